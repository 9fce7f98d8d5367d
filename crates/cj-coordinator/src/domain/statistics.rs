//! Fee-rate history and the set of scripts already used in coinjoins.

use std::collections::{HashSet, VecDeque};

use bitcoin::ScriptBuf;
use serde::{Deserialize, Serialize};

use super::identifiers::Timestamp;
use super::money::FeeRate;

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

/// Samples older than this are pruned.
pub const FEE_RATE_HISTORY_MS: u64 = 30 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRateSample {
    pub timestamp: Timestamp,
    pub confirmation_target: u16,
    pub fee_rate: FeeRate,
}

/// Rolling averages of sampled mining fee rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRateAverages {
    pub confirmation_target: u16,
    pub one_day: Option<FeeRate>,
    pub one_week: Option<FeeRate>,
    pub one_month: Option<FeeRate>,
}

#[derive(Debug, Default, Clone)]
pub struct FeeRateStatStore {
    samples: VecDeque<FeeRateSample>,
}

impl FeeRateStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples must arrive in timestamp order.
    pub fn add(&mut self, sample: FeeRateSample) {
        self.samples.push_back(sample);
        self.prune(sample.timestamp);
    }

    pub fn prune(&mut self, now: Timestamp) {
        let cutoff = now.saturating_sub(FEE_RATE_HISTORY_MS);
        while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            self.samples.pop_front();
        }
    }

    /// Mean fee rate over the trailing window; `None` with no samples.
    pub fn average(&self, confirmation_target: u16, window_ms: u64, now: Timestamp) -> Option<FeeRate> {
        let cutoff = now.saturating_sub(window_ms);
        let (sum, count) = self
            .samples
            .iter()
            .filter(|s| s.confirmation_target == confirmation_target && s.timestamp >= cutoff)
            .fold((0u64, 0u64), |(sum, count), s| (sum + s.fee_rate.sat_per_kvb(), count + 1));
        (count > 0).then(|| FeeRate::from_sat_per_kvb(sum / count))
    }

    pub fn averages(&self, confirmation_target: u16, now: Timestamp) -> FeeRateAverages {
        FeeRateAverages {
            confirmation_target,
            one_day: self.average(confirmation_target, DAY_MS, now),
            one_week: self.average(confirmation_target, 7 * DAY_MS, now),
            one_month: self.average(confirmation_target, 30 * DAY_MS, now),
        }
    }
}

/// Scripts that already appeared in a broadcast coinjoin.
#[derive(Debug, Default, Clone)]
pub struct ScriptStore {
    scripts: HashSet<ScriptBuf>,
}

impl ScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scripts(scripts: impl IntoIterator<Item = ScriptBuf>) -> Self {
        Self {
            scripts: scripts.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn contains(&self, script: &ScriptBuf) -> bool {
        self.scripts.contains(script)
    }

    /// Insert scripts, returning the ones not seen before.
    pub fn add_range(&mut self, scripts: impl IntoIterator<Item = ScriptBuf>) -> Vec<ScriptBuf> {
        scripts
            .into_iter()
            .filter(|s| self.scripts.insert(s.clone()))
            .collect()
    }
}
