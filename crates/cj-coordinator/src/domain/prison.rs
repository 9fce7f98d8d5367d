//! # Prison
//!
//! Registry of punished outpoints and scripts. Independent of any round.
//!
//! ## Punishment
//!
//! | Offense                      | Punishment | Duration                                     |
//! |------------------------------|------------|----------------------------------------------|
//! | Did not confirm              | Noted      | severity / value * factor                    |
//! | Did not sign / double spent  | Banned     | severity / value * factor * (1 + priors)     |
//! | Failed to verify             | Banned     | `min_time_for_failed_to_verify`              |
//! | Inherited                    | Banned     | longest remaining ancestor sentence          |
//!
//! A second offense while an entry is still active upgrades a note to a ban.
//! Disruption sentences are at least `min_time_in_prison` and every sentence
//! is clamped to `max_time_in_prison`.

use std::collections::HashMap;

use bitcoin::{Amount, OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};

use super::identifiers::{RoundId, Timestamp};
use crate::config::DosConfig;

const HOUR_MS: f64 = 3_600_000.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrisonKey {
    Outpoint(OutPoint),
    Script(ScriptBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Punishment {
    Noted,
    Banned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisruptionMethod {
    DidNotConfirm,
    DidNotSign,
    DoubleSpent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Offense {
    RoundDisruption {
        value: Amount,
        method: DisruptionMethod,
        disrupted_round_ids: Vec<RoundId>,
    },
    FailedToVerify {
        round_id: RoundId,
    },
    Inherited {
        ancestors: Vec<OutPoint>,
    },
}

/// A sentenced key. This is also the persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inmate {
    pub key: PrisonKey,
    pub offense: Offense,
    pub punishment: Punishment,
    pub started: Timestamp,
    pub release_at: Timestamp,
}

impl Inmate {
    pub fn is_active(&self, now: Timestamp) -> bool {
        now < self.release_at
    }
}

#[derive(Debug, Default, Clone)]
pub struct Prison {
    inmates: HashMap<PrisonKey, Inmate>,
}

impl Prison {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records; the latest record per key wins.
    pub fn from_records(records: impl IntoIterator<Item = Inmate>) -> Self {
        let mut inmates = HashMap::new();
        for inmate in records {
            inmates.insert(inmate.key.clone(), inmate);
        }
        Self { inmates }
    }

    pub fn len(&self) -> usize {
        self.inmates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inmates.is_empty()
    }

    pub fn get(&self, key: &PrisonKey) -> Option<&Inmate> {
        self.inmates.get(key)
    }

    /// Whether `key` may not register right now.
    pub fn is_banned(&self, key: &PrisonKey, dos: &DosConfig, now: Timestamp) -> bool {
        match self.inmates.get(key) {
            Some(inmate) if inmate.is_active(now) => match inmate.punishment {
                Punishment::Banned => true,
                Punishment::Noted => !dos.allow_noted_input_registration,
            },
            _ => false,
        }
    }

    /// Sentence `key` for `offense`, returning the stored record.
    pub fn punish(&mut self, key: PrisonKey, offense: Offense, dos: &DosConfig, now: Timestamp) -> Inmate {
        let (mut punishment, duration_ms) = self.sentence(&key, &offense, dos, now);

        if let Some(existing) = self.inmates.get(&key) {
            if existing.is_active(now) {
                punishment = Punishment::Banned;
            }
        }

        let inmate = Inmate {
            key: key.clone(),
            offense,
            punishment,
            started: now,
            release_at: now.saturating_add(duration_ms),
        };
        self.inmates.insert(key, inmate.clone());
        inmate
    }

    /// Ban every output of a transaction that spends a banned ancestor.
    ///
    /// Returns the new records, empty when no ancestor is banned.
    pub fn inherit_punishment(
        &mut self,
        descendants: &[OutPoint],
        ancestors: &[OutPoint],
        dos: &DosConfig,
        now: Timestamp,
    ) -> Vec<Inmate> {
        let banned: Vec<OutPoint> = ancestors
            .iter()
            .filter(|o| {
                self.inmates
                    .get(&PrisonKey::Outpoint(**o))
                    .is_some_and(|i| i.is_active(now) && i.punishment == Punishment::Banned)
            })
            .copied()
            .collect();
        if banned.is_empty() {
            return Vec::new();
        }

        descendants
            .iter()
            .map(|o| {
                self.punish(
                    PrisonKey::Outpoint(*o),
                    Offense::Inherited {
                        ancestors: banned.clone(),
                    },
                    dos,
                    now,
                )
            })
            .collect()
    }

    /// Record a double spend of a registered coin. Bans the outpoint and its script.
    pub fn double_spent(
        &mut self,
        outpoint: OutPoint,
        script: ScriptBuf,
        value: Amount,
        disrupted_round_ids: Vec<RoundId>,
        dos: &DosConfig,
        now: Timestamp,
    ) -> Vec<Inmate> {
        let offense = Offense::RoundDisruption {
            value,
            method: DisruptionMethod::DoubleSpent,
            disrupted_round_ids,
        };
        vec![
            self.punish(PrisonKey::Outpoint(outpoint), offense.clone(), dos, now),
            self.punish(PrisonKey::Script(script), offense, dos, now),
        ]
    }

    /// Drop served sentences.
    pub fn release_eligible(&mut self, now: Timestamp) -> Vec<PrisonKey> {
        let released: Vec<PrisonKey> = self
            .inmates
            .iter()
            .filter(|(_, i)| !i.is_active(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &released {
            self.inmates.remove(key);
        }
        released
    }

    fn sentence(&self, key: &PrisonKey, offense: &Offense, dos: &DosConfig, now: Timestamp) -> (Punishment, u64) {
        let min_ms = dos.min_time_in_prison_secs.saturating_mul(1_000);
        let max_ms = dos.max_time_in_prison_secs.saturating_mul(1_000);

        let (punishment, ms) = match offense {
            Offense::RoundDisruption { value, method, .. } => {
                let factor = match method {
                    DisruptionMethod::DidNotConfirm => dos.penalty_factor_did_not_confirm,
                    DisruptionMethod::DidNotSign => dos.penalty_factor_did_not_sign,
                    DisruptionMethod::DoubleSpent => dos.penalty_factor_double_spent,
                };
                let btc = value.to_btc().max(1e-8);
                let priors = self.prior_offenses(key, now) as f64;
                let hours = dos.severity_btc / btc * factor * (1.0 + priors);
                let ms = (hours * HOUR_MS).min(u64::MAX as f64) as u64;

                let punishment = match method {
                    DisruptionMethod::DidNotConfirm => Punishment::Noted,
                    DisruptionMethod::DidNotSign | DisruptionMethod::DoubleSpent => Punishment::Banned,
                };
                (punishment, ms.max(min_ms))
            }
            Offense::FailedToVerify { .. } => (
                Punishment::Banned,
                dos.min_time_for_failed_to_verify_secs.saturating_mul(1_000),
            ),
            Offense::Inherited { ancestors } => {
                let longest = ancestors
                    .iter()
                    .filter_map(|o| self.inmates.get(&PrisonKey::Outpoint(*o)))
                    .map(|i| i.release_at.saturating_sub(now))
                    .max()
                    .unwrap_or(min_ms);
                (Punishment::Banned, longest)
            }
        };
        (punishment, ms.min(max_ms))
    }

    /// Active sentences on sibling outputs of the same transaction.
    fn prior_offenses(&self, key: &PrisonKey, now: Timestamp) -> usize {
        let PrisonKey::Outpoint(outpoint) = key else {
            return 0;
        };
        self.inmates
            .values()
            .filter(|i| i.is_active(now))
            .filter(|i| matches!(&i.key, PrisonKey::Outpoint(o) if o.txid == outpoint.txid && o != outpoint))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    const HOUR: u64 = 3_600_000;

    fn outpoint(tag: u8, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([tag; 32]), vout)
    }

    fn disruption(sats: u64, method: DisruptionMethod) -> Offense {
        Offense::RoundDisruption {
            value: Amount::from_sat(sats),
            method,
            disrupted_round_ids: vec![RoundId::from_bytes([1; 32])],
        }
    }

    #[test]
    fn test_failed_to_sign_bans_scaled_by_value() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        let key = PrisonKey::Outpoint(outpoint(1, 0));

        // 0.1 / 0.01 BTC * 1.0 = 10 hours
        let inmate = prison.punish(key.clone(), disruption(1_000_000, DisruptionMethod::DidNotSign), &dos, 0);
        assert_eq!(inmate.punishment, Punishment::Banned);
        assert_eq!(inmate.release_at, 10 * HOUR);
        assert!(prison.is_banned(&key, &dos, 10 * HOUR - 1));
        assert!(!prison.is_banned(&key, &dos, 10 * HOUR));
    }

    #[test]
    fn test_did_not_confirm_is_noted() {
        let mut dos = DosConfig::default();
        let mut prison = Prison::new();
        let key = PrisonKey::Outpoint(outpoint(1, 0));

        let inmate = prison.punish(key.clone(), disruption(1_000_000, DisruptionMethod::DidNotConfirm), &dos, 0);
        assert_eq!(inmate.punishment, Punishment::Noted);
        assert!(!prison.is_banned(&key, &dos, 1));

        dos.allow_noted_input_registration = false;
        assert!(prison.is_banned(&key, &dos, 1));
    }

    #[test]
    fn test_repeat_offense_upgrades_note() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        let key = PrisonKey::Outpoint(outpoint(1, 0));

        prison.punish(key.clone(), disruption(1_000_000, DisruptionMethod::DidNotConfirm), &dos, 0);
        let second = prison.punish(key.clone(), disruption(1_000_000, DisruptionMethod::DidNotConfirm), &dos, 10);
        assert_eq!(second.punishment, Punishment::Banned);
        assert!(prison.is_banned(&key, &dos, 11));
    }

    #[test]
    fn test_large_value_non_signer_still_banned() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        let key = PrisonKey::Outpoint(outpoint(1, 0));
        // 0.1 / 100 BTC = 0.001 h, far below 20 minutes
        let inmate = prison.punish(key.clone(), disruption(10_000_000_000, DisruptionMethod::DidNotSign), &dos, 0);
        assert_eq!(inmate.punishment, Punishment::Banned);
        assert_eq!(inmate.release_at, dos.min_time_in_prison_secs * 1_000);
        assert!(prison.is_banned(&key, &dos, 1));
    }

    #[test]
    fn test_large_double_spend_still_banned() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        let script = ScriptBuf::from_bytes(vec![0x00, 0x14, 9, 9, 9]);
        // 0.1 / 1 BTC * 3 = 0.3 h, under 20 minutes
        let records = prison.double_spent(outpoint(1, 0), script, Amount::from_sat(100_000_000), vec![], &dos, 0);
        assert!(records.iter().all(|i| i.punishment == Punishment::Banned));
        assert!(records.iter().all(|i| i.release_at == dos.min_time_in_prison_secs * 1_000));
    }

    #[test]
    fn test_absurd_durations_saturate() {
        let dos = DosConfig {
            min_time_in_prison_secs: u64::MAX,
            max_time_in_prison_secs: u64::MAX,
            min_time_for_failed_to_verify_secs: u64::MAX,
            ..DosConfig::default()
        };
        let mut prison = Prison::new();
        let key = PrisonKey::Outpoint(outpoint(1, 0));
        let inmate = prison.punish(
            key.clone(),
            Offense::FailedToVerify {
                round_id: RoundId::from_bytes([0; 32]),
            },
            &dos,
            5,
        );
        assert_eq!(inmate.release_at, u64::MAX);
        assert!(prison.is_banned(&key, &dos, 6));

        let noted = prison.punish(
            PrisonKey::Outpoint(outpoint(2, 0)),
            disruption(1_000_000, DisruptionMethod::DidNotConfirm),
            &dos,
            5,
        );
        assert_eq!(noted.release_at, u64::MAX);
    }

    #[test]
    fn test_sibling_priors_multiply() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        prison.punish(PrisonKey::Outpoint(outpoint(1, 0)), disruption(1_000_000, DisruptionMethod::DidNotSign), &dos, 0);
        let second = prison.punish(
            PrisonKey::Outpoint(outpoint(1, 1)),
            disruption(1_000_000, DisruptionMethod::DidNotSign),
            &dos,
            0,
        );
        assert_eq!(second.release_at, 20 * HOUR);
    }

    #[test]
    fn test_sentence_clamped_to_max() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        let inmate = prison.punish(PrisonKey::Outpoint(outpoint(1, 0)), disruption(1, DisruptionMethod::DoubleSpent), &dos, 0);
        assert_eq!(inmate.release_at, dos.max_time_in_prison_secs * 1_000);
    }

    #[test]
    fn test_inherit_punishment() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        let ancestor = outpoint(1, 0);
        prison.punish(PrisonKey::Outpoint(ancestor), disruption(1_000_000, DisruptionMethod::DidNotSign), &dos, 0);

        let children = [outpoint(2, 0), outpoint(2, 1)];
        let inherited = prison.inherit_punishment(&children, &[ancestor, outpoint(3, 0)], &dos, HOUR);
        assert_eq!(inherited.len(), 2);
        assert!(inherited.iter().all(|i| i.release_at == 10 * HOUR));
        assert!(prison.is_banned(&PrisonKey::Outpoint(children[1]), &dos, HOUR));

        let clean = prison.inherit_punishment(&[outpoint(4, 0)], &[outpoint(3, 0)], &dos, HOUR);
        assert!(clean.is_empty());
    }

    #[test]
    fn test_double_spent_bans_outpoint_and_script() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        let script = ScriptBuf::from_bytes(vec![0x00, 0x14, 1, 2, 3]);
        prison.double_spent(outpoint(1, 0), script.clone(), Amount::from_sat(1_000_000), vec![], &dos, 0);

        assert!(prison.is_banned(&PrisonKey::Outpoint(outpoint(1, 0)), &dos, 1));
        assert!(prison.is_banned(&PrisonKey::Script(script), &dos, 1));
    }

    #[test]
    fn test_release_and_rebuild() {
        let dos = DosConfig::default();
        let mut prison = Prison::new();
        let first = prison.punish(
            PrisonKey::Outpoint(outpoint(1, 0)),
            disruption(1_000_000, DisruptionMethod::DidNotSign),
            &dos,
            0,
        );
        prison.punish(
            PrisonKey::Outpoint(outpoint(2, 0)),
            Offense::FailedToVerify {
                round_id: RoundId::from_bytes([0; 32]),
            },
            &dos,
            0,
        );

        let released = prison.release_eligible(first.release_at);
        assert_eq!(released, vec![PrisonKey::Outpoint(outpoint(1, 0))]);
        assert_eq!(prison.len(), 1);

        let rebuilt = Prison::from_records(vec![first.clone(), first]);
        assert_eq!(rebuilt.len(), 1);
    }
}
