//! # Warden
//!
//! Owns the [`Prison`] and its persistence.
//!
//! ```text
//! Arena ──punish──→ [Warden] ──pending──→ run() ──append──→ PrisonStore
//!                       │
//!                       └──InputBanned──→ EventBus
//! ```
//!
//! The prison is loaded from the store at construction. New sentences are
//! applied in memory immediately and persisted by the background task; a
//! failed append stays queued and is retried on the next flush.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Amount, OutPoint, ScriptBuf};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::DosConfig;
use crate::domain::{Inmate, Offense, Prison, PrisonKey, RoundId};
use crate::error::StoreError;
use crate::events::{CoordinatorEvent, EventBus};
use crate::metrics;
use crate::ports::outbound::{PrisonStore, TimeSource};

pub struct Warden {
    prison: RwLock<Prison>,
    pending: Mutex<Vec<Inmate>>,
    wake: Notify,
    store: Arc<dyn PrisonStore>,
    dos: DosConfig,
    clock: Arc<dyn TimeSource>,
    events: Arc<EventBus>,
}

impl Warden {
    /// Load the prison from `store`, dropping sentences already served.
    pub fn new(
        dos: DosConfig,
        store: Arc<dyn PrisonStore>,
        clock: Arc<dyn TimeSource>,
        events: Arc<EventBus>,
    ) -> Result<Self, StoreError> {
        let records = store.load()?;
        let loaded = records.len();
        let mut prison = Prison::from_records(records);
        let released = prison.release_eligible(clock.now()).len();
        info!(loaded, released, active = prison.len(), "Prison loaded");

        Ok(Self {
            prison: RwLock::new(prison),
            pending: Mutex::new(Vec::new()),
            wake: Notify::new(),
            store,
            dos,
            clock,
            events,
        })
    }

    pub fn dos(&self) -> &DosConfig {
        &self.dos
    }

    pub fn is_banned(&self, key: &PrisonKey) -> bool {
        self.prison.read().is_banned(key, &self.dos, self.clock.now())
    }

    pub fn inmate(&self, key: &PrisonKey) -> Option<Inmate> {
        self.prison.read().get(key).cloned()
    }

    pub fn inmate_count(&self) -> usize {
        self.prison.read().len()
    }

    pub fn punish(&self, key: PrisonKey, offense: Offense) -> Inmate {
        let inmate = self.prison.write().punish(key, offense, &self.dos, self.clock.now());
        self.record(vec![inmate.clone()]);
        inmate
    }

    /// Ban outputs of a transaction that spends banned outpoints.
    pub fn inherit_punishment(&self, descendants: &[OutPoint], ancestors: &[OutPoint]) -> Vec<Inmate> {
        let inmates = self
            .prison
            .write()
            .inherit_punishment(descendants, ancestors, &self.dos, self.clock.now());
        self.record(inmates.clone());
        inmates
    }

    pub fn double_spent(
        &self,
        outpoint: OutPoint,
        script: ScriptBuf,
        value: Amount,
        disrupted_round_ids: Vec<RoundId>,
    ) -> Vec<Inmate> {
        let inmates = self.prison.write().double_spent(
            outpoint,
            script,
            value,
            disrupted_round_ids,
            &self.dos,
            self.clock.now(),
        );
        self.record(inmates.clone());
        inmates
    }

    /// Drop served sentences; returns how many were released.
    pub fn release(&self) -> usize {
        let released = self.prison.write().release_eligible(self.clock.now());
        if !released.is_empty() {
            debug!(count = released.len(), "Released served sentences");
        }
        released.len()
    }

    /// Persist queued sentences; returns how many were written.
    pub fn flush(&self) -> Result<usize, StoreError> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }
        match self.store.append(&batch) {
            Ok(()) => Ok(batch.len()),
            Err(e) => {
                let mut pending = self.pending.lock();
                let newer = std::mem::replace(&mut *pending, batch);
                pending.extend(newer);
                Err(e)
            }
        }
    }

    /// Background task: persist new sentences and release served ones.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.dos.release_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Warden started");

        loop {
            tokio::select! {
                _ = self.wake.notified() => self.flush_logged(),
                _ = ticker.tick() => {
                    self.release();
                    self.flush_logged();
                }
                _ = shutdown.changed() => {
                    info!("Warden shutdown signal received");
                    break;
                }
            }
        }
        self.flush_logged();
    }

    fn flush_logged(&self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "Failed to persist prison entries");
        }
    }

    fn record(&self, inmates: Vec<Inmate>) {
        if inmates.is_empty() {
            return;
        }
        for inmate in &inmates {
            warn!(
                key = ?inmate.key,
                punishment = ?inmate.punishment,
                release_at = inmate.release_at,
                offense = ?inmate.offense,
                "Prison entry recorded"
            );
            metrics::record_ban(&format!("{:?}", inmate.punishment));
            self.events.publish(CoordinatorEvent::InputBanned {
                key: inmate.key.clone(),
                punishment: inmate.punishment,
                release_at: inmate.release_at,
            });
        }
        self.pending.lock().extend(inmates);
        self.wake.notify_one();
    }
}
