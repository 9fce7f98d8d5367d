//! # Arena
//!
//! The table of live rounds and everything that mutates them.
//!
//! ## Concurrency
//!
//! ```text
//! rounds: RwLock<HashMap<RoundId, Arc<RoundSlot>>>     membership (brief, sync)
//!   └── RoundSlot
//!         ├── writer: tokio Mutex                       content (may span awaits)
//!         ├── published: RwLock<Arc<Round>>            snapshot readers clone
//!         └── amount / vsize issuers
//! registry: Mutex<HashMap<OutPoint, CoinRegistration>> cross-round ownership
//! ```
//!
//! Every content change follows the same shape: take the slot's writer,
//! clone the published round, validate and mutate the clone, publish it.
//! Readers never wait on writers and a failed request leaves nothing behind.
//!
//! Lock order: round table, then one round writer, then the registry. A
//! handler that must touch a second round releases the first one before.
//!
//! ## Submodules
//! - handlers: participant requests
//! - stepper: phase progression, chain events, round lifecycle
//! - registry: cross-round coin ownership

mod handlers;
pub mod registry;
mod stepper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::OutPoint;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch, MutexGuard};
use tracing::{debug, info};

use crate::config::CoordinatorConfig;
use crate::domain::{FeeRateStatStore, Round, RoundId, ScriptStore};
use crate::error::{reject, CoordinatorResult, ProtocolResult};
use crate::events::{ChainEvent, CoordinatorEvent, EventBus};
use crate::ports::inbound::{RoundState, StatusResponse};
use crate::ports::outbound::{ChainStateOracle, CredentialIssuer, CredentialIssuerFactory, ScriptArchive, TimeSource};
use crate::warden::Warden;

use registry::{CoinRegistration, CoinRegistry};

/// Outbound collaborators the arena is wired to.
#[derive(Clone)]
pub struct ArenaPorts {
    pub chain: Arc<dyn ChainStateOracle>,
    pub issuers: Arc<dyn CredentialIssuerFactory>,
    pub script_archive: Arc<dyn ScriptArchive>,
    pub clock: Arc<dyn TimeSource>,
}

/// One round plus its writer guard and issuers.
pub(crate) struct RoundSlot {
    writer: tokio::sync::Mutex<()>,
    published: RwLock<Arc<Round>>,
    pub(crate) amount_issuer: Arc<dyn CredentialIssuer>,
    pub(crate) vsize_issuer: Arc<dyn CredentialIssuer>,
}

impl RoundSlot {
    fn new(round: Round, amount_issuer: Arc<dyn CredentialIssuer>, vsize_issuer: Arc<dyn CredentialIssuer>) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(()),
            published: RwLock::new(Arc::new(round)),
            amount_issuer,
            vsize_issuer,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Round> {
        self.published.read().clone()
    }

    /// Take the writer and start from the latest published round.
    pub(crate) async fn edit(&self) -> RoundEdit<'_> {
        let guard = self.writer.lock().await;
        let round = Round::clone(&self.snapshot());
        RoundEdit {
            slot: self,
            _guard: guard,
            round,
        }
    }
}

/// A working copy of a round under its writer. Dropping it discards changes.
pub(crate) struct RoundEdit<'a> {
    slot: &'a RoundSlot,
    _guard: MutexGuard<'a, ()>,
    pub(crate) round: Round,
}

impl RoundEdit<'_> {
    pub(crate) fn publish(self) {
        *self.slot.published.write() = Arc::new(self.round);
    }
}

pub struct Arena {
    config: CoordinatorConfig,
    rounds: RwLock<HashMap<RoundId, Arc<RoundSlot>>>,
    registry: CoinRegistry,
    warden: Arc<Warden>,
    chain: Arc<dyn ChainStateOracle>,
    issuers: Arc<dyn CredentialIssuerFactory>,
    script_archive: Arc<dyn ScriptArchive>,
    clock: Arc<dyn TimeSource>,
    events: Arc<EventBus>,
    fee_stats: Mutex<FeeRateStatStore>,
    scripts: RwLock<ScriptStore>,
    step_lock: tokio::sync::Mutex<()>,
}

impl Arena {
    /// Validate `config` and load the script archive. No round exists until
    /// the first [`Arena::step`].
    pub fn new(
        config: CoordinatorConfig,
        ports: ArenaPorts,
        warden: Arc<Warden>,
        events: Arc<EventBus>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        let scripts = ScriptStore::from_scripts(ports.script_archive.load()?);
        info!(
            network = %config.network,
            min_inputs = config.min_input_count_by_round,
            max_inputs = config.max_input_count_by_round,
            known_scripts = scripts.len(),
            "Arena initialized"
        );

        Ok(Self {
            config,
            rounds: RwLock::new(HashMap::new()),
            registry: CoinRegistry::new(),
            warden,
            chain: ports.chain,
            issuers: ports.issuers,
            script_archive: ports.script_archive,
            clock: ports.clock,
            events,
            fee_stats: Mutex::new(FeeRateStatStore::new()),
            scripts: RwLock::new(scripts),
            step_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn warden(&self) -> &Arc<Warden> {
        &self.warden
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Latest published state of a round.
    pub fn round(&self, round_id: RoundId) -> Option<Arc<Round>> {
        self.rounds.read().get(&round_id).map(|slot| slot.snapshot())
    }

    /// Snapshots of every round, oldest first.
    pub fn rounds(&self) -> Vec<Arc<Round>> {
        let mut rounds: Vec<Arc<Round>> = self.rounds.read().values().map(|slot| slot.snapshot()).collect();
        rounds.sort_by_key(|r| (r.created_at(), r.id()));
        rounds
    }

    pub fn registration(&self, outpoint: &OutPoint) -> Option<CoinRegistration> {
        self.registry.get(outpoint)
    }

    pub fn is_known_script(&self, script: &bitcoin::ScriptBuf) -> bool {
        self.scripts.read().contains(script)
    }

    pub fn status(&self) -> StatusResponse {
        let now = self.clock.now();
        StatusResponse {
            rounds: self.rounds().iter().map(|r| RoundState::from_round(r)).collect(),
            fee_rate_averages: self.fee_stats.lock().averages(self.config.confirmation_target, now),
        }
    }

    /// Drive stepping and chain events until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut chain_events: mpsc::Receiver<ChainEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.step_interval_millis.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.step_interval_millis, "Arena started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.step().await,
                Some(event) = chain_events.recv() => self.handle_chain_event(event).await,
                _ = shutdown.changed() => {
                    info!("Arena shutdown signal received");
                    break;
                }
            }
        }
    }

    pub(crate) fn slot(&self, round_id: RoundId) -> ProtocolResult<Arc<RoundSlot>> {
        self.rounds
            .read()
            .get(&round_id)
            .cloned()
            .ok_or_else(|| reject!(RoundNotFound, "round {} not found", round_id))
    }

    fn slots(&self) -> Vec<Arc<RoundSlot>> {
        self.rounds.read().values().cloned().collect()
    }

    fn insert_slot(&self, slot: RoundSlot) -> RoundId {
        let round_id = slot.snapshot().id();
        self.rounds.write().insert(round_id, Arc::new(slot));
        debug!(%round_id, "Round inserted");
        round_id
    }
}
