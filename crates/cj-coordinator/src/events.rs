//! # Events
//!
//! ```text
//! Chain watcher ──ChainEvent──→ [Arena] ──CoordinatorEvent──→ EventBus ──→ subscribers
//! ```
//!
//! Outgoing events are fire-and-forget: a lagging subscriber loses events, it
//! never slows the arena down.

use std::sync::atomic::{AtomicU64, Ordering};

use bitcoin::{OutPoint, Transaction, Txid};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{EndRoundState, FeeRate, Phase, PrisonKey, Punishment, RoundId};

/// Default capacity of the outgoing event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events published by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CoordinatorEvent {
    RoundCreated {
        round_id: RoundId,
        blame_of: Option<RoundId>,
        fee_rate: FeeRate,
    },
    PhaseChanged {
        round_id: RoundId,
        phase: Phase,
    },
    RoundEnded {
        round_id: RoundId,
        end_state: EndRoundState,
    },
    CoinjoinBroadcast {
        round_id: RoundId,
        txid: Txid,
        input_count: usize,
        output_count: usize,
    },
    InputBanned {
        key: PrisonKey,
        punishment: Punishment,
        release_at: u64,
    },
    FeeRateSampled {
        confirmation_target: u16,
        fee_rate: FeeRate,
    },
}

/// Chain notifications consumed by the arena.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// Transaction entered the mempool.
    TransactionSeen { transaction: Transaction, fee_rate: FeeRate },
    /// Block connected to the best chain.
    BlockConnected { height: u32, transactions: Vec<Transaction> },
}

impl ChainEvent {
    pub fn transactions(&self) -> &[Transaction] {
        match self {
            ChainEvent::TransactionSeen { transaction, .. } => std::slice::from_ref(transaction),
            ChainEvent::BlockConnected { transactions, .. } => transactions,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, ChainEvent::BlockConnected { .. })
    }

    /// Fee rate of a mempool conflict; confirmed conflicts have no rate.
    pub fn fee_rate(&self) -> Option<FeeRate> {
        match self {
            ChainEvent::TransactionSeen { fee_rate, .. } => Some(*fee_rate),
            ChainEvent::BlockConnected { .. } => None,
        }
    }
}

/// Every outpoint spent by `transaction`.
pub fn spent_outpoints(transaction: &Transaction) -> impl Iterator<Item = OutPoint> + '_ {
    transaction.input.iter().map(|i| i.previous_output)
}

/// Broadcast-backed publisher for [`CoordinatorEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<CoordinatorEvent>,
    events_published: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            events_published: AtomicU64::new(0),
        }
    }

    /// Publish an event, returning how many subscribers received it.
    pub fn publish(&self, event: CoordinatorEvent) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        trace!(?event, "Publishing coordinator event");
        self.sender.send(event).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let event = CoordinatorEvent::FeeRateSampled {
            confirmation_target: 6,
            fee_rate: FeeRate::from_sat_per_vb(3),
        };

        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(bus.events_published(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        let delivered = bus.publish(CoordinatorEvent::FeeRateSampled {
            confirmation_target: 6,
            fee_rate: FeeRate::ZERO,
        });
        assert_eq!(delivered, 0);
    }
}
