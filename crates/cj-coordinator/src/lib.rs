//! # cj-coordinator
//!
//! Round coordinator for WabiSabi-style CoinJoin transactions.
//!
//! ## Overview
//!
//! This crate provides:
//! - **Round state machine**: input registration, connection confirmation,
//!   output registration and signing, with blame rounds after partial failure
//! - **Credential accounting**: amount and vsize credentials carry value from
//!   inputs to outputs without linking them
//! - **Canonical transaction**: deterministic ordering every participant can
//!   recompute and sign
//! - **Prison**: bans for disruption, bad proofs and double spends, inherited
//!   by descendants of banned coins
//!
//! ## Architecture
//!
//! ```text
//! transport ──CoordinatorApi──→ RequestHandler ──→ Arena ──→ Round (per-round writer)
//!                                                   │  │
//!                     ChainStateOracle ←────────────┘  ├──→ Warden ──→ PrisonStore
//!                     CredentialIssuer ←───────────────┤
//!                     chain watcher ──ChainEvent──────→┘
//! ```
//!
//! ## Round Lifecycle
//!
//! | Phase | Participants may | Ends |
//! |-------|------------------|------|
//! | InputRegistration | register and remove inputs, keep alive | timeout or input cap |
//! | ConnectionConfirmation | confirm, receive real credentials | all confirmed or timeout |
//! | OutputRegistration | register outputs, reissue, signal ready | all ready, value claimed, or timeout |
//! | TransactionSigning | submit witnesses | fully signed or timeout |
//!
//! ## Example
//!
//! ```rust,ignore
//! use cj_coordinator::{Arena, ArenaPorts, CoordinatorConfig, EventBus, RequestHandler, Warden};
//!
//! let events = Arc::new(EventBus::new());
//! let warden = Arc::new(Warden::new(config.dos.clone(), prison_store, clock.clone(), events.clone())?);
//! let arena = Arc::new(Arena::new(config, ports, warden.clone(), events)?);
//!
//! tokio::spawn(arena.clone().run(chain_events, shutdown.clone()));
//! tokio::spawn(warden.run(shutdown));
//!
//! let handler = RequestHandler::new(arena);
//! let status = handler.get_status(CancellationToken::new()).await?;
//! ```

pub mod adapters;
pub mod arena;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod metrics;
pub mod ports;
pub mod request_handler;
pub mod warden;

pub use arena::registry::CoinRegistration;
pub use arena::{Arena, ArenaPorts};
pub use config::{ConfigError, CoordinatorConfig, DosConfig};
pub use domain::{
    Alice, AliceId, Coin, EndRoundState, FeeRate, OwnershipProof, Phase, Round, RoundId, RoundParameters, ScriptType,
};
pub use error::{
    CoordinatorError, CoordinatorResult, IssuerError, OracleError, ProtocolError, ProtocolErrorCode, ProtocolResult,
    StoreError,
};
pub use events::{ChainEvent, CoordinatorEvent, EventBus};
pub use ports::inbound::CoordinatorApi;
pub use ports::outbound::{
    ChainStateOracle, CredentialIssuer, CredentialIssuerFactory, ManualTimeSource, PrisonStore, ScriptArchive,
    SystemTimeSource, TimeSource,
};
pub use request_handler::RequestHandler;
pub use warden::Warden;
