//! Domain module for the round coordinator
//!
//! Pure state and validation. Nothing here performs I/O or reads the clock;
//! timestamps are always passed in.
//!
//! ## Core Modules
//! - round: Round lifecycle and registration checks
//! - alice: Participant registrations
//! - construction / signing: Coinjoin transaction states
//! - prison: Punishment of disruptive coins
//!
//! ## Support
//! - coin, script, money: Bitcoin value and size rules
//! - ownership: Ownership proofs bound to a round
//! - credentials: Issuer contract types
//! - parameters: Immutable per-round parameters
//! - statistics: Fee-rate history and script reuse tracking

pub mod alice;
pub mod coin;
pub mod construction;
pub mod credentials;
pub mod identifiers;
pub mod money;
pub mod ownership;
pub mod parameters;
pub mod prison;
pub mod round;
pub mod script;
pub mod signing;
pub mod statistics;

pub use alice::{Alice, RegisteredCoin};
pub use coin::{Coin, TxOutInfo};
pub use construction::ConstructionState;
pub use credentials::{
    Credential, CredentialKind, CredentialsRequest, CredentialsResponse, IssuanceRequest, IssuerParameters,
    SerialNumber,
};
pub use identifiers::{AliceId, RoundId, TimeFrame, Timestamp};
pub use money::{CoordinationFeeRate, FeeRate, MoneyRange};
pub use ownership::{CommitmentData, OwnershipProof};
pub use parameters::RoundParameters;
pub use prison::{DisruptionMethod, Inmate, Offense, Prison, PrisonKey, Punishment};
pub use round::{BlameInfo, EndRoundState, MultipartyTransactionState, Phase, Round};
pub use script::ScriptType;
pub use signing::SigningState;
pub use statistics::{FeeRateAverages, FeeRateSample, FeeRateStatStore, ScriptStore};
