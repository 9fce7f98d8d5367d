//! Ports module for the coordinator

pub mod inbound;
pub mod outbound;

pub use inbound::CoordinatorApi;
pub use outbound::{
    ChainStateOracle, CredentialIssuer, CredentialIssuerFactory, ManualTimeSource, PreparedIssuance, PrisonStore,
    ScriptArchive, SystemTimeSource, TimeSource,
};
