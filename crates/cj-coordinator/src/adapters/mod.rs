//! Adapters implementing the outbound ports.

pub mod chain_state;
pub mod credential_ledger;
pub mod stores;

pub use chain_state::InMemoryChainState;
pub use credential_ledger::{MacCredentialIssuer, MacCredentialIssuerFactory};
pub use stores::{InMemoryStore, JsonLinesStore};
