//! Credential contract types.
//!
//! The coordinator treats credentials as opaque tokens for a scalar resource
//! (amount or vsize). An issuer enforces, for every request:
//!
//! ```text
//! sum(requested) == sum(presented) + delta
//! ```
//!
//! and never accepts the same presented credential twice. A *zero* request
//! presents nothing, moves no value (`delta == 0`) and requests only zero-valued
//! credentials; it is how participants obtain placeholders to present later.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of credentials requested per issuance.
pub const CREDENTIALS_PER_REQUEST: usize = 2;

/// Resource a credential accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialKind {
    Amount,
    Vsize,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Amount => f.write_str("amount"),
            CredentialKind::Vsize => f.write_str("vsize"),
        }
    }
}

/// Unique serial of an issued credential; presenting it spends it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialNumber(pub [u8; 32]);

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", &hex::encode(self.0)[..12])
    }
}

/// An issued credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub kind: CredentialKind,
    pub serial: SerialNumber,
    pub value: u64,
    pub mac: [u8; 32],
}

/// A request for one new credential of `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRequest {
    pub value: u64,
}

/// Credential presentation plus issuance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsRequest {
    /// Value entering (positive) or leaving (negative) the credential system
    pub delta: i64,
    pub presented: Vec<Credential>,
    pub requested: Vec<IssuanceRequest>,
}

impl CredentialsRequest {
    /// A zero request asking for placeholder credentials.
    pub fn zero() -> Self {
        Self {
            delta: 0,
            presented: Vec::new(),
            requested: vec![IssuanceRequest { value: 0 }; CREDENTIALS_PER_REQUEST],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.delta == 0 && self.presented.is_empty() && self.requested.iter().all(|r| r.value == 0)
    }

    pub fn presented_total(&self) -> u64 {
        self.presented.iter().map(|c| c.value).sum()
    }

    pub fn requested_total(&self) -> u64 {
        self.requested.iter().map(|r| r.value).sum()
    }
}

/// Credentials issued in response to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsResponse {
    pub issued: Vec<Credential>,
}

/// Public issuer parameters a round commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerParameters {
    pub kind: CredentialKind,
    pub max_value: u64,
    pub key_commitment: [u8; 32],
}
