//! Opaque identifiers and time values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Hash-sized round identifier.
///
/// Derived from the round's parameters, issuer parameters and a creation nonce,
/// so it doubles as the round hash that ownership proofs commit to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub struct RoundId([u8; 32]);

impl RoundId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary preimage parts into an id.
    pub fn hash_of<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoundId({})", &hex::encode(self.0)[..16])
    }
}

impl FromStr for RoundId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Per-round participant identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct AliceId(Uuid);

impl AliceId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A `[start, start + duration)` window measured in milliseconds.
///
/// Phase timeouts run from phase start, never per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFrame {
    pub start: Option<Timestamp>,
    pub duration_ms: u64,
}

impl TimeFrame {
    pub fn create(duration_ms: u64) -> Self {
        Self {
            start: None,
            duration_ms,
        }
    }

    pub fn started_at(self, now: Timestamp) -> Self {
        Self {
            start: Some(now),
            ..self
        }
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.start.map(|s| s.saturating_add(self.duration_ms))
    }

    /// An unstarted frame never expires.
    pub fn has_expired(&self, now: Timestamp) -> bool {
        self.end().is_some_and(|end| now >= end)
    }
}
