//! Outbound (Driven) ports for the coordinator.
//!
//! These traits define the external collaborators the Arena depends on:
//! chain state, credential issuance, prison persistence and the clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Transaction};

use crate::domain::{
    Credential, CredentialKind, CredentialsRequest, CredentialsResponse, FeeRate, Inmate, IssuerParameters,
    SerialNumber, Timestamp, TxOutInfo,
};
use crate::error::{IssuerError, OracleError, StoreError};

/// Chain-state oracle (full node or indexer).
#[async_trait]
pub trait ChainStateOracle: Send + Sync {
    /// Look up an unspent output.
    ///
    /// # Returns
    /// - `Ok(Some(info))`: the output exists and is unspent
    /// - `Ok(None)`: the output is spent or never existed
    /// - `Err`: the oracle could not answer
    async fn get_tx_out(&self, outpoint: &OutPoint, include_mempool: bool) -> Result<Option<TxOutInfo>, OracleError>;

    /// Estimate a mining fee rate for confirmation within `confirmation_target` blocks.
    async fn estimate_fee_rate(&self, confirmation_target: u16) -> Result<FeeRate, OracleError>;

    /// Submit a fully signed transaction.
    async fn broadcast(&self, transaction: &Transaction) -> Result<(), OracleError>;
}

/// An issuance validated by [`CredentialIssuer::prepare`] and not yet applied.
///
/// Nothing is spent until [`CredentialIssuer::commit`]; dropping a prepared
/// issuance leaves the issuer untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedIssuance {
    pub kind: CredentialKind,
    pub spent: Vec<SerialNumber>,
    pub issued: Vec<Credential>,
}

/// Per-round issuer of credentials for one resource.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    fn parameters(&self) -> IssuerParameters;

    /// Validate `request` and compute the credentials it would receive.
    ///
    /// Enforces `requested == presented + delta`, the request shape, the
    /// value ceiling, and that every presented credential is authentic and unspent.
    async fn prepare(&self, request: &CredentialsRequest) -> Result<PreparedIssuance, IssuerError>;

    /// Spend the presented serials and release the credentials.
    ///
    /// Fails without side effects if a serial was spent since `prepare`.
    fn commit(&self, prepared: PreparedIssuance) -> Result<CredentialsResponse, IssuerError>;
}

/// Creates the issuers for a new round.
pub trait CredentialIssuerFactory: Send + Sync {
    fn create(&self, kind: CredentialKind, max_value: u64) -> Result<Arc<dyn CredentialIssuer>, IssuerError>;
}

/// Append-only log of prison sentences.
pub trait PrisonStore: Send + Sync {
    fn load(&self) -> Result<Vec<Inmate>, StoreError>;

    fn append(&self, inmates: &[Inmate]) -> Result<(), StoreError>;
}

/// Append-only log of scripts used in broadcast coinjoins.
pub trait ScriptArchive: Send + Sync {
    fn load(&self) -> Result<Vec<ScriptBuf>, StoreError>;

    fn append(&self, scripts: &[ScriptBuf]) -> Result<(), StoreError>;
}

/// Time source for consistent timestamp handling.
///
/// Abstracted to allow testing with deterministic time.
pub trait TimeSource: Send + Sync {
    /// Returns the current timestamp in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Default system time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// Manually driven clock for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    time: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(initial: Timestamp) -> Self {
        Self {
            time: AtomicU64::new(initial),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.time.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time: Timestamp) {
        self.time.store(time, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }
}
