//! Error types for the coordinator
//!
//! Two layers:
//! - [`ProtocolError`]: the closed taxonomy of client-caused rejections. Always
//!   recovered at the request boundary and returned to the caller.
//! - [`CoordinatorError`]: everything a request can fail with, protocol
//!   rejections plus infrastructure and lifecycle failures.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for domain operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Result type alias for request handling
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

/// Protocol rejection codes.
///
/// Clients branch on these; the set is closed and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolErrorCode {
    NonUniqueInputs,
    InputBanned,
    InputSpent,
    InputUnconfirmed,
    InputImmature,
    InputNotWhitelisted,
    TooManyInputs,
    TooMuchVsize,
    VsizeQuotaExceeded,
    WrongRoundSignature,
    NotEnoughFunds,
    TooMuchFunds,
    WrongPhase,
    AliceAlreadyRegistered,
    AliceNotFound,
    NonStandardInput,
    NonStandardOutput,
    ScriptNotAllowed,
    AlreadyRegisteredScript,
    UneconomicalInput,
    DustOutput,
    SizeLimitExceeded,
    InsufficientFees,
    WitnessAlreadyProvided,
    SignatureTooLong,
    WrongCoinjoinSignature,
    InvalidInputIndex,
    IncorrectRequestedAmountCredentials,
    IncorrectRequestedVsizeCredentials,
    InvalidCredentialRequest,
    RoundNotFound,
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A client-caused protocol rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ProtocolError {
    pub code: ProtocolErrorCode,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: ProtocolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ProtocolErrorCode {
        self.code
    }
}

/// Shorthand for building a [`ProtocolError`].
macro_rules! reject {
    ($code:ident, $($arg:tt)+) => {
        $crate::error::ProtocolError::new(
            $crate::error::ProtocolErrorCode::$code,
            format!($($arg)+),
        )
    };
}
pub(crate) use reject;

/// Chain-state oracle failures.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("Chain state oracle unreachable: {0}")]
    Unreachable(String),

    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("Fee estimation unavailable: {0}")]
    FeeEstimationUnavailable(String),
}

/// Credential issuer failures.
///
/// Rejections caused by a malformed or replayed client request map to
/// [`ProtocolErrorCode::InvalidCredentialRequest`]; `Internal` is an issuer fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssuerError {
    #[error("Serial number already used")]
    SerialNumberAlreadyUsed,

    #[error("Invalid credential presented")]
    InvalidCredential,

    #[error("Expected {expected} requested credentials, got {actual}")]
    WrongRequestedCount { expected: usize, actual: usize },

    #[error("Expected 0 or {expected} presented credentials, got {actual}")]
    WrongPresentedCount { expected: usize, actual: usize },

    #[error("Requested value {value} exceeds maximum {max}")]
    ValueTooLarge { value: u64, max: u64 },

    #[error("Balance mismatch: presented {presented} + delta {delta} != requested {requested}")]
    BalanceMismatch {
        presented: u64,
        delta: i64,
        requested: u64,
    },

    #[error("Issuer failure: {0}")]
    Internal(String),
}

impl From<IssuerError> for ProtocolError {
    fn from(err: IssuerError) -> Self {
        ProtocolError::new(ProtocolErrorCode::InvalidCredentialRequest, err.to_string())
    }
}

/// Persistent store failures (prison log, script store).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced at the request boundary.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Client-caused rejection
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Service is shutting down and no longer accepts requests
    #[error("Coordinator is shutting down")]
    Disposed,

    /// The caller's cancellation token fired
    #[error("Request cancelled")]
    Cancelled,

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("Credential issuer error: {0}")]
    Issuer(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoordinatorError {
    /// Protocol code, if this is a protocol rejection.
    pub fn protocol_code(&self) -> Option<ProtocolErrorCode> {
        match self {
            CoordinatorError::Protocol(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<IssuerError> for CoordinatorError {
    fn from(err: IssuerError) -> Self {
        match err {
            IssuerError::Internal(reason) => CoordinatorError::Issuer(reason),
            other => CoordinatorError::Protocol(other.into()),
        }
    }
}
