//! Structured logging.
//!
//! Events carry consistent fields so log processors can index them:
//! - `service`: service name from [`TelemetryConfig`]
//! - `round_id`: hex round identifier, on round scoped events
//! - `outpoint`: `txid:vout`, on coin scoped events
//! - Additional context fields

use tracing_subscriber::EnvFilter;

use crate::{TelemetryConfig, TelemetryError};

/// Parse the configured level into an [`EnvFilter`].
pub fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(&config.log_level).map_err(|e| TelemetryError::InvalidFilter {
        filter: config.log_level.clone(),
        reason: e.to_string(),
    })
}

/// Install the global tracing subscriber.
///
/// Fails if another subscriber was installed first, which is common in tests
/// where several cases race to initialise logging.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_targets);

    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::debug!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Structured logging configured"
    );
    Ok(())
}

/// Log a round-related event with standard fields.
#[macro_export]
macro_rules! log_round_event {
    ($level:ident, $round_id:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            round_id = %$round_id,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log a coin-related event with standard fields.
#[macro_export]
macro_rules! log_coin_event {
    ($level:ident, $round_id:expr, $outpoint:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            round_id = %$round_id,
            outpoint = %$outpoint,
            $($($field)*,)?
            $msg
        )
    };
}
