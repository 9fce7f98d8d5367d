//! # CoinJoin Telemetry
//!
//! Logging setup shared by every process that embeds the coordinator.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cj_telemetry::{init_logging, TelemetryConfig};
//!
//! fn main() {
//!     let config = TelemetryConfig::from_env();
//!     init_logging(&config).expect("Failed to init logging");
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CJ_SERVICE_NAME` | `cj-coordinator` | Service name attached to every log line |
//! | `CJ_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `CJ_JSON_LOGS` | `false` (`true` in containers) | Emit JSON instead of text |
//! | `CJ_LOG_TARGETS` | `true` | Include the module target in log lines |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::{build_filter, init_logging};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}
