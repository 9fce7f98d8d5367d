//! Telemetry configuration from environment variables.

use std::env;

use serde::Deserialize;

/// Logging configuration for a coordinator process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name attached to log lines
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error or a full directive)
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Whether to print the module target of each event
    pub with_targets: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "cj-coordinator".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            with_targets: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CJ_SERVICE_NAME`: Service name (default: cj-coordinator)
    /// - `CJ_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `CJ_JSON_LOGS`: Enable JSON logs (default: false in dev, true in containers)
    /// - `CJ_LOG_TARGETS`: Print module targets (default: true)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("CJ_SERVICE_NAME")
                .unwrap_or_else(|_| "cj-coordinator".to_string()),

            log_level: env::var("CJ_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            json_logs: env::var("CJ_JSON_LOGS")
                .map(|v| parse_flag(&v))
                .unwrap_or(is_container),

            with_targets: env::var("CJ_LOG_TARGETS")
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
        }
    }

    /// Same as [`TelemetryConfig::from_env`] with a fixed service name.
    pub fn for_service(service_name: &str) -> Self {
        let mut config = Self::from_env();
        config.service_name = service_name.to_string();
        config
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
