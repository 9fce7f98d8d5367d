//! # Coordinator Metrics
//!
//! Prometheus metrics for monitoring round throughput and abuse.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! cj-coordinator = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `coinjoin_rounds_created_total` - Counter of rounds created (label: blame)
//! - `coinjoin_rounds_ended_total` - Counter of rounds ended (label: end_state)
//! - `coinjoin_inputs_registered_total` - Counter of accepted input registrations
//! - `coinjoin_requests_rejected_total` - Counter of protocol rejections (label: code)
//! - `coinjoin_bans_total` - Counter of prison entries (label: punishment)
//! - `coinjoin_broadcasts_total` - Counter of coinjoins broadcast
//! - `coinjoin_open_rounds` - Gauge of rounds not yet ended

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{register_gauge, register_int_counter, register_int_counter_vec, Gauge, IntCounter, IntCounterVec};

#[cfg(feature = "metrics")]
lazy_static! {
    /// Rounds created, labeled by whether they are blame rounds
    pub static ref ROUNDS_CREATED: IntCounterVec = register_int_counter_vec!(
        "coinjoin_rounds_created_total",
        "Total number of rounds created",
        &["blame"]
    )
    .expect("Failed to create ROUNDS_CREATED metric");

    /// Rounds ended, labeled by end state
    pub static ref ROUNDS_ENDED: IntCounterVec = register_int_counter_vec!(
        "coinjoin_rounds_ended_total",
        "Total number of rounds ended",
        &["end_state"]
    )
    .expect("Failed to create ROUNDS_ENDED metric");

    /// Accepted input registrations
    pub static ref INPUTS_REGISTERED: IntCounter = register_int_counter!(
        "coinjoin_inputs_registered_total",
        "Total number of inputs registered"
    )
    .expect("Failed to create INPUTS_REGISTERED metric");

    /// Protocol rejections, labeled by code
    pub static ref REQUESTS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "coinjoin_requests_rejected_total",
        "Total number of rejected requests",
        &["code"]
    )
    .expect("Failed to create REQUESTS_REJECTED metric");

    /// Prison entries, labeled by punishment
    pub static ref BANS: IntCounterVec = register_int_counter_vec!(
        "coinjoin_bans_total",
        "Total number of prison entries",
        &["punishment"]
    )
    .expect("Failed to create BANS metric");

    /// Coinjoins broadcast
    pub static ref BROADCASTS: IntCounter = register_int_counter!(
        "coinjoin_broadcasts_total",
        "Total number of coinjoin transactions broadcast"
    )
    .expect("Failed to create BROADCASTS metric");

    /// Rounds not yet ended
    pub static ref OPEN_ROUNDS: Gauge = register_gauge!(
        "coinjoin_open_rounds",
        "Number of rounds that have not ended"
    )
    .expect("Failed to create OPEN_ROUNDS metric");
}

// =============================================================================
// METRIC RECORDING FUNCTIONS
// =============================================================================

#[cfg(feature = "metrics")]
pub fn record_round_created(blame: bool) {
    ROUNDS_CREATED.with_label_values(&[if blame { "true" } else { "false" }]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_round_ended(end_state: &str) {
    ROUNDS_ENDED.with_label_values(&[end_state]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_inputs_registered(count: u64) {
    INPUTS_REGISTERED.inc_by(count);
}

#[cfg(feature = "metrics")]
pub fn record_rejection(code: &str) {
    REQUESTS_REJECTED.with_label_values(&[code]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_ban(punishment: &str) {
    BANS.with_label_values(&[punishment]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_broadcast() {
    BROADCASTS.inc();
}

#[cfg(feature = "metrics")]
pub fn set_open_rounds(count: usize) {
    OPEN_ROUNDS.set(count as f64);
}

// =============================================================================
// NO-OP IMPLEMENTATIONS (when metrics feature disabled)
// =============================================================================

#[cfg(not(feature = "metrics"))]
pub fn record_round_created(_blame: bool) {}

#[cfg(not(feature = "metrics"))]
pub fn record_round_ended(_end_state: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_inputs_registered(_count: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_rejection(_code: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_ban(_punishment: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_broadcast() {}

#[cfg(not(feature = "metrics"))]
pub fn set_open_rounds(_count: usize) {}
