//! Configuration types for the coordinator

use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Amount, Network, ScriptBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::money::{CoordinationFeeRate, FeeRate, MoneyRange};
use crate::domain::parameters::RoundParameters;
use crate::domain::script::{ScriptType, MAX_TRANSACTION_SIZE};

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration for the coordinator
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bitcoin network the coordinator runs on
    pub network: Network,

    /// Confirmation target used for fee estimation
    pub confirmation_target: u16,

    /// Rounds with fewer inputs than this abort
    pub min_input_count_by_round: usize,

    /// Input registration closes once this many inputs registered
    pub max_input_count_by_round: usize,

    /// Coins one participant may register at once
    pub max_inputs_per_alice: usize,

    pub min_registrable_amount_sat: u64,
    pub max_registrable_amount_sat: u64,

    /// Minimum relay fee used for dust checks
    pub min_relay_fee_sat_per_kvb: u64,

    /// Used when neither the oracle nor the statistics have a rate
    pub fallback_fee_rate_sat_per_kvb: u64,

    /// Coordination fee, parts per million of input value
    pub coordination_fee_rate_ppm: u64,

    /// Inputs at or below this amount pay no coordination fee
    pub plebs_dont_pay_threshold_sat: u64,

    /// Address receiving coordination fees; surplus goes to miners when unset
    pub coordinator_fee_address: Option<String>,

    pub allowed_input_types: Vec<ScriptType>,
    pub allowed_output_types: Vec<ScriptType>,

    pub standard_input_registration_timeout_secs: u64,
    pub blame_input_registration_timeout_secs: u64,
    pub connection_confirmation_timeout_secs: u64,
    pub output_registration_timeout_secs: u64,
    pub transaction_signing_timeout_secs: u64,

    /// How long ended rounds stay visible before eviction
    pub round_expiry_timeout_secs: u64,

    /// Period of the phase stepper
    pub step_interval_millis: u64,

    /// Blame rounds require `min_input_count_by_round * multiplier` inputs
    pub blame_min_input_count_multiplier: f64,

    /// Label bound into every ownership proof
    pub coordinator_identifier: String,

    /// Accept inputs with zero confirmations
    pub allow_unconfirmed_inputs: bool,

    /// Denial-of-service policy
    pub dos: DosConfig,

    /// Append-only prison log; in-memory when unset
    pub prison_file_path: Option<PathBuf>,

    /// Script reuse log; in-memory when unset
    pub script_store_path: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            confirmation_target: 6,
            min_input_count_by_round: 21,
            max_input_count_by_round: 100,
            max_inputs_per_alice: 3,
            min_registrable_amount_sat: 5_000,
            max_registrable_amount_sat: 4_300_000_000_000,
            min_relay_fee_sat_per_kvb: 1_000,
            fallback_fee_rate_sat_per_kvb: 10_000,
            coordination_fee_rate_ppm: 3_000,
            plebs_dont_pay_threshold_sat: 1_000_000,
            coordinator_fee_address: None,
            allowed_input_types: vec![ScriptType::P2wpkh, ScriptType::Taproot],
            allowed_output_types: vec![ScriptType::P2wpkh, ScriptType::Taproot],
            standard_input_registration_timeout_secs: 3_600,
            blame_input_registration_timeout_secs: 180,
            connection_confirmation_timeout_secs: 60,
            output_registration_timeout_secs: 60,
            transaction_signing_timeout_secs: 60,
            round_expiry_timeout_secs: 300,
            step_interval_millis: 1_000,
            blame_min_input_count_multiplier: 0.4,
            coordinator_identifier: "CoinJoinCoordinatorIdentifier".to_string(),
            allow_unconfirmed_inputs: false,
            dos: DosConfig::default(),
            prison_file_path: None,
            script_store_path: None,
        }
    }
}

impl CoordinatorConfig {
    /// Load from a JSON file, apply environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: CoordinatorConfig = serde_json::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        info!(path = %path.display(), network = %config.network, "Loaded coordinator configuration");
        Ok(config)
    }

    /// Override selected fields from `CJ_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(network) = std::env::var("CJ_NETWORK") {
            match Network::from_str(&network) {
                Ok(n) => self.network = n,
                Err(_) => warn!(value = %network, "Ignoring invalid CJ_NETWORK"),
            }
        }
        if let Some(n) = env_parse("CJ_MIN_INPUT_COUNT") {
            self.min_input_count_by_round = n;
        }
        if let Some(n) = env_parse("CJ_MAX_INPUT_COUNT") {
            self.max_input_count_by_round = n;
        }
        if let Some(ms) = env_parse("CJ_STEP_INTERVAL_MILLIS") {
            self.step_interval_millis = ms;
        }
        if let Ok(identifier) = std::env::var("CJ_COORDINATOR_IDENTIFIER") {
            self.coordinator_identifier = identifier;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_input_count_by_round == 0 {
            return Err(ConfigError::Invalid("min_input_count_by_round must be positive".into()));
        }
        if self.min_input_count_by_round > self.max_input_count_by_round {
            return Err(ConfigError::Invalid(format!(
                "min_input_count_by_round {} exceeds max_input_count_by_round {}",
                self.min_input_count_by_round, self.max_input_count_by_round
            )));
        }
        if self.max_inputs_per_alice == 0 {
            return Err(ConfigError::Invalid("max_inputs_per_alice must be positive".into()));
        }
        if self.min_registrable_amount_sat > self.max_registrable_amount_sat {
            return Err(ConfigError::Invalid("min registrable amount exceeds max".into()));
        }
        if self.allowed_input_types.is_empty() || self.allowed_output_types.is_empty() {
            return Err(ConfigError::Invalid("allowed script types must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.blame_min_input_count_multiplier) {
            return Err(ConfigError::Invalid("blame_min_input_count_multiplier must be within [0, 1]".into()));
        }
        if self.coordinator_identifier.is_empty() {
            return Err(ConfigError::Invalid("coordinator_identifier must not be empty".into()));
        }
        self.coordinator_fee_script()?;
        self.dos.validate()
    }

    /// Script paid by the coordinator fee output, if configured.
    pub fn coordinator_fee_script(&self) -> Result<Option<ScriptBuf>, ConfigError> {
        let Some(address) = &self.coordinator_fee_address else {
            return Ok(None);
        };
        let unchecked: Address<NetworkUnchecked> = address
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("coordinator_fee_address: {e}")))?;
        let checked = unchecked
            .require_network(self.network)
            .map_err(|e| ConfigError::Invalid(format!("coordinator_fee_address: {e}")))?;
        Ok(Some(checked.script_pubkey()))
    }

    pub fn min_relay_fee(&self) -> FeeRate {
        FeeRate::from_sat_per_kvb(self.min_relay_fee_sat_per_kvb)
    }

    pub fn fallback_fee_rate(&self) -> FeeRate {
        FeeRate::from_sat_per_kvb(self.fallback_fee_rate_sat_per_kvb)
    }

    pub fn blame_min_input_count(&self) -> usize {
        let scaled = (self.min_input_count_by_round as f64 * self.blame_min_input_count_multiplier).floor() as usize;
        scaled.max(2).min(self.min_input_count_by_round.max(2))
    }

    /// Parameters for a fresh round at `mining_fee_rate`.
    pub fn round_parameters(&self, mining_fee_rate: FeeRate) -> RoundParameters {
        let amounts = MoneyRange::new(
            Amount::from_sat(self.min_registrable_amount_sat),
            Amount::from_sat(self.max_registrable_amount_sat),
        );
        RoundParameters {
            network: self.network,
            mining_fee_rate,
            coordination_fee_rate: CoordinationFeeRate::new(
                self.coordination_fee_rate_ppm,
                Amount::from_sat(self.plebs_dont_pay_threshold_sat),
            ),
            min_input_count_by_round: self.min_input_count_by_round,
            max_input_count_by_round: self.max_input_count_by_round,
            max_inputs_per_alice: self.max_inputs_per_alice,
            allowed_input_amounts: amounts,
            allowed_output_amounts: amounts,
            allowed_input_types: self.allowed_input_types.clone(),
            allowed_output_types: self.allowed_output_types.clone(),
            min_relay_tx_fee: self.min_relay_fee(),
            max_transaction_size: MAX_TRANSACTION_SIZE,
            input_registration_timeout_ms: self.standard_input_registration_timeout_secs.saturating_mul(1_000),
            connection_confirmation_timeout_ms: self.connection_confirmation_timeout_secs.saturating_mul(1_000),
            output_registration_timeout_ms: self.output_registration_timeout_secs.saturating_mul(1_000),
            transaction_signing_timeout_ms: self.transaction_signing_timeout_secs.saturating_mul(1_000),
            coordinator_identifier: self.coordinator_identifier.clone(),
            allow_unconfirmed_inputs: self.allow_unconfirmed_inputs,
            coordinator_fee_script: self.coordinator_fee_script().ok().flatten(),
        }
    }
}

/// Denial-of-service policy for the prison
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DosConfig {
    /// Base punishment: hours in prison for disrupting with 1 BTC is
    /// `severity_btc / 1 BTC`, scaled by the method factor
    pub severity_btc: f64,

    pub penalty_factor_did_not_confirm: f64,
    pub penalty_factor_did_not_sign: f64,
    pub penalty_factor_double_spent: f64,

    pub min_time_for_failed_to_verify_secs: u64,

    /// Floor for every disruption sentence
    pub min_time_in_prison_secs: u64,
    pub max_time_in_prison_secs: u64,

    /// Noted coins may still register
    pub allow_noted_input_registration: bool,

    /// How often the warden releases served sentences
    pub release_interval_secs: u64,
}

impl Default for DosConfig {
    fn default() -> Self {
        Self {
            severity_btc: 0.1,
            penalty_factor_did_not_confirm: 0.2,
            penalty_factor_did_not_sign: 1.0,
            penalty_factor_double_spent: 3.0,
            min_time_for_failed_to_verify_secs: 31 * 24 * 3_600,
            min_time_in_prison_secs: 20 * 60,
            max_time_in_prison_secs: 60 * 24 * 3_600,
            allow_noted_input_registration: true,
            release_interval_secs: 60,
        }
    }
}

impl DosConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.severity_btc <= 0.0 {
            return Err(ConfigError::Invalid("dos.severity_btc must be positive".into()));
        }
        if self.min_time_in_prison_secs > self.max_time_in_prison_secs {
            return Err(ConfigError::Invalid("dos.min_time_in_prison exceeds max".into()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %value, "Ignoring unparsable override");
            None
        }
    }
}
