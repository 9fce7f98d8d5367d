//! Immutable per-round parameters.

use bitcoin::{Amount, Network, ScriptBuf};
use serde::Serialize;

use super::identifiers::RoundId;
use super::money::{CoordinationFeeRate, FeeRate, MoneyRange};
use super::ownership::CommitmentData;
use super::script::{ScriptType, MAX_TRANSACTION_SIZE, SHARED_OVERHEAD_VSIZE};

/// Largest vsize credential a single participant can hold.
pub const MAX_VSIZE_CREDENTIAL_VALUE: u64 = 255;

/// Parameters fixed at round creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundParameters {
    pub network: Network,
    pub mining_fee_rate: FeeRate,
    pub coordination_fee_rate: CoordinationFeeRate,
    pub min_input_count_by_round: usize,
    pub max_input_count_by_round: usize,
    pub max_inputs_per_alice: usize,
    pub allowed_input_amounts: MoneyRange,
    pub allowed_output_amounts: MoneyRange,
    pub allowed_input_types: Vec<ScriptType>,
    pub allowed_output_types: Vec<ScriptType>,
    pub min_relay_tx_fee: FeeRate,
    pub max_transaction_size: u64,
    pub input_registration_timeout_ms: u64,
    pub connection_confirmation_timeout_ms: u64,
    pub output_registration_timeout_ms: u64,
    pub transaction_signing_timeout_ms: u64,
    pub coordinator_identifier: String,
    pub allow_unconfirmed_inputs: bool,
    pub coordinator_fee_script: Option<ScriptBuf>,
}

impl RoundParameters {
    /// Vsize available to inputs once shared overhead is paid.
    pub fn initial_input_vsize_allocation(&self) -> u64 {
        self.max_transaction_size.saturating_sub(SHARED_OVERHEAD_VSIZE)
    }

    /// Vsize each participant may spend on inputs and outputs combined.
    pub fn per_alice_vsize_allocation(&self) -> u64 {
        let share = self.initial_input_vsize_allocation() / self.max_input_count_by_round.max(1) as u64;
        share.min(MAX_VSIZE_CREDENTIAL_VALUE)
    }

    pub fn max_vsize_credential_value(&self) -> u64 {
        self.per_alice_vsize_allocation()
    }

    pub fn max_amount_credential_value(&self) -> u64 {
        self.allowed_input_amounts.max.to_sat()
    }

    pub fn min_registrable_amount(&self) -> Amount {
        self.allowed_input_amounts.min
    }

    pub fn max_registrable_amount(&self) -> Amount {
        self.allowed_input_amounts.max
    }

    pub fn commitment_data(&self, round_id: RoundId) -> CommitmentData {
        CommitmentData::new(self.coordinator_identifier.clone(), round_id)
    }

    /// Parameters for a blame round spawned from this one.
    pub fn for_blame_round(&self, min_input_count: usize, input_registration_timeout_ms: u64) -> Self {
        Self {
            min_input_count_by_round: min_input_count,
            input_registration_timeout_ms,
            ..self.clone()
        }
    }

    /// Canonical bytes committed to by the round id.
    pub(crate) fn hash_preimage(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) fn test_parameters() -> RoundParameters {
    RoundParameters {
        network: Network::Regtest,
        mining_fee_rate: FeeRate::from_sat_per_vb(5),
        coordination_fee_rate: CoordinationFeeRate::FREE,
        min_input_count_by_round: 2,
        max_input_count_by_round: 100,
        max_inputs_per_alice: 4,
        allowed_input_amounts: MoneyRange::new(Amount::from_sat(10_000), Amount::from_sat(4_300_000_000_000)),
        allowed_output_amounts: MoneyRange::new(Amount::from_sat(5_000), Amount::from_sat(4_300_000_000_000)),
        allowed_input_types: vec![ScriptType::P2wpkh, ScriptType::Taproot],
        allowed_output_types: vec![ScriptType::P2wpkh, ScriptType::Taproot],
        min_relay_tx_fee: FeeRate::from_sat_per_vb(1),
        max_transaction_size: MAX_TRANSACTION_SIZE,
        input_registration_timeout_ms: 60_000,
        connection_confirmation_timeout_ms: 60_000,
        output_registration_timeout_ms: 60_000,
        transaction_signing_timeout_ms: 60_000,
        coordinator_identifier: "CoinJoinCoordinatorIdentifier".to_string(),
        allow_unconfirmed_inputs: false,
        coordinator_fee_script: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_allocations() {
        let params = test_parameters();
        assert_eq!(params.initial_input_vsize_allocation(), 99_989);
        // 99_989 / 100 = 999, capped
        assert_eq!(params.per_alice_vsize_allocation(), 255);

        let small = RoundParameters {
            max_transaction_size: 2_011,
            ..params
        };
        assert_eq!(small.per_alice_vsize_allocation(), 20);
    }

    #[test]
    fn test_blame_parameters_inherit_everything_else() {
        let params = test_parameters();
        let blame = params.for_blame_round(1, 5_000);
        assert_eq!(blame.min_input_count_by_round, 1);
        assert_eq!(blame.input_registration_timeout_ms, 5_000);
        assert_eq!(blame.mining_fee_rate, params.mining_fee_rate);
    }

    #[test]
    fn test_hash_preimage_changes_with_fee_rate() {
        let a = test_parameters();
        let b = RoundParameters {
            mining_fee_rate: FeeRate::from_sat_per_vb(6),
            ..test_parameters()
        };
        assert_ne!(a.hash_preimage(), b.hash_preimage());
    }
}
