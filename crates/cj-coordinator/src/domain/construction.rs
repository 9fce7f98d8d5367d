//! # Construction State
//!
//! Open-ended assembly of the coinjoin. Every operation returns a new state
//! and leaves `self` untouched, so a rejected add never corrupts the round.
//!
//! ```text
//! ConstructionState ──add_input/add_output──► ConstructionState
//!        │
//!        └──finalize()──► SigningState (sorted, frozen)
//! ```
//!
//! ## Invariants
//!
//! - `estimated_vsize() <= max_transaction_size`
//! - `effective_fee_rate() >= mining_fee_rate` once finalized

use std::cmp::Ordering;
use std::sync::Arc;

use bitcoin::consensus::encode::serialize;
use bitcoin::TxOut;

use super::coin::Coin;
use super::money::FeeRate;
use super::parameters::RoundParameters;
use super::script::{is_dust, is_standard, ScriptType, SHARED_OVERHEAD_VSIZE};
use super::signing::SigningState;
use crate::error::{reject, ProtocolResult};

#[derive(Debug, Clone)]
pub struct ConstructionState {
    parameters: Arc<RoundParameters>,
    inputs: Vec<Coin>,
    outputs: Vec<TxOut>,
}

impl ConstructionState {
    pub fn new(parameters: Arc<RoundParameters>) -> Self {
        Self {
            parameters,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn parameters(&self) -> &RoundParameters {
        &self.parameters
    }

    pub fn inputs(&self) -> &[Coin] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    /// Input value minus output value, in satoshis.
    pub fn balance(&self) -> i64 {
        let inputs: i64 = self.inputs.iter().map(|c| c.amount().to_sat() as i64).sum();
        let outputs: i64 = self.outputs.iter().map(|o| o.value.to_sat() as i64).sum();
        inputs - outputs
    }

    pub fn estimated_input_vsize(&self) -> u64 {
        self.inputs.iter().map(Coin::input_vsize).sum()
    }

    pub fn estimated_vsize(&self) -> u64 {
        SHARED_OVERHEAD_VSIZE
            + self.estimated_input_vsize()
            + self.outputs.iter().map(output_vsize).sum::<u64>()
    }

    /// Rate actually paid by the current balance.
    pub fn effective_fee_rate(&self) -> FeeRate {
        let fee = bitcoin::Amount::from_sat(self.balance().max(0) as u64);
        FeeRate::from_fee(fee, self.estimated_vsize())
    }

    pub fn add_input(&self, coin: Coin) -> ProtocolResult<Self> {
        let params = &self.parameters;
        let script = &coin.txout.script_pubkey;

        if !is_standard(script) {
            return Err(reject!(NonStandardInput, "input {} has a non-standard script", coin.outpoint));
        }
        match coin.script_type() {
            Some(t) if params.allowed_input_types.contains(&t) => {}
            _ => {
                return Err(reject!(ScriptNotAllowed, "input {} script type not allowed", coin.outpoint));
            }
        }
        if self.inputs.iter().any(|c| c.outpoint == coin.outpoint) {
            return Err(reject!(NonUniqueInputs, "input {} already present", coin.outpoint));
        }
        if coin.effective_value(params.mining_fee_rate, params.coordination_fee_rate) <= 0 {
            return Err(reject!(
                UneconomicalInput,
                "input {} worth {} does not cover its own fees",
                coin.outpoint,
                coin.amount()
            ));
        }

        let mut next = self.clone();
        next.inputs.push(coin);
        next.check_size()?;
        Ok(next)
    }

    pub fn add_output(&self, txout: TxOut) -> ProtocolResult<Self> {
        let params = &self.parameters;
        let script = &txout.script_pubkey;

        if !is_standard(script) {
            return Err(reject!(NonStandardOutput, "output script is not standard"));
        }
        let allowed = ScriptType::from_script(script)
            .is_some_and(|t| params.allowed_output_types.contains(&t));
        if script.is_op_return() || !allowed {
            return Err(reject!(ScriptNotAllowed, "output script type not allowed"));
        }
        if is_dust(&txout, params.min_relay_tx_fee) {
            return Err(reject!(DustOutput, "output of {} is dust", txout.value));
        }
        if txout.value < params.allowed_output_amounts.min {
            return Err(reject!(
                NotEnoughFunds,
                "output {} below minimum {}",
                txout.value,
                params.allowed_output_amounts.min
            ));
        }
        if txout.value > params.allowed_output_amounts.max {
            return Err(reject!(
                TooMuchFunds,
                "output {} above maximum {}",
                txout.value,
                params.allowed_output_amounts.max
            ));
        }

        self.push_output(txout)
    }

    /// Adds the coordinator's fee output. Only dust and size rules apply.
    pub(crate) fn add_coordinator_output(&self, txout: TxOut) -> ProtocolResult<Self> {
        if !is_standard(&txout.script_pubkey) {
            return Err(reject!(NonStandardOutput, "coordinator script is not standard"));
        }
        if is_dust(&txout, self.parameters.min_relay_tx_fee) {
            return Err(reject!(DustOutput, "coordinator output of {} is dust", txout.value));
        }
        self.push_output(txout)
    }

    fn push_output(&self, txout: TxOut) -> ProtocolResult<Self> {
        let mut next = self.clone();
        next.outputs.push(txout);
        next.check_size()?;
        Ok(next)
    }

    fn check_size(&self) -> ProtocolResult<()> {
        let vsize = self.estimated_vsize();
        if vsize > self.parameters.max_transaction_size {
            return Err(reject!(
                SizeLimitExceeded,
                "estimated vsize {} exceeds {}",
                vsize,
                self.parameters.max_transaction_size
            ));
        }
        Ok(())
    }

    /// Freeze into the canonical, sorted transaction.
    pub fn finalize(&self) -> ProtocolResult<SigningState> {
        self.check_size()?;
        let effective = self.effective_fee_rate();
        if effective < self.parameters.mining_fee_rate {
            return Err(reject!(
                InsufficientFees,
                "effective fee rate {} below required {}",
                effective,
                self.parameters.mining_fee_rate
            ));
        }

        let mut inputs = self.inputs.clone();
        inputs.sort_by(compare_inputs);
        let mut outputs = self.outputs.clone();
        outputs.sort_by(compare_outputs);

        Ok(SigningState::new(self.parameters.clone(), inputs, outputs))
    }
}

/// Virtual size an output adds to the transaction.
pub fn output_vsize(txout: &TxOut) -> u64 {
    serialize(txout).len() as u64
}

/// Descending amount, then outpoint bytes.
fn compare_inputs(a: &Coin, b: &Coin) -> Ordering {
    b.amount()
        .cmp(&a.amount())
        .then_with(|| serialize(&a.outpoint).cmp(&serialize(&b.outpoint)))
}

/// Descending value, then script bytes.
fn compare_outputs(a: &TxOut, b: &TxOut) -> Ordering {
    b.value
        .cmp(&a.value)
        .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
}
