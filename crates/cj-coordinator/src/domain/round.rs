//! # Round
//!
//! One instance of the coinjoin protocol.
//!
//! ## Phase Machine
//!
//! ```text
//! InputRegistration ──► ConnectionConfirmation ──► OutputRegistration ──► TransactionSigning
//!        │                       │                        │                       │
//!        └───────────────────────┴────────────┬───────────┴───────────────────────┘
//!                                             ▼
//!                                     Ended(EndRoundState)
//! ```
//!
//! Phases only move forward and only the arena's stepper moves them. Request
//! handlers work on a clone of the round and publish it whole; a `Round` value
//! is never mutated while shared.

use std::collections::BTreeSet;
use std::sync::Arc;

use bitcoin::{Amount, OutPoint, Script};
use serde::{Deserialize, Serialize};

use super::alice::{Alice, RegisteredCoin};
use super::construction::ConstructionState;
use super::credentials::IssuerParameters;
use super::identifiers::{AliceId, RoundId, TimeFrame, Timestamp};
use super::parameters::RoundParameters;
use super::signing::SigningState;
use crate::error::{reject, ProtocolResult};

/// Round phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    InputRegistration,
    ConnectionConfirmation,
    OutputRegistration,
    TransactionSigning,
    Ended(EndRoundState),
}

impl Phase {
    pub fn ordinal(&self) -> u8 {
        match self {
            Phase::InputRegistration => 0,
            Phase::ConnectionConfirmation => 1,
            Phase::OutputRegistration => 2,
            Phase::TransactionSigning => 3,
            Phase::Ended(_) => 4,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Phase::Ended(_))
    }
}

/// Why a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndRoundState {
    TransactionBroadcasted,
    TransactionBroadcastFailed,
    AbortedWithError,
    AbortedNotEnoughAlices,
    AbortedNotEnoughAlicesSigned,
    NotAllAlicesSign,
    AbortedDoubleSpendingDetected,
}

impl EndRoundState {
    pub fn is_success(&self) -> bool {
        matches!(self, EndRoundState::TransactionBroadcasted)
    }
}

/// Restriction carried by a blame round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameInfo {
    pub blame_of: RoundId,
    pub whitelist: BTreeSet<OutPoint>,
}

/// The shared transaction in either of its two stages.
#[derive(Debug, Clone)]
pub enum MultipartyTransactionState {
    Construction(ConstructionState),
    Signing(SigningState),
}

#[derive(Debug, Clone)]
pub struct Round {
    id: RoundId,
    parameters: Arc<RoundParameters>,
    amount_issuer: IssuerParameters,
    vsize_issuer: IssuerParameters,
    phase: Phase,
    created_at: Timestamp,
    ended_at: Option<Timestamp>,
    pub(crate) input_registration: TimeFrame,
    pub(crate) connection_confirmation: TimeFrame,
    pub(crate) output_registration: TimeFrame,
    pub(crate) transaction_signing: TimeFrame,
    alices: Vec<Alice>,
    coinjoin: MultipartyTransactionState,
    blame: Option<BlameInfo>,
    was_transaction_broadcast: bool,
}

impl Round {
    pub fn new(
        parameters: RoundParameters,
        amount_issuer: IssuerParameters,
        vsize_issuer: IssuerParameters,
        blame: Option<BlameInfo>,
        now: Timestamp,
        nonce: [u8; 32],
    ) -> Self {
        let amount_bytes = serde_json::to_vec(&amount_issuer).unwrap_or_default();
        let vsize_bytes = serde_json::to_vec(&vsize_issuer).unwrap_or_default();
        let blame_of = blame.as_ref().map(|b| *b.blame_of.as_bytes()).unwrap_or([0u8; 32]);
        let id = RoundId::hash_of([
            parameters.hash_preimage().as_slice(),
            amount_bytes.as_slice(),
            vsize_bytes.as_slice(),
            now.to_le_bytes().as_slice(),
            blame_of.as_slice(),
            nonce.as_slice(),
        ]);

        let parameters = Arc::new(parameters);
        Self {
            id,
            amount_issuer,
            vsize_issuer,
            phase: Phase::InputRegistration,
            created_at: now,
            ended_at: None,
            input_registration: TimeFrame::create(parameters.input_registration_timeout_ms).started_at(now),
            connection_confirmation: TimeFrame::create(parameters.connection_confirmation_timeout_ms),
            output_registration: TimeFrame::create(parameters.output_registration_timeout_ms),
            transaction_signing: TimeFrame::create(parameters.transaction_signing_timeout_ms),
            alices: Vec::new(),
            coinjoin: MultipartyTransactionState::Construction(ConstructionState::new(parameters.clone())),
            parameters,
            blame,
            was_transaction_broadcast: false,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn parameters(&self) -> &RoundParameters {
        &self.parameters
    }

    pub fn amount_issuer(&self) -> &IssuerParameters {
        &self.amount_issuer
    }

    pub fn vsize_issuer(&self) -> &IssuerParameters {
        &self.vsize_issuer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn ended_at(&self) -> Option<Timestamp> {
        self.ended_at
    }

    pub fn alices(&self) -> &[Alice] {
        &self.alices
    }

    pub fn input_count(&self) -> usize {
        self.alices.iter().map(|a| a.registered_coins().len()).sum()
    }

    pub fn coinjoin(&self) -> &MultipartyTransactionState {
        &self.coinjoin
    }

    pub fn blame(&self) -> Option<&BlameInfo> {
        self.blame.as_ref()
    }

    pub fn is_blame_round(&self) -> bool {
        self.blame.is_some()
    }

    pub fn was_transaction_broadcast(&self) -> bool {
        self.was_transaction_broadcast
    }

    pub fn time_frame(&self, phase: Phase) -> Option<TimeFrame> {
        match phase {
            Phase::InputRegistration => Some(self.input_registration),
            Phase::ConnectionConfirmation => Some(self.connection_confirmation),
            Phase::OutputRegistration => Some(self.output_registration),
            Phase::TransactionSigning => Some(self.transaction_signing),
            Phase::Ended(_) => None,
        }
    }

    pub fn construction_state(&self) -> ProtocolResult<&ConstructionState> {
        match &self.coinjoin {
            MultipartyTransactionState::Construction(state) => Ok(state),
            MultipartyTransactionState::Signing(_) => {
                Err(reject!(WrongPhase, "round {} is no longer under construction", self.id))
            }
        }
    }

    pub fn signing_state(&self) -> ProtocolResult<&SigningState> {
        match &self.coinjoin {
            MultipartyTransactionState::Signing(state) => Ok(state),
            MultipartyTransactionState::Construction(_) => {
                Err(reject!(WrongPhase, "round {} is not signing", self.id))
            }
        }
    }

    pub fn alice(&self, id: AliceId) -> ProtocolResult<&Alice> {
        self.alices
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| reject!(AliceNotFound, "alice {} not in round {}", id, self.id))
    }

    pub fn alice_holding(&self, outpoint: &OutPoint) -> Option<&Alice> {
        self.alices.iter().find(|a| a.holds(outpoint))
    }

    /// Fail with `WrongPhase` unless the round is in one of `expected`.
    pub fn ensure_phase(&self, expected: &[Phase]) -> ProtocolResult<()> {
        if expected.contains(&self.phase) {
            Ok(())
        } else {
            Err(reject!(
                WrongPhase,
                "round {} is in {:?}, expected one of {:?}",
                self.id,
                self.phase,
                expected
            ))
        }
    }

    // =========================================================================
    // DERIVED STATE
    // =========================================================================

    pub fn is_input_registration_ended(&self, now: Timestamp) -> bool {
        if self.phase != Phase::InputRegistration {
            return true;
        }
        if let Some(blame) = &self.blame {
            if blame.whitelist.len() <= self.input_count() {
                return true;
            }
        }
        self.input_count() >= self.parameters.max_input_count_by_round
            || self.input_registration.has_expired(now)
    }

    /// Input vsize still available to new registrations.
    pub fn remaining_input_vsize_allocation(&self) -> u64 {
        let used: u64 = self.alices.iter().map(Alice::total_input_vsize).sum();
        self.parameters.initial_input_vsize_allocation().saturating_sub(used)
    }

    /// Confirmed value not yet turned into outputs, output fees included.
    pub fn unclaimed_amount(&self) -> i64 {
        let params = &self.parameters;
        let available: i64 = self
            .alices
            .iter()
            .filter(|a| a.confirmed_connection)
            .map(|a| a.calculate_remaining_amount_credentials(params.mining_fee_rate, params.coordination_fee_rate))
            .sum();
        let claimed: i64 = match &self.coinjoin {
            MultipartyTransactionState::Construction(state) => state
                .outputs()
                .iter()
                .map(|o| {
                    let vsize = bitcoin::consensus::encode::serialize(o).len() as u64;
                    (o.value + params.mining_fee_rate.fee_for(vsize)).to_sat() as i64
                })
                .sum(),
            MultipartyTransactionState::Signing(_) => available,
        };
        available - claimed
    }

    /// True once no further output could be paid for.
    pub fn is_all_value_claimed(&self) -> bool {
        let params = &self.parameters;
        let smallest = params.allowed_output_amounts.min + params.mining_fee_rate.fee_for(31);
        self.unclaimed_amount() < smallest.to_sat() as i64
    }

    // =========================================================================
    // INPUT REGISTRATION CHECKS
    // =========================================================================

    /// Checks that depend only on the round and the fetched coins, in
    /// protocol order: whitelist, input counts, vsize quota, ownership,
    /// amount range, per-participant vsize, tentative construction.
    pub fn check_input_registration(&self, coins: &[RegisteredCoin]) -> ProtocolResult<()> {
        let params = &self.parameters;

        if let Some(blame) = &self.blame {
            if let Some(c) = coins.iter().find(|c| !blame.whitelist.contains(&c.coin.outpoint)) {
                return Err(reject!(InputNotWhitelisted, "{} not whitelisted in blame round", c.coin.outpoint));
            }
        }

        if coins.len() > params.max_inputs_per_alice {
            return Err(reject!(
                TooManyInputs,
                "{} inputs exceed the per-participant limit {}",
                coins.len(),
                params.max_inputs_per_alice
            ));
        }
        if self.input_count() + coins.len() > params.max_input_count_by_round {
            return Err(reject!(
                TooManyInputs,
                "{} more inputs would exceed the round limit {}",
                coins.len(),
                params.max_input_count_by_round
            ));
        }
        let input_vsize: u64 = coins.iter().map(|c| c.coin.input_vsize()).sum();
        if input_vsize > self.remaining_input_vsize_allocation() {
            return Err(reject!(
                VsizeQuotaExceeded,
                "{} vbytes requested, {} remaining",
                input_vsize,
                self.remaining_input_vsize_allocation()
            ));
        }

        let commitment = params.commitment_data(self.id);
        if let Some(c) = coins
            .iter()
            .find(|c| !c.ownership_proof.verify(&c.coin.txout.script_pubkey, &commitment))
        {
            return Err(reject!(WrongRoundSignature, "ownership proof for {} does not match round", c.coin.outpoint));
        }

        let total: Amount = coins.iter().map(|c| c.coin.amount()).sum();
        if total < params.min_registrable_amount() {
            return Err(reject!(NotEnoughFunds, "{} below minimum {}", total, params.min_registrable_amount()));
        }
        if total > params.max_registrable_amount() {
            return Err(reject!(TooMuchFunds, "{} above maximum {}", total, params.max_registrable_amount()));
        }
        if input_vsize > params.per_alice_vsize_allocation() {
            return Err(reject!(
                TooMuchVsize,
                "{} vbytes exceed the per-participant allocation {}",
                input_vsize,
                params.per_alice_vsize_allocation()
            ));
        }

        let mut tentative = self.construction_state()?.clone();
        for c in coins {
            tentative = tentative.add_input(c.coin.clone())?;
        }
        Ok(())
    }

    /// Same-round script reuse.
    pub fn check_output_script(&self, script: &Script) -> ProtocolResult<()> {
        let state = self.construction_state()?;
        if state.outputs().iter().any(|o| o.script_pubkey.as_script() == script) {
            return Err(reject!(AlreadyRegisteredScript, "script already registered in round {}", self.id));
        }
        Ok(())
    }

    // =========================================================================
    // CONTENT MUTATIONS (request handlers and stepper)
    // =========================================================================

    pub(crate) fn add_alice(&mut self, alice: Alice) {
        self.alices.push(alice);
    }

    pub(crate) fn remove_alice(&mut self, id: AliceId) -> Option<Alice> {
        let index = self.alices.iter().position(|a| a.id == id)?;
        Some(self.alices.remove(index))
    }

    pub(crate) fn alice_mut(&mut self, id: AliceId) -> ProtocolResult<&mut Alice> {
        let round_id = self.id;
        self.alices
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| reject!(AliceNotFound, "alice {} not in round {}", id, round_id))
    }

    pub(crate) fn set_coinjoin(&mut self, state: MultipartyTransactionState) {
        self.coinjoin = state;
    }

    // =========================================================================
    // PHASE MUTATIONS (stepper only)
    // =========================================================================

    /// Advance to `phase`. Backward or sideways moves are ignored and logged.
    pub(crate) fn set_phase(&mut self, phase: Phase, now: Timestamp) {
        if phase.ordinal() <= self.phase.ordinal() {
            tracing::error!(round_id = %self.id, from = ?self.phase, to = ?phase, "Refusing non-forward phase transition");
            return;
        }
        self.phase = phase;
        match phase {
            Phase::ConnectionConfirmation => {
                self.connection_confirmation = self.connection_confirmation.started_at(now)
            }
            Phase::OutputRegistration => self.output_registration = self.output_registration.started_at(now),
            Phase::TransactionSigning => self.transaction_signing = self.transaction_signing.started_at(now),
            Phase::Ended(_) => self.ended_at = Some(now),
            Phase::InputRegistration => {}
        }
    }

    pub(crate) fn end(&mut self, state: EndRoundState, now: Timestamp) {
        if !self.phase.is_ended() {
            self.set_phase(Phase::Ended(state), now);
        }
    }

    pub(crate) fn mark_broadcast(&mut self) {
        self.was_transaction_broadcast = true;
    }
}
