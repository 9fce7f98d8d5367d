//! Participant request handlers.
//!
//! Chain lookups happen before the round writer is taken; everything after
//! runs on a working copy that is published only when the whole request
//! succeeded. Credential commits are the last fallible step before publish.

use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, TxOut};
use tracing::{debug, info, warn};

use super::registry::CoinRegistration;
use super::Arena;
use crate::domain::construction::output_vsize;
use crate::domain::{
    Alice, Coin, CredentialKind, CredentialsRequest, MultipartyTransactionState, Offense, Phase, PrisonKey,
    RegisteredCoin, Round,
};
use crate::error::{reject, CoordinatorResult, ProtocolErrorCode, ProtocolResult};
use crate::metrics;
use crate::ports::inbound::{
    ConnectionConfirmationRequest, ConnectionConfirmationResponse, InputRegistrationRequest, InputRegistrationResponse,
    InputsRemovalRequest, OutputRegistrationRequest, OutputRegistrationResponse, ReadyToSignRequest,
    ReissueCredentialRequest, ReissueCredentialResponse, TransactionSignaturesRequest,
};

impl Arena {
    // =========================================================================
    // INPUT REGISTRATION
    // =========================================================================

    pub async fn register_input(&self, request: InputRegistrationRequest) -> CoordinatorResult<InputRegistrationResponse> {
        let round_id = request.round_id;
        if request.inputs.is_empty() {
            return Err(reject!(NotEnoughFunds, "no inputs offered").into());
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = request.inputs.iter().find(|i| !seen.insert(i.outpoint)) {
            return Err(reject!(NonUniqueInputs, "{} offered twice", duplicate.outpoint).into());
        }
        ensure_zero(&request.zero_amount_credential_request, CredentialKind::Amount)?;
        ensure_zero(&request.zero_vsize_credential_request, CredentialKind::Vsize)?;

        let slot = self.slot(round_id)?;
        let snapshot = slot.snapshot();
        ensure_registration_open(&snapshot, self.clock.now())?;

        if let Some(input) = request
            .inputs
            .iter()
            .find(|i| self.warden.is_banned(&PrisonKey::Outpoint(i.outpoint)))
        {
            return Err(reject!(InputBanned, "{} is banned", input.outpoint).into());
        }

        let mut coins = Vec::with_capacity(request.inputs.len());
        for input in request.inputs {
            let info = self
                .chain
                .get_tx_out(&input.outpoint, true)
                .await?
                .ok_or_else(|| reject!(InputSpent, "{} is spent or unknown", input.outpoint))?;
            if info.confirmations == 0 && !snapshot.parameters().allow_unconfirmed_inputs {
                return Err(reject!(InputUnconfirmed, "{} is unconfirmed", input.outpoint).into());
            }
            if info.is_immature() {
                return Err(reject!(InputImmature, "{} is an immature coinbase output", input.outpoint).into());
            }
            if self.warden.is_banned(&PrisonKey::Script(info.txout.script_pubkey.clone())) {
                return Err(reject!(InputBanned, "script of {} is banned", input.outpoint).into());
            }
            coins.push(RegisteredCoin {
                coin: Coin::new(input.outpoint, info.txout),
                ownership_proof: input.ownership_proof,
            });
        }

        let mut edit = slot.edit().await;
        let now = self.clock.now();
        ensure_registration_open(&edit.round, now)?;
        if let Err(e) = edit.round.check_input_registration(&coins) {
            if e.code() == ProtocolErrorCode::WrongRoundSignature {
                self.punish_failed_proofs(&edit.round, &coins);
            }
            return Err(e.into());
        }

        let amount = slot.amount_issuer.prepare(&request.zero_amount_credential_request).await?;
        let vsize = slot.vsize_issuer.prepare(&request.zero_vsize_credential_request).await?;

        let params = edit.round.parameters();
        let alice = Alice::new(
            coins,
            now.saturating_add(params.connection_confirmation_timeout_ms),
            params.coordination_fee_rate,
        );
        let alice_id = alice.id;
        let outpoints: Vec<OutPoint> = alice.outpoints().copied().collect();

        let claim = self.registry.claim(round_id, alice_id, &outpoints)?;
        let committed = (|| {
            Ok::<_, crate::error::IssuerError>((
                slot.amount_issuer.commit(amount)?.issued,
                slot.vsize_issuer.commit(vsize)?.issued,
            ))
        })();
        let (amount_credentials, vsize_credentials) = match committed {
            Ok(issued) => issued,
            Err(e) => {
                self.registry.revert(round_id, alice_id, claim);
                return Err(e.into());
            }
        };

        let mut remote = Vec::new();
        for previous in claim.superseded() {
            if previous.round_id != round_id {
                remote.push(previous);
                continue;
            }
            if let Some(old) = edit.round.remove_alice(previous.alice_id) {
                let old_outpoints: Vec<OutPoint> = old.outpoints().copied().collect();
                self.registry.release(round_id, old.id, &old_outpoints);
                info!(%round_id, alice_id = %old.id, "Superseded earlier registration");
            }
        }

        let response = InputRegistrationResponse {
            alice_id,
            amount_credentials,
            vsize_credentials,
            is_paying_zero_coordination_fee: alice.is_paying_zero_coordination_fee,
        };
        let input_count = outpoints.len();
        edit.round.add_alice(alice);
        edit.publish();

        // Stepping drops superseded registrations too, so an abandoned eviction only delays it
        for previous in remote {
            self.evict_superseded(previous).await;
        }

        metrics::record_inputs_registered(input_count as u64);
        info!(%round_id, %alice_id, inputs = input_count, "Input registered");
        Ok(response)
    }

    pub async fn remove_input(&self, request: InputsRemovalRequest) -> CoordinatorResult<()> {
        let slot = self.slot(request.round_id)?;
        let mut edit = slot.edit().await;
        edit.round.ensure_phase(&[Phase::InputRegistration])?;
        if edit.round.alice(request.alice_id)?.confirmed_connection {
            return Err(reject!(WrongPhase, "alice {} already confirmed", request.alice_id).into());
        }

        if let Some(alice) = edit.round.remove_alice(request.alice_id) {
            let outpoints: Vec<OutPoint> = alice.outpoints().copied().collect();
            self.registry.release(request.round_id, alice.id, &outpoints);
        }
        edit.publish();
        info!(round_id = %request.round_id, alice_id = %request.alice_id, "Input removed");
        Ok(())
    }

    // =========================================================================
    // CONNECTION CONFIRMATION
    // =========================================================================

    pub async fn confirm_connection(
        &self,
        request: ConnectionConfirmationRequest,
    ) -> CoordinatorResult<ConnectionConfirmationResponse> {
        let round_id = request.round_id;
        ensure_zero(&request.zero_amount_credential_request, CredentialKind::Amount)?;
        ensure_zero(&request.zero_vsize_credential_request, CredentialKind::Vsize)?;

        let slot = self.slot(round_id)?;
        let mut edit = slot.edit().await;
        edit.round
            .ensure_phase(&[Phase::InputRegistration, Phase::ConnectionConfirmation])?;
        let alice = edit.round.alice(request.alice_id)?.clone();
        let outpoints: Vec<OutPoint> = alice.outpoints().copied().collect();

        if edit.round.phase() == Phase::InputRegistration {
            let amount = slot.amount_issuer.prepare(&request.zero_amount_credential_request).await?;
            let vsize = slot.vsize_issuer.prepare(&request.zero_vsize_credential_request).await?;

            let deadline = self
                .clock
                .now()
                .saturating_add(edit.round.parameters().connection_confirmation_timeout_ms);
            edit.round.alice_mut(alice.id)?.deadline = deadline;

            let response = ConnectionConfirmationResponse {
                zero_amount_credentials: slot.amount_issuer.commit(amount)?.issued,
                zero_vsize_credentials: slot.vsize_issuer.commit(vsize)?.issued,
                real_amount_credentials: None,
                real_vsize_credentials: None,
            };
            edit.publish();
            debug!(%round_id, alice_id = %alice.id, deadline, "Registration kept alive");
            return Ok(response);
        }

        if alice.confirmed_connection {
            return Err(reject!(AliceAlreadyRegistered, "alice {} already confirmed", alice.id).into());
        }

        let params = edit.round.parameters();
        let expected_amount =
            alice.calculate_remaining_amount_credentials(params.mining_fee_rate, params.coordination_fee_rate);
        if request.real_amount_credential_request.delta != expected_amount {
            return Err(reject!(
                IncorrectRequestedAmountCredentials,
                "requested {} amount, entitled to {}",
                request.real_amount_credential_request.delta,
                expected_amount
            )
            .into());
        }
        let expected_vsize = alice.calculate_remaining_vsize_credentials(params.per_alice_vsize_allocation());
        if request.real_vsize_credential_request.delta != expected_vsize {
            return Err(reject!(
                IncorrectRequestedVsizeCredentials,
                "requested {} vsize, entitled to {}",
                request.real_vsize_credential_request.delta,
                expected_vsize
            )
            .into());
        }
        ensure_disjoint(&request.zero_amount_credential_request, &request.real_amount_credential_request)?;
        ensure_disjoint(&request.zero_vsize_credential_request, &request.real_vsize_credential_request)?;

        let mut construction = edit.round.construction_state()?.clone();
        for coin in alice.coins() {
            construction = construction.add_input(coin.clone())?;
        }

        let zero_amount = slot.amount_issuer.prepare(&request.zero_amount_credential_request).await?;
        let real_amount = slot.amount_issuer.prepare(&request.real_amount_credential_request).await?;
        let zero_vsize = slot.vsize_issuer.prepare(&request.zero_vsize_credential_request).await?;
        let real_vsize = slot.vsize_issuer.prepare(&request.real_vsize_credential_request).await?;

        self.registry.lock(round_id, alice.id, &outpoints)?;
        let committed = (|| {
            Ok::<_, crate::error::IssuerError>(ConnectionConfirmationResponse {
                zero_amount_credentials: slot.amount_issuer.commit(zero_amount)?.issued,
                real_amount_credentials: Some(slot.amount_issuer.commit(real_amount)?.issued),
                zero_vsize_credentials: slot.vsize_issuer.commit(zero_vsize)?.issued,
                real_vsize_credentials: Some(slot.vsize_issuer.commit(real_vsize)?.issued),
            })
        })();
        let response = match committed {
            Ok(response) => response,
            Err(e) => {
                let _ = self.registry.unlock(round_id, alice.id, &outpoints);
                return Err(e.into());
            }
        };

        edit.round.alice_mut(alice.id)?.confirmed_connection = true;
        edit.round.set_coinjoin(MultipartyTransactionState::Construction(construction));
        edit.publish();
        info!(%round_id, alice_id = %alice.id, "Connection confirmed");
        Ok(response)
    }

    // =========================================================================
    // OUTPUT REGISTRATION
    // =========================================================================

    pub async fn register_output(&self, request: OutputRegistrationRequest) -> CoordinatorResult<OutputRegistrationResponse> {
        let round_id = request.round_id;
        let slot = self.slot(round_id)?;
        let mut edit = slot.edit().await;
        edit.round.ensure_phase(&[Phase::OutputRegistration])?;

        let params = edit.round.parameters();
        let vsize = output_vsize(&TxOut {
            value: Amount::ZERO,
            script_pubkey: request.script.clone(),
        });
        if request.vsize_credential_request.delta != -(vsize as i64) {
            return Err(reject!(
                IncorrectRequestedVsizeCredentials,
                "output costs {} vbytes, request delta is {}",
                vsize,
                request.vsize_credential_request.delta
            )
            .into());
        }
        let spent = match request.amount_credential_request.delta.checked_neg() {
            Some(spent) if spent > 0 => spent,
            _ => {
                return Err(reject!(
                    IncorrectRequestedAmountCredentials,
                    "output must spend amount, request delta is {}",
                    request.amount_credential_request.delta
                )
                .into())
            }
        };
        let value = spent.saturating_sub(params.mining_fee_rate.fee_for(vsize).to_sat() as i64);
        if value <= 0 {
            return Err(reject!(NotEnoughFunds, "{} sats do not cover the output fee", spent).into());
        }
        let txout = TxOut {
            value: Amount::from_sat(value as u64),
            script_pubkey: request.script,
        };

        edit.round.check_output_script(&txout.script_pubkey)?;
        let construction = edit.round.construction_state()?.add_output(txout.clone())?;
        if self.scripts.read().contains(&txout.script_pubkey) {
            warn!(%round_id, "Output script was already used in an earlier coinjoin");
        }

        let amount = slot.amount_issuer.prepare(&request.amount_credential_request).await?;
        let vsize_issuance = slot.vsize_issuer.prepare(&request.vsize_credential_request).await?;
        let response = OutputRegistrationResponse {
            amount_credentials: slot.amount_issuer.commit(amount)?.issued,
            vsize_credentials: slot.vsize_issuer.commit(vsize_issuance)?.issued,
        };

        edit.round.set_coinjoin(MultipartyTransactionState::Construction(construction));
        edit.publish();
        info!(%round_id, value = %txout.value, vsize, "Output registered");
        Ok(response)
    }

    pub async fn ready_to_sign(&self, request: ReadyToSignRequest) -> CoordinatorResult<()> {
        let slot = self.slot(request.round_id)?;
        let mut edit = slot.edit().await;
        edit.round.ensure_phase(&[Phase::OutputRegistration])?;
        edit.round.alice_mut(request.alice_id)?.ready_to_sign = true;
        edit.publish();
        debug!(round_id = %request.round_id, alice_id = %request.alice_id, "Ready to sign");
        Ok(())
    }

    pub async fn reissue_credentials(&self, request: ReissueCredentialRequest) -> CoordinatorResult<ReissueCredentialResponse> {
        ensure_zero(&request.zero_amount_credential_request, CredentialKind::Amount)?;
        ensure_zero(&request.zero_vsize_credential_request, CredentialKind::Vsize)?;
        if request.real_amount_credential_request.delta != 0 {
            return Err(reject!(IncorrectRequestedAmountCredentials, "reissuance cannot move amount").into());
        }
        if request.real_vsize_credential_request.delta != 0 {
            return Err(reject!(IncorrectRequestedVsizeCredentials, "reissuance cannot move vsize").into());
        }
        ensure_disjoint(&request.zero_amount_credential_request, &request.real_amount_credential_request)?;
        ensure_disjoint(&request.zero_vsize_credential_request, &request.real_vsize_credential_request)?;

        let slot = self.slot(request.round_id)?;
        let edit = slot.edit().await;
        edit.round
            .ensure_phase(&[Phase::ConnectionConfirmation, Phase::OutputRegistration])?;

        let real_amount = slot.amount_issuer.prepare(&request.real_amount_credential_request).await?;
        let zero_amount = slot.amount_issuer.prepare(&request.zero_amount_credential_request).await?;
        let real_vsize = slot.vsize_issuer.prepare(&request.real_vsize_credential_request).await?;
        let zero_vsize = slot.vsize_issuer.prepare(&request.zero_vsize_credential_request).await?;

        Ok(ReissueCredentialResponse {
            real_amount_credentials: slot.amount_issuer.commit(real_amount)?.issued,
            zero_amount_credentials: slot.amount_issuer.commit(zero_amount)?.issued,
            real_vsize_credentials: slot.vsize_issuer.commit(real_vsize)?.issued,
            zero_vsize_credentials: slot.vsize_issuer.commit(zero_vsize)?.issued,
        })
    }

    // =========================================================================
    // TRANSACTION SIGNING
    // =========================================================================

    pub async fn sign_transaction(&self, request: TransactionSignaturesRequest) -> CoordinatorResult<()> {
        let round_id = request.round_id;
        let slot = self.slot(round_id)?;
        let mut edit = slot.edit().await;
        edit.round.ensure_phase(&[Phase::TransactionSigning])?;

        let mut state = edit.round.signing_state()?.clone();
        for pair in &request.witnesses {
            state = match state.add_witness(pair.input_index, pair.witness.clone()) {
                Ok(next) => next,
                Err(e) => {
                    if e.code() == ProtocolErrorCode::WrongCoinjoinSignature {
                        if let Some(coin) = state.inputs().get(pair.input_index) {
                            self.warden
                                .punish(PrisonKey::Outpoint(coin.outpoint), Offense::FailedToVerify { round_id });
                        }
                    }
                    return Err(e.into());
                }
            };
        }

        edit.round
            .set_coinjoin(MultipartyTransactionState::Signing(state.publish_witnesses()));
        edit.publish();
        debug!(%round_id, witnesses = request.witnesses.len(), "Signatures accepted");
        Ok(())
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Remove an Alice whose coins were claimed in another round.
    async fn evict_superseded(&self, previous: CoinRegistration) {
        let Ok(slot) = self.slot(previous.round_id) else {
            return;
        };
        let mut edit = slot.edit().await;
        if !matches!(edit.round.phase(), Phase::InputRegistration | Phase::ConnectionConfirmation) {
            return;
        }
        let confirmed = match edit.round.alice(previous.alice_id) {
            Ok(alice) => alice.confirmed_connection,
            Err(_) => return,
        };
        if confirmed {
            return;
        }
        if let Some(alice) = edit.round.remove_alice(previous.alice_id) {
            let outpoints: Vec<OutPoint> = alice.outpoints().copied().collect();
            self.registry.release(previous.round_id, alice.id, &outpoints);
            edit.publish();
            info!(round_id = %previous.round_id, alice_id = %alice.id, "Evicted registration superseded in another round");
        }
    }

    fn punish_failed_proofs(&self, round: &Round, coins: &[RegisteredCoin]) {
        let commitment = round.parameters().commitment_data(round.id());
        for c in coins
            .iter()
            .filter(|c| !c.ownership_proof.verify(&c.coin.txout.script_pubkey, &commitment))
        {
            self.warden.punish(
                PrisonKey::Outpoint(c.coin.outpoint),
                Offense::FailedToVerify { round_id: round.id() },
            );
        }
    }
}

fn ensure_registration_open(round: &Round, now: u64) -> ProtocolResult<()> {
    round.ensure_phase(&[Phase::InputRegistration])?;
    if round.is_input_registration_ended(now) {
        return Err(reject!(WrongPhase, "input registration of round {} has ended", round.id()));
    }
    Ok(())
}

fn ensure_zero(request: &CredentialsRequest, kind: CredentialKind) -> ProtocolResult<()> {
    if request.is_zero() {
        Ok(())
    } else {
        Err(reject!(InvalidCredentialRequest, "{} zero credential request carries value", kind))
    }
}

/// Two requests to one issuer in the same call must not present the same credential.
fn ensure_disjoint(a: &CredentialsRequest, b: &CredentialsRequest) -> ProtocolResult<()> {
    let serials: HashSet<_> = a.presented.iter().map(|c| c.serial).collect();
    if b.presented.iter().any(|c| serials.contains(&c.serial)) {
        return Err(reject!(InvalidCredentialRequest, "credential presented twice"));
    }
    Ok(())
}
