//! Phase progression, chain events and round lifecycle.
//!
//! `step` is the only code that changes a round's phase. It runs under the
//! arena's step lock so two ticks never interleave; each round is stepped
//! under its own writer, so requests to that round wait for at most one
//! round's worth of work.
//!
//! | Phase                  | Leaves when                                      | To                          |
//! |------------------------|--------------------------------------------------|-----------------------------|
//! | InputRegistration      | timeout, input cap, or blame whitelist filled    | ConnectionConfirmation / ended |
//! | ConnectionConfirmation | all confirmed or timeout                         | OutputRegistration / ended  |
//! | OutputRegistration     | all ready, all value claimed, or timeout         | TransactionSigning / ended  |
//! | TransactionSigning     | fully signed or timeout                          | ended                       |

use std::collections::BTreeSet;

use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut};
use cj_telemetry::{log_coin_event, log_round_event};
use rand::RngCore;
use tracing::{debug, error, info, warn};

use super::{Arena, RoundEdit, RoundSlot};
use crate::domain::construction::output_vsize;
use crate::domain::script::is_dust;
use crate::domain::{
    AliceId, BlameInfo, ConstructionState, CredentialKind, DisruptionMethod, EndRoundState, FeeRate, FeeRateSample,
    MultipartyTransactionState, Offense, Phase, PrisonKey, Round, RoundId, RoundParameters,
};
use crate::error::CoordinatorResult;
use crate::events::{spent_outpoints, ChainEvent, CoordinatorEvent};
use crate::metrics;

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

/// What a stepped round asks the arena to do next.
enum Followup {
    None,
    Blame {
        parameters: RoundParameters,
        blame_of: RoundId,
        whitelist: BTreeSet<OutPoint>,
    },
}

impl Arena {
    /// Advance every round by at most one phase, evict expired rounds and
    /// make sure a round is open for registration.
    pub async fn step(&self) {
        let _step = self.step_lock.lock().await;

        for slot in self.slots() {
            let phase = slot.snapshot().phase();
            let followup = match phase {
                Phase::InputRegistration => {
                    self.step_input_registration(&slot).await;
                    Followup::None
                }
                Phase::ConnectionConfirmation => self.step_connection_confirmation(&slot).await,
                Phase::OutputRegistration => {
                    self.step_output_registration(&slot).await;
                    Followup::None
                }
                Phase::TransactionSigning => self.step_transaction_signing(&slot).await,
                Phase::Ended(_) => Followup::None,
            };

            if let Followup::Blame {
                parameters,
                blame_of,
                whitelist,
            } = followup
            {
                let blame = BlameInfo { blame_of, whitelist };
                if let Err(e) = self.create_round(parameters, Some(blame)) {
                    error!(%blame_of, error = %e, "Failed to create blame round");
                }
            }
        }

        self.evict_expired_rounds();
        self.ensure_open_round().await;

        let open = self.rounds().iter().filter(|r| !r.phase().is_ended()).count();
        metrics::set_open_rounds(open);
    }

    // =========================================================================
    // PER-PHASE STEPPING
    // =========================================================================

    async fn step_input_registration(&self, slot: &RoundSlot) {
        let snapshot = slot.snapshot();
        let mut spent = Vec::new();
        for alice in snapshot.alices().iter().filter(|a| !a.confirmed_connection) {
            for outpoint in alice.outpoints() {
                match self.chain.get_tx_out(outpoint, true).await {
                    Ok(None) => spent.push(alice.id),
                    Ok(Some(_)) => {}
                    Err(e) => debug!(round_id = %snapshot.id(), %outpoint, error = %e, "Skipping spent-coin check"),
                }
            }
        }

        let mut edit = slot.edit().await;
        if edit.round.phase() != Phase::InputRegistration {
            return;
        }
        let now = self.clock.now();
        let round_id = edit.round.id();

        self.drop_superseded(&mut edit);
        let expired: Vec<_> = edit
            .round
            .alices()
            .iter()
            .filter(|a| !a.confirmed_connection && (a.is_past_deadline(now) || spent.contains(&a.id)))
            .map(|a| a.id)
            .collect();
        for alice_id in expired {
            self.drop_alice(&mut edit, alice_id);
            info!(%round_id, %alice_id, "Dropped registration that lapsed or was spent");
        }

        if !edit.round.is_input_registration_ended(now) {
            edit.publish();
            return;
        }

        let min_inputs = edit.round.parameters().min_input_count_by_round;
        if edit.round.input_count() >= min_inputs {
            self.advance(&mut edit, Phase::ConnectionConfirmation, now);
        } else {
            info!(
                %round_id,
                inputs = edit.round.input_count(),
                min = min_inputs,
                "Not enough inputs registered"
            );
            self.end_round(&mut edit, EndRoundState::AbortedNotEnoughAlices, now);
        }
        edit.publish();
    }

    async fn step_connection_confirmation(&self, slot: &RoundSlot) -> Followup {
        let mut edit = slot.edit().await;
        if edit.round.phase() != Phase::ConnectionConfirmation {
            return Followup::None;
        }
        let now = self.clock.now();
        let round_id = edit.round.id();

        self.drop_superseded(&mut edit);
        let all_confirmed = edit.round.alices().iter().all(|a| a.confirmed_connection);
        let timed_out = edit
            .round
            .time_frame(Phase::ConnectionConfirmation)
            .is_some_and(|t| t.has_expired(now));
        if !all_confirmed && !timed_out {
            edit.publish();
            return Followup::None;
        }

        let unconfirmed: Vec<_> = edit
            .round
            .alices()
            .iter()
            .filter(|a| !a.confirmed_connection)
            .cloned()
            .collect();
        for alice in &unconfirmed {
            let value = alice.total_input_amount();
            for outpoint in alice.outpoints() {
                self.warden.punish(
                    PrisonKey::Outpoint(*outpoint),
                    Offense::RoundDisruption {
                        value,
                        method: DisruptionMethod::DidNotConfirm,
                        disrupted_round_ids: vec![round_id],
                    },
                );
            }
            self.drop_alice(&mut edit, alice.id);
        }
        if !unconfirmed.is_empty() {
            warn!(%round_id, count = unconfirmed.len(), "Removed participants that did not confirm");
        }

        let params = edit.round.parameters().clone();
        let mut followup = Followup::None;
        if edit.round.input_count() >= params.min_input_count_by_round {
            self.advance(&mut edit, Phase::OutputRegistration, now);
        } else {
            if !unconfirmed.is_empty() {
                followup = self.blame_followup(&edit.round, &params);
            }
            self.end_round(&mut edit, EndRoundState::AbortedNotEnoughAlices, now);
        }
        edit.publish();
        followup
    }

    async fn step_output_registration(&self, slot: &RoundSlot) {
        let mut edit = slot.edit().await;
        if edit.round.phase() != Phase::OutputRegistration {
            return;
        }
        let now = self.clock.now();
        let round_id = edit.round.id();

        let all_ready = edit.round.alices().iter().all(|a| a.ready_to_sign);
        let timed_out = edit
            .round
            .time_frame(Phase::OutputRegistration)
            .is_some_and(|t| t.has_expired(now));
        if !all_ready && !edit.round.is_all_value_claimed() && !timed_out {
            return;
        }

        let finalized = edit.round.construction_state().and_then(|state| {
            let state = self.with_coordinator_fee(state.clone(), edit.round.parameters());
            state.finalize()
        });
        match finalized {
            Ok(signing) => {
                info!(
                    %round_id,
                    inputs = signing.inputs().len(),
                    outputs = signing.outputs().len(),
                    "Coinjoin finalized"
                );
                edit.round.set_coinjoin(MultipartyTransactionState::Signing(signing));
                self.advance(&mut edit, Phase::TransactionSigning, now);
            }
            Err(e) => {
                error!(%round_id, error = %e, "Failed to finalize coinjoin");
                self.end_round(&mut edit, EndRoundState::AbortedWithError, now);
            }
        }
        edit.publish();
    }

    async fn step_transaction_signing(&self, slot: &RoundSlot) -> Followup {
        let snapshot = slot.snapshot();
        let round_id = snapshot.id();
        let Ok(signing) = snapshot.signing_state() else {
            return Followup::None;
        };

        if signing.is_fully_signed() {
            let transaction = signing.create_transaction();
            let result = self.chain.broadcast(&transaction).await;
            let mut edit = slot.edit().await;
            let now = self.clock.now();
            if edit.round.phase() != Phase::TransactionSigning {
                warn!(%round_id, phase = ?edit.round.phase(), "Round left signing during broadcast");
                return Followup::None;
            }
            match result {
                Ok(()) => {
                    edit.round.mark_broadcast();
                    self.end_round(&mut edit, EndRoundState::TransactionBroadcasted, now);
                    edit.publish();
                    self.record_broadcast(round_id, &transaction);
                }
                Err(e) => {
                    error!(%round_id, error = %e, "Coinjoin broadcast failed");
                    self.end_round(&mut edit, EndRoundState::TransactionBroadcastFailed, now);
                    edit.publish();
                }
            }
            return Followup::None;
        }

        let now = self.clock.now();
        let timed_out = snapshot
            .time_frame(Phase::TransactionSigning)
            .is_some_and(|t| t.has_expired(now));
        if !timed_out {
            return Followup::None;
        }

        let mut edit = slot.edit().await;
        if edit.round.phase() != Phase::TransactionSigning {
            return Followup::None;
        }
        let unsigned: BTreeSet<OutPoint> = match edit.round.signing_state() {
            Ok(state) => state.unsigned_inputs().map(|c| c.outpoint).collect(),
            Err(_) => return Followup::None,
        };
        let offenders: Vec<_> = edit
            .round
            .alices()
            .iter()
            .filter(|a| a.outpoints().any(|o| unsigned.contains(o)))
            .cloned()
            .collect();
        for alice in &offenders {
            let value = alice.total_input_amount();
            for outpoint in alice.outpoints().filter(|o| unsigned.contains(o)) {
                self.warden.punish(
                    PrisonKey::Outpoint(*outpoint),
                    Offense::RoundDisruption {
                        value,
                        method: DisruptionMethod::DidNotSign,
                        disrupted_round_ids: vec![round_id],
                    },
                );
            }
            edit.round.remove_alice(alice.id);
        }
        warn!(%round_id, inputs = unsigned.len(), "Signing timed out");

        let params = edit.round.parameters().clone();
        let followup = self.blame_followup(&edit.round, &params);
        let end_state = if matches!(followup, Followup::Blame { .. }) {
            EndRoundState::NotAllAlicesSign
        } else {
            EndRoundState::AbortedNotEnoughAlicesSigned
        };
        self.end_round(&mut edit, end_state, now);
        edit.publish();
        followup
    }

    // =========================================================================
    // CHAIN EVENTS
    // =========================================================================

    /// Apply ban inheritance and double-spend handling for observed transactions.
    pub async fn handle_chain_event(&self, event: ChainEvent) {
        let _step = self.step_lock.lock().await;
        let signing_txids: Vec<_> = self
            .rounds()
            .iter()
            .filter_map(|r| r.signing_state().ok().map(|s| s.create_unsigned_transaction().compute_txid()))
            .collect();

        for transaction in event.transactions() {
            let txid = transaction.compute_txid();
            if signing_txids.contains(&txid) {
                debug!(%txid, "Observed our own coinjoin");
                continue;
            }

            let ancestors: Vec<OutPoint> = spent_outpoints(transaction).collect();
            let descendants: Vec<OutPoint> = (0..transaction.output.len() as u32)
                .map(|vout| OutPoint::new(txid, vout))
                .collect();
            self.warden.inherit_punishment(&descendants, &ancestors);

            for outpoint in ancestors {
                if let Some(registration) = self.registry.get(&outpoint) {
                    self.handle_double_spend(registration.round_id, outpoint, &event).await;
                }
            }
        }
    }

    async fn handle_double_spend(&self, round_id: RoundId, outpoint: OutPoint, event: &ChainEvent) {
        let Ok(slot) = self.slot(round_id) else {
            return;
        };
        let mut edit = slot.edit().await;
        let Some(alice) = edit.round.alice_holding(&outpoint).cloned() else {
            return;
        };
        let Some(coin) = alice.coins().find(|c| c.outpoint == outpoint).cloned() else {
            return;
        };

        self.warden
            .double_spent(outpoint, coin.txout.script_pubkey.clone(), coin.amount(), vec![round_id]);

        if !alice.confirmed_connection {
            self.drop_alice(&mut edit, alice.id);
            edit.publish();
            log_coin_event!(warn, round_id, outpoint, "Removed participant whose coin was double spent", alice_id = %alice.id);
            return;
        }

        let mining_fee_rate = edit.round.parameters().mining_fee_rate;
        let outbids = event.fee_rate().map_or(true, |rate| rate >= mining_fee_rate);
        if event.is_confirmed() || outbids {
            let now = self.clock.now();
            self.end_round(&mut edit, EndRoundState::AbortedDoubleSpendingDetected, now);
            edit.publish();
            log_coin_event!(warn, round_id, outpoint, "Round aborted by double spend");
        } else {
            log_coin_event!(info, round_id, outpoint, "Double spend pays less than the round, letting it race");
        }
    }

    // =========================================================================
    // ROUND LIFECYCLE
    // =========================================================================

    async fn ensure_open_round(&self) {
        let now = self.clock.now();
        let has_open = self
            .rounds()
            .iter()
            .any(|r| !r.is_blame_round() && r.phase() == Phase::InputRegistration && !r.is_input_registration_ended(now));
        if has_open {
            return;
        }

        let fee_rate = self.current_fee_rate().await;
        let parameters = self.config.round_parameters(fee_rate);
        if let Err(e) = self.create_round(parameters, None) {
            error!(error = %e, "Failed to create round");
        }
    }

    /// Oracle estimate, else the one-day average, else the configured fallback.
    async fn current_fee_rate(&self) -> FeeRate {
        let target = self.config.confirmation_target;
        let now = self.clock.now();
        let estimate = match self.chain.estimate_fee_rate(target).await {
            Ok(fee_rate) => {
                self.fee_stats.lock().add(FeeRateSample {
                    timestamp: now,
                    confirmation_target: target,
                    fee_rate,
                });
                self.events.publish(CoordinatorEvent::FeeRateSampled {
                    confirmation_target: target,
                    fee_rate,
                });
                fee_rate
            }
            Err(e) => {
                let average = self.fee_stats.lock().average(target, DAY_MS, now);
                warn!(error = %e, ?average, "Fee estimation failed, using history");
                average.unwrap_or_else(|| self.config.fallback_fee_rate())
            }
        };
        estimate.max(self.config.min_relay_fee())
    }

    fn create_round(&self, parameters: RoundParameters, blame: Option<BlameInfo>) -> CoordinatorResult<RoundId> {
        let amount_issuer = self
            .issuers
            .create(CredentialKind::Amount, parameters.max_amount_credential_value())?;
        let vsize_issuer = self
            .issuers
            .create(CredentialKind::Vsize, parameters.max_vsize_credential_value())?;

        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        let fee_rate = parameters.mining_fee_rate;
        let blame_of = blame.as_ref().map(|b| b.blame_of);
        let round = Round::new(
            parameters,
            amount_issuer.parameters(),
            vsize_issuer.parameters(),
            blame,
            self.clock.now(),
            nonce,
        );

        let round_id = self.insert_slot(RoundSlot::new(round, amount_issuer, vsize_issuer));
        info!(%round_id, ?blame_of, %fee_rate, "Round created");
        metrics::record_round_created(blame_of.is_some());
        self.events.publish(CoordinatorEvent::RoundCreated {
            round_id,
            blame_of,
            fee_rate,
        });
        Ok(round_id)
    }

    fn evict_expired_rounds(&self) {
        let now = self.clock.now();
        let expiry_ms = self.config.round_expiry_timeout_secs.saturating_mul(1_000);
        let expired: Vec<RoundId> = self
            .rounds()
            .iter()
            .filter(|r| r.ended_at().is_some_and(|t| now.saturating_sub(t) >= expiry_ms))
            .map(|r| r.id())
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut rounds = self.rounds.write();
        for round_id in expired {
            rounds.remove(&round_id);
            debug!(%round_id, "Expired round evicted");
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn advance(&self, edit: &mut RoundEdit<'_>, phase: Phase, now: u64) {
        edit.round.set_phase(phase, now);
        let round_id = edit.round.id();
        log_round_event!(info, round_id, "Phase changed", phase = ?phase, inputs = edit.round.input_count());
        self.events.publish(CoordinatorEvent::PhaseChanged { round_id, phase });
    }

    fn end_round(&self, edit: &mut RoundEdit<'_>, end_state: EndRoundState, now: u64) {
        if edit.round.phase().is_ended() {
            return;
        }
        edit.round.end(end_state, now);
        let round_id = edit.round.id();
        let released = self.registry.release_round(round_id);
        log_round_event!(info, round_id, "Round ended", end_state = ?end_state, released = released);
        metrics::record_round_ended(&format!("{end_state:?}"));
        self.events.publish(CoordinatorEvent::RoundEnded { round_id, end_state });
    }

    fn drop_alice(&self, edit: &mut RoundEdit<'_>, alice_id: AliceId) {
        let round_id = edit.round.id();
        if let Some(alice) = edit.round.remove_alice(alice_id) {
            let outpoints: Vec<OutPoint> = alice.outpoints().copied().collect();
            self.registry.release(round_id, alice_id, &outpoints);
        }
    }

    /// Drop unconfirmed Alices whose coins were claimed by a later registration.
    fn drop_superseded(&self, edit: &mut RoundEdit<'_>) {
        let round_id = edit.round.id();
        let superseded: Vec<AliceId> = edit
            .round
            .alices()
            .iter()
            .filter(|a| !a.confirmed_connection)
            .filter(|a| {
                let outpoints: Vec<OutPoint> = a.outpoints().copied().collect();
                !self.registry.owns_all(round_id, a.id, &outpoints)
            })
            .map(|a| a.id)
            .collect();
        for alice_id in superseded {
            self.drop_alice(edit, alice_id);
            info!(%round_id, %alice_id, "Dropped registration superseded in another round");
        }
    }

    /// Blame round over the inputs still in `round`, if there are enough of them.
    fn blame_followup(&self, round: &Round, params: &RoundParameters) -> Followup {
        let whitelist: BTreeSet<OutPoint> = round.alices().iter().flat_map(|a| a.outpoints().copied()).collect();
        let min_inputs = self.config.blame_min_input_count();
        if whitelist.is_empty() || whitelist.len() < min_inputs {
            return Followup::None;
        }
        let timeout_ms = self.config.blame_input_registration_timeout_secs.saturating_mul(1_000);
        Followup::Blame {
            parameters: params.for_blame_round(min_inputs, timeout_ms),
            blame_of: round.id(),
            whitelist,
        }
    }

    /// Pay the surplus above the mining fee to the coordinator, if it is worth an output.
    fn with_coordinator_fee(
        &self,
        state: ConstructionState,
        params: &RoundParameters,
    ) -> ConstructionState {
        let Some(script) = params.coordinator_fee_script.clone() else {
            return state;
        };
        let fee_output = TxOut {
            value: Amount::ZERO,
            script_pubkey: script.clone(),
        };
        let vsize = state.estimated_vsize() + output_vsize(&fee_output);
        let surplus = state.balance() - params.mining_fee_rate.fee_for(vsize).to_sat() as i64;
        if surplus <= 0 {
            return state;
        }
        let txout = TxOut {
            value: Amount::from_sat(surplus as u64),
            script_pubkey: script,
        };
        if is_dust(&txout, params.min_relay_tx_fee) {
            return state;
        }
        match state.add_coordinator_output(txout) {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "Skipping coordinator fee output");
                state
            }
        }
    }

    fn record_broadcast(&self, round_id: RoundId, transaction: &Transaction) {
        let txid = transaction.compute_txid();
        let scripts: Vec<ScriptBuf> = transaction.output.iter().map(|o| o.script_pubkey.clone()).collect();
        let new_scripts = self.scripts.write().add_range(scripts);
        if let Err(e) = self.script_archive.append(&new_scripts) {
            error!(%round_id, error = %e, "Failed to archive coinjoin scripts");
        }

        info!(
            %round_id,
            %txid,
            inputs = transaction.input.len(),
            outputs = transaction.output.len(),
            "Coinjoin broadcast"
        );
        metrics::record_broadcast();
        self.events.publish(CoordinatorEvent::CoinjoinBroadcast {
            round_id,
            txid,
            input_count: transaction.input.len(),
            output_count: transaction.output.len(),
        });
    }
}
