//! # Round Lifecycle Tests
//!
//! Drive whole rounds through the request handler and the stepper with a
//! manual clock and the in-memory chain.
//!
//! ## Test Categories
//!
//! 1. **Happy path** - registration through broadcast
//! 2. **Timeouts** - lapsed registrations, unconfirmed and unsigned participants
//! 3. **Blame rounds** - restricted restart after a signing failure
//! 4. **Housekeeping** - status, expiry, withdrawal

mod common;

use std::collections::BTreeSet;

use bitcoin::{Address, Amount, Network, OutPoint};
use tokio_util::sync::CancellationToken;

use cj_coordinator::domain::{CredentialsRequest, Inmate, IssuanceRequest, Offense, PrisonKey, Punishment};
use cj_coordinator::ports::inbound::{InputsRemovalRequest, ReadyToSignRequest, ReissueCredentialRequest};
use cj_coordinator::{CoordinatorApi, CoordinatorConfig, CoordinatorEvent, EndRoundState, Phase, ProtocolErrorCode};

use common::*;

const COIN: u64 = 5_000_000;

// =============================================================================
// HAPPY PATH
// =============================================================================

#[tokio::test]
async fn test_two_inputs_registered_reduce_vsize_budget() {
    let h = Harness::new(2, 10);
    let round_id = h.open_round().await;
    let budget = h.round(round_id).remaining_input_vsize_allocation();

    let first = h.register(round_id, 1, 5_000_000).await.unwrap();
    let second = h.register(round_id, 2, 3_000_000).await.unwrap();

    assert_ne!(first.alice_id, second.alice_id);
    let round = h.round(round_id);
    assert_eq!(round.alices().len(), 2);
    assert_eq!(round.remaining_input_vsize_allocation(), budget - 2 * 69);
    assert_eq!(first.amount_credentials.len(), 2);
    assert_eq!(total(&first.amount_credentials), 0);
}

#[tokio::test]
async fn test_round_broadcasts_coinjoin() {
    let h = Harness::new(2, 2);
    let (round_id, participants) = h.round_in_signing(&[1, 2], COIN).await;

    for p in &participants {
        h.sign(round_id, p).await.unwrap();
    }
    h.step().await;

    let round = h.round(round_id);
    assert_eq!(round.phase(), Phase::Ended(EndRoundState::TransactionBroadcasted));
    assert!(round.was_transaction_broadcast());

    let broadcasts = h.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let tx = &broadcasts[0];
    assert_eq!(tx.input.len(), 2);
    assert_eq!(tx.output.len(), 2);
    assert!(tx.input.iter().all(|i| !i.witness.is_empty()));
    for p in &participants {
        assert!(!h.chain.is_unspent(&p.outpoint));
    }

    // Output scripts are archived for reuse detection
    assert_eq!(h.scripts.records().len(), 2);
    assert!(h.arena.is_known_script(&script(101)));
}

#[tokio::test]
async fn test_coinjoin_pays_at_least_the_round_fee_rate() {
    let h = Harness::new(2, 2);
    let (round_id, participants) = h.round_in_signing(&[1, 2], COIN).await;

    let round = h.round(round_id);
    let state = round.signing_state().unwrap();
    let inputs: Amount = state.inputs().iter().map(|c| c.amount()).sum();
    let outputs: Amount = state.outputs().iter().map(|o| o.value).sum();
    assert!(inputs > outputs);

    let fee = inputs - outputs;
    let vsize = 11 + 2 * 69 + 2 * 31;
    assert!(fee >= round.parameters().mining_fee_rate.fee_for(vsize));
    assert_eq!(participants.len(), 2);
}

#[tokio::test]
async fn test_surplus_paid_to_coordinator() {
    let config = CoordinatorConfig {
        coordinator_fee_address: Some(Address::p2wpkh(&public_key(250), Network::Regtest).to_string()),
        ..test_config(2, 2)
    };
    let h = Harness::with_config(config);
    let (round_id, participants) = h.round_in_signing(&[1, 2], COIN).await;

    let round = h.round(round_id);
    let state = round.signing_state().unwrap();
    assert_eq!(state.outputs().len(), 3);
    let fee_output = state.outputs().iter().find(|o| o.script_pubkey == script(250)).unwrap();
    // Both participants pay the coordination fee; slack and fees for their own bytes go on top
    assert!(fee_output.value > Amount::from_sat(2 * 15_000));

    for p in &participants {
        h.sign(round_id, p).await.unwrap();
    }
    h.step().await;
    assert_eq!(h.phase(round_id), Phase::Ended(EndRoundState::TransactionBroadcasted));
}

#[tokio::test]
async fn test_reissued_credentials_fund_output() {
    let h = Harness::new(2, 2);
    let round_id = h.open_round().await;
    let mut a = h.register(round_id, 1, COIN).await.unwrap();
    let mut b = h.register(round_id, 2, COIN).await.unwrap();
    h.step().await;
    h.confirm(round_id, &mut a).await.unwrap();
    h.confirm(round_id, &mut b).await.unwrap();
    h.step().await;
    assert_eq!(h.phase(round_id), Phase::OutputRegistration);

    let amount = total(&a.amount_credentials);
    let stale = a.amount_credentials.clone();
    let response = h
        .handler
        .reissue_credentials(
            ReissueCredentialRequest {
                round_id,
                real_amount_credential_request: CredentialsRequest {
                    delta: 0,
                    presented: a.amount_credentials.clone(),
                    requested: vec![
                        IssuanceRequest { value: amount / 2 },
                        IssuanceRequest {
                            value: amount - amount / 2,
                        },
                    ],
                },
                zero_amount_credential_request: CredentialsRequest::zero(),
                real_vsize_credential_request: present(&a.vsize_credentials, 0),
                zero_vsize_credential_request: CredentialsRequest::zero(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(total(&response.real_amount_credentials), amount);
    assert_eq!(total(&response.zero_amount_credentials), 0);
    a.amount_credentials = response.real_amount_credentials;
    a.vsize_credentials = response.real_vsize_credentials;
    h.register_output(round_id, &mut a, script(101)).await.unwrap();

    // Reissuance spent the originals
    a.amount_credentials = stale;
    let err = h.register_output(round_id, &mut a, script(102)).await.unwrap_err();
    assert_eq!(err.protocol_code(), Some(ProtocolErrorCode::InvalidCredentialRequest));
}

#[tokio::test]
async fn test_ready_to_sign_ends_output_registration() {
    let h = Harness::new(2, 2);
    let round_id = h.open_round().await;
    let mut a = h.register(round_id, 1, COIN).await.unwrap();
    let mut b = h.register(round_id, 2, COIN).await.unwrap();
    h.step().await;
    h.confirm(round_id, &mut a).await.unwrap();
    h.confirm(round_id, &mut b).await.unwrap();
    h.step().await;

    // Only one output, so value remains unclaimed; readiness ends the phase
    h.register_output(round_id, &mut a, script(101)).await.unwrap();
    h.ready(round_id, &a).await.unwrap();
    h.step().await;
    assert_eq!(h.phase(round_id), Phase::OutputRegistration);

    h.ready(round_id, &b).await.unwrap();
    h.step().await;
    assert_eq!(h.phase(round_id), Phase::TransactionSigning);

    let err = h
        .handler
        .ready_to_sign(
            ReadyToSignRequest {
                round_id,
                alice_id: a.alice_id,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.protocol_code(), Some(ProtocolErrorCode::WrongPhase));
}

#[tokio::test]
async fn test_phases_only_move_forward() {
    let h = Harness::new(2, 2);
    let mut events = h.arena.subscribe();
    let (round_id, participants) = h.round_in_signing(&[1, 2], COIN).await;
    for p in &participants {
        h.sign(round_id, p).await.unwrap();
    }
    h.step().await;

    let mut ordinals = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            CoordinatorEvent::PhaseChanged { round_id: id, phase } if id == round_id => ordinals.push(phase.ordinal()),
            CoordinatorEvent::RoundEnded { round_id: id, .. } if id == round_id => ordinals.push(4),
            _ => {}
        }
    }
    assert_eq!(ordinals, vec![1, 2, 3, 4]);
}

// =============================================================================
// TIMEOUTS
// =============================================================================

#[tokio::test]
async fn test_lapsed_registration_dropped_without_penalty() {
    let h = Harness::new(2, 10);
    let round_id = h.open_round().await;
    let p = h.register(round_id, 1, COIN).await.unwrap();

    let timeout_ms = h.round(round_id).parameters().connection_confirmation_timeout_ms;
    h.advance(timeout_ms).await;

    assert!(h.round(round_id).alices().is_empty());
    assert!(h.arena.registration(&p.outpoint).is_none());
    assert!(h.arena.warden().inmate(&PrisonKey::Outpoint(p.outpoint)).is_none());
}

#[tokio::test]
async fn test_confirmation_during_registration_extends_deadline() {
    let h = Harness::new(2, 10);
    let round_id = h.open_round().await;
    let mut p = h.register(round_id, 1, COIN).await.unwrap();
    let timeout_ms = h.round(round_id).parameters().connection_confirmation_timeout_ms;

    h.advance(timeout_ms - 1).await;
    h.confirm_with(round_id, &mut p, 0, 0).await.unwrap();
    h.advance(timeout_ms - 1).await;

    let round = h.round(round_id);
    assert_eq!(round.alices().len(), 1);
    assert!(!round.alices()[0].confirmed_connection);
    // Credentials stay zero until the round reaches ConnectionConfirmation
    assert_eq!(total(&p.amount_credentials), 0);
}

#[tokio::test]
async fn test_not_enough_inputs_aborts_round() {
    let h = Harness::new(2, 10);
    let round_id = h.open_round().await;
    let registration_ms = h.round(round_id).parameters().input_registration_timeout_ms;

    h.advance(registration_ms).await;

    assert_eq!(h.phase(round_id), Phase::Ended(EndRoundState::AbortedNotEnoughAlices));
    let open = h.open_round().await;
    assert_ne!(open, round_id);
}

#[tokio::test]
async fn test_unconfirmed_participants_noted_and_removed() {
    let h = Harness::new(2, 3);
    let round_id = h.open_round().await;
    let mut a = h.register(round_id, 1, COIN).await.unwrap();
    let mut b = h.register(round_id, 2, COIN).await.unwrap();
    let c = h.register(round_id, 3, COIN).await.unwrap();
    h.step().await;
    assert_eq!(h.phase(round_id), Phase::ConnectionConfirmation);

    h.confirm(round_id, &mut a).await.unwrap();
    h.confirm(round_id, &mut b).await.unwrap();
    let timeout_ms = h.round(round_id).parameters().connection_confirmation_timeout_ms;
    h.advance(timeout_ms).await;

    let round = h.round(round_id);
    assert_eq!(round.phase(), Phase::OutputRegistration);
    assert_eq!(round.alices().len(), 2);
    let inmate = h.arena.warden().inmate(&PrisonKey::Outpoint(c.outpoint)).unwrap();
    assert_eq!(inmate.punishment, Punishment::Noted);
}

#[tokio::test]
async fn test_signing_timeout_bans_and_spawns_blame_round() {
    let h = Harness::new(2, 3);
    let (round_id, participants) = h.round_in_signing(&[1, 2, 3], COIN).await;
    h.sign(round_id, &participants[0]).await.unwrap();
    h.sign(round_id, &participants[1]).await.unwrap();

    let timeout_ms = h.round(round_id).parameters().transaction_signing_timeout_ms;
    h.advance(timeout_ms).await;

    assert_eq!(h.phase(round_id), Phase::Ended(EndRoundState::NotAllAlicesSign));

    let laggard = participants[2].outpoint;
    let inmate = h.arena.warden().inmate(&PrisonKey::Outpoint(laggard)).unwrap();
    assert_eq!(inmate.punishment, Punishment::Banned);
    assert!(matches!(inmate.offense, Offense::RoundDisruption { .. }));

    let blame = h
        .arena
        .rounds()
        .into_iter()
        .find(|r| r.blame().is_some_and(|b| b.blame_of == round_id))
        .expect("blame round");
    let expected: BTreeSet<OutPoint> = participants[..2].iter().map(|p| p.outpoint).collect();
    assert_eq!(blame.blame().unwrap().whitelist, expected);
    assert_eq!(blame.phase(), Phase::InputRegistration);

    // The ban is persisted once the warden flushes
    h.arena.warden().flush().unwrap();
    let records: Vec<Inmate> = h.prison.records();
    assert!(records.iter().any(|i| i.key == PrisonKey::Outpoint(laggard)));
}

#[tokio::test]
async fn test_whole_coin_non_signer_is_banned() {
    let h = Harness::new(2, 3);
    let (round_id, participants) = h.round_in_signing(&[1, 2, 3], 100_000_000).await;
    h.sign(round_id, &participants[0]).await.unwrap();
    h.sign(round_id, &participants[1]).await.unwrap();
    let timeout_ms = h.round(round_id).parameters().transaction_signing_timeout_ms;
    h.advance(timeout_ms).await;

    // 0.1 / 1 BTC is six minutes, so the ban runs for the minimum prison time
    let laggard = participants[2].outpoint;
    let inmate = h.arena.warden().inmate(&PrisonKey::Outpoint(laggard)).unwrap();
    assert_eq!(inmate.punishment, Punishment::Banned);
    assert!(h.arena.warden().is_banned(&PrisonKey::Outpoint(laggard)));

    let next = h.open_round().await;
    let proof = ownership_proof(3, &h.commitment(next));
    match h.register_coin(next, laggard, proof).await {
        Ok(_) => panic!("banned coin registered"),
        Err(e) => assert_eq!(e.protocol_code(), Some(ProtocolErrorCode::InputBanned)),
    }
}

#[tokio::test]
async fn test_blame_round_accepts_only_whitelisted_coins() {
    let h = Harness::new(2, 3);
    let (round_id, participants) = h.round_in_signing(&[1, 2, 3], COIN).await;
    h.sign(round_id, &participants[0]).await.unwrap();
    h.sign(round_id, &participants[1]).await.unwrap();
    let timeout_ms = h.round(round_id).parameters().transaction_signing_timeout_ms;
    h.advance(timeout_ms).await;

    let blame_id = h
        .arena
        .rounds()
        .into_iter()
        .find(|r| r.is_blame_round())
        .map(|r| r.id())
        .unwrap();

    let outsider = h.register(blame_id, 9, COIN).await.unwrap_err();
    assert_eq!(outsider.protocol_code(), Some(ProtocolErrorCode::InputNotWhitelisted));

    let proof = ownership_proof(1, &h.commitment(blame_id));
    h.register_coin(blame_id, participants[0].outpoint, proof).await.unwrap();
    let proof = ownership_proof(2, &h.commitment(blame_id));
    h.register_coin(blame_id, participants[1].outpoint, proof).await.unwrap();

    // Whitelist filled: registration closes on the next step
    h.step().await;
    assert_eq!(h.phase(blame_id), Phase::ConnectionConfirmation);
}

#[tokio::test]
async fn test_rejected_broadcast_ends_round() {
    let h = Harness::new(2, 2);
    let (round_id, participants) = h.round_in_signing(&[1, 2], COIN).await;
    for p in &participants {
        h.sign(round_id, p).await.unwrap();
    }
    h.chain.reject_broadcasts(Some("mempool full".into()));
    h.step().await;

    assert_eq!(h.phase(round_id), Phase::Ended(EndRoundState::TransactionBroadcastFailed));
    assert!(!h.round(round_id).was_transaction_broadcast());
}

// =============================================================================
// HOUSEKEEPING
// =============================================================================

#[tokio::test]
async fn test_remove_input_releases_coin() {
    let h = Harness::new(2, 10);
    let round_id = h.open_round().await;
    let p = h.register(round_id, 1, COIN).await.unwrap();

    h.handler
        .remove_input(
            InputsRemovalRequest {
                round_id,
                alice_id: p.alice_id,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(h.round(round_id).alices().is_empty());
    assert!(h.arena.registration(&p.outpoint).is_none());
    let again = h.register_coin(round_id, p.outpoint, ownership_proof(1, &h.commitment(round_id)));
    assert!(again.await.is_ok());
}

#[tokio::test]
async fn test_status_lists_rounds_and_fee_history() {
    let h = Harness::new(2, 2);
    let (round_id, _) = h.round_in_signing(&[1, 2], COIN).await;

    let status = h.handler.get_status(CancellationToken::new()).await.unwrap();
    let signing = status.rounds.iter().find(|r| r.id == round_id).unwrap();
    assert_eq!(signing.phase, Phase::TransactionSigning);
    assert!(signing.unsigned_transaction.is_some());
    assert_eq!(signing.input_count, 2);
    assert!(status.rounds.iter().any(|r| r.phase == Phase::InputRegistration));
    assert!(status.fee_rate_averages.one_day.is_some());
}

#[tokio::test]
async fn test_fee_rate_falls_back_to_history() {
    let h = Harness::new(2, 10);
    let first = h.open_round().await;
    h.chain.set_fee_rate(None);

    let registration_ms = h.round(first).parameters().input_registration_timeout_ms;
    h.advance(registration_ms).await;

    let second = h.open_round().await;
    assert_ne!(first, second);
    assert_eq!(
        h.round(second).parameters().mining_fee_rate,
        h.round(first).parameters().mining_fee_rate
    );
}

#[tokio::test]
async fn test_ended_rounds_expire() {
    let h = Harness::new(2, 10);
    let round_id = h.open_round().await;
    let registration_ms = h.round(round_id).parameters().input_registration_timeout_ms;
    h.advance(registration_ms).await;
    assert!(h.arena.round(round_id).is_some());

    let expiry_ms = h.arena.config().round_expiry_timeout_secs * 1_000;
    h.advance(expiry_ms).await;
    assert!(h.arena.round(round_id).is_none());
}
