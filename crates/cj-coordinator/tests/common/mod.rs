//! Shared fixtures: an arena wired to in-memory adapters and a manual clock,
//! plus a minimal client that funds, registers, confirms and signs.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::{
    ecdsa, Amount, CompressedPublicKey, EcdsaSighashType, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid,
    Witness,
};
use cj_telemetry::{init_logging, TelemetryConfig};
use tokio_util::sync::CancellationToken;

use cj_coordinator::adapters::{InMemoryChainState, InMemoryStore, MacCredentialIssuerFactory};
use cj_coordinator::domain::construction::output_vsize;
use cj_coordinator::domain::{
    CommitmentData, Credential, CredentialsRequest, Inmate, IssuanceRequest, OwnershipProof, Phase, Round,
};
use cj_coordinator::ports::inbound::{
    ConnectionConfirmationRequest, InputOwnership, InputRegistrationRequest, InputRegistrationResponse,
    InputWitnessPair, OutputRegistrationRequest, ReadyToSignRequest, TransactionSignaturesRequest,
};
use cj_coordinator::{
    AliceId, Arena, ArenaPorts, CoordinatorApi, CoordinatorConfig, CoordinatorResult, EventBus, FeeRate,
    ManualTimeSource, RequestHandler, RoundId, Warden,
};

pub const FEE_RATE_SAT_PER_VB: u64 = 5;
pub const START_TIME_MS: u64 = 1_700_000_000_000;
/// Amount left in credentials when registering an output, covering the shared overhead.
pub const OUTPUT_SLACK_SAT: u64 = 1_000;

static LOGGING: Once = Once::new();

pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = init_logging(&TelemetryConfig::for_service("cj-coordinator-tests"));
    });
}

pub fn test_config(min_inputs: usize, max_inputs: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        network: Network::Regtest,
        min_input_count_by_round: min_inputs,
        max_input_count_by_round: max_inputs,
        min_registrable_amount_sat: 10_000,
        blame_min_input_count_multiplier: 0.5,
        ..CoordinatorConfig::default()
    }
}

// =============================================================================
// KEYS
// =============================================================================

pub fn secret(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed.max(1); 32]).expect("valid key")
}

pub fn public_key(seed: u8) -> CompressedPublicKey {
    CompressedPublicKey(PublicKey::from_secret_key(&Secp256k1::new(), &secret(seed)))
}

pub fn script(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&public_key(seed).wpubkey_hash())
}

fn p2wpkh_witness(seed: u8, digest: [u8; 32]) -> Witness {
    let secp = Secp256k1::new();
    let signature = ecdsa::Signature {
        signature: secp.sign_ecdsa(&Message::from_digest(digest), &secret(seed)),
        sighash_type: EcdsaSighashType::All,
    };
    Witness::from_slice(&[signature.to_vec(), public_key(seed).to_bytes().to_vec()])
}

pub fn ownership_proof(seed: u8, commitment: &CommitmentData) -> OwnershipProof {
    OwnershipProof::new(p2wpkh_witness(seed, commitment.signature_hash(&script(seed))))
}

pub fn sign_input(tx: &Transaction, index: usize, seed: u8, value: Amount) -> Witness {
    let sighash = SighashCache::new(tx)
        .p2wpkh_signature_hash(index, &script(seed), value, EcdsaSighashType::All)
        .expect("sighash");
    p2wpkh_witness(seed, sighash.to_byte_array())
}

pub fn outpoint(seed: u8) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([seed; 32]), 0)
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Present `credentials`, move `delta` in or out, and take the result back
/// as one credential plus a zero one.
pub fn present(credentials: &[Credential], delta: i64) -> CredentialsRequest {
    let total: u64 = credentials.iter().map(|c| c.value).sum();
    let value = (total as i64 + delta).max(0) as u64;
    CredentialsRequest {
        delta,
        presented: credentials.to_vec(),
        requested: vec![IssuanceRequest { value }, IssuanceRequest { value: 0 }],
    }
}

pub fn total(credentials: &[Credential]) -> u64 {
    credentials.iter().map(|c| c.value).sum()
}

// =============================================================================
// HARNESS
// =============================================================================

#[derive(Debug)]
pub struct Participant {
    pub seed: u8,
    pub outpoint: OutPoint,
    pub value: Amount,
    pub alice_id: AliceId,
    pub amount_credentials: Vec<Credential>,
    pub vsize_credentials: Vec<Credential>,
}

pub struct Harness {
    pub arena: Arc<Arena>,
    pub handler: RequestHandler,
    pub chain: Arc<InMemoryChainState>,
    pub clock: Arc<ManualTimeSource>,
    pub prison: Arc<InMemoryStore<Inmate>>,
    pub scripts: Arc<InMemoryStore<ScriptBuf>>,
    pub events: Arc<EventBus>,
}

impl Harness {
    pub fn new(min_inputs: usize, max_inputs: usize) -> Self {
        Self::with_config(test_config(min_inputs, max_inputs))
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        init_test_logging();
        let clock = Arc::new(ManualTimeSource::new(START_TIME_MS));
        let chain = Arc::new(InMemoryChainState::new(FeeRate::from_sat_per_vb(FEE_RATE_SAT_PER_VB)));
        let prison = Arc::new(InMemoryStore::<Inmate>::new());
        let scripts = Arc::new(InMemoryStore::<ScriptBuf>::new());
        let events = Arc::new(EventBus::new());

        let warden = Arc::new(
            Warden::new(config.dos.clone(), prison.clone(), clock.clone(), events.clone()).expect("warden"),
        );
        let ports = ArenaPorts {
            chain: chain.clone(),
            issuers: Arc::new(MacCredentialIssuerFactory),
            script_archive: scripts.clone(),
            clock: clock.clone(),
        };
        let arena = Arc::new(Arena::new(config, ports, warden, events.clone()).expect("arena"));

        Self {
            handler: RequestHandler::new(arena.clone()),
            arena,
            chain,
            clock,
            prison,
            scripts,
            events,
        }
    }

    pub async fn step(&self) {
        self.arena.step().await;
    }

    pub async fn advance(&self, ms: u64) {
        self.clock.advance(ms);
        self.arena.step().await;
    }

    /// Step once and return the newest standard round open for registration.
    pub async fn open_round(&self) -> RoundId {
        self.step().await;
        self.arena
            .rounds()
            .iter()
            .rev()
            .find(|r| !r.is_blame_round() && r.phase() == Phase::InputRegistration)
            .map(|r| r.id())
            .expect("open round")
    }

    pub fn round(&self, round_id: RoundId) -> Arc<Round> {
        self.arena.round(round_id).expect("round exists")
    }

    pub fn phase(&self, round_id: RoundId) -> Phase {
        self.round(round_id).phase()
    }

    pub fn commitment(&self, round_id: RoundId) -> CommitmentData {
        self.round(round_id).parameters().commitment_data(round_id)
    }

    pub fn fund(&self, seed: u8, sats: u64) -> OutPoint {
        let outpoint = outpoint(seed);
        self.chain.add_utxo(
            outpoint,
            TxOut {
                value: Amount::from_sat(sats),
                script_pubkey: script(seed),
            },
            6,
        );
        outpoint
    }

    pub async fn register_coin(
        &self,
        round_id: RoundId,
        outpoint: OutPoint,
        proof: OwnershipProof,
    ) -> CoordinatorResult<InputRegistrationResponse> {
        self.handler
            .register_input(
                InputRegistrationRequest {
                    round_id,
                    inputs: vec![InputOwnership {
                        outpoint,
                        ownership_proof: proof,
                    }],
                    zero_amount_credential_request: CredentialsRequest::zero(),
                    zero_vsize_credential_request: CredentialsRequest::zero(),
                },
                CancellationToken::new(),
            )
            .await
    }

    /// Fund a coin for `seed` and register it with a proof for `round_id`.
    pub async fn register(&self, round_id: RoundId, seed: u8, sats: u64) -> CoordinatorResult<Participant> {
        let outpoint = self.fund(seed, sats);
        let proof = ownership_proof(seed, &self.commitment(round_id));
        let response = self.register_coin(round_id, outpoint, proof).await?;
        Ok(Participant {
            seed,
            outpoint,
            value: Amount::from_sat(sats),
            alice_id: response.alice_id,
            amount_credentials: response.amount_credentials,
            vsize_credentials: response.vsize_credentials,
        })
    }

    /// Confirm with exactly the credentials the participant is entitled to.
    pub async fn confirm(&self, round_id: RoundId, participant: &mut Participant) -> CoordinatorResult<()> {
        let round = self.round(round_id);
        let params = round.parameters();
        let alice = round.alice(participant.alice_id)?;
        let amount = alice.calculate_remaining_amount_credentials(params.mining_fee_rate, params.coordination_fee_rate);
        let vsize = alice.calculate_remaining_vsize_credentials(params.per_alice_vsize_allocation());
        self.confirm_with(round_id, participant, amount, vsize).await
    }

    pub async fn confirm_with(
        &self,
        round_id: RoundId,
        participant: &mut Participant,
        amount: i64,
        vsize: i64,
    ) -> CoordinatorResult<()> {
        let response = self
            .handler
            .confirm_connection(
                ConnectionConfirmationRequest {
                    round_id,
                    alice_id: participant.alice_id,
                    zero_amount_credential_request: CredentialsRequest::zero(),
                    real_amount_credential_request: present(&participant.amount_credentials, amount),
                    zero_vsize_credential_request: CredentialsRequest::zero(),
                    real_vsize_credential_request: present(&participant.vsize_credentials, vsize),
                },
                CancellationToken::new(),
            )
            .await?;
        if let (Some(amount), Some(vsize)) = (response.real_amount_credentials, response.real_vsize_credentials) {
            participant.amount_credentials = amount;
            participant.vsize_credentials = vsize;
        }
        Ok(())
    }

    /// Spend all but [`OUTPUT_SLACK_SAT`] of the participant's amount
    /// credentials on one output to `script`; returns the output value.
    pub async fn register_output(
        &self,
        round_id: RoundId,
        participant: &mut Participant,
        script: ScriptBuf,
    ) -> CoordinatorResult<Amount> {
        let vsize = output_vsize(&TxOut {
            value: Amount::ZERO,
            script_pubkey: script.clone(),
        });
        let spend = total(&participant.amount_credentials) - OUTPUT_SLACK_SAT;
        let response = self
            .handler
            .register_output(
                OutputRegistrationRequest {
                    round_id,
                    script,
                    amount_credential_request: present(&participant.amount_credentials, -(spend as i64)),
                    vsize_credential_request: present(&participant.vsize_credentials, -(vsize as i64)),
                },
                CancellationToken::new(),
            )
            .await?;
        participant.amount_credentials = response.amount_credentials;
        participant.vsize_credentials = response.vsize_credentials;

        let fee = self.round(round_id).parameters().mining_fee_rate.fee_for(vsize);
        Ok(Amount::from_sat(spend) - fee)
    }

    pub async fn ready(&self, round_id: RoundId, participant: &Participant) -> CoordinatorResult<()> {
        self.handler
            .ready_to_sign(
                ReadyToSignRequest {
                    round_id,
                    alice_id: participant.alice_id,
                },
                CancellationToken::new(),
            )
            .await
    }

    /// Witness for the participant's input in the round's canonical transaction.
    pub fn witness_for(&self, round_id: RoundId, participant: &Participant) -> InputWitnessPair {
        let round = self.round(round_id);
        let state = round.signing_state().expect("round is signing");
        let tx = state.create_unsigned_transaction();
        let index = state.index_of(&participant.outpoint).expect("input in transaction");
        InputWitnessPair {
            input_index: index,
            witness: sign_input(&tx, index, participant.seed, participant.value),
        }
    }

    pub async fn submit(&self, round_id: RoundId, pair: InputWitnessPair) -> CoordinatorResult<()> {
        self.handler
            .sign_transaction(
                TransactionSignaturesRequest {
                    round_id,
                    witnesses: vec![pair],
                },
                CancellationToken::new(),
            )
            .await
    }

    pub async fn sign(&self, round_id: RoundId, participant: &Participant) -> CoordinatorResult<()> {
        let pair = self.witness_for(round_id, participant);
        self.submit(round_id, pair).await
    }

    /// Drive a round from registration into TransactionSigning with one coin
    /// of `sats` per seed. The input cap must equal `seeds.len()`.
    pub async fn round_in_signing(&self, seeds: &[u8], sats: u64) -> (RoundId, Vec<Participant>) {
        let round_id = self.open_round().await;
        let mut participants = Vec::new();
        for &seed in seeds {
            participants.push(self.register(round_id, seed, sats).await.expect("register"));
        }
        self.step().await;
        assert_eq!(self.phase(round_id), Phase::ConnectionConfirmation);

        for p in participants.iter_mut() {
            self.confirm(round_id, p).await.expect("confirm");
        }
        self.step().await;
        assert_eq!(self.phase(round_id), Phase::OutputRegistration);

        for p in participants.iter_mut() {
            let destination = script(p.seed.wrapping_add(100));
            self.register_output(round_id, p, destination).await.expect("output");
        }
        self.step().await;
        assert_eq!(self.phase(round_id), Phase::TransactionSigning);
        (round_id, participants)
    }
}
