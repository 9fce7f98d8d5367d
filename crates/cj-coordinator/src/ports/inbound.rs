//! Driving Ports (API - Inbound)
//!
//! Requests a participant sends to the coordinator and their responses.
//! Every call carries a cancellation token; the transport binding decides how
//! that token maps to client disconnects or deadlines.

use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Witness};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    AliceId, BlameInfo, Credential, CredentialsRequest, EndRoundState, FeeRateAverages, IssuerParameters,
    MultipartyTransactionState, OwnershipProof, Phase, Round, RoundId, RoundParameters, Timestamp,
};
use crate::error::CoordinatorResult;

/// One coin offered at input registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputOwnership {
    pub outpoint: OutPoint,
    pub ownership_proof: OwnershipProof,
}

#[derive(Debug, Clone)]
pub struct InputRegistrationRequest {
    pub round_id: RoundId,
    pub inputs: Vec<InputOwnership>,
    pub zero_amount_credential_request: CredentialsRequest,
    pub zero_vsize_credential_request: CredentialsRequest,
}

#[derive(Debug, Clone)]
pub struct InputRegistrationResponse {
    pub alice_id: AliceId,
    pub amount_credentials: Vec<Credential>,
    pub vsize_credentials: Vec<Credential>,
    pub is_paying_zero_coordination_fee: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfirmationRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
    pub zero_amount_credential_request: CredentialsRequest,
    pub real_amount_credential_request: CredentialsRequest,
    pub zero_vsize_credential_request: CredentialsRequest,
    pub real_vsize_credential_request: CredentialsRequest,
}

/// Real credentials are present only once the round reached ConnectionConfirmation.
#[derive(Debug, Clone)]
pub struct ConnectionConfirmationResponse {
    pub zero_amount_credentials: Vec<Credential>,
    pub zero_vsize_credentials: Vec<Credential>,
    pub real_amount_credentials: Option<Vec<Credential>>,
    pub real_vsize_credentials: Option<Vec<Credential>>,
}

#[derive(Debug, Clone)]
pub struct OutputRegistrationRequest {
    pub round_id: RoundId,
    pub script: ScriptBuf,
    pub amount_credential_request: CredentialsRequest,
    pub vsize_credential_request: CredentialsRequest,
}

#[derive(Debug, Clone)]
pub struct OutputRegistrationResponse {
    pub amount_credentials: Vec<Credential>,
    pub vsize_credentials: Vec<Credential>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadyToSignRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
}

#[derive(Debug, Clone)]
pub struct InputWitnessPair {
    pub input_index: usize,
    pub witness: Witness,
}

#[derive(Debug, Clone)]
pub struct TransactionSignaturesRequest {
    pub round_id: RoundId,
    pub witnesses: Vec<InputWitnessPair>,
}

#[derive(Debug, Clone)]
pub struct ReissueCredentialRequest {
    pub round_id: RoundId,
    pub real_amount_credential_request: CredentialsRequest,
    pub zero_amount_credential_request: CredentialsRequest,
    pub real_vsize_credential_request: CredentialsRequest,
    pub zero_vsize_credential_request: CredentialsRequest,
}

#[derive(Debug, Clone)]
pub struct ReissueCredentialResponse {
    pub real_amount_credentials: Vec<Credential>,
    pub zero_amount_credentials: Vec<Credential>,
    pub real_vsize_credentials: Vec<Credential>,
    pub zero_vsize_credentials: Vec<Credential>,
}

#[derive(Debug, Clone, Copy)]
pub struct InputsRemovalRequest {
    pub round_id: RoundId,
    pub alice_id: AliceId,
}

/// Public view of one round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundState {
    pub id: RoundId,
    pub phase: Phase,
    pub end_round_state: Option<EndRoundState>,
    pub blame_of: Option<RoundId>,
    pub parameters: RoundParameters,
    pub amount_issuer: IssuerParameters,
    pub vsize_issuer: IssuerParameters,
    pub input_count: usize,
    pub input_registration_end: Option<Timestamp>,
    pub created_at: Timestamp,
    pub was_transaction_broadcast: bool,
    /// Canonical transaction to sign; only during TransactionSigning.
    pub unsigned_transaction: Option<Transaction>,
}

impl RoundState {
    pub fn from_round(round: &Round) -> Self {
        let unsigned_transaction = match (round.phase(), round.coinjoin()) {
            (Phase::TransactionSigning, MultipartyTransactionState::Signing(state)) => {
                Some(state.create_unsigned_transaction())
            }
            _ => None,
        };
        let end_round_state = match round.phase() {
            Phase::Ended(state) => Some(state),
            _ => None,
        };
        Self {
            id: round.id(),
            phase: round.phase(),
            end_round_state,
            blame_of: round.blame().map(|b: &BlameInfo| b.blame_of),
            parameters: round.parameters().clone(),
            amount_issuer: *round.amount_issuer(),
            vsize_issuer: *round.vsize_issuer(),
            input_count: round.input_count(),
            input_registration_end: round.time_frame(Phase::InputRegistration).and_then(|f| f.end()),
            created_at: round.created_at(),
            was_transaction_broadcast: round.was_transaction_broadcast(),
            unsigned_transaction,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub rounds: Vec<RoundState>,
    pub fee_rate_averages: FeeRateAverages,
}

/// Primary coordinator API
///
/// The driving port a transport binding (HTTP, in-process client) calls.
/// Protocol rejections come back as `CoordinatorError::Protocol`; once the
/// service is shutting down every call fails with `CoordinatorError::Disposed`.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn register_input(
        &self,
        request: InputRegistrationRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<InputRegistrationResponse>;

    async fn confirm_connection(
        &self,
        request: ConnectionConfirmationRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<ConnectionConfirmationResponse>;

    async fn register_output(
        &self,
        request: OutputRegistrationRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<OutputRegistrationResponse>;

    async fn ready_to_sign(&self, request: ReadyToSignRequest, cancel: CancellationToken) -> CoordinatorResult<()>;

    async fn sign_transaction(
        &self,
        request: TransactionSignaturesRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<()>;

    async fn reissue_credentials(
        &self,
        request: ReissueCredentialRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<ReissueCredentialResponse>;

    async fn remove_input(&self, request: InputsRemovalRequest, cancel: CancellationToken) -> CoordinatorResult<()>;

    async fn get_status(&self, cancel: CancellationToken) -> CoordinatorResult<StatusResponse>;
}
