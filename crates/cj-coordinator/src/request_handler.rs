//! # Request Handler
//!
//! The [`CoordinatorApi`] implementation transports bind to.
//!
//! ```text
//! transport ──request + CancellationToken──→ [RequestHandler] ──→ Arena
//!                                               │
//!                                               └── TaskTracker (drain on shutdown)
//! ```
//!
//! Every call is tracked while it runs. After [`RequestHandler::shutdown`]
//! begins, new calls fail with `Disposed` and shutdown returns once the
//! in-flight calls have finished. A fired cancellation token abandons the
//! call before it publishes anything.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::metrics;
use crate::ports::inbound::{
    ConnectionConfirmationRequest, ConnectionConfirmationResponse, CoordinatorApi, InputRegistrationRequest,
    InputRegistrationResponse, InputsRemovalRequest, OutputRegistrationRequest, OutputRegistrationResponse,
    ReadyToSignRequest, ReissueCredentialRequest, ReissueCredentialResponse, StatusResponse,
    TransactionSignaturesRequest,
};

pub struct RequestHandler {
    arena: Arc<Arena>,
    tracker: TaskTracker,
}

impl RequestHandler {
    pub fn new(arena: Arc<Arena>) -> Self {
        Self {
            arena,
            tracker: TaskTracker::new(),
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Requests currently being served.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        info!(in_flight = self.tracker.len(), "Draining coordinator requests");
        self.tracker.wait().await;
        info!("Coordinator requests drained");
    }

    async fn guarded<T, F>(&self, operation: &'static str, cancel: CancellationToken, request: F) -> CoordinatorResult<T>
    where
        F: Future<Output = CoordinatorResult<T>>,
    {
        if self.tracker.is_closed() {
            return Err(CoordinatorError::Disposed);
        }

        let tracked = self.tracker.track_future(request);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
            result = tracked => result,
        };

        match &result {
            Err(CoordinatorError::Protocol(e)) => {
                metrics::record_rejection(&e.code.to_string());
                debug!(operation, code = %e.code, message = %e.message, "Request rejected");
            }
            Err(CoordinatorError::Cancelled) => debug!(operation, "Request cancelled"),
            Err(e) => warn!(operation, error = %e, "Request failed"),
            Ok(_) => {}
        }
        result
    }
}

#[async_trait]
impl CoordinatorApi for RequestHandler {
    async fn register_input(
        &self,
        request: InputRegistrationRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<InputRegistrationResponse> {
        self.guarded("register_input", cancel, self.arena.register_input(request))
            .await
    }

    async fn confirm_connection(
        &self,
        request: ConnectionConfirmationRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<ConnectionConfirmationResponse> {
        self.guarded("confirm_connection", cancel, self.arena.confirm_connection(request))
            .await
    }

    async fn register_output(
        &self,
        request: OutputRegistrationRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<OutputRegistrationResponse> {
        self.guarded("register_output", cancel, self.arena.register_output(request))
            .await
    }

    async fn ready_to_sign(&self, request: ReadyToSignRequest, cancel: CancellationToken) -> CoordinatorResult<()> {
        self.guarded("ready_to_sign", cancel, self.arena.ready_to_sign(request))
            .await
    }

    async fn sign_transaction(
        &self,
        request: TransactionSignaturesRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<()> {
        self.guarded("sign_transaction", cancel, self.arena.sign_transaction(request))
            .await
    }

    async fn reissue_credentials(
        &self,
        request: ReissueCredentialRequest,
        cancel: CancellationToken,
    ) -> CoordinatorResult<ReissueCredentialResponse> {
        self.guarded("reissue_credentials", cancel, self.arena.reissue_credentials(request))
            .await
    }

    async fn remove_input(&self, request: InputsRemovalRequest, cancel: CancellationToken) -> CoordinatorResult<()> {
        self.guarded("remove_input", cancel, self.arena.remove_input(request))
            .await
    }

    async fn get_status(&self, cancel: CancellationToken) -> CoordinatorResult<StatusResponse> {
        let arena = self.arena.clone();
        self.guarded("get_status", cancel, async move { Ok(arena.status()) })
            .await
    }
}
