//! Request pipeline: issue application requests, and route the ones that
//! observe an expired credential through the renewal gate.
//!
//! A request is replayed at most once. The first expiry queues it behind the
//! (single) renewal; an expiry on the replay is reported to the caller as
//! [`SendError::AuthExpired`]. Once the session has ended, an expiry fails
//! with [`SendError::Renewal`] and the cause, without renewing.

mod classify;
mod request;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, instrument};

use crate::error::SendError;
use crate::renewal::{Admission, PendingRequest, RenewalGate};

pub use classify::{AuthSignal, ClassifierConfig, FailureClass, FailureClassifier};
pub use request::{ApiRequest, ApiResponse, Invoke, RequestBody, Transport, invoke_via};

/// Sends application requests on behalf of callers.
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    gate: Arc<RenewalGate>,
    next_id: AtomicU64,
}

impl RequestPipeline {
    pub fn new(transport: Arc<dyn Transport>, gate: Arc<RenewalGate>) -> Self {
        Self {
            transport,
            gate,
            next_id: AtomicU64::new(1),
        }
    }

    /// Send `request` through the transport.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, SendError> {
        self.send_with(invoke_via(Arc::clone(&self.transport), request))
            .await
    }

    /// Send a request described by `invoke`, which is called once for the
    /// original attempt and once more if the request is replayed.
    ///
    /// Non-expiry failures, including other auth failures such as 403, are
    /// returned to the caller unchanged.
    #[instrument(skip(self, invoke), fields(request_id))]
    pub async fn send_with(&self, invoke: Invoke) -> Result<ApiResponse, SendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::Span::current().record("request_id", id);

        let response = invoke().await?;
        if !self.gate.classifier().is_auth_expired(&response) {
            return Ok(response);
        }

        debug!(status = %response.status(), "Credential expired; waiting for renewal");
        let (pending, reply) = PendingRequest::new(id, invoke);
        match self.gate.admit(pending) {
            Admission::Queued => {}
            Admission::ReplayNow(pending) => {
                pending.replay(Arc::clone(self.gate.classifier())).await;
            }
            Admission::Rejected { request, limit } => {
                request.complete(Err(SendError::QueueFull { limit }));
            }
            Admission::Refused { request, error } => request.reject(error),
        }

        reply.await.unwrap_or(Err(SendError::Cancelled))
    }
}
