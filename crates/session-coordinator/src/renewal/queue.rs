//! Retry queue for requests that raced an expired credential.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::gate::RenewalOutcome;
use crate::error::{RenewalError, SendError};
use crate::pipeline::{ApiResponse, FailureClassifier, Invoke};

/// Result delivered to the original caller of a queued request.
pub type Reply = Result<ApiResponse, SendError>;

/// A request waiting for a renewal outcome, plus its caller's completion handle.
///
/// Consumed exactly once: by a replay, a rejection, or by being dropped (which
/// the caller observes as [`SendError::Cancelled`]).
pub struct PendingRequest {
    id: u64,
    invoke: Invoke,
    reply: oneshot::Sender<Reply>,
}

impl PendingRequest {
    pub fn new(id: u64, invoke: Invoke) -> (Self, oneshot::Receiver<Reply>) {
        let (reply, rx) = oneshot::channel();
        (Self { id, invoke, reply }, rx)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Settle the request with `reply`.
    pub fn complete(self, reply: Reply) {
        if self.reply.send(reply).is_err() {
            trace!(request_id = self.id, "Caller went away before its request settled");
        }
    }

    pub fn reject(self, error: RenewalError) {
        self.complete(Err(SendError::Renewal(error)));
    }

    /// Issue the request once more and settle it with the result.
    ///
    /// This is the only retry a request gets: an expiry on the replay is
    /// surfaced as [`SendError::AuthExpired`].
    pub fn replay(self, classifier: Arc<FailureClassifier>) -> BoxFuture<'static, ()> {
        let response = (self.invoke)();
        Box::pin(async move {
            let reply = match response.await {
                Ok(response) if classifier.is_auth_expired(&response) => {
                    warn!(
                        request_id = self.id,
                        status = %response.status(),
                        "Replayed request expired again; giving up"
                    );
                    Err(SendError::AuthExpired)
                }
                Ok(response) => Ok(response),
                Err(e) => Err(SendError::Transport(e)),
            };
            self.complete(reply);
        })
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// FIFO buffer of [`PendingRequest`]s, bounded by `max_depth`.
#[derive(Debug)]
pub struct RetryQueue {
    entries: VecDeque<PendingRequest>,
    max_depth: usize,
}

impl RetryQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_depth,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Append a request. A full queue hands the request back.
    pub fn enqueue(&mut self, request: PendingRequest) -> Result<(), PendingRequest> {
        if self.entries.len() >= self.max_depth {
            return Err(request);
        }
        trace!(request_id = request.id, depth = self.entries.len() + 1, "Request queued");
        self.entries.push_back(request);
        Ok(())
    }

    /// Resolve every queued request with `outcome`, in insertion order.
    ///
    /// On failure every request is rejected immediately and `None` is
    /// returned. On success the replays are returned as a [`ReplayBatch`]
    /// which the caller must drive.
    pub fn drain(
        &mut self,
        outcome: &RenewalOutcome,
        classifier: &Arc<FailureClassifier>,
    ) -> Option<ReplayBatch> {
        if self.entries.is_empty() {
            return None;
        }

        match outcome {
            RenewalOutcome::Success { .. } => {
                debug!(count = self.entries.len(), "Replaying queued requests");
                let replays = self
                    .entries
                    .drain(..)
                    .map(|request| request.replay(Arc::clone(classifier)))
                    .collect::<FuturesUnordered<_>>();
                Some(ReplayBatch { replays })
            }
            RenewalOutcome::Failure(error) => {
                self.reject_all(error.clone());
                None
            }
        }
    }

    /// Reject every queued request with `error`, in insertion order.
    pub fn reject_all(&mut self, error: RenewalError) -> usize {
        let count = self.entries.len();
        if count > 0 {
            debug!(count, %error, "Rejecting queued requests");
        }
        for request in self.entries.drain(..) {
            request.reject(error.clone());
        }
        count
    }
}

impl Drop for RetryQueue {
    fn drop(&mut self) {
        self.reject_all(RenewalError::Shutdown);
    }
}

/// Replays issued after a successful renewal.
///
/// The replays were issued in queue order when the batch was built; they
/// complete independently of each other.
#[must_use = "replays only make progress when the batch is driven"]
pub struct ReplayBatch {
    replays: FuturesUnordered<BoxFuture<'static, ()>>,
}

impl ReplayBatch {
    #[inline]
    pub fn len(&self) -> usize {
        self.replays.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.replays.is_empty()
    }

    /// Drive every replay to completion.
    pub async fn run(mut self) {
        while self.replays.next().await.is_some() {}
    }
}
