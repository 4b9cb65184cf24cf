//! Single-flight renewal gate.
//!
//! Collapses concurrent renewal triggers (the proactive timer and any number
//! of requests that observed an expired credential) into one exchange with
//! the backend, then commits the outcome: session state, the proactive
//! timer, and the retry queue are all updated while the gate is locked, so a
//! request queued before the outcome is committed is always drained with
//! that outcome.
//!
//! The lock is never held across an `.await`; `InFlight` is entered
//! synchronously before the exchange task starts. Session listeners are
//! notified after the lock is released.
//!
//! A session that ended by logout, shutdown or a failed renewal stays ended:
//! later expiries are refused instead of starting a renewal, until a new
//! session is established.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::clock::{CredentialClock, deadline_after};
use super::queue::{PendingRequest, RetryQueue};
use crate::backend::AuthBackend;
use crate::config::CoordinatorConfig;
use crate::error::{BackendError, RenewalError};
use crate::pipeline::FailureClassifier;
use crate::session::{ClearReason, SessionPublisher, UserIdentity};

/// Outcome of one renewal, observed identically by every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Success {
        identity: Arc<UserIdentity>,
        expires_in: Duration,
    },
    Failure(RenewalError),
}

impl RenewalOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn identity(&self) -> Option<&Arc<UserIdentity>> {
        match self {
            Self::Success { identity, .. } => Some(identity),
            Self::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RenewalError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(e) => Some(e),
        }
    }
}

type SharedRenewal = Shared<BoxFuture<'static, RenewalOutcome>>;

enum RenewalState {
    Idle,
    InFlight(SharedRenewal),
    /// A renewal just succeeded. Requests that expire now were sent with the
    /// old credential and are replayed without another exchange.
    Cooldown { until: Instant },
}

/// Externally visible view of the gate's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPhase {
    Idle,
    InFlight,
    Cooldown,
}

struct GateInner {
    state: RenewalState,
    queue: RetryQueue,
    /// Bumped on every teardown; outcomes from an older epoch are discarded.
    epoch: u64,
    torn_down_with: RenewalError,
    /// Why the session ended, while it stays ended.
    ended: Option<RenewalError>,
}

/// What the pipeline should do with a request that observed an expiry.
pub(crate) enum Admission {
    /// Queued behind an in-flight renewal; the reply arrives on its channel.
    Queued,
    /// A renewal just succeeded; replay right away.
    ReplayNow(PendingRequest),
    /// The retry queue is full.
    Rejected {
        request: PendingRequest,
        limit: usize,
    },
    /// The session has ended; no renewal is attempted.
    Refused {
        request: PendingRequest,
        error: RenewalError,
    },
}

/// Owner of the renewal state and the retry queue.
pub struct RenewalGate {
    backend: Arc<dyn AuthBackend>,
    publisher: Arc<SessionPublisher>,
    clock: Arc<CredentialClock>,
    classifier: Arc<FailureClassifier>,
    renewal_timeout: Duration,
    renewal_cooldown: Duration,
    assumed_validity: Duration,
    inner: Mutex<GateInner>,
    exchanges: AtomicU64,
}

impl RenewalGate {
    pub fn new(
        config: &CoordinatorConfig,
        backend: Arc<dyn AuthBackend>,
        publisher: Arc<SessionPublisher>,
        clock: Arc<CredentialClock>,
        classifier: Arc<FailureClassifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            publisher,
            clock,
            classifier,
            renewal_timeout: config.renewal_timeout,
            renewal_cooldown: config.renewal_cooldown,
            assumed_validity: config.assumed_validity,
            inner: Mutex::new(GateInner {
                state: RenewalState::Idle,
                queue: RetryQueue::new(config.max_queue_depth),
                epoch: 0,
                torn_down_with: RenewalError::Shutdown,
                ended: None,
            }),
            exchanges: AtomicU64::new(0),
        })
    }

    /// Renew the session, joining the in-flight renewal if there is one.
    ///
    /// Unlike a reactive expiry this always attempts a renewal, even after
    /// the session has ended.
    pub async fn renew(self: &Arc<Self>) -> RenewalOutcome {
        let renewal = {
            let mut inner = self.inner.lock();
            self.join_or_start(&mut inner)
        };
        renewal.await
    }

    /// Current phase. An elapsed cooldown reports `Idle`.
    pub fn phase(&self) -> RenewalPhase {
        match &self.inner.lock().state {
            RenewalState::Idle => RenewalPhase::Idle,
            RenewalState::InFlight(_) => RenewalPhase::InFlight,
            RenewalState::Cooldown { until } if Instant::now() < *until => RenewalPhase::Cooldown,
            RenewalState::Cooldown { .. } => RenewalPhase::Idle,
        }
    }

    /// Number of requests waiting for the in-flight renewal.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of renewal exchanges started since construction.
    pub fn exchanges_started(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn classifier(&self) -> &Arc<FailureClassifier> {
        &self.classifier
    }

    /// Why the session ended, if it has ended and not been re-established.
    pub fn ended(&self) -> Option<RenewalError> {
        self.inner.lock().ended.clone()
    }

    /// Queue a request that observed an expiry, starting a renewal if none is
    /// in flight.
    pub(crate) fn admit(self: &Arc<Self>, request: PendingRequest) -> Admission {
        let mut inner = self.inner.lock();

        if !matches!(inner.state, RenewalState::InFlight(_)) {
            if let Some(error) = inner.ended.clone() {
                debug!(
                    request_id = request.id(),
                    %error,
                    "Session has ended; not renewing"
                );
                return Admission::Refused { request, error };
            }
        }

        if let RenewalState::Cooldown { until } = inner.state {
            if Instant::now() < until {
                debug!(
                    request_id = request.id(),
                    "Renewal just completed; replaying without a new exchange"
                );
                return Admission::ReplayNow(request);
            }
            inner.state = RenewalState::Idle;
        }

        if let Err(request) = inner.queue.enqueue(request) {
            let limit = inner.queue.max_depth();
            warn!(limit, request_id = request.id(), "Retry queue full; failing fast");
            return Admission::Rejected { request, limit };
        }

        let _ = self.join_or_start(&mut inner);
        Admission::Queued
    }

    /// Install a session obtained outside the renewal flow (probe, sign-in).
    pub(crate) fn establish(self: &Arc<Self>, identity: Arc<UserIdentity>, expires_in: Duration) {
        {
            let mut inner = self.inner.lock();
            inner.ended = None;
            self.commit_session(identity, expires_in);
        }
        self.publisher.flush();
    }

    /// End the session locally: stop the timer, reject every queued request
    /// with `error`, and clear the published session.
    ///
    /// A renewal still in flight completes for its waiters with `error` and
    /// does not touch the session.
    pub(crate) fn teardown(&self, error: RenewalError, reason: ClearReason) -> usize {
        let rejected = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            inner.state = RenewalState::Idle;
            inner.torn_down_with = error.clone();
            inner.ended = Some(error.clone());

            self.clock.disarm();
            let rejected = inner.queue.reject_all(error);
            self.publisher.clear_session(reason);
            rejected
        };
        self.publisher.flush();
        rejected
    }

    fn join_or_start(self: &Arc<Self>, inner: &mut GateInner) -> SharedRenewal {
        if let RenewalState::InFlight(renewal) = &inner.state {
            debug!("Joining in-flight renewal");
            return renewal.clone();
        }

        let epoch = inner.epoch;
        let attempt = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(gate.exchange(attempt))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    RenewalOutcome::Failure(RenewalError::Internal(
                        "renewal exchange panicked".to_string(),
                    ))
                });
            gate.settle(epoch, outcome)
        });

        let renewal = async move {
            task.await
                .unwrap_or(RenewalOutcome::Failure(RenewalError::Shutdown))
        }
        .boxed()
        .shared();

        inner.state = RenewalState::InFlight(renewal.clone());
        renewal
    }

    #[instrument(skip(self))]
    async fn exchange(&self, attempt: u64) -> RenewalOutcome {
        info!("Starting session renewal");

        let exchange = async {
            let grant = self.backend.refresh().await?;
            let identity = self.backend.fetch_identity().await?;
            Ok::<_, BackendError>((identity, grant.expires_in.unwrap_or(self.assumed_validity)))
        };

        match tokio::time::timeout(self.renewal_timeout, exchange).await {
            Ok(Ok((identity, expires_in))) => {
                info!(
                    user = %identity.display_name(),
                    ?expires_in,
                    "Session renewal successful"
                );
                RenewalOutcome::Success {
                    identity: Arc::new(identity),
                    expires_in,
                }
            }
            Ok(Err(e)) => {
                let error = RenewalError::from(e);
                error!(error = %error, "Session renewal failed");
                RenewalOutcome::Failure(error)
            }
            Err(_) => {
                error!(timeout = ?self.renewal_timeout, "Session renewal timed out");
                RenewalOutcome::Failure(RenewalError::Timeout(self.renewal_timeout))
            }
        }
    }

    /// Commit `outcome` and return what waiters observe.
    fn settle(self: &Arc<Self>, epoch: u64, outcome: RenewalOutcome) -> RenewalOutcome {
        let replays = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                debug!("Session torn down during renewal; discarding outcome");
                return RenewalOutcome::Failure(inner.torn_down_with.clone());
            }

            inner.state = match &outcome {
                RenewalOutcome::Success { .. } if !self.renewal_cooldown.is_zero() => {
                    RenewalState::Cooldown {
                        until: deadline_after(self.renewal_cooldown),
                    }
                }
                _ => RenewalState::Idle,
            };

            match &outcome {
                RenewalOutcome::Success {
                    identity,
                    expires_in,
                } => {
                    inner.ended = None;
                    self.commit_session(Arc::clone(identity), *expires_in);
                }
                RenewalOutcome::Failure(error) => {
                    inner.ended = Some(error.clone());
                    self.clock.disarm();
                    self.publisher
                        .clear_session(ClearReason::RenewalFailed(error.clone()));
                }
            }

            inner.queue.drain(&outcome, &self.classifier)
        };
        self.publisher.flush();

        if let Some(replays) = replays {
            tokio::spawn(replays.run());
        }
        outcome
    }

    /// Publish the session and re-arm the proactive timer for it.
    fn commit_session(self: &Arc<Self>, identity: Arc<UserIdentity>, expires_in: Duration) {
        self.publisher.set_session(identity, valid_until(expires_in));

        let gate = Arc::downgrade(self);
        self.clock.arm(expires_in, move || async move {
            let Some(gate) = gate.upgrade() else {
                return;
            };
            match gate.renew().await {
                RenewalOutcome::Success { .. } => debug!("Proactive renewal completed"),
                RenewalOutcome::Failure(error) => {
                    warn!(error = %error, "Proactive renewal failed; session ended")
                }
            }
        });
    }
}

fn valid_until(expires_in: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(expires_in)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::backend::Grant;

    /// Backend whose refresh blocks until released.
    struct HeldBackend {
        release: Notify,
        refreshes: AtomicUsize,
        fail: bool,
    }

    impl HeldBackend {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                refreshes: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl AuthBackend for HeldBackend {
        async fn refresh(&self) -> Result<Grant, BackendError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            if self.fail {
                Err(BackendError::Unauthenticated)
            } else {
                Ok(Grant::expiring_in(Duration::from_secs(300)))
            }
        }

        async fn fetch_identity(&self) -> Result<UserIdentity, BackendError> {
            Ok(UserIdentity::new("alice", ["Admin"]))
        }

        async fn logout(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn gate_with(backend: Arc<HeldBackend>, config: CoordinatorConfig) -> Arc<RenewalGate> {
        RenewalGate::new(
            &config,
            backend,
            Arc::new(SessionPublisher::new()),
            Arc::new(CredentialClock::new(config.safety_margin, config.min_delay)),
            Arc::new(FailureClassifier::default()),
        )
    }

    #[tokio::test]
    async fn test_concurrent_renew_calls_share_one_exchange() {
        let backend = HeldBackend::new(false);
        let gate = gate_with(Arc::clone(&backend), CoordinatorConfig::default());

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move { gate.renew().await })
            })
            .collect();

        while backend.refreshes.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.phase(), RenewalPhase::InFlight);
        backend.release.notify_one();

        for waiter in waiters {
            let outcome = waiter.await.unwrap();
            assert_eq!(outcome.identity().unwrap().display_name(), "alice");
        }
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(gate.exchanges_started(), 1);
        assert_eq!(gate.phase(), RenewalPhase::Cooldown);
        assert!(gate.publisher.current_session().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_exchange_times_out() {
        let backend = HeldBackend::new(false);
        let config = CoordinatorConfig::default().with_renewal_timeout(Duration::from_secs(5));
        let gate = gate_with(Arc::clone(&backend), config);

        let outcome = gate.renew().await;
        assert_eq!(
            outcome,
            RenewalOutcome::Failure(RenewalError::Timeout(Duration::from_secs(5)))
        );
        assert_eq!(gate.phase(), RenewalPhase::Idle);
        assert!(!gate.clock.is_armed());
    }

    #[tokio::test]
    async fn test_teardown_during_renewal_discards_outcome() {
        let backend = HeldBackend::new(false);
        let gate = gate_with(Arc::clone(&backend), CoordinatorConfig::default());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.renew().await })
        };
        while backend.refreshes.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        gate.teardown(RenewalError::LoggedOut, ClearReason::Logout);
        backend.release.notify_one();

        assert_eq!(
            waiter.await.unwrap(),
            RenewalOutcome::Failure(RenewalError::LoggedOut)
        );
        assert!(!gate.publisher.current_session().is_authenticated());
        assert!(!gate.clock.is_armed());
    }

    #[tokio::test]
    async fn test_failed_renewal_returns_to_idle() {
        let backend = HeldBackend::new(true);
        let gate = gate_with(Arc::clone(&backend), CoordinatorConfig::default());
        backend.release.notify_one();

        let outcome = gate.renew().await;
        assert!(outcome.error().unwrap().requires_relogin());
        assert_eq!(gate.phase(), RenewalPhase::Idle);
    }

    #[tokio::test]
    async fn test_ended_until_reestablished() {
        let backend = HeldBackend::new(true);
        let gate = gate_with(Arc::clone(&backend), CoordinatorConfig::default());
        assert_eq!(gate.ended(), None);

        backend.release.notify_one();
        let outcome = gate.renew().await;
        assert_eq!(gate.ended().as_ref(), outcome.error());

        gate.establish(Arc::new(UserIdentity::new("alice", ["Admin"])), Duration::from_secs(60));
        assert_eq!(gate.ended(), None);

        gate.teardown(RenewalError::LoggedOut, ClearReason::Logout);
        assert_eq!(gate.ended(), Some(RenewalError::LoggedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_expiry_does_not_overflow() {
        let backend = HeldBackend::new(false);
        let gate = gate_with(Arc::clone(&backend), CoordinatorConfig::default());

        gate.establish(Arc::new(UserIdentity::new("alice", ["Admin"])), Duration::MAX);
        assert!(gate.clock.is_armed());
        assert_eq!(
            gate.publisher.current_session().valid_until,
            Some(DateTime::<Utc>::MAX_UTC)
        );
    }

    #[test]
    fn test_valid_until_saturates() {
        assert_eq!(valid_until(Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(valid_until(Duration::from_secs(60)) > Utc::now());
    }
}
