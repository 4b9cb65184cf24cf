//! Session coordinator: the entry point applications hold on to.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::backend::{AuthBackend, Credentials};
use crate::config::CoordinatorConfig;
use crate::error::{BackendError, RenewalError, SendError};
use crate::pipeline::{ApiRequest, ApiResponse, FailureClassifier, Invoke, RequestPipeline, Transport};
use crate::renewal::{CredentialClock, RenewalGate, RenewalOutcome};
use crate::session::{AuthPhase, ClearReason, Session, SessionEvent, SessionPublisher, Subscription, UserIdentity};

/// Upper bound on the best-effort server-side logout.
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinates credential renewal for one client session.
///
/// Owns the session publisher, the proactive renewal clock, the single-flight
/// renewal gate and the request pipeline. Dropping the coordinator tears the
/// session down: queued requests are rejected and the timer is stopped.
pub struct Coordinator {
    config: CoordinatorConfig,
    backend: Arc<dyn AuthBackend>,
    publisher: Arc<SessionPublisher>,
    clock: Arc<CredentialClock>,
    gate: Arc<RenewalGate>,
    pipeline: RequestPipeline,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        backend: Arc<dyn AuthBackend>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let publisher = Arc::new(SessionPublisher::new());
        let clock = Arc::new(CredentialClock::new(config.safety_margin, config.min_delay));
        let classifier = Arc::new(FailureClassifier::new(config.classifier.clone()));
        let gate = RenewalGate::new(
            &config,
            Arc::clone(&backend),
            Arc::clone(&publisher),
            Arc::clone(&clock),
            classifier,
        );
        let pipeline = RequestPipeline::new(transport, Arc::clone(&gate));

        Self {
            config,
            backend,
            publisher,
            clock,
            gate,
            pipeline,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionPublisher> {
        &self.publisher
    }

    pub fn current_session(&self) -> Session {
        self.publisher.current_session()
    }

    /// See [`SessionPublisher::subscribe`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionEvent, &Session) + Send + Sync + 'static,
    {
        self.publisher.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<Session> {
        self.publisher.watch()
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn clock(&self) -> &CredentialClock {
        &self.clock
    }

    pub fn gate(&self) -> &Arc<RenewalGate> {
        &self.gate
    }

    /// Send an application request, renewing and replaying once on expiry.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, SendError> {
        self.pipeline.send(request).await
    }

    /// See [`RequestPipeline::send_with`].
    pub async fn send_with(&self, invoke: Invoke) -> Result<ApiResponse, SendError> {
        self.pipeline.send_with(invoke).await
    }

    /// Renew now, joining a renewal already in flight.
    pub async fn renew(&self) -> RenewalOutcome {
        self.gate.renew().await
    }

    /// Restore a session from an existing credential, if there is one.
    ///
    /// Asks the backend who the current credential belongs to. A stale
    /// credential gets one renewal attempt; a missing or rejected one leaves
    /// the session cleared.
    #[instrument(skip(self))]
    pub async fn start(&self) -> AuthPhase {
        self.publisher.begin_authenticating();
        self.publisher.flush();

        match self.backend.fetch_identity().await {
            Ok(identity) => {
                info!(user = %identity.display_name(), "Existing session found");
                self.gate
                    .establish(Arc::new(identity), self.config.assumed_validity);
            }
            Err(BackendError::Unauthenticated) => {
                info!("No valid session; attempting renewal");
                // The gate publishes the outcome.
                let _ = self.gate.renew().await;
            }
            Err(e) => {
                warn!(error = %e, "Session probe failed");
                self.publisher.clear_session(ClearReason::ProbeFailed);
                self.publisher.flush();
            }
        }

        self.publisher.current_session().phase()
    }

    /// Sign in with a username and password and establish the session.
    #[instrument(skip(self, credentials), fields(user = %credentials.username))]
    pub async fn sign_in(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<UserIdentity>, BackendError> {
        self.publisher.begin_authenticating();
        self.publisher.flush();

        let result = async {
            let grant = self.backend.sign_in(credentials).await?;
            let identity = self.backend.fetch_identity().await?;
            Ok::<_, BackendError>((identity, grant))
        }
        .await;

        match result {
            Ok((identity, grant)) => {
                let identity = Arc::new(identity);
                let expires_in = grant.expires_in.unwrap_or(self.config.assumed_validity);
                self.gate.establish(Arc::clone(&identity), expires_in);
                info!("Signed in");
                Ok(identity)
            }
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                self.publisher.clear_session(ClearReason::SignInFailed);
                self.publisher.flush();
                Err(e)
            }
        }
    }

    /// Install a session obtained out of band (e.g. an external login flow).
    pub fn establish(&self, identity: UserIdentity, expires_in: Option<Duration>) {
        self.gate.establish(
            Arc::new(identity),
            expires_in.unwrap_or(self.config.assumed_validity),
        );
    }

    /// Log out.
    ///
    /// The local session ends first: queued requests are rejected with
    /// [`RenewalError::LoggedOut`] and no renewal outcome from before the
    /// logout is committed. The server-side logout is best effort.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        let rejected = self.gate.teardown(RenewalError::LoggedOut, ClearReason::Logout);
        info!(rejected, "Logged out locally");

        match tokio::time::timeout(LOGOUT_TIMEOUT, self.backend.logout()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Server-side logout failed"),
            Err(_) => warn!(timeout = ?LOGOUT_TIMEOUT, "Server-side logout timed out"),
        }
    }

    /// Stop the coordinator, rejecting queued requests with
    /// [`RenewalError::Shutdown`]. Returns how many were rejected.
    pub fn shutdown(&self) -> usize {
        self.gate.teardown(RenewalError::Shutdown, ClearReason::Shutdown)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
