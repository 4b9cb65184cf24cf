//! # Session Coordinator
//!
//! Client-side coordination of a renewable authentication session.
//!
//! ## Features
//!
//! - Proactive renewal scheduled ahead of the credential's expiry
//! - Single-flight renewal: concurrent triggers share one backend exchange
//! - Requests that observe an expired credential are queued, then replayed
//!   once (in arrival order) after the renewal succeeds, or rejected if it fails
//! - Session state published to watchers and synchronous listeners
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod backend;
pub mod config;
mod coordinator;
pub mod error;
pub mod pipeline;
pub mod renewal;
pub mod session;

/// Re-export key types
pub use backend::{AuthBackend, Credentials, Grant, HttpBackend, HttpBackendConfig};
pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{BackendError, RenewalError, SendError, TransportError};
pub use pipeline::{ApiRequest, ApiResponse, FailureClassifier, RequestPipeline, Transport};
pub use renewal::{CredentialClock, RenewalGate, RenewalOutcome, RenewalPhase};
pub use session::{
    AuthPhase, ClearReason, GuardDecision, RouteGuard, Session, SessionEvent, SessionPublisher,
    Subscription, UserIdentity,
};
