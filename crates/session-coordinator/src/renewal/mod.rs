//! Credential renewal.
//!
//! - [`CredentialClock`]: schedules proactive renewals ahead of expiry
//! - [`RenewalGate`]: single-flight renewal and outcome commit
//! - [`RetryQueue`]: requests waiting for the in-flight renewal

mod clock;
mod gate;
mod queue;

pub use clock::{CredentialClock, DEFAULT_MIN_DELAY, DEFAULT_SAFETY_MARGIN, MAX_DELAY};
pub(crate) use gate::Admission;
pub use gate::{RenewalGate, RenewalOutcome, RenewalPhase};
pub use queue::{PendingRequest, ReplayBatch, Reply, RetryQueue};
