//! Session state: who the current user is, and who is told when that changes.

mod guard;
mod publisher;
mod types;

pub use guard::{GuardDecision, RouteGuard};
pub use publisher::{SessionPublisher, Subscription};
pub use types::{AuthPhase, ClearReason, Session, SessionEvent, UserIdentity};
