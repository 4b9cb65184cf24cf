//! Session data types.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RenewalError;

/// The authenticated user as reported by the backend's identity endpoint.
///
/// Immutable once constructed; a renewal replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    #[serde(rename = "userName", alias = "displayName")]
    display_name: String,
    #[serde(default)]
    roles: BTreeSet<String>,
}

impl UserIdentity {
    pub fn new<I, S>(display_name: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            display_name: display_name.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    #[inline]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[inline]
    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    /// Check if the user holds a role (exact, case-sensitive match).
    #[inline]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Externally visible phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Unauthenticated,
    /// The first identity probe (or a sign-in) is outstanding.
    Authenticating,
    Authenticated,
}

/// Read-only snapshot of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// `None` when unauthenticated.
    pub principal: Option<Arc<UserIdentity>>,
    /// Known or assumed expiry of the credential.
    pub valid_until: Option<DateTime<Utc>>,
    /// Set while the first identity probe is outstanding.
    pub authenticating: bool,
}

impl Session {
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    pub fn phase(&self) -> AuthPhase {
        if self.principal.is_some() {
            AuthPhase::Authenticated
        } else if self.authenticating {
            AuthPhase::Authenticating
        } else {
            AuthPhase::Unauthenticated
        }
    }

    /// Display name of the current user, if any.
    pub fn display_name(&self) -> Option<&str> {
        self.principal.as_deref().map(UserIdentity::display_name)
    }
}

/// Why a session was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearReason {
    /// Explicit logout.
    Logout,
    /// Renewal failed; the session cannot be salvaged without user action.
    RenewalFailed(RenewalError),
    /// The startup identity probe did not yield a session.
    ProbeFailed,
    /// Sign-in was attempted and failed.
    SignInFailed,
    /// The coordinator was torn down.
    Shutdown,
}

impl ClearReason {
    pub fn describe(&self) -> String {
        match self {
            Self::Logout => "logout".to_string(),
            Self::RenewalFailed(e) => format!("renewal failed: {}", e),
            Self::ProbeFailed => "identity probe failed".to_string(),
            Self::SignInFailed => "sign-in failed".to_string(),
            Self::Shutdown => "shutdown".to_string(),
        }
    }
}

/// Notification delivered to session subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An identity probe or sign-in started.
    Authenticating,
    /// A session was established from an unauthenticated state.
    Established(Arc<UserIdentity>),
    /// An existing session was renewed; the identity may have changed.
    Renewed(Arc<UserIdentity>),
    /// The session was cleared. Identity-dependent state must be discarded.
    Cleared { reason: ClearReason },
}
