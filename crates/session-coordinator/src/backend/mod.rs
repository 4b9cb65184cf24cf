//! Backend boundary: the authentication endpoints the coordinator depends on.
//!
//! - [`AuthBackend`]: refresh, identity, logout and sign-in exchanges
//! - [`HttpBackend`]: cookie-based HTTP implementation of both [`AuthBackend`]
//!   and [`Transport`](crate::pipeline::Transport)

mod http;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::session::UserIdentity;

pub use http::{DEFAULT_REQUEST_TIMEOUT, HttpBackend, HttpBackendConfig, install_rustls_provider};

/// Result of a successful refresh or sign-in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    /// Remaining validity of the new credential, if the backend reports it.
    pub expires_in: Option<Duration>,
}

impl Grant {
    pub fn expiring_in(expires_in: Duration) -> Self {
        Self {
            expires_in: Some(expires_in),
        }
    }
}

/// Username/password pair for the sign-in boundary call.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authentication endpoints of the backend.
///
/// `refresh` and `fetch_identity` must be idempotent and safe to retry.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange the current (possibly stale) credential for a fresh one.
    async fn refresh(&self) -> Result<Grant, BackendError>;

    /// Fetch the identity bound to the current credential.
    ///
    /// Returns [`BackendError::Unauthenticated`] when there is no valid credential.
    async fn fetch_identity(&self) -> Result<UserIdentity, BackendError>;

    /// Invalidate the credential server-side. Best effort.
    async fn logout(&self) -> Result<(), BackendError>;

    /// Obtain a credential from a username and password.
    async fn sign_in(&self, _credentials: &Credentials) -> Result<Grant, BackendError> {
        Err(BackendError::Unsupported("sign-in"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials::new("alice", "Secr3tPass");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("Secr3tPass"));
        assert_eq!(credentials.password(), "Secr3tPass");
    }
}
