//! Error types for session coordination.

use std::time::Duration;

use thiserror::Error;

/// Why a renewal attempt did not produce a fresh session.
///
/// Every waiter of one renewal observes the same value, so this type is
/// `Clone` and carries messages instead of source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenewalError {
    /// The backend refused the refresh credential - re-login required.
    #[error("Refresh rejected: {0}")]
    Rejected(String),

    /// The backend answered with a server-side failure.
    #[error("Backend error during renewal: {0}")]
    Backend(String),

    /// The renewal exchange could not reach the backend.
    #[error("Network error during renewal: {0}")]
    Network(String),

    /// The renewal exchange did not finish within the configured timeout.
    #[error("Renewal timed out after {0:?}")]
    Timeout(Duration),

    /// The user logged out while the request was waiting.
    #[error("Session was logged out")]
    LoggedOut,

    /// The coordinator was torn down while the request was waiting.
    #[error("Session coordinator shut down")]
    Shutdown,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RenewalError {
    /// Check if this error requires the user to authenticate again.
    pub fn requires_relogin(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::LoggedOut)
    }

    /// Check if this error is transient and a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_) | Self::Backend(_))
    }
}

impl From<BackendError> for RenewalError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unauthenticated => {
                RenewalError::Rejected("credential no longer accepted".to_string())
            }
            BackendError::Status { status, message } if (400..500).contains(&status) => {
                RenewalError::Rejected(format!("{}: {}", status, message))
            }
            BackendError::Status { status, message } => {
                RenewalError::Backend(format!("{}: {}", status, message))
            }
            BackendError::Network(e) => RenewalError::Network(e.to_string()),
            BackendError::Decode(msg) => RenewalError::Internal(format!("invalid response: {msg}")),
            BackendError::Unsupported(op) => {
                RenewalError::Internal(format!("backend does not support {op}"))
            }
            BackendError::Config(msg) => RenewalError::Internal(msg),
        }
    }
}

/// Errors from the backend's authentication endpoints.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend does not recognise the current credential.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Non-success status other than an authentication failure.
    #[error("Backend returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Response body could not be decoded.
    #[error("Invalid response: {0}")]
    Decode(String),

    /// The backend is misconfigured (bad base URL or endpoint path).
    #[error("Invalid backend configuration: {0}")]
    Config(String),

    /// The backend has no endpoint for this operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Errors from the transport that carries application requests.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The request could not be built (bad path, bad body).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),
}

/// Error returned to callers of the request pipeline.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The replay after a successful renewal was rejected as expired again.
    #[error("Request expired again after session renewal")]
    AuthExpired,

    /// The renewal this request was waiting on failed.
    #[error("Session renewal failed: {0}")]
    Renewal(#[from] RenewalError),

    /// Too many requests are already waiting for the renewal.
    #[error("Retry queue full ({limit} requests waiting for renewal)")]
    QueueFull { limit: usize },

    /// The request was dropped before it could be settled.
    #[error("Request abandoned before renewal completed")]
    Cancelled,
}

impl SendError {
    /// Check if this error means the caller is no longer authenticated.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::AuthExpired | Self::Renewal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_maps_to_renewal_error() {
        assert!(RenewalError::from(BackendError::Unauthenticated).requires_relogin());

        let client = RenewalError::from(BackendError::Status {
            status: 400,
            message: "bad refresh token".to_string(),
        });
        assert!(matches!(client, RenewalError::Rejected(_)));

        let server = RenewalError::from(BackendError::Status {
            status: 503,
            message: "maintenance".to_string(),
        });
        assert!(matches!(server, RenewalError::Backend(_)));
        assert!(server.is_transient());
    }

    #[test]
    fn test_session_lost_classification() {
        assert!(SendError::AuthExpired.is_session_lost());
        assert!(SendError::Renewal(RenewalError::LoggedOut).is_session_lost());
        assert!(
            SendError::Renewal(RenewalError::Timeout(std::time::Duration::from_secs(1)))
                .is_session_lost()
        );
        assert!(!SendError::QueueFull { limit: 4 }.is_session_lost());
        assert!(!SendError::Transport(TransportError::Other("reset".into())).is_session_lost());
    }
}
