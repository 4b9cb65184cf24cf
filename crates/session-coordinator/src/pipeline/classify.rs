//! Failure classification: "authentication expired, retry worthwhile" versus
//! everything else.
//!
//! A status code alone is ambiguous (some backends answer 401 for bad
//! passwords or revoked grants too), so an explicit error-kind signal from
//! the backend takes precedence when present:
//!
//! 1. `x-auth-error` (configurable): values listed in `expiry_signals` mean
//!    expiry, any other value means a non-expiry auth failure.
//! 2. RFC 6750 `WWW-Authenticate: Bearer error="invalid_token"` means expiry;
//!    any other `error` parameter means a non-expiry auth failure.

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};
use serde::{Deserialize, Serialize};

use super::request::ApiResponse;

/// Classification policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Status the backend uses for an expired credential.
    pub expiry_status: u16,
    /// Header carrying the backend's explicit auth error kind.
    pub signal_header: String,
    /// Values of `signal_header` meaning "expired" (compared case-insensitively).
    pub expiry_signals: Vec<String>,
    /// Treat a bare `expiry_status` without any signal as non-expiry.
    pub require_explicit_signal: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            expiry_status: StatusCode::UNAUTHORIZED.as_u16(),
            signal_header: "x-auth-error".to_string(),
            expiry_signals: vec!["expired".to_string(), "token_expired".to_string()],
            require_explicit_signal: false,
        }
    }
}

/// Explicit auth error kind carried by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSignal {
    Expired,
    /// An auth failure that renewal will not fix (bad credentials, revoked, forbidden).
    Other,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    AuthExpired,
    Other,
}

#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    config: ClassifierConfig,
}

impl FailureClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Read the explicit auth error kind from response headers.
    pub fn signal(&self, headers: &HeaderMap) -> AuthSignal {
        if let Some(value) = headers
            .get(self.config.signal_header.as_str())
            .and_then(|v| v.to_str().ok())
        {
            let value = value.trim();
            return if self
                .config
                .expiry_signals
                .iter()
                .any(|s| s.eq_ignore_ascii_case(value))
            {
                AuthSignal::Expired
            } else {
                AuthSignal::Other
            };
        }

        for challenge in headers.get_all(WWW_AUTHENTICATE) {
            let Ok(challenge) = challenge.to_str() else {
                continue;
            };
            match bearer_error(challenge) {
                Some(error) if error.eq_ignore_ascii_case("invalid_token") => {
                    return AuthSignal::Expired;
                }
                Some(_) => return AuthSignal::Other,
                None => {}
            }
        }

        AuthSignal::Absent
    }

    pub fn classify_parts(&self, status: StatusCode, headers: &HeaderMap) -> FailureClass {
        if status.as_u16() != self.config.expiry_status {
            return FailureClass::Other;
        }

        match self.signal(headers) {
            AuthSignal::Expired => FailureClass::AuthExpired,
            AuthSignal::Other => FailureClass::Other,
            AuthSignal::Absent if self.config.require_explicit_signal => FailureClass::Other,
            AuthSignal::Absent => FailureClass::AuthExpired,
        }
    }

    pub fn classify(&self, response: &ApiResponse) -> FailureClass {
        self.classify_parts(response.status(), response.headers())
    }

    #[inline]
    pub fn is_auth_expired(&self, response: &ApiResponse) -> bool {
        self.classify(response) == FailureClass::AuthExpired
    }
}

/// Extract the `error` parameter of a `Bearer` challenge.
fn bearer_error(challenge: &str) -> Option<&str> {
    let rest = challenge.trim();
    let scheme_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    if !rest[..scheme_end].eq_ignore_ascii_case("bearer") {
        return None;
    }

    rest[scheme_end..].split(',').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("error") {
            Some(value.trim().trim_matches('"'))
        } else {
            None
        }
    })
}
