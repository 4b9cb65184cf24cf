//! Route guarding on top of the published session.

use super::types::{AuthPhase, Session};

/// What a navigation guard should do for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Authentication is still being established; show a loading state.
    Wait,
    /// Render the protected content.
    Allow,
    /// Send the user to the authentication page.
    RedirectToAuth,
}

/// Guard for routes that require an authenticated session, optionally
/// restricted to a set of roles.
#[derive(Debug, Clone, Default)]
pub struct RouteGuard {
    required_roles: Vec<String>,
}

impl RouteGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the user to hold at least one of `roles`.
    pub fn with_any_role<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn decide(&self, session: &Session) -> GuardDecision {
        match session.phase() {
            AuthPhase::Authenticating => GuardDecision::Wait,
            AuthPhase::Unauthenticated => GuardDecision::RedirectToAuth,
            AuthPhase::Authenticated => {
                let Some(principal) = session.principal.as_deref() else {
                    return GuardDecision::RedirectToAuth;
                };
                if self.required_roles.is_empty()
                    || self.required_roles.iter().any(|r| principal.has_role(r))
                {
                    GuardDecision::Allow
                } else {
                    GuardDecision::RedirectToAuth
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::UserIdentity;

    fn signed_in(roles: &[&str]) -> Session {
        Session {
            principal: Some(Arc::new(UserIdentity::new("alice", roles.iter().copied()))),
            valid_until: None,
            authenticating: false,
        }
    }

    #[test]
    fn test_guard_decisions_follow_phase() {
        let guard = RouteGuard::new();
        assert_eq!(guard.decide(&Session::default()), GuardDecision::RedirectToAuth);

        let probing = Session {
            authenticating: true,
            ..Session::default()
        };
        assert_eq!(guard.decide(&probing), GuardDecision::Wait);
        assert_eq!(guard.decide(&signed_in(&[])), GuardDecision::Allow);
    }

    #[test]
    fn test_guard_with_roles() {
        let guard = RouteGuard::with_any_role(["Admin", "Editor"]);
        assert_eq!(guard.decide(&signed_in(&["Editor"])), GuardDecision::Allow);
        assert_eq!(
            guard.decide(&signed_in(&["Viewer"])),
            GuardDecision::RedirectToAuth
        );
    }
}
