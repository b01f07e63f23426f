//! Pending HTTP-01 challenges
//!
//! An issuance run registers the token it was given; the plaintext listener
//! answers `/.well-known/acme-challenge/<token>` from here. The entry lives
//! only as long as the [`PendingChallengeGuard`] returned on registration.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Token -> key authorization map shared between issuer and listener
#[derive(Debug, Clone, Default)]
pub struct PendingChallenges {
    challenges: Arc<DashMap<String, String>>,
}

impl PendingChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a challenge; it is withdrawn when the guard is dropped
    pub fn register(&self, token: &str, key_authorization: &str) -> PendingChallengeGuard {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
        PendingChallengeGuard {
            challenges: self.clone(),
            token: token.to_string(),
        }
    }

    /// Expected response body for `token`
    pub fn response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Token embedded in a challenge request path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    fn remove(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }
}

/// Keeps one challenge answerable; removes it on drop
#[derive(Debug)]
pub struct PendingChallengeGuard {
    challenges: PendingChallenges,
    token: String,
}

impl Drop for PendingChallengeGuard {
    fn drop(&mut self) {
        self.challenges.remove(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_respond() {
        let challenges = PendingChallenges::new();
        let _guard = challenges.register("token123", "token123.thumbprint");

        assert_eq!(
            challenges.response("token123"),
            Some("token123.thumbprint".to_string())
        );
        assert_eq!(challenges.response("other"), None);
    }

    #[test]
    fn test_guard_drop_withdraws_challenge() {
        let challenges = PendingChallenges::new();
        {
            let _guard = challenges.register("token123", "auth");
            assert_eq!(challenges.pending_count(), 1);
        }
        assert_eq!(challenges.pending_count(), 0);
        assert!(challenges.response("token123").is_none());
    }

    #[test]
    fn test_clone_shares_state() {
        let challenges = PendingChallenges::new();
        let listener_view = challenges.clone();

        let _guard = challenges.register("token", "auth");
        assert_eq!(listener_view.response("token"), Some("auth".to_string()));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            PendingChallenges::extract_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(PendingChallenges::extract_token("/.well-known/acme-challenge/"), None);
        assert_eq!(PendingChallenges::extract_token("/.well-known/acme-challenge/a/b"), None);
        assert_eq!(PendingChallenges::extract_token("/.well-known/acme-challenge"), None);
        assert_eq!(PendingChallenges::extract_token("/other/path"), None);
    }
}
