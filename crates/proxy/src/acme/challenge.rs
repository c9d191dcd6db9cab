//! HTTP-01 challenge responder state
//!
//! Holds the challenge tokens currently being proven to the CA. The
//! plaintext dispatcher answers `/.well-known/acme-challenge/<token>` from
//! here and never forwards such paths upstream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use switchyard_common::DomainName;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// A token being served for one domain's validation
#[derive(Debug, Clone)]
struct PendingChallenge {
    domain: DomainName,
    key_authorization: String,
    registered: Instant,
}

/// Token -> key authorization bindings
///
/// Cloning shares the underlying map, so the lifecycle manager registers
/// tokens on the same instance the dispatcher reads from.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    challenges: Arc<DashMap<String, PendingChallenge>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start serving `key_authorization` for `token`
    pub fn add_challenge(&self, domain: &DomainName, token: &str, key_authorization: &str) {
        debug!(domain = %domain, token = %token, "Serving ACME HTTP-01 challenge");
        self.challenges.insert(
            token.to_string(),
            PendingChallenge {
                domain: domain.clone(),
                key_authorization: key_authorization.to_string(),
                registered: Instant::now(),
            },
        );
    }

    /// Stop serving a token
    pub fn remove_challenge(&self, token: &str) {
        if let Some((_, challenge)) = self.challenges.remove(token) {
            debug!(domain = %challenge.domain, token = %token, "Removed ACME challenge");
        }
    }

    /// Stop serving every token registered for `domain`
    pub fn remove_domain(&self, domain: &DomainName) -> usize {
        let before = self.challenges.len();
        self.challenges.retain(|_, c| &c.domain != domain);
        let removed = before.saturating_sub(self.challenges.len());
        if removed > 0 {
            debug!(domain = %domain, removed, "Removed ACME challenges for domain");
        }
        removed
    }

    /// Key authorization for a token, if one is being served
    pub fn get_response(&self, token: &str) -> Option<String> {
        let response = self.challenges.get(token).map(|c| c.key_authorization.clone());
        trace!(token = %token, found = response.is_some(), "ACME challenge lookup");
        response
    }

    /// Token part of a challenge request path, if the path is one
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Drop tokens older than `max_age`
    ///
    /// Backstop for attempts that ended without cleaning up after themselves.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let before = self.challenges.len();
        self.challenges.retain(|_, c| c.registered.elapsed() < max_age);
        let purged = before.saturating_sub(self.challenges.len());
        if purged > 0 {
            debug!(purged, "Purged stale ACME challenges");
        }
        purged
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}
