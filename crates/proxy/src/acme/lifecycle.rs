//! Per-domain certificate lifecycle
//!
//! ```text
//! Unregistered -> ChallengeRequested -> ChallengeServing -> Validating -> Issued
//!                        ^                                                  |
//!                        +------------------- RenewalDue <-----------------+
//! ```
//!
//! `Failed` is entered from any of the in-progress states and immediately
//! settles back to `Unregistered` (nothing installed) or `RenewalDue` (the
//! previous certificate is still installed and serving).
//!
//! A domain whose issuance failed is not queued again until its backoff
//! window has passed. The window starts at [`AcmePolicy::failure_backoff`]
//! and doubles with each consecutive failure, up to six hours.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use switchyard_common::DomainName;
use switchyard_config::{AcmeConfig, AcmeDirectory};
use tracing::{debug, info, warn};

use super::challenge::ChallengeManager;
use super::client::CertificateAuthority;
use super::error::AcmeError;
use crate::runner::SequentialRunner;
use crate::tls::{CertificateRecord, CertificateStore, IssuanceRequester};

/// Certificate policy for the process
#[derive(Debug, Clone)]
pub struct AcmePolicy {
    pub directory: AcmeDirectory,
    pub contact_email: Option<String>,
    /// Renew once less than this fraction of the lifetime remains
    pub renew_fraction: f64,
    pub validation_timeout: Duration,
    /// Initial delay between CA status polls
    pub poll_interval: Duration,
    /// Wait after a first failure before the domain may be queued again
    pub failure_backoff: Duration,
}

const MAX_FAILURE_BACKOFF: Duration = Duration::from_secs(6 * 3600);

impl Default for AcmePolicy {
    fn default() -> Self {
        Self {
            directory: AcmeDirectory::Staging,
            contact_email: None,
            renew_fraction: 0.2,
            validation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            failure_backoff: Duration::from_secs(5 * 60),
        }
    }
}

impl AcmePolicy {
    pub fn from_config(config: &AcmeConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            contact_email: config.contact_email.clone(),
            renew_fraction: config.renew_fraction,
            validation_timeout: config.validation_timeout(),
            failure_backoff: config.failure_backoff(),
            ..Self::default()
        }
    }
}

/// Lifecycle state of one domain's certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    Unregistered,
    ChallengeRequested,
    ChallengeServing,
    Validating,
    Issued,
    RenewalDue,
    Failed,
}

impl fmt::Display for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertState::Unregistered => "unregistered",
            CertState::ChallengeRequested => "challenge-requested",
            CertState::ChallengeServing => "challenge-serving",
            CertState::Validating => "validating",
            CertState::Issued => "issued",
            CertState::RenewalDue => "renewal-due",
            CertState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of a successful [`CertificateLifecycleManager::ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The installed certificate is outside its renewal window
    AlreadyValid { expires: DateTime<Utc> },
    /// A new certificate was issued and installed
    Issued { expires: DateTime<Utc> },
}

/// Consecutive failed issuances for one domain
#[derive(Debug, Clone, Copy)]
struct FailureStreak {
    count: u32,
    last: Instant,
}

/// Drives issuance and renewal for individual domains
pub struct CertificateLifecycleManager {
    authority: Arc<dyn CertificateAuthority>,
    store: Arc<dyn CertificateStore>,
    challenges: ChallengeManager,
    policy: AcmePolicy,
    states: DashMap<DomainName, CertState>,
    failures: DashMap<DomainName, FailureStreak>,
    in_flight: DashSet<DomainName>,
}

impl fmt::Debug for CertificateLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateLifecycleManager")
            .field("policy", &self.policy)
            .field("tracked_domains", &self.states.len())
            .field("failing_domains", &self.failures.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl CertificateLifecycleManager {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        store: Arc<dyn CertificateStore>,
        challenges: ChallengeManager,
        policy: AcmePolicy,
    ) -> Self {
        Self {
            authority,
            store,
            challenges,
            policy,
            states: DashMap::new(),
            failures: DashMap::new(),
            in_flight: DashSet::new(),
        }
    }

    pub fn policy(&self) -> &AcmePolicy {
        &self.policy
    }

    /// Current state of a domain
    ///
    /// Domains never touched in this process report the state implied by
    /// what is installed (for instance certificates loaded from disk).
    pub fn state(&self, domain: &DomainName) -> CertState {
        if let Some(state) = self.states.get(domain) {
            return *state;
        }
        match self.store.get(domain) {
            Some(installed)
                if !installed
                    .record
                    .needs_renewal_at(Utc::now(), self.policy.renew_fraction) =>
            {
                CertState::Issued
            }
            Some(_) => CertState::RenewalDue,
            None => CertState::Unregistered,
        }
    }

    /// Domains this manager has recorded a state for
    pub fn tracked_domains(&self) -> Vec<DomainName> {
        let mut domains: Vec<_> = self.states.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    /// Whether `ensure` would contact the CA right now
    pub fn needs_issuance(&self, domain: &DomainName) -> bool {
        match self.store.get(domain) {
            Some(installed) => installed
                .record
                .needs_renewal_at(Utc::now(), self.policy.renew_fraction),
            None => true,
        }
    }

    /// Time left before a failing domain may be queued again
    ///
    /// `None` when the domain has no recent failure.
    pub fn retry_after(&self, domain: &DomainName) -> Option<Duration> {
        let streak = *self.failures.get(domain)?;
        let exponent = streak.count.saturating_sub(1).min(16);
        let window = self
            .policy
            .failure_backoff
            .saturating_mul(1 << exponent)
            .min(MAX_FAILURE_BACKOFF);
        window.checked_sub(streak.last.elapsed()).filter(|d| !d.is_zero())
    }

    /// Forget everything about a domain that left the routing table
    ///
    /// Drops its state, failure history and challenge tokens, and removes
    /// its certificate from the store. Returns whether a certificate was
    /// removed.
    pub async fn retire(&self, domain: &DomainName) -> Result<bool, AcmeError> {
        self.states.remove(domain);
        self.failures.remove(domain);
        self.challenges.remove_domain(domain);
        if self.in_flight.contains(domain) {
            warn!(domain = %domain, "Retiring domain while its issuance is still running");
        }

        let store = Arc::clone(&self.store);
        let target = domain.clone();
        let removed = tokio::task::spawn_blocking(move || store.remove(&target))
            .await
            .map_err(|e| AcmeError::Protocol(format!("certificate removal task failed: {e}")))??;

        info!(domain = %domain, removed, "Retired domain");
        Ok(removed)
    }

    /// Make sure `domain` holds a certificate outside its renewal window,
    /// issuing one if needed.
    pub async fn ensure(&self, domain: &DomainName) -> Result<EnsureOutcome, AcmeError> {
        if !self.in_flight.insert(domain.clone()) {
            debug!(domain = %domain, "Issuance already in progress");
            return Err(AcmeError::IssuanceInProgress(domain.to_string()));
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            domain,
        };

        let prior = self.store.get(domain);
        if let Some(installed) = &prior {
            if !installed
                .record
                .needs_renewal_at(Utc::now(), self.policy.renew_fraction)
            {
                self.set_state(domain, CertState::Issued);
                self.failures.remove(domain);
                return Ok(EnsureOutcome::AlreadyValid {
                    expires: installed.record.expires,
                });
            }
            self.set_state(domain, CertState::RenewalDue);
            info!(
                domain = %domain,
                expires = %installed.record.expires,
                "Certificate inside renewal window, renewing"
            );
        } else {
            info!(domain = %domain, "Requesting certificate");
        }

        match self.issue(domain).await {
            Ok(expires) => {
                self.set_state(domain, CertState::Issued);
                self.failures.remove(domain);
                info!(domain = %domain, expires = %expires, "Certificate issued");
                Ok(EnsureOutcome::Issued { expires })
            }
            Err(e) => {
                self.set_state(domain, CertState::Failed);
                let settled = if self.store.get(domain).is_some() {
                    CertState::RenewalDue
                } else {
                    CertState::Unregistered
                };
                let failures = self.record_failure(domain);
                warn!(
                    domain = %domain,
                    error = %e,
                    state = %settled,
                    failures,
                    "Certificate issuance failed"
                );
                self.set_state(domain, settled);
                Err(e)
            }
        }
    }

    async fn issue(&self, domain: &DomainName) -> Result<DateTime<Utc>, AcmeError> {
        self.set_state(domain, CertState::ChallengeRequested);
        let mut order = self.authority.new_order(domain).await?;

        let mut served = ServedTokens {
            challenges: &self.challenges,
            tokens: Vec::new(),
        };
        for challenge in order.challenges() {
            self.challenges
                .add_challenge(domain, &challenge.token, &challenge.key_authorization);
            served.tokens.push(challenge.token.clone());
        }
        self.set_state(domain, CertState::ChallengeServing);

        order.notify_ready().await?;
        self.set_state(domain, CertState::Validating);
        order.await_validation(self.policy.validation_timeout).await?;

        // Validated; the CA no longer needs the responses
        drop(served);

        let issued = order.finalize().await?;
        let record = CertificateRecord::from_pem(domain.clone(), &issued.chain_pem, &issued.key_pem)?;
        // Installing writes to disk
        let store = Arc::clone(&self.store);
        let installed = tokio::task::spawn_blocking(move || store.install(record))
            .await
            .map_err(|e| AcmeError::Protocol(format!("certificate install task failed: {e}")))??;

        Ok(installed.record.expires)
    }

    fn record_failure(&self, domain: &DomainName) -> u32 {
        let mut streak = self
            .failures
            .entry(domain.clone())
            .or_insert(FailureStreak {
                count: 0,
                last: Instant::now(),
            });
        streak.count += 1;
        streak.last = Instant::now();
        streak.count
    }

    fn set_state(&self, domain: &DomainName, state: CertState) {
        debug!(domain = %domain, state = %state, "Certificate state");
        self.states.insert(domain.clone(), state);
    }
}

/// Clears the in-flight marker on every exit path
struct InFlight<'a> {
    set: &'a DashSet<DomainName>,
    domain: &'a DomainName,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(self.domain);
    }
}

/// Stops serving challenge tokens on every exit path
struct ServedTokens<'a> {
    challenges: &'a ChallengeManager,
    tokens: Vec<String>,
}

impl Drop for ServedTokens<'_> {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.challenges.remove_challenge(token);
        }
    }
}

/// De-duplicating front door to the runner for issuance requests
///
/// At most one request per domain is queued or running at a time; repeats
/// while one is pending are dropped, as are requests for a domain still
/// inside its failure backoff.
#[derive(Clone)]
pub struct IssuanceQueue {
    manager: Arc<CertificateLifecycleManager>,
    runner: SequentialRunner,
    pending: Arc<DashSet<DomainName>>,
}

impl fmt::Debug for IssuanceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuanceQueue")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl IssuanceQueue {
    pub fn new(manager: Arc<CertificateLifecycleManager>, runner: SequentialRunner) -> Self {
        Self {
            manager,
            runner,
            pending: Arc::new(DashSet::new()),
        }
    }

    /// Queue `ensure` for a domain unless one is already pending or the
    /// domain failed recently.
    ///
    /// Returns whether a new job was queued.
    pub fn enqueue(&self, domain: &DomainName) -> bool {
        if let Some(wait) = self.manager.retry_after(domain) {
            debug!(
                domain = %domain,
                retry_in_secs = wait.as_secs(),
                "Issuance backing off after failure"
            );
            return false;
        }
        if !self.pending.insert(domain.clone()) {
            debug!(domain = %domain, "Issuance already queued");
            return false;
        }

        let manager = Arc::clone(&self.manager);
        let pending = Arc::clone(&self.pending);
        let job_domain = domain.clone();

        let submitted = self.runner.submit(async move {
            // Cleared when the job ends so a later request can retry
            let _pending = PendingEntry {
                set: &pending,
                domain: &job_domain,
            };
            if let Err(e) = manager.ensure(&job_domain).await {
                debug!(domain = %job_domain, error = %e, "Queued issuance did not complete");
            }
        });

        if let Err(e) = submitted {
            warn!(domain = %domain, error = %e, "Could not queue issuance");
            self.pending.remove(domain);
            return false;
        }
        debug!(domain = %domain, queue_depth = self.runner.queued(), "Queued issuance");
        true
    }

    /// Queue `ensure` only if the domain has no certificate outside its
    /// renewal window
    pub fn enqueue_if_needed(&self, domain: &DomainName) -> bool {
        self.manager.needs_issuance(domain) && self.enqueue(domain)
    }

    pub fn is_pending(&self, domain: &DomainName) -> bool {
        self.pending.contains(domain)
    }

    pub fn manager(&self) -> &Arc<CertificateLifecycleManager> {
        &self.manager
    }
}

impl IssuanceRequester for IssuanceQueue {
    fn request_issuance(&self, domain: &DomainName) {
        self.enqueue(domain);
    }
}

struct PendingEntry<'a> {
    set: &'a DashSet<DomainName>,
    domain: &'a DomainName,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.set.remove(self.domain);
    }
}
