//! Background certificate renewal scheduler
//!
//! Periodically sweeps every TLS-enabled domain in the current routing
//! table through the runner, renewing whatever is inside its window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::challenge::ChallengeManager;
use super::error::AcmeError;
use super::lifecycle::{CertificateLifecycleManager, EnsureOutcome};
use crate::routing::RoutingHandle;
use crate::runner::SequentialRunner;

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 hour)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Delay before the first sweep after startup
const INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Tokens older than this are leftovers from an attempt that never cleaned up
const STALE_CHALLENGE_AGE: Duration = Duration::from_secs(3600);

/// Outcome counts for one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
}

/// Background certificate renewal scheduler
pub struct RenewalScheduler {
    manager: Arc<CertificateLifecycleManager>,
    runner: SequentialRunner,
    routes: RoutingHandle,
    challenges: ChallengeManager,
    check_interval: Duration,
}

impl RenewalScheduler {
    pub fn new(
        manager: Arc<CertificateLifecycleManager>,
        runner: SequentialRunner,
        routes: RoutingHandle,
        challenges: ChallengeManager,
    ) -> Self {
        Self {
            manager,
            runner,
            routes,
            challenges,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 hour to avoid
    /// excessive polling.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run sweeps until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            check_interval_hours = self.check_interval.as_secs() / 3600,
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval_at(Instant::now() + INITIAL_DELAY, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running scheduled certificate renewal check");
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Certificate renewal check failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Certificate renewal scheduler stopped");
    }

    /// Check every TLS-enabled domain once, renewing as needed
    pub async fn sweep(&self) -> Result<SweepSummary, AcmeError> {
        self.challenges.purge_older_than(STALE_CHALLENGE_AGE);

        let domains = self.routes.load().tls_domains();
        info!(domain_count = domains.len(), "Checking certificates for renewal");

        let start = Instant::now();
        let manager = Arc::clone(&self.manager);
        let results = self
            .runner
            .run_series(domains.clone(), move |domain, _| {
                let manager = Arc::clone(&manager);
                async move { manager.ensure(&domain).await }
            })
            .await
            .map_err(|e| AcmeError::Protocol(format!("renewal sweep could not run: {e}")))?;

        let mut summary = SweepSummary {
            checked: results.len(),
            ..SweepSummary::default()
        };
        for (domain, result) in domains.iter().zip(&results) {
            match result {
                Ok(EnsureOutcome::Issued { expires }) => {
                    summary.renewed += 1;
                    info!(domain = %domain, expires = %expires, "Certificate renewed");
                }
                Ok(EnsureOutcome::AlreadyValid { .. }) => {
                    debug!(domain = %domain, "Certificate is still valid");
                }
                Err(AcmeError::IssuanceInProgress(_)) => {
                    debug!(domain = %domain, "Renewal skipped, issuance already running");
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(domain = %domain, error = %e, "Certificate renewal failed");
                }
            }
        }

        info!(
            checked = summary.checked,
            renewed = summary.renewed,
            failed = summary.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Certificate renewal check complete"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::client::{CertificateAuthority, PendingOrder};
    use crate::acme::AcmePolicy;
    use crate::registry::DomainRecord;
    use crate::routing::RoutingTable;
    use crate::testutil::self_signed_pem;
    use crate::tls::{CertificateRecord, CertificateStore, ManagedCertificates};
    use async_trait::async_trait;
    use switchyard_common::DomainName;

    /// CA that refuses every order
    struct Unreachable;

    #[async_trait]
    impl CertificateAuthority for Unreachable {
        async fn new_order(&self, domain: &DomainName) -> Result<Box<dyn PendingOrder>, AcmeError> {
            Err(AcmeError::OrderCreation(format!("unreachable for {domain}")))
        }
    }

    #[tokio::test]
    async fn test_interval_is_clamped() {
        let scheduler = scheduler(Arc::new(ManagedCertificates::in_memory()))
            .with_interval(Duration::from_secs(60));
        assert_eq!(scheduler.check_interval(), MIN_CHECK_INTERVAL);
    }

    fn scheduler(store: Arc<ManagedCertificates>) -> RenewalScheduler {
        let challenges = ChallengeManager::new();
        let manager = Arc::new(CertificateLifecycleManager::new(
            Arc::new(Unreachable),
            store,
            challenges.clone(),
            AcmePolicy::default(),
        ));
        let routes = RoutingHandle::new(RoutingTable::build(vec![
            DomainRecord::new(1, "valid.test", "127.0.0.1", 9001, true),
            DomainRecord::new(2, "missing.test", "127.0.0.1", 9002, true),
            DomainRecord::new(3, "plain.test", "127.0.0.1", 9003, false),
        ]));
        RenewalScheduler::new(manager, SequentialRunner::spawn(), routes, challenges)
    }

    #[tokio::test]
    async fn test_sweep_only_touches_tls_domains_and_isolates_failures() {
        let store = Arc::new(ManagedCertificates::in_memory());
        let (cert, key) = self_signed_pem("valid.test");
        store
            .install(
                CertificateRecord::from_pem(DomainName::parse("valid.test").unwrap(), &cert, &key)
                    .unwrap(),
            )
            .unwrap();

        let summary = scheduler(store).sweep().await.unwrap();
        assert_eq!(
            summary,
            SweepSummary {
                checked: 2,
                renewed: 0,
                failed: 1
            }
        );
    }
}
