//! Registry refresh
//!
//! Re-fetches the domain registry, swaps in a new routing table, and queues
//! issuance for TLS domains that need it. Domains that no longer need a
//! certificate are retired from the lifecycle manager. A failed fetch
//! leaves the current table in service.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::acme::IssuanceQueue;
use crate::registry::{DomainSource, RegistryError};
use crate::routing::{RoutingHandle, RoutingTable};

/// What changed in one refresh
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub routes: usize,
    pub added: usize,
    pub removed: usize,
    pub queued_for_issuance: usize,
    /// Former TLS domains whose certificate state was dropped
    pub retired: usize,
}

/// Rebuilds the routing table from the registry on demand
#[derive(Clone)]
pub struct RegistryRefresher {
    source: Arc<dyn DomainSource>,
    routes: RoutingHandle,
    issuance: Option<IssuanceQueue>,
}

impl std::fmt::Debug for RegistryRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryRefresher")
            .field("queues_issuance", &self.issuance.is_some())
            .finish()
    }
}

impl RegistryRefresher {
    pub fn new(source: Arc<dyn DomainSource>, routes: RoutingHandle) -> Self {
        Self {
            source,
            routes,
            issuance: None,
        }
    }

    /// Queue issuance for TLS domains after each refresh
    pub fn with_issuance(mut self, issuance: IssuanceQueue) -> Self {
        self.issuance = Some(issuance);
        self
    }

    /// Fetch, rebuild and publish the routing table
    pub async fn refresh(&self) -> Result<RefreshSummary, RegistryError> {
        let records = self.source.fetch_domains().await?;
        let table = RoutingTable::build(records);

        let previous = self.routes.load();
        let added = table
            .domains()
            .filter(|d| previous.lookup(d.as_str()).is_none())
            .count();
        let removed = previous
            .domains()
            .filter(|d| table.lookup(d.as_str()).is_none())
            .count();
        let tls_domains = table.tls_domains();
        let dropped_tls: Vec<_> = previous
            .tls_domains()
            .into_iter()
            .filter(|d| !tls_domains.contains(d))
            .collect();

        let mut summary = RefreshSummary {
            routes: table.len(),
            added,
            removed,
            ..RefreshSummary::default()
        };

        self.routes.replace(table);

        if let Some(issuance) = &self.issuance {
            for domain in &dropped_tls {
                match issuance.manager().retire(domain).await {
                    Ok(_) => summary.retired += 1,
                    Err(e) => warn!(domain = %domain, error = %e, "Could not retire domain"),
                }
            }

            summary.queued_for_issuance = tls_domains
                .iter()
                .filter(|d| issuance.enqueue_if_needed(d))
                .count();
        }

        info!(
            routes = summary.routes,
            added = summary.added,
            removed = summary.removed,
            queued_for_issuance = summary.queued_for_issuance,
            retired = summary.retired,
            "Registry refreshed"
        );
        Ok(summary)
    }

    /// Refresh every `period` until `shutdown` flips to true
    pub async fn run_periodic(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = period.as_secs(), "Starting periodic registry refresh");

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running periodic registry refresh");
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Registry refresh failed, keeping current routing table");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Periodic registry refresh stopped");
    }
}
