//! Host-based routing table
//!
//! Maps a normalized host name to the upstream that serves it. A table is
//! immutable once built; refreshes build a new table and publish it through
//! [`RoutingHandle`], so readers on the request path never block and never
//! observe a half-built table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use switchyard_common::{normalize_host, DomainId, DomainName};
use tracing::{debug, info, warn};

use crate::registry::DomainRecord;

/// Upstream address a domain forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    /// `host:port` form used for connecting
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// A routable domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: DomainId,
    pub domain: DomainName,
    pub upstream: Upstream,
    pub tls: bool,
}

/// Immutable host -> route mapping
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: HashMap<DomainName, Arc<Route>>,
    /// Insertion order, for deterministic iteration
    order: Vec<DomainName>,
}

impl RoutingTable {
    /// Build a table from registry records.
    ///
    /// Records with an empty or malformed domain name, an empty upstream host,
    /// or port 0 are logged and skipped. When two records share a name
    /// (case-insensitively), the first one wins.
    pub fn build<I>(records: I) -> Self
    where
        I: IntoIterator<Item = DomainRecord>,
    {
        let mut table = Self::default();

        for record in records {
            let domain = match DomainName::parse(&record.domain_name) {
                Ok(domain) => domain,
                Err(e) => {
                    warn!(
                        id = %record.id,
                        domain = %record.domain_name,
                        error = %e,
                        "Skipping registry record with unusable domain name"
                    );
                    continue;
                }
            };

            if record.forward_host.trim().is_empty() || record.forward_port == 0 {
                warn!(
                    id = %record.id,
                    domain = %domain,
                    forward_host = %record.forward_host,
                    forward_port = record.forward_port,
                    "Skipping registry record without a usable upstream"
                );
                continue;
            }

            if table.routes.contains_key(&domain) {
                warn!(
                    id = %record.id,
                    domain = %domain,
                    "Skipping duplicate registry record, first occurrence wins"
                );
                continue;
            }

            let route = Route {
                id: record.id,
                domain: domain.clone(),
                upstream: Upstream {
                    host: record.forward_host.trim().to_string(),
                    port: record.forward_port,
                },
                tls: record.use_ssl,
            };

            debug!(
                domain = %route.domain,
                upstream = %route.upstream,
                tls = route.tls,
                "Registered route"
            );

            table.order.push(domain.clone());
            table.routes.insert(domain, Arc::new(route));
        }

        info!(
            route_count = table.routes.len(),
            tls_count = table.tls_routes().count(),
            "Routing table built"
        );

        table
    }

    /// Look up the route for a Host header or SNI value.
    ///
    /// Case-insensitive; a `:port` suffix is ignored.
    pub fn lookup(&self, host: &str) -> Option<Arc<Route>> {
        let key = normalize_host(host)?;
        let domain = DomainName::parse(&key).ok()?;
        self.routes.get(&domain).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All routes in registry order
    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.order.iter().filter_map(|d| self.routes.get(d))
    }

    /// Domain names in registry order
    pub fn domains(&self) -> impl Iterator<Item = &DomainName> {
        self.order.iter()
    }

    /// Routes with TLS enabled, in registry order
    pub fn tls_routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes().filter(|r| r.tls)
    }

    /// Domains with TLS enabled, in registry order
    pub fn tls_domains(&self) -> Vec<DomainName> {
        self.tls_routes().map(|r| r.domain.clone()).collect()
    }
}

/// Shared, atomically replaceable routing table
#[derive(Debug, Clone)]
pub struct RoutingHandle {
    current: Arc<ArcSwap<RoutingTable>>,
}

impl RoutingHandle {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    /// Snapshot of the current table
    pub fn load(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    /// Look up a host in the current table
    pub fn lookup(&self, host: &str) -> Option<Arc<Route>> {
        self.current.load().lookup(host)
    }

    /// Publish a new table; in-flight readers keep their snapshot
    pub fn replace(&self, table: RoutingTable) {
        let route_count = table.len();
        self.current.store(Arc::new(table));
        info!(route_count, "Routing table replaced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(id: u64, name: &str, port: u16, tls: bool) -> DomainRecord {
        DomainRecord::new(id, name, "10.0.0.1", port, tls)
    }

    #[test]
    fn test_lookup_case_and_port_insensitive() {
        let table = RoutingTable::build(vec![record(1, "Example.com", 3000, false)]);

        let route = table.lookup("example.com").unwrap();
        assert_eq!(route.upstream.authority(), "10.0.0.1:3000");

        assert!(table.lookup("EXAMPLE.COM").is_some());
        assert!(table.lookup("example.com:8080").is_some());
        assert!(table.lookup("example.com.").is_some());
        assert!(table.lookup("other.com").is_none());
        assert!(table.lookup("").is_none());
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let table = RoutingTable::build(vec![
            record(1, "a.test", 3000, false),
            record(2, "A.TEST", 4000, true),
        ]);

        assert_eq!(table.len(), 1);
        let route = table.lookup("a.test").unwrap();
        assert_eq!(route.id, DomainId::new(1));
        assert_eq!(route.upstream.port, 3000);
        assert!(!route.tls);
    }

    #[test]
    fn test_invalid_records_dropped() {
        let table = RoutingTable::build(vec![
            record(1, "", 3000, false),
            record(2, "b.test", 0, false),
            DomainRecord::new(3, "c.test", " ", 3000, false),
            record(4, "d.test", 3000, false),
        ]);

        assert_eq!(table.len(), 1);
        assert!(table.lookup("d.test").is_some());
    }

    #[test]
    fn test_tls_domains_in_order() {
        let table = RoutingTable::build(vec![
            record(1, "z.test", 1, true),
            record(2, "a.test", 1, false),
            record(3, "m.test", 1, true),
        ]);

        let domains: Vec<_> = table.tls_domains().into_iter().map(|d| d.into_string()).collect();
        assert_eq!(domains, vec!["z.test", "m.test"]);
    }

    #[test]
    fn test_ipv6_upstream_authority() {
        let upstream = Upstream {
            host: "::1".to_string(),
            port: 8080,
        };
        assert_eq!(upstream.authority(), "[::1]:8080");
    }

    #[test]
    fn test_handle_replace_is_visible() {
        let handle = RoutingHandle::new(RoutingTable::build(vec![record(1, "a.test", 1, false)]));
        let before = handle.load();

        handle.replace(RoutingTable::build(vec![record(2, "b.test", 1, false)]));

        assert!(handle.lookup("a.test").is_none());
        assert!(handle.lookup("b.test").is_some());
        // Earlier snapshot is unaffected
        assert!(before.lookup("a.test").is_some());
    }

    proptest! {
        #[test]
        fn prop_lookup_finds_every_present_name(
            names in proptest::collection::hash_set("[a-z]{1,12}\\.(test|com|org)", 1..20),
            absent in "[a-z]{13,16}\\.net",
            port in 1u16..=u16::MAX,
        ) {
            let records: Vec<_> = names
                .iter()
                .enumerate()
                .map(|(i, n)| record(i as u64, n, (i as u16 % 1000) + 1, false))
                .collect();
            let table = RoutingTable::build(records.clone());

            prop_assert_eq!(table.len(), names.len());
            for rec in &records {
                let with_port = format!("{}:{}", rec.domain_name.to_uppercase(), port);
                let route = table.lookup(&with_port);
                prop_assert!(route.is_some());
                prop_assert_eq!(route.unwrap().upstream.port, rec.forward_port);
            }
            prop_assert!(table.lookup(&absent).is_none());
        }
    }
}
