//! SNI-based certificate selection

use std::sync::Arc;

use chrono::Utc;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use switchyard_common::DomainName;
use tracing::{debug, trace, warn};

use super::CertificateStore;
use crate::routing::RoutingHandle;

/// Receives "this domain needs a certificate" notifications from the
/// handshake path. Must return immediately.
pub trait IssuanceRequester: Send + Sync {
    fn request_issuance(&self, domain: &DomainName);
}

/// Picks the certificate for each TLS handshake by server name
pub struct SniResolver {
    store: Arc<dyn CertificateStore>,
    routes: RoutingHandle,
    issuer: Option<Arc<dyn IssuanceRequester>>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("issues_on_miss", &self.issuer.is_some())
            .finish()
    }
}

impl SniResolver {
    pub fn new(store: Arc<dyn CertificateStore>, routes: RoutingHandle) -> Self {
        Self {
            store,
            routes,
            issuer: None,
        }
    }

    /// Request issuance when a handshake arrives for a TLS domain with no
    /// usable certificate
    pub fn with_issuer(mut self, issuer: Arc<dyn IssuanceRequester>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Certificate to present for `server_name`
    ///
    /// `None` fails the handshake: no SNI, a name we hold nothing for, or an
    /// expired certificate.
    pub fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = server_name else {
            debug!("Rejecting TLS handshake without SNI");
            return None;
        };

        let Ok(domain) = DomainName::parse(name) else {
            debug!(server_name = %name, "Rejecting TLS handshake with malformed SNI");
            return None;
        };

        if let Some(installed) = self.store.get(&domain) {
            if !installed.record.is_expired_at(Utc::now()) {
                trace!(domain = %domain, "Resolved certificate");
                return Some(Arc::clone(&installed.key));
            }
            warn!(
                domain = %domain,
                expired = %installed.record.expires,
                "Installed certificate has expired"
            );
        }

        self.request_if_routable(&domain);
        None
    }

    fn request_if_routable(&self, domain: &DomainName) {
        let Some(issuer) = &self.issuer else {
            return;
        };

        match self.routes.lookup(domain.as_str()) {
            Some(route) if route.tls => {
                debug!(domain = %domain, "No usable certificate, requesting issuance");
                issuer.request_issuance(domain);
            }
            _ => {
                trace!(domain = %domain, "No certificate and no TLS route");
            }
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        SniResolver::resolve(self, client_hello.server_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DomainRecord;
    use crate::routing::RoutingTable;
    use crate::testutil::self_signed_pem;
    use crate::tls::{CertificateRecord, ManagedCertificates};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingIssuer {
        requested: Mutex<Vec<String>>,
    }

    impl IssuanceRequester for RecordingIssuer {
        fn request_issuance(&self, domain: &DomainName) {
            self.requested.lock().unwrap().push(domain.to_string());
        }
    }

    fn routes() -> RoutingHandle {
        RoutingHandle::new(RoutingTable::build(vec![
            DomainRecord::new(1, "a.test", "127.0.0.1", 9001, true),
            DomainRecord::new(2, "plain.test", "127.0.0.1", 9002, false),
            DomainRecord::new(3, "new.test", "127.0.0.1", 9003, true),
        ]))
    }

    fn store_with(name: &str) -> Arc<ManagedCertificates> {
        let store = Arc::new(ManagedCertificates::in_memory());
        let (cert, key) = self_signed_pem(name);
        let record =
            CertificateRecord::from_pem(DomainName::parse(name).unwrap(), &cert, &key).unwrap();
        store.install(record).unwrap();
        store
    }

    #[test]
    fn test_resolves_installed_certificate() {
        let resolver = SniResolver::new(store_with("a.test"), routes());
        assert!(resolver.resolve(Some("a.test")).is_some());
        assert!(resolver.resolve(Some("A.Test.")).is_some());
    }

    #[test]
    fn test_no_sni_fails() {
        let resolver = SniResolver::new(store_with("a.test"), routes());
        assert!(resolver.resolve(None).is_none());
    }

    #[test]
    fn test_unknown_name_gets_nothing() {
        let issuer = Arc::new(RecordingIssuer::default());
        let resolver = SniResolver::new(store_with("a.test"), routes()).with_issuer(issuer.clone());

        assert!(resolver.resolve(Some("other.test")).is_none());
        assert!(issuer.requested.lock().unwrap().is_empty());
    }

    #[test]
    fn test_miss_on_tls_route_requests_issuance() {
        let issuer = Arc::new(RecordingIssuer::default());
        let resolver = SniResolver::new(store_with("a.test"), routes()).with_issuer(issuer.clone());

        assert!(resolver.resolve(Some("new.test")).is_none());
        assert!(resolver.resolve(Some("plain.test")).is_none());

        assert_eq!(*issuer.requested.lock().unwrap(), vec!["new.test".to_string()]);
    }
}
