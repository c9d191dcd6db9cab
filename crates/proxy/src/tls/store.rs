//! Installed certificates

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::sign::CertifiedKey;
use switchyard_common::DomainName;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{CertificateRecord, TlsError};
use crate::acme::{CertificateStorage, StorageError};

/// Errors from installing a certificate
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Certificate(#[from] TlsError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A record together with its ready-to-use signing key
#[derive(Debug)]
pub struct InstalledCertificate {
    pub record: CertificateRecord,
    pub key: Arc<CertifiedKey>,
}

/// Retrieval and replacement of per-domain certificates
///
/// `get` runs on the handshake path and must not block; `install` replaces
/// a domain's certificate as a single visible step. `install` and `remove`
/// may block on disk.
pub trait CertificateStore: Send + Sync {
    fn get(&self, domain: &DomainName) -> Option<Arc<InstalledCertificate>>;

    fn install(&self, record: CertificateRecord) -> Result<Arc<InstalledCertificate>, StoreError>;

    /// Stop serving a domain's certificate and drop any persisted copy.
    /// Returns whether one was installed.
    fn remove(&self, domain: &DomainName) -> Result<bool, StoreError>;
}

type CertificateMap = HashMap<DomainName, Arc<InstalledCertificate>>;

/// In-memory certificate map, optionally persisted to disk
///
/// Readers load a snapshot of the whole map; each install publishes a new
/// map, so a handshake sees either the old certificate or the new one.
pub struct ManagedCertificates {
    installed: ArcSwap<CertificateMap>,
    storage: Option<Arc<CertificateStorage>>,
}

impl std::fmt::Debug for ManagedCertificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedCertificates")
            .field("installed", &self.installed.load().len())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

impl ManagedCertificates {
    /// Store that keeps certificates in memory only
    pub fn in_memory() -> Self {
        Self {
            installed: ArcSwap::from_pointee(HashMap::new()),
            storage: None,
        }
    }

    /// Store that writes every install through to `storage`
    pub fn with_storage(storage: Arc<CertificateStorage>) -> Self {
        Self {
            installed: ArcSwap::from_pointee(HashMap::new()),
            storage: Some(storage),
        }
    }

    /// Load every certificate found in storage.
    ///
    /// Unreadable entries are logged and skipped; they will be re-issued.
    pub fn load_from_storage(&self) -> Result<usize, StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };

        let mut loaded = HashMap::new();
        for name in storage.list_domains()? {
            let Ok(domain) = DomainName::parse(&name) else {
                warn!(entry = %name, "Ignoring storage entry that is not a domain name");
                continue;
            };

            let record = match storage.load_certificate(&domain) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Skipping unreadable stored certificate");
                    continue;
                }
            };

            match record.certified_key() {
                Ok(key) => {
                    debug!(domain = %domain, expires = %record.expires, "Loaded stored certificate");
                    loaded.insert(domain, Arc::new(InstalledCertificate { record, key }));
                }
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Skipping stored certificate with unusable key");
                }
            }
        }

        let count = loaded.len();
        self.installed.store(Arc::new(loaded));
        info!(count, "Loaded certificates from storage");
        Ok(count)
    }

    /// Domains with an installed certificate
    pub fn domains(&self) -> Vec<DomainName> {
        let mut domains: Vec<_> = self.installed.load().keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.installed.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.load().is_empty()
    }
}

impl CertificateStore for ManagedCertificates {
    fn get(&self, domain: &DomainName) -> Option<Arc<InstalledCertificate>> {
        self.installed.load().get(domain).cloned()
    }

    fn install(&self, record: CertificateRecord) -> Result<Arc<InstalledCertificate>, StoreError> {
        // Build the signing key before touching disk or the live map
        let key = record.certified_key()?;

        if let Some(storage) = &self.storage {
            storage.save_certificate(&record)?;
        }

        let domain = record.domain.clone();
        let installed = Arc::new(InstalledCertificate { record, key });

        self.installed.rcu(|current| {
            let mut next = CertificateMap::clone(current);
            next.insert(domain.clone(), Arc::clone(&installed));
            next
        });

        info!(
            domain = %domain,
            expires = %installed.record.expires,
            "Installed certificate"
        );

        Ok(installed)
    }

    fn remove(&self, domain: &DomainName) -> Result<bool, StoreError> {
        let mut was_installed = false;
        self.installed.rcu(|current| {
            was_installed = current.contains_key(domain);
            let mut next = CertificateMap::clone(current);
            next.remove(domain);
            next
        });

        if let Some(storage) = &self.storage {
            storage.delete_certificate(domain)?;
        }

        if was_installed {
            info!(domain = %domain, "Removed certificate");
        }
        Ok(was_installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::self_signed_pem;
    use tempfile::TempDir;

    fn record(name: &str) -> CertificateRecord {
        let (cert, key) = self_signed_pem(name);
        CertificateRecord::from_pem(DomainName::parse(name).unwrap(), &cert, &key).unwrap()
    }

    #[test]
    fn test_install_and_get() {
        let store = ManagedCertificates::in_memory();
        let domain = DomainName::parse("a.test").unwrap();
        assert!(store.get(&domain).is_none());

        store.install(record("a.test")).unwrap();

        let installed = store.get(&domain).unwrap();
        assert_eq!(installed.record.domain, domain);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_install_replaces_previous() {
        let store = ManagedCertificates::in_memory();
        let domain = DomainName::parse("a.test").unwrap();

        store.install(record("a.test")).unwrap();
        let first = store.get(&domain).unwrap();

        store.install(record("a.test")).unwrap();
        let second = store.get(&domain).unwrap();

        assert_ne!(first.record.leaf_pem, second.record.leaf_pem);
        assert_eq!(store.len(), 1);
        // Old snapshot still intact for whoever holds it
        assert!(first.record.leaf_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_bad_record_leaves_store_untouched() {
        let store = ManagedCertificates::in_memory();
        let domain = DomainName::parse("a.test").unwrap();
        store.install(record("a.test")).unwrap();
        let before = store.get(&domain).unwrap();

        let mut broken = record("a.test");
        broken.key_pem = "garbage".to_string();
        assert!(store.install(broken).is_err());

        let after = store.get(&domain).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_remove_drops_memory_and_disk() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(temp_dir.path()).unwrap());
        let store = ManagedCertificates::with_storage(Arc::clone(&storage));
        let gone = DomainName::parse("gone.test").unwrap();
        let kept = DomainName::parse("kept.test").unwrap();
        store.install(record("gone.test")).unwrap();
        store.install(record("kept.test")).unwrap();

        assert!(store.remove(&gone).unwrap());
        assert!(store.get(&gone).is_none());
        assert!(store.get(&kept).is_some());
        assert!(storage.load_certificate(&gone).unwrap().is_none());
        assert_eq!(storage.list_domains().unwrap(), vec!["kept.test"]);

        // Nothing left to remove
        assert!(!store.remove(&gone).unwrap());
    }

    #[test]
    fn test_persisted_certificates_reload() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(CertificateStorage::new(temp_dir.path()).unwrap());

        let store = ManagedCertificates::with_storage(Arc::clone(&storage));
        store.install(record("a.test")).unwrap();
        store.install(record("b.test")).unwrap();

        let reloaded = ManagedCertificates::with_storage(storage);
        assert_eq!(reloaded.load_from_storage().unwrap(), 2);
        assert_eq!(
            reloaded.domains(),
            vec![
                DomainName::parse("a.test").unwrap(),
                DomainName::parse("b.test").unwrap()
            ]
        );
    }
}
