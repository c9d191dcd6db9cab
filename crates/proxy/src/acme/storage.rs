//! Certificate and account storage for ACME
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── credentials.json      # ACME account credentials (opaque, serialized)
//! └── domains/
//!     └── example.com/
//!         ├── cert.pem      # Leaf followed by intermediates
//!         ├── key.pem       # Private key
//!         └── meta.json     # Validity window and when it was stored
//! ```
//!
//! Credentials are written to a temporary sibling and renamed into place.
//! A domain's files are written together into `domains/.<name>.staging/`
//! and the directory is swapped in, so `key.pem` and `cert.pem` always come
//! from the same save. The previous directory is parked as `.<name>.old`
//! during the swap; [`CertificateStorage::new`] puts it back if a crash
//! left the domain without one. `meta.json` is informational: validity is
//! always re-read from the certificate.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_common::DomainName;
use tracing::{debug, info, trace, warn};

use super::error::StorageError;
use crate::tls::CertificateRecord;

const CREDENTIALS_FILE: &str = "credentials.json";
const DOMAINS_DIR: &str = "domains";
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const META_FILE: &str = "meta.json";
const STAGING_SUFFIX: &str = ".staging";
const PARKED_SUFFIX: &str = ".old";

/// Metadata stored alongside each certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    /// When this copy was written
    pub stored: DateTime<Utc>,
}

/// Filesystem storage for account credentials and issued certificates
#[derive(Debug)]
pub struct CertificateStorage {
    base_path: PathBuf,
}

impl CertificateStorage {
    /// Open storage at `base_path`, creating it with owner-only permissions
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let domains_path = base_path.join(DOMAINS_DIR);
        fs::create_dir_all(&domains_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone())?;
            fs::set_permissions(&domains_path, perms)?;
        }

        recover_interrupted_saves(&domains_path)?;

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Load raw credentials JSON (for instant_acme::AccountCredentials)
    pub fn load_credentials_json(&self) -> Result<Option<String>, StorageError> {
        let creds_path = self.base_path.join(CREDENTIALS_FILE);

        if !creds_path.exists() {
            trace!("No stored ACME credentials found");
            return Ok(None);
        }

        let content = fs::read_to_string(&creds_path)?;
        debug!("Loaded ACME credentials JSON");
        Ok(Some(content))
    }

    /// Save raw credentials JSON (for instant_acme::AccountCredentials)
    pub fn save_credentials_json(&self, json: &str) -> Result<(), StorageError> {
        let creds_path = self.base_path.join(CREDENTIALS_FILE);
        write_atomic(&creds_path, json.as_bytes(), true)?;
        info!("Saved ACME credentials JSON");
        Ok(())
    }

    // =========================================================================
    // Certificate Operations
    // =========================================================================

    fn domain_path(&self, domain: &DomainName) -> PathBuf {
        self.base_path.join(DOMAINS_DIR).join(domain.as_str())
    }

    /// Load the stored certificate for a domain
    ///
    /// `Ok(None)` when nothing is stored; [`StorageError::Corrupt`] when the
    /// files exist but do not form a usable certificate.
    pub fn load_certificate(
        &self,
        domain: &DomainName,
    ) -> Result<Option<CertificateRecord>, StorageError> {
        let domain_path = self.domain_path(domain);
        let cert_path = domain_path.join(CERT_FILE);
        let key_path = domain_path.join(KEY_FILE);

        if !cert_path.exists() || !key_path.exists() {
            trace!(domain = %domain, "No stored certificate found");
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;

        let record = CertificateRecord::from_pem(domain.clone(), &cert_pem, &key_pem).map_err(
            |source| StorageError::Corrupt {
                domain: domain.to_string(),
                source,
            },
        )?;

        debug!(
            domain = %domain,
            expires = %record.expires,
            "Loaded stored certificate"
        );
        Ok(Some(record))
    }

    /// Persist a certificate, replacing any previous one for the domain
    ///
    /// Either the whole new record is in place afterwards or the previous
    /// one is left untouched.
    pub fn save_certificate(&self, record: &CertificateRecord) -> Result<(), StorageError> {
        let domains_path = self.base_path.join(DOMAINS_DIR);
        let name = record.domain.as_str();
        let domain_path = domains_path.join(name);
        let staging = domains_path.join(format!(".{name}{STAGING_SUFFIX}"));
        let parked = domains_path.join(format!(".{name}{PARKED_SUFFIX}"));

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        if let Err(e) = stage_record(&staging, record) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if parked.exists() {
            fs::remove_dir_all(&parked)?;
        }
        let had_previous = domain_path.exists();
        if had_previous {
            fs::rename(&domain_path, &parked)?;
        }
        if let Err(e) = fs::rename(&staging, &domain_path) {
            if had_previous {
                let _ = fs::rename(&parked, &domain_path);
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        if had_previous {
            if let Err(e) = fs::remove_dir_all(&parked) {
                warn!(domain = %record.domain, error = %e, "Could not remove replaced certificate");
            }
        }

        info!(
            domain = %record.domain,
            expires = %record.expires,
            "Saved certificate to storage"
        );
        Ok(())
    }

    /// Names of all domain directories in storage
    pub fn list_domains(&self) -> Result<Vec<String>, StorageError> {
        let domains_path = self.base_path.join(DOMAINS_DIR);

        if !domains_path.exists() {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        for entry in fs::read_dir(&domains_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    domains.push(name.to_string());
                }
            }
        }

        domains.sort();
        Ok(domains)
    }

    /// Delete the stored certificate for a domain
    ///
    /// Returns whether anything was stored.
    pub fn delete_certificate(&self, domain: &DomainName) -> Result<bool, StorageError> {
        let domain_path = self.domain_path(domain);

        if !domain_path.exists() {
            trace!(domain = %domain, "No stored certificate to delete");
            return Ok(false);
        }

        fs::remove_dir_all(&domain_path)?;
        info!(domain = %domain, "Deleted stored certificate");
        Ok(true)
    }
}

/// Undo what a crash in the middle of [`CertificateStorage::save_certificate`]
/// left behind
fn recover_interrupted_saves(domains_path: &Path) -> Result<(), StorageError> {
    for entry in fs::read_dir(domains_path)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(hidden) = name.strip_prefix('.') else {
            continue;
        };

        if hidden.ends_with(STAGING_SUFFIX) {
            fs::remove_dir_all(entry.path())?;
            debug!(path = %entry.path().display(), "Removed unfinished certificate save");
        } else if let Some(domain) = hidden.strip_suffix(PARKED_SUFFIX) {
            let live = domains_path.join(domain);
            if live.exists() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::rename(entry.path(), &live)?;
                warn!(domain, "Restored previous certificate after an interrupted save");
            }
        }
    }
    Ok(())
}

/// Write every file of `record` into `dir`
fn stage_record(dir: &Path, record: &CertificateRecord) -> Result<(), StorageError> {
    write_private(&dir.join(KEY_FILE), record.key_pem.as_bytes())?;
    fs::write(dir.join(CERT_FILE), record.full_chain_pem())?;

    let meta = CertificateMeta {
        issued: record.issued,
        expires: record.expires,
        stored: Utc::now(),
    };
    fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
    Ok(())
}

/// Write a file only the owner can read
fn write_private(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Write `contents` to a temporary sibling of `path`, then rename over it
fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), StorageError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if private {
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    fs::rename(&tmp_path, path)?;
    Ok(())
}
