//! Certificate records
//!
//! A [`CertificateRecord`] is the unit the lifecycle manager installs: key,
//! leaf, chain and the validity window read from the leaf itself. Records
//! are only ever constructed from PEM that parses completely, so anything
//! that reaches the store can be turned into a rustls `CertifiedKey`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use switchyard_common::DomainName;

use super::TlsError;

const PEM_CERT_END: &str = "-----END CERTIFICATE-----";

/// Key, certificate chain and validity window for one domain
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub domain: DomainName,
    pub key_pem: String,
    pub leaf_pem: String,
    /// Intermediates, possibly empty
    pub chain_pem: String,
    /// Leaf `notBefore`
    pub issued: DateTime<Utc>,
    /// Leaf `notAfter`
    pub expires: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build a record from a PEM chain (leaf first) and a PEM private key.
    pub fn from_pem(domain: DomainName, cert_chain_pem: &str, key_pem: &str) -> Result<Self, TlsError> {
        let certs = parse_certs(cert_chain_pem)?;
        let (issued, expires) = validity(&certs[0])?;

        // A key that does not parse or does not belong to the leaf never
        // reaches the store
        signing_pair(&domain, certs, key_pem)?;

        let end = cert_chain_pem
            .find(PEM_CERT_END)
            .map(|i| i + PEM_CERT_END.len())
            .ok_or_else(|| TlsError::CertificateLoad("no PEM certificate block".to_string()))?;
        let leaf_pem = format!("{}\n", cert_chain_pem[..end].trim());
        let rest = cert_chain_pem[end..].trim();
        let chain_pem = if rest.is_empty() {
            String::new()
        } else {
            format!("{rest}\n")
        };

        Ok(Self {
            domain,
            key_pem: key_pem.to_string(),
            leaf_pem,
            chain_pem,
            issued,
            expires,
        })
    }

    /// Leaf followed by intermediates
    pub fn full_chain_pem(&self) -> String {
        format!("{}{}", self.leaf_pem, self.chain_pem)
    }

    /// Signing key and chain ready for the TLS handshake
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>, TlsError> {
        let certs = parse_certs(&self.full_chain_pem())?;
        signing_pair(&self.domain, certs, &self.key_pem).map(Arc::new)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    /// Fraction of the validity period still ahead of `now`, clamped to [0, 1]
    pub fn remaining_fraction_at(&self, now: DateTime<Utc>) -> f64 {
        let lifetime = (self.expires - self.issued).num_seconds();
        if lifetime <= 0 {
            return 0.0;
        }
        let remaining = (self.expires - now).num_seconds();
        (remaining as f64 / lifetime as f64).clamp(0.0, 1.0)
    }

    /// Whether the record is inside its renewal window
    ///
    /// True once less than `renew_fraction` of the lifetime remains (90-day
    /// certificates with 0.2 renew at day 72), and always once expired.
    pub fn needs_renewal_at(&self, now: DateTime<Utc>, renew_fraction: f64) -> bool {
        self.is_expired_at(now) || self.remaining_fraction_at(now) < renew_fraction
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad(
            "no certificates found in PEM".to_string(),
        ));
    }
    Ok(certs)
}

/// Load the private key and pair it with the chain, rejecting a key that
/// does not match the leaf's public key
fn signing_pair(
    domain: &DomainName,
    certs: Vec<CertificateDer<'static>>,
    key_pem: &str,
) -> Result<CertifiedKey, TlsError> {
    let key = parse_key(key_pem)?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| TlsError::KeyLoad(format!("{domain}: {e}")))?;

    let certified = CertifiedKey::new(certs, signing_key);
    match certified.keys_match() {
        Ok(()) => Ok(certified),
        // The key type cannot report its public half; nothing to compare
        Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => Ok(certified),
        Err(e) => Err(TlsError::InvalidCertificate(format!(
            "{domain}: private key does not match certificate ({e})"
        ))),
    }
}

fn parse_key(pem: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| TlsError::KeyLoad(e.to_string()))?
        .ok_or_else(|| TlsError::KeyLoad("no private key found in PEM".to_string()))
}

fn validity(leaf: &CertificateDer<'_>) -> Result<(DateTime<Utc>, DateTime<Utc>), TlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();

    let issued = DateTime::from_timestamp(not_before, 0)
        .ok_or_else(|| TlsError::InvalidCertificate("notBefore out of range".to_string()))?;
    let expires = DateTime::from_timestamp(not_after, 0)
        .ok_or_else(|| TlsError::InvalidCertificate("notAfter out of range".to_string()))?;

    Ok((issued, expires))
}
