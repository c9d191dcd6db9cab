//! TLS termination with per-domain certificates
//!
//! - [`CertificateRecord`]: parsed key + chain + validity for one domain
//! - [`CertificateStore`] / [`ManagedCertificates`]: installed certificates,
//!   swapped atomically and persisted through ACME storage
//! - [`SniResolver`]: picks the certificate for each handshake from the
//!   ClientHello server name, refusing the handshake when there is none
//!
//! There is deliberately no default certificate. A client asking for a name
//! we hold no certificate for gets a failed handshake, never someone else's
//! certificate.

use std::sync::Arc;

use rustls::ServerConfig;
use thiserror::Error;

mod certificate;
mod sni;
mod store;

pub use certificate::CertificateRecord;
pub use sni::{IssuanceRequester, SniResolver};
pub use store::{CertificateStore, InstalledCertificate, ManagedCertificates, StoreError};

/// Error type for TLS operations
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load certificate: {0}")]
    CertificateLoad(String),

    #[error("failed to load private key: {0}")]
    KeyLoad(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("failed to build TLS config: {0}")]
    ConfigBuild(String),
}

/// Build the server configuration for the secure listener
pub fn build_server_config(resolver: Arc<SniResolver>) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::ConfigBuild(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
