//! Shared helpers for unit tests

use rcgen::{CertificateParams, KeyPair};

/// Fresh self-signed certificate for `domain`, as `(cert_pem, key_pem)`
pub fn self_signed_pem(domain: &str) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec![domain.to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    (cert.pem(), key.serialize_pem())
}
