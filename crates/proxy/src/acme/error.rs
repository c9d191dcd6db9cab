//! ACME error types

use std::time::Duration;

use thiserror::Error;

use crate::tls::{StoreError, TlsError};

/// Errors from certificate storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored certificate for '{domain}' is unusable: {source}")]
    Corrupt {
        domain: String,
        #[source]
        source: TlsError,
    },
}

/// Errors from certificate issuance
///
/// Every variant is scoped to a single domain's issuance attempt; none of
/// them affect other domains or the listeners.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME configuration error: {0}")]
    Config(String),

    #[error("ACME account error: {0}")]
    Account(String),

    #[error("failed to create order: {0}")]
    OrderCreation(String),

    #[error("CA offered no HTTP-01 challenge for '{0}'")]
    NoHttpChallenge(String),

    #[error("validation failed for '{domain}': {reason}")]
    Validation { domain: String, reason: String },

    #[error("CA rate limit hit: {0}")]
    RateLimited(String),

    #[error("timed out after {after:?} waiting for '{domain}'")]
    Timeout { domain: String, after: Duration },

    #[error("failed to finalize order: {0}")]
    Finalize(String),

    #[error("ACME protocol error: {0}")]
    Protocol(String),

    #[error("issuance already in progress for '{0}'")]
    IssuanceInProgress(String),

    #[error("issued certificate rejected: {0}")]
    Certificate(#[from] TlsError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to install certificate: {0}")]
    Install(#[from] StoreError),
}

impl From<instant_acme::Error> for AcmeError {
    fn from(err: instant_acme::Error) -> Self {
        match &err {
            instant_acme::Error::Api(problem)
                if problem
                    .r#type
                    .as_deref()
                    .is_some_and(|t| t.ends_with(":rateLimited")) =>
            {
                AcmeError::RateLimited(err.to_string())
            }
            _ => AcmeError::Protocol(err.to_string()),
        }
    }
}
