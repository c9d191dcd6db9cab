//! Domain registry client
//!
//! Fetches the list of registered domains and their upstream targets from
//! the remote configuration service. The registry is read-only from the
//! proxy's point of view and nothing fetched here is persisted; every
//! refresh re-reads the full set.
//!
//! Wire format (`GET /api/domains`):
//!
//! ```json
//! { "data": [ { "id": 1, "attributes": {
//!     "domainName": "a.test", "forwardHost": "10.0.0.1",
//!     "forwardPort": 3000, "useSSL": false } } ] }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use switchyard_common::DomainId;
use switchyard_config::RegistryConfig;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Path of the domain collection on the registry
pub const DOMAINS_PATH: &str = "/api/domains";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to build registry client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("registry request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("registry rejected credentials ({status}) at {url}")]
    Unauthorized { url: String, status: u16 },

    #[error("registry returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("failed to decode registry response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One domain entry as published by the registry
///
/// Fields are kept raw; the routing table decides which entries are usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub id: DomainId,
    pub domain_name: String,
    pub forward_host: String,
    pub forward_port: u16,
    pub use_ssl: bool,
}

impl DomainRecord {
    pub fn new(
        id: u64,
        domain_name: impl Into<String>,
        forward_host: impl Into<String>,
        forward_port: u16,
        use_ssl: bool,
    ) -> Self {
        Self {
            id: DomainId::new(id),
            domain_name: domain_name.into(),
            forward_host: forward_host.into(),
            forward_port,
            use_ssl,
        }
    }
}

/// Source of domain records
///
/// Implemented by [`RegistryClient`]; tests and embedders can provide a
/// static list instead.
#[async_trait]
pub trait DomainSource: Send + Sync {
    async fn fetch_domains(&self) -> Result<Vec<DomainRecord>, RegistryError>;
}

#[async_trait]
impl DomainSource for Vec<DomainRecord> {
    async fn fetch_domains(&self) -> Result<Vec<DomainRecord>, RegistryError> {
        Ok(self.clone())
    }
}

#[derive(Debug, Deserialize)]
struct DomainsResponse {
    #[serde(default)]
    data: Vec<DomainEntry>,
}

#[derive(Debug, Deserialize)]
struct DomainEntry {
    id: u64,
    attributes: DomainAttributes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DomainAttributes {
    #[serde(default)]
    domain_name: Option<String>,
    #[serde(default)]
    forward_host: Option<String>,
    #[serde(default)]
    forward_port: Option<u16>,
    #[serde(default, rename = "useSSL")]
    use_ssl: Option<bool>,
}

impl From<DomainEntry> for DomainRecord {
    fn from(entry: DomainEntry) -> Self {
        let attrs = entry.attributes;
        Self {
            id: DomainId::new(entry.id),
            domain_name: attrs.domain_name.unwrap_or_default(),
            forward_host: attrs.forward_host.unwrap_or_default(),
            forward_port: attrs.forward_port.unwrap_or_default(),
            use_ssl: attrs.use_ssl.unwrap_or(false),
        }
    }
}

/// Parse a registry response body
pub fn parse_domains(body: &str) -> Result<Vec<DomainRecord>, RegistryError> {
    let response: DomainsResponse = serde_json::from_str(body)?;
    Ok(response.data.into_iter().map(DomainRecord::from).collect())
}

/// HTTP client for the remote domain registry
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(RegistryError::Client)?;

        if !config.has_token() {
            warn!("Registry token not configured");
        }

        Ok(Self {
            http,
            base_url: config.base_url(),
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Authenticated GET returning the raw body
    async fn get(&self, path: &str) -> Result<String, RegistryError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Registry request");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RegistryError::Unauthorized {
                url,
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(RegistryError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|source| RegistryError::Request { url, source })
    }
}

#[async_trait]
impl DomainSource for RegistryClient {
    async fn fetch_domains(&self) -> Result<Vec<DomainRecord>, RegistryError> {
        let body = self.get(DOMAINS_PATH).await?;
        let records = parse_domains(&body)?;

        info!(
            registry = %self.base_url,
            domain_count = records.len(),
            "Fetched domains from registry"
        );

        Ok(records)
    }
}
