//! Switchyard configuration.
//!
//! Configuration comes from the process environment (see [`env`]) and is
//! validated before any listener is bound. Every setting has a documented
//! default so an empty environment yields a runnable development setup
//! (Let's Encrypt staging, ports 8080/4433, local registry).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

pub mod env;

pub use env::EnvConfig;

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Token value used when the registry token is not configured
pub const UNSET_REGISTRY_TOKEN: &str = "token-not-set";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Environment(#[from] envy::Error),

    #[error("invalid bind address '{0}'")]
    BindAddress(String),

    #[error("invalid ACME directory '{0}': expected 'staging', 'production' or an https URL")]
    Directory(String),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

// ============================================================================
// Top-level configuration
// ============================================================================

/// Complete process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub listeners: ListenerConfig,

    #[validate(nested)]
    pub registry: RegistryConfig,

    #[validate(nested)]
    pub proxy: ProxyConfig,

    #[validate(nested)]
    pub acme: AcmeConfig,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        EnvConfig::from_env()?.try_into()
    }

    /// Validate all settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        <Self as Validate>::validate(self)?;
        Ok(())
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Plaintext and secure listener settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_distinct_ports"))]
pub struct ListenerConfig {
    /// Address both listeners bind to
    pub bind: IpAddr,

    /// Plaintext HTTP port (also answers ACME HTTP-01 challenges)
    #[validate(range(min = 1))]
    pub http_port: u16,

    /// TLS port
    #[validate(range(min = 1))]
    pub https_port: u16,

    /// Port clients reach the TLS listener on, when it differs from
    /// `https_port` (e.g. 443 forwarded to 4433). Used in redirects.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub public_https_port: Option<u16>,

    /// How long active connections may drain on shutdown
    pub drain_timeout_secs: u64,
}

impl ListenerConfig {
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.http_port)
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.https_port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: default_http_port(),
            https_port: default_https_port(),
            public_https_port: None,
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn validate_distinct_ports(config: &ListenerConfig) -> Result<(), ValidationError> {
    if config.http_port == config.https_port {
        return Err(ValidationError::new("listener_ports_must_differ"));
    }
    Ok(())
}

pub(crate) fn default_http_port() -> u16 {
    8080
}

pub(crate) fn default_https_port() -> u16 {
    4433
}

pub(crate) fn default_drain_timeout_secs() -> u64 {
    30
}

// ============================================================================
// Registry
// ============================================================================

/// Remote domain registry settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegistryConfig {
    /// Scheme and host, e.g. `http://127.0.0.1`
    #[validate(url)]
    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    /// Bearer token sent with every registry request
    pub token: String,

    /// Periodic refresh interval in seconds, 0 disables
    pub refresh_secs: u64,
}

impl RegistryConfig {
    /// Base URL the API paths are appended to
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty() && self.token != UNSET_REGISTRY_TOKEN
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_secs > 0).then(|| Duration::from_secs(self.refresh_secs))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: default_registry_host(),
            port: default_registry_port(),
            token: UNSET_REGISTRY_TOKEN.to_string(),
            refresh_secs: 0,
        }
    }
}

pub(crate) fn default_registry_host() -> String {
    "http://127.0.0.1".to_string()
}

pub(crate) fn default_registry_port() -> u16 {
    1337
}

// ============================================================================
// Proxy
// ============================================================================

/// Request forwarding settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProxyConfig {
    /// Upstream connect and response-head timeout in milliseconds
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    /// Redirect plaintext requests to HTTPS once a domain has a certificate
    pub redirect_to_https: bool,
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_proxy_timeout_ms(),
            redirect_to_https: true,
        }
    }
}

pub(crate) fn default_proxy_timeout_ms() -> u64 {
    600_000
}

// ============================================================================
// ACME
// ============================================================================

/// Which ACME directory certificates are requested from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcmeDirectory {
    #[default]
    Staging,
    Production,
    Custom(String),
}

impl AcmeDirectory {
    /// Pick the directory from an explicit setting, falling back to the
    /// deployment environment name (`production` selects the production CA).
    pub fn resolve(explicit: Option<&str>, deployment_env: Option<&str>) -> Result<Self, ConfigError> {
        match explicit {
            Some(value) => value.parse(),
            None if deployment_env.is_some_and(|e| e.eq_ignore_ascii_case("production")) => {
                Ok(Self::Production)
            }
            None => Ok(Self::Staging),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Staging => LETSENCRYPT_STAGING,
            Self::Production => LETSENCRYPT_PRODUCTION,
            Self::Custom(url) => url,
        }
    }

    pub fn is_staging(&self) -> bool {
        matches!(self, Self::Staging)
    }
}

impl FromStr for AcmeDirectory {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            _ => {
                let url = url::Url::parse(s.trim()).map_err(|_| ConfigError::Directory(s.to_string()))?;
                if !matches!(url.scheme(), "https" | "http") {
                    return Err(ConfigError::Directory(s.to_string()));
                }
                Ok(Self::Custom(url.to_string()))
            }
        }
    }
}

/// Certificate lifecycle policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AcmeConfig {
    /// Directory for account credentials and issued certificates
    pub storage_path: PathBuf,

    /// Contact address registered with the CA account
    #[validate(email)]
    pub contact_email: Option<String>,

    pub directory: AcmeDirectory,

    /// Renew once less than this fraction of the validity period remains
    #[validate(range(exclusive_min = 0.0, exclusive_max = 1.0))]
    pub renew_fraction: f64,

    /// Upper bound on waiting for the CA to validate a challenge
    #[validate(range(min = 1))]
    pub validation_timeout_secs: u64,

    /// Renewal sweep interval in seconds
    pub renewal_check_secs: u64,

    /// Wait after a failed issuance before the domain is tried again;
    /// doubles with each consecutive failure
    #[serde(default = "default_failure_backoff_secs")]
    #[validate(range(min = 1))]
    pub failure_backoff_secs: u64,
}

impl AcmeConfig {
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_secs)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_secs)
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            contact_email: None,
            directory: AcmeDirectory::default(),
            renew_fraction: default_renew_fraction(),
            validation_timeout_secs: default_validation_timeout_secs(),
            renewal_check_secs: default_renewal_check_secs(),
            failure_backoff_secs: default_failure_backoff_secs(),
        }
    }
}

pub(crate) fn default_storage_path() -> PathBuf {
    PathBuf::from("./ssl")
}

pub(crate) fn default_renew_fraction() -> f64 {
    0.2
}

pub(crate) fn default_validation_timeout_secs() -> u64 {
    120
}

pub(crate) fn default_renewal_check_secs() -> u64 {
    12 * 3600
}

pub(crate) fn default_failure_backoff_secs() -> u64 {
    5 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.listeners.http_port, 8080);
        assert_eq!(config.listeners.https_port, 4433);
        assert_eq!(config.proxy.timeout(), Duration::from_secs(600));
        assert!(config.acme.directory.is_staging());
    }

    #[test]
    fn test_same_ports_rejected() {
        let mut config = Config::default();
        config.listeners.https_port = config.listeners.http_port;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_public_https_port() {
        let mut config = Config::default();
        assert_eq!(config.listeners.public_https_port, None);

        config.listeners.public_https_port = Some(443);
        assert!(config.validate().is_ok());

        config.listeners.public_https_port = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = Config::default();
        config.listeners.http_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_renew_fraction_bounds() {
        let mut config = Config::default();
        config.acme.renew_fraction = 1.0;
        assert!(config.validate().is_err());

        config.acme.renew_fraction = 0.0;
        assert!(config.validate().is_err());

        config.acme.renew_fraction = 0.33;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_contact_email_rejected() {
        let mut config = Config::default();
        config.acme.contact_email = Some("not-an-email".to_string());
        assert!(config.validate().is_err());

        config.acme.contact_email = Some("ops@example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_base_url() {
        let registry = RegistryConfig {
            host: "https://cms.example.com/".to_string(),
            port: 443,
            ..Default::default()
        };
        assert_eq!(registry.base_url(), "https://cms.example.com:443");
        assert!(!registry.has_token());
        assert_eq!(registry.refresh_interval(), None);
    }

    #[test]
    fn test_directory_resolution() {
        assert_eq!(AcmeDirectory::resolve(None, None).unwrap(), AcmeDirectory::Staging);
        assert_eq!(
            AcmeDirectory::resolve(None, Some("production")).unwrap(),
            AcmeDirectory::Production
        );
        assert_eq!(
            AcmeDirectory::resolve(Some("staging"), Some("production")).unwrap(),
            AcmeDirectory::Staging
        );

        let custom = AcmeDirectory::resolve(Some("https://ca.internal/directory"), None).unwrap();
        assert_eq!(custom.url(), "https://ca.internal/directory");

        assert!(AcmeDirectory::resolve(Some("ftp://nope"), None).is_err());
        assert!(AcmeDirectory::resolve(Some("nonsense"), None).is_err());
    }
}
