//! Environment variable loading.
//!
//! Variable names match the deployment's existing `.env` files
//! (`ROUTER_PORT`, `CMS_API_TOKEN`, `SSL_PATH`, ...), so the flat
//! [`EnvConfig`] is deserialized first and then folded into the nested
//! [`Config`].

use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::{trace, warn};

use crate::*;

/// Flat view of the environment, one field per variable
#[derive(Debug, Clone, Deserialize)]
pub struct EnvConfig {
    #[serde(default = "default_http_port")]
    pub router_port: u16,

    #[serde(default = "default_https_port")]
    pub router_port_secure: u16,

    /// Externally visible TLS port, when a port forward sits in front
    #[serde(default)]
    pub router_public_port_secure: Option<u16>,

    #[serde(default = "default_bind")]
    pub router_bind: String,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_registry_host")]
    pub cms_api_host: String,

    #[serde(default = "default_registry_port")]
    pub cms_api_port: u16,

    #[serde(default = "default_token")]
    pub cms_api_token: String,

    #[serde(default)]
    pub registry_refresh_secs: u64,

    /// Milliseconds
    #[serde(default = "default_proxy_timeout_ms")]
    pub proxy_timeout: u64,

    #[serde(default = "default_true")]
    pub redirect_to_https: bool,

    #[serde(default)]
    pub ssl_path: Option<PathBuf>,

    #[serde(default)]
    pub ssl_email: Option<String>,

    #[serde(default)]
    pub acme_directory: Option<String>,

    #[serde(default)]
    pub node_env: Option<String>,

    #[serde(default = "default_renew_fraction")]
    pub acme_renew_fraction: f64,

    #[serde(default = "default_validation_timeout_secs")]
    pub acme_validation_timeout_secs: u64,

    #[serde(default = "default_renewal_check_secs")]
    pub acme_renewal_check_secs: u64,

    #[serde(default = "default_failure_backoff_secs")]
    pub acme_failure_backoff_secs: u64,
}

impl EnvConfig {
    /// Read from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(envy::from_env::<Self>()?)
    }

    /// Read from an explicit set of variables
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::from_iter::<_, Self>(vars)?)
    }
}

impl TryFrom<EnvConfig> for Config {
    type Error = ConfigError;

    fn try_from(env: EnvConfig) -> Result<Self, Self::Error> {
        let bind: IpAddr = env
            .router_bind
            .parse()
            .map_err(|_| ConfigError::BindAddress(env.router_bind.clone()))?;

        let directory =
            AcmeDirectory::resolve(env.acme_directory.as_deref(), env.node_env.as_deref())?;

        if env.cms_api_token.is_empty() || env.cms_api_token == UNSET_REGISTRY_TOKEN {
            warn!("CMS_API_TOKEN is not set, registry requests will likely be rejected");
        }

        let config = Config {
            listeners: ListenerConfig {
                bind,
                http_port: env.router_port,
                https_port: env.router_port_secure,
                public_https_port: env.router_public_port_secure,
                drain_timeout_secs: env.drain_timeout_secs,
            },
            registry: RegistryConfig {
                host: env.cms_api_host,
                port: env.cms_api_port,
                token: env.cms_api_token,
                refresh_secs: env.registry_refresh_secs,
            },
            proxy: ProxyConfig {
                timeout_ms: env.proxy_timeout,
                redirect_to_https: env.redirect_to_https,
            },
            acme: AcmeConfig {
                storage_path: env.ssl_path.unwrap_or_else(default_storage_path),
                contact_email: env.ssl_email.filter(|e| !e.trim().is_empty()),
                directory,
                renew_fraction: env.acme_renew_fraction,
                validation_timeout_secs: env.acme_validation_timeout_secs,
                renewal_check_secs: env.acme_renewal_check_secs,
                failure_backoff_secs: env.acme_failure_backoff_secs,
            },
        };

        trace!(
            http = %config.listeners.http_addr(),
            https = %config.listeners.https_addr(),
            directory = %config.acme.directory.url(),
            "Loaded configuration from environment"
        );

        Ok(config)
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_token() -> String {
    UNSET_REGISTRY_TOKEN.to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let env = EnvConfig::from_vars(Vec::new()).unwrap();
        let config = Config::try_from(env).unwrap();

        assert_eq!(config.listeners.http_port, 8080);
        assert_eq!(config.listeners.https_port, 4433);
        assert_eq!(config.registry.base_url(), "http://127.0.0.1:1337");
        assert_eq!(config.proxy.timeout_ms, 600_000);
        assert_eq!(config.acme.storage_path, PathBuf::from("./ssl"));
        assert!(config.acme.directory.is_staging());
        assert!(config.proxy.redirect_to_https);
        assert_eq!(config.acme.failure_backoff_secs, 300);
        config.validate().unwrap();
    }

    #[test]
    fn test_environment_overrides() {
        let env = EnvConfig::from_vars(vars(&[
            ("ROUTER_PORT", "80"),
            ("ROUTER_PORT_SECURE", "443"),
            ("CMS_API_HOST", "https://cms.example.com"),
            ("CMS_API_PORT", "8443"),
            ("CMS_API_TOKEN", "secret"),
            ("PROXY_TIMEOUT", "5000"),
            ("SSL_PATH", "/var/lib/switchyard"),
            ("SSL_EMAIL", "ops@example.com"),
            ("NODE_ENV", "production"),
            ("REDIRECT_TO_HTTPS", "false"),
            ("ACME_FAILURE_BACKOFF_SECS", "60"),
        ]))
        .unwrap();
        let config = Config::try_from(env).unwrap();

        assert_eq!(config.listeners.http_port, 80);
        assert_eq!(config.listeners.https_port, 443);
        assert_eq!(config.registry.base_url(), "https://cms.example.com:8443");
        assert!(config.registry.has_token());
        assert_eq!(config.proxy.timeout_ms, 5000);
        assert!(!config.proxy.redirect_to_https);
        assert_eq!(config.acme.storage_path, PathBuf::from("/var/lib/switchyard"));
        assert_eq!(config.acme.contact_email.as_deref(), Some("ops@example.com"));
        assert_eq!(config.acme.directory, AcmeDirectory::Production);
        assert_eq!(config.acme.failure_backoff(), std::time::Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn test_public_secure_port_from_environment() {
        let env = EnvConfig::from_vars(vars(&[("ROUTER_PUBLIC_PORT_SECURE", "443")])).unwrap();
        let config = Config::try_from(env).unwrap();
        assert_eq!(config.listeners.https_port, 4433);
        assert_eq!(config.listeners.public_https_port, Some(443));
    }

    #[test]
    fn test_invalid_bind_address() {
        let env = EnvConfig::from_vars(vars(&[("ROUTER_BIND", "not-an-ip")])).unwrap();
        assert!(matches!(
            Config::try_from(env),
            Err(ConfigError::BindAddress(_))
        ));
    }

    #[test]
    fn test_unparseable_port() {
        let result = EnvConfig::from_vars(vars(&[("ROUTER_PORT", "eighty")]));
        assert!(matches!(result, Err(ConfigError::Environment(_))));
    }

    #[test]
    fn test_blank_email_is_none() {
        let env = EnvConfig::from_vars(vars(&[("SSL_EMAIL", "  ")])).unwrap();
        let config = Config::try_from(env).unwrap();
        assert_eq!(config.acme.contact_email, None);
    }
}
