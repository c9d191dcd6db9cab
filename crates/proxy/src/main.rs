//! Switchyard - Main entry point
//!
//! Multi-tenant edge proxy with automatic ACME certificates.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use switchyard_config::{Config, EnvConfig};
use switchyard_proxy::EdgeProxy;

/// Switchyard - multi-tenant edge proxy
///
/// Settings come from the environment (`ROUTER_PORT`, `CMS_API_HOST`,
/// `SSL_PATH`, ...); the flags below override individual values.
#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Plaintext listener port (overrides ROUTER_PORT)
    #[arg(long = "http-port")]
    http_port: Option<u16>,

    /// TLS listener port (overrides ROUTER_PORT_SECURE)
    #[arg(long = "https-port")]
    https_port: Option<u16>,

    /// Port clients use for HTTPS in redirects (overrides ROUTER_PUBLIC_PORT_SECURE)
    #[arg(long = "public-https-port")]
    public_https_port: Option<u16>,

    /// Certificate storage directory (overrides SSL_PATH)
    #[arg(long = "ssl-path")]
    ssl_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = load_config(&cli)?;

    if cli.test {
        return test_config(&config);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(run(config))
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut env = EnvConfig::from_env().context("Failed to read configuration from environment")?;

    if let Some(port) = cli.http_port {
        env.router_port = port;
    }
    if let Some(port) = cli.https_port {
        env.router_port_secure = port;
    }
    if cli.public_https_port.is_some() {
        env.router_public_port_secure = cli.public_https_port;
    }
    if let Some(path) = &cli.ssl_path {
        env.ssl_path = Some(path.clone());
    }

    let config = Config::try_from(env).context("Invalid configuration")?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn test_config(config: &Config) -> Result<()> {
    info!("Configuration test successful:");
    info!("  - http listener: {}", config.listeners.http_addr());
    info!("  - https listener: {}", config.listeners.https_addr());
    info!("  - registry: {}", config.registry.base_url());
    info!("  - ACME directory: {}", config.acme.directory.url());
    info!("  - certificate storage: {}", config.acme.storage_path.display());

    println!("switchyard: configuration test is successful");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let proxy = EdgeProxy::from_config(&config)
        .await
        .context("Failed to start proxy")?;

    let drained = proxy
        .run_until_signal()
        .await
        .context("Failed to install signal handlers")?;

    if !drained {
        info!("Exited before all connections drained");
    }
    Ok(())
}
