//! Switchyard Proxy Library
//!
//! A multi-tenant edge proxy. Requests are routed by `Host` header to the
//! upstream a tenant registered in the domain registry; TLS domains get
//! certificates from an ACME CA over HTTP-01 and are served by SNI.
//!
//! - **Routing**: exact host match against a table rebuilt from the registry
//! - **Dispatch**: challenge responses, HTTPS redirects and forwarding with
//!   `X-Forwarded-*` headers
//! - **TLS**: per-handshake certificate selection, with issuance requested
//!   for TLS domains that have no usable certificate
//! - **ACME**: sequential issuance, on-disk persistence and periodic renewal
//!
//! # Example
//!
//! ```ignore
//! use switchyard_config::Config;
//! use switchyard_proxy::EdgeProxy;
//!
//! let config = Config::from_env()?;
//! let proxy = EdgeProxy::from_config(&config).await?;
//! proxy.run_until_signal().await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod app;
pub mod dispatch;
pub mod registry;
pub mod reload;
pub mod routing;
pub mod runner;
pub mod server;
pub mod tls;

#[cfg(test)]
mod testutil;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Application
pub use app::{EdgeProxy, Listeners, ProxyServices, StartupError};

// Registry
pub use registry::{DomainRecord, DomainSource, RegistryClient, RegistryError};

// Routing
pub use routing::{Route, RoutingHandle, RoutingTable, Upstream};

// Dispatch
pub use dispatch::{DispatchSettings, Dispatcher, ProxyBody, Scheme};

// Certificates
pub use acme::{
    AcmeClient, AcmeError, AcmePolicy, CertState, CertificateAuthority,
    CertificateLifecycleManager, ChallengeManager, EnsureOutcome, IssuanceQueue, RenewalScheduler,
};
pub use tls::{CertificateRecord, CertificateStore, ManagedCertificates, SniResolver};

// Sequential execution
pub use runner::{SequentialRunner, RunnerError};

// Reload and shutdown
pub use reload::{DrainCoordinator, RegistryRefresher, SignalListener, SignalType};
