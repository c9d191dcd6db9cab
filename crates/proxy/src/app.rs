//! Process assembly
//!
//! [`EdgeProxy`] wires the registry, routing table, certificate store,
//! lifecycle manager and both listeners together, then owns the
//! background tasks until shutdown.
//!
//! Startup order matters: the registry is fetched first (a failure is
//! fatal), the plaintext listener starts before anything asks the CA to
//! validate a domain, and only then does the initial registration series
//! run.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ServerConfig;
use switchyard_config::{Config, ListenerConfig};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::acme::{
    AcmeClient, AcmePolicy, CertificateAuthority, CertificateLifecycleManager, CertificateStorage,
    ChallengeManager, IssuanceQueue, RenewalScheduler, StorageError,
};
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::registry::{DomainSource, RegistryClient, RegistryError};
use crate::reload::{DrainCoordinator, RefreshSummary, RegistryRefresher, SignalListener, SignalType};
use crate::routing::{RoutingHandle, RoutingTable};
use crate::runner::SequentialRunner;
use crate::server::{serve_plaintext, serve_tls};
use crate::tls::{build_server_config, ManagedCertificates, SniResolver, TlsError};

/// Errors that abort startup
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("initial registry fetch failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("certificate storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// The two bound listener sockets
#[derive(Debug)]
pub struct Listeners {
    pub plaintext: TcpListener,
    pub secure: TcpListener,
}

impl Listeners {
    /// Bind both ports from the listener settings, plaintext first
    pub async fn bind(config: &ListenerConfig) -> Result<Self, StartupError> {
        let plaintext = bind(config.http_addr()).await?;
        let secure = bind(config.https_addr()).await?;
        Ok(Self { plaintext, secure })
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr, StartupError> {
    listener.local_addr().map_err(|source| StartupError::Bind {
        addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        source,
    })
}

/// Shared components used by the listeners and background tasks
#[derive(Clone)]
pub struct ProxyServices {
    pub routes: RoutingHandle,
    pub challenges: ChallengeManager,
    pub certificates: Arc<ManagedCertificates>,
    pub lifecycle: Arc<CertificateLifecycleManager>,
    pub runner: SequentialRunner,
    pub issuance: IssuanceQueue,
    pub dispatcher: Dispatcher,
    pub tls_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for ProxyServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServices")
            .field("routes", &self.routes.load().len())
            .field("certificates", &self.certificates.len())
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl ProxyServices {
    /// Wire the shared components. Must be called inside the runtime
    /// since the sequential runner spawns its worker here.
    pub fn new(
        config: &Config,
        table: RoutingTable,
        certificates: Arc<ManagedCertificates>,
        authority: Arc<dyn CertificateAuthority>,
        dispatch: DispatchSettings,
    ) -> Result<Self, TlsError> {
        let routes = RoutingHandle::new(table);
        let challenges = ChallengeManager::new();
        let lifecycle = Arc::new(CertificateLifecycleManager::new(
            authority,
            certificates.clone(),
            challenges.clone(),
            AcmePolicy::from_config(&config.acme),
        ));
        let runner = SequentialRunner::spawn();
        let issuance = IssuanceQueue::new(Arc::clone(&lifecycle), runner.clone());

        let resolver = SniResolver::new(certificates.clone(), routes.clone())
            .with_issuer(Arc::new(issuance.clone()));
        let tls_config = build_server_config(Arc::new(resolver))?;

        let dispatcher = Dispatcher::new(
            routes.clone(),
            challenges.clone(),
            certificates.clone(),
            dispatch,
        );

        Ok(Self {
            routes,
            challenges,
            certificates,
            lifecycle,
            runner,
            issuance,
            dispatcher,
            tls_config,
        })
    }
}

/// A running edge proxy
pub struct EdgeProxy {
    services: ProxyServices,
    refresher: RegistryRefresher,
    coordinator: Arc<DrainCoordinator>,
    plaintext_addr: SocketAddr,
    secure_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for EdgeProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeProxy")
            .field("plaintext_addr", &self.plaintext_addr)
            .field("secure_addr", &self.secure_addr)
            .field("services", &self.services)
            .finish()
    }
}

impl EdgeProxy {
    /// Start with the real registry client, on-disk certificate storage
    /// and the configured ACME directory
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        let source: Arc<dyn DomainSource> = Arc::new(RegistryClient::new(&config.registry)?);

        let storage = Arc::new(CertificateStorage::new(&config.acme.storage_path)?);
        let certificates = Arc::new(ManagedCertificates::with_storage(Arc::clone(&storage)));
        let restored = certificates.load_from_storage()?;
        info!(
            restored,
            path = %config.acme.storage_path.display(),
            "Loaded stored certificates"
        );

        let authority: Arc<dyn CertificateAuthority> =
            Arc::new(AcmeClient::new(&AcmePolicy::from_config(&config.acme), storage));

        let listeners = Listeners::bind(&config.listeners).await?;
        Self::start(config, source, certificates, authority, listeners).await
    }

    /// Start from explicit components
    pub async fn start(
        config: &Config,
        source: Arc<dyn DomainSource>,
        certificates: Arc<ManagedCertificates>,
        authority: Arc<dyn CertificateAuthority>,
        listeners: Listeners,
    ) -> Result<Self, StartupError> {
        let records = source.fetch_domains().await?;
        let table = RoutingTable::build(records);
        let tls_count = table.tls_routes().count();
        info!(routes = table.len(), tls = tls_count, "Routing table built");

        if tls_count > 0 && config.acme.contact_email.is_none() {
            warn!(
                tls_domains = tls_count,
                "SSL_EMAIL is not set, certificate issuance will fail for TLS domains"
            );
        }

        let plaintext_addr = local_addr(&listeners.plaintext)?;
        let secure_addr = local_addr(&listeners.secure)?;

        let dispatch = DispatchSettings {
            upstream_timeout: config.proxy.timeout(),
            redirect_to_https: config.proxy.redirect_to_https,
            https_port: config
                .listeners
                .public_https_port
                .unwrap_or_else(|| secure_addr.port()),
        };
        let services = ProxyServices::new(config, table, certificates, authority, dispatch)?;
        let coordinator = Arc::new(DrainCoordinator::new(config.listeners.drain_timeout()));

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(serve_plaintext(
            listeners.plaintext,
            services.dispatcher.clone(),
            Arc::clone(&coordinator),
        )));
        tasks.push(tokio::spawn(serve_tls(
            listeners.secure,
            TlsAcceptor::from(Arc::clone(&services.tls_config)),
            services.dispatcher.clone(),
            Arc::clone(&coordinator),
        )));

        tasks.push(tokio::spawn(register_domains(services.clone())));

        let scheduler = RenewalScheduler::new(
            Arc::clone(&services.lifecycle),
            services.runner.clone(),
            services.routes.clone(),
            services.challenges.clone(),
        )
        .with_interval(config.acme.renewal_check_interval());
        tasks.push(tokio::spawn(scheduler.run(coordinator.subscribe())));

        let refresher = RegistryRefresher::new(source, services.routes.clone())
            .with_issuance(services.issuance.clone());
        if let Some(period) = config.registry.refresh_interval() {
            tasks.push(tokio::spawn(
                refresher.clone().run_periodic(period, coordinator.subscribe()),
            ));
        }

        info!(
            http = %plaintext_addr,
            https = %secure_addr,
            directory = %config.acme.directory.url(),
            "Switchyard started"
        );

        Ok(Self {
            services,
            refresher,
            coordinator,
            plaintext_addr,
            secure_addr,
            tasks,
        })
    }

    pub fn plaintext_addr(&self) -> SocketAddr {
        self.plaintext_addr
    }

    pub fn secure_addr(&self) -> SocketAddr {
        self.secure_addr
    }

    pub fn services(&self) -> &ProxyServices {
        &self.services
    }

    /// Re-fetch the registry now and swap in the new table
    pub async fn refresh_registry(&self) -> Result<RefreshSummary, RegistryError> {
        self.refresher.refresh().await
    }

    /// Serve until SIGTERM/SIGINT, refreshing the registry on SIGHUP
    pub async fn run_until_signal(self) -> io::Result<bool> {
        let mut signals = SignalListener::install()?;

        loop {
            match signals.recv().await {
                SignalType::Reload => {
                    info!("Reload requested, refreshing registry");
                    if let Err(e) = self.refresh_registry().await {
                        error!(error = %e, "Registry refresh failed, keeping current routing table");
                    }
                }
                SignalType::Shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        Ok(self.shutdown().await)
    }

    /// Stop accepting, drain open connections and stop background tasks.
    ///
    /// Returns false if connections were still open when the drain
    /// timeout expired.
    pub async fn shutdown(self) -> bool {
        self.coordinator.request_shutdown();
        let drained = self.coordinator.wait_for_drain().await;

        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }

        if drained {
            info!("Shutdown complete");
        } else {
            warn!(
                active = self.coordinator.active_count(),
                "Shutdown with connections still open"
            );
        }
        drained
    }
}

/// Initial certificate registration for every TLS domain, one at a time
async fn register_domains(services: ProxyServices) {
    let domains = services.routes.load().tls_domains();
    if domains.is_empty() {
        debug!("No TLS domains to register");
        return;
    }

    info!(count = domains.len(), "Registering TLS domains");
    let lifecycle = Arc::clone(&services.lifecycle);
    let series = services
        .runner
        .run_series(domains, move |domain, _| {
            let lifecycle = Arc::clone(&lifecycle);
            async move { lifecycle.ensure(&domain).await }
        })
        .await;

    match series {
        Ok(results) => {
            let failed = results.iter().filter(|r| r.is_err()).count();
            info!(
                ready = results.len() - failed,
                failed,
                "Initial certificate registration finished"
            );
        }
        Err(e) => error!(error = %e, "Initial certificate registration did not run"),
    }
}
