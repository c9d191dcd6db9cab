//! Plaintext and TLS listeners
//!
//! Each accepted connection runs on its own task and is served over
//! HTTP/1.1 by the [`Dispatcher`]. When shutdown is signalled the accept
//! loops stop and open connections finish their in-flight request.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use crate::dispatch::{Dispatcher, Scheme};
use crate::reload::{ConnectionGuard, DrainCoordinator};

/// Bound on the TLS handshake for one connection
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accept plaintext connections until shutdown
pub async fn serve_plaintext(
    listener: TcpListener,
    dispatcher: Dispatcher,
    coordinator: Arc<DrainCoordinator>,
) {
    log_listening(&listener, Scheme::Http);

    accept_loop(listener, Arc::clone(&coordinator), move |stream, peer, guard| {
        let dispatcher = dispatcher.clone();
        let shutdown = coordinator.subscribe();
        async move {
            serve_connection(TokioIo::new(stream), dispatcher, Scheme::Http, peer, shutdown).await;
            drop(guard);
        }
    })
    .await;
}

/// Accept TLS connections until shutdown
///
/// The certificate is chosen during the handshake by the acceptor's
/// resolver; a failed handshake just closes that connection.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    dispatcher: Dispatcher,
    coordinator: Arc<DrainCoordinator>,
) {
    log_listening(&listener, Scheme::Https);

    accept_loop(listener, Arc::clone(&coordinator), move |stream, peer, guard| {
        let acceptor = acceptor.clone();
        let dispatcher = dispatcher.clone();
        let shutdown = coordinator.subscribe();
        async move {
            let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "TLS handshake timed out");
                    return;
                }
            };

            let sni = tls.get_ref().1.server_name().map(str::to_string);
            trace!(peer = %peer, sni = ?sni, "TLS handshake complete");

            serve_connection(TokioIo::new(tls), dispatcher, Scheme::Https, peer, shutdown).await;
            drop(guard);
        }
    })
    .await;
}

fn log_listening(listener: &TcpListener, scheme: Scheme) {
    match listener.local_addr() {
        Ok(addr) => info!(address = %addr, scheme = scheme.as_str(), "Listening"),
        Err(e) => warn!(error = %e, scheme = scheme.as_str(), "Listening on unknown address"),
    }
}

async fn accept_loop<F, Fut>(listener: TcpListener, coordinator: Arc<DrainCoordinator>, mut handle: F)
where
    F: FnMut(tokio::net::TcpStream, SocketAddr, ConnectionGuard) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut shutdown = coordinator.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    trace!(peer = %peer, "Accepted connection");
                    let guard = coordinator.track();
                    tokio::spawn(handle(stream, peer, guard));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Accept loop stopped");
}

/// Serve HTTP/1.1 on one connection until it closes or shutdown completes
async fn serve_connection<I>(
    io: TokioIo<I>,
    dispatcher: Dispatcher,
    scheme: Scheme,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatcher.dispatch(req, scheme, peer).await) }
    });

    // Upgrades hand the connection to the dispatcher's tunnel after a 101
    let connection = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.changed() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Connection closed with error");
    }
}
