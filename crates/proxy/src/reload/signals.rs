//! Signal handling for registry reload and shutdown.
//!
//! SIGHUP re-fetches the domain registry; SIGTERM and SIGINT start a
//! graceful shutdown.

use std::io;

use tracing::debug;

/// What a received signal asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Re-fetch the registry (SIGHUP)
    Reload,
    /// Graceful shutdown (SIGTERM/SIGINT)
    Shutdown,
}

/// Async stream of process signals
#[cfg(unix)]
pub struct SignalListener {
    hangup: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    /// Register handlers; must be called inside the runtime
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        debug!("Installing signal handlers");
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal
    pub async fn recv(&mut self) -> SignalType {
        let signal = tokio::select! {
            _ = self.hangup.recv() => SignalType::Reload,
            _ = self.terminate.recv() => SignalType::Shutdown,
            _ = self.interrupt.recv() => SignalType::Shutdown,
        };
        debug!(signal = ?signal, "Received signal");
        signal
    }
}

#[cfg(not(unix))]
pub struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub fn install() -> io::Result<Self> {
        Ok(Self)
    }

    /// Only Ctrl-C is available; it always means shutdown
    pub async fn recv(&mut self) -> SignalType {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl-C handler failed");
        }
        SignalType::Shutdown
    }
}

impl std::fmt::Debug for SignalListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalListener").finish()
    }
}
