//! Graceful shutdown coordination.
//!
//! Tracks open client connections and lets shutdown wait for them to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Shutdown broadcast plus a count of open connections
///
/// Listeners hold a [`watch::Receiver`] from [`subscribe`](Self::subscribe)
/// and stop accepting once it flips to `true`; each connection task holds
/// a [`ConnectionGuard`] for as long as it is serving.
#[derive(Debug)]
pub struct DrainCoordinator {
    active_connections: Arc<AtomicUsize>,
    max_drain_time: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl DrainCoordinator {
    pub fn new(max_drain_time: Duration) -> Self {
        debug!(
            max_drain_time_secs = max_drain_time.as_secs(),
            "Creating drain coordinator"
        );
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            active_connections: Arc::new(AtomicUsize::new(0)),
            max_drain_time,
            shutdown_tx,
        }
    }

    /// Count a connection until the returned guard is dropped
    pub fn track(&self) -> ConnectionGuard {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(active_connections = count, "Connection opened");
        ConnectionGuard {
            active_connections: Arc::clone(&self.active_connections),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Receiver that flips to `true` when shutdown starts
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Tell every listener and connection to wind down
    pub fn request_shutdown(&self) {
        info!(
            active_connections = self.active_count(),
            "Shutdown requested"
        );
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait for open connections to close
    ///
    /// Returns `true` if all connections drained within the timeout,
    /// `false` if the timeout was reached with connections still open.
    pub async fn wait_for_drain(&self) -> bool {
        let start = Instant::now();
        let initial_count = self.active_count();

        info!(
            active_connections = initial_count,
            max_drain_time_secs = self.max_drain_time.as_secs(),
            "Starting connection drain"
        );

        let mut last_logged_count = initial_count;

        while self.active_count() > 0 {
            if start.elapsed() > self.max_drain_time {
                warn!(
                    remaining_connections = self.active_count(),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Drain timeout reached, connections still open"
                );
                return false;
            }

            let current_count = self.active_count();
            if current_count != last_logged_count {
                debug!(
                    remaining_connections = current_count,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Draining connections"
                );
                last_logged_count = current_count;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            initial_connections = initial_count,
            "All connections drained"
        );
        true
    }
}

/// Decrements the open-connection count on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    active_connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        trace!(active_connections = count, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guards_track_connections() {
        let coordinator = DrainCoordinator::new(Duration::from_secs(1));

        let first = coordinator.track();
        let second = coordinator.track();
        assert_eq!(coordinator.active_count(), 2);

        drop(first);
        assert_eq!(coordinator.active_count(), 1);

        drop(second);
        assert_eq!(coordinator.active_count(), 0);

        assert!(coordinator.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_drain_times_out_with_open_connection() {
        let coordinator = DrainCoordinator::new(Duration::from_millis(150));
        let _open = coordinator.track();
        assert!(!coordinator.wait_for_drain().await);
    }

    #[tokio::test]
    async fn test_shutdown_broadcast() {
        let coordinator = DrainCoordinator::new(Duration::from_secs(1));
        let mut rx = coordinator.subscribe();

        assert!(!coordinator.is_shutdown_requested());
        coordinator.request_shutdown();

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(coordinator.is_shutdown_requested());
    }
}
