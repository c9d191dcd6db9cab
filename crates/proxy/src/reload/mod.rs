//! Runtime reload and shutdown
//!
//! - [`RegistryRefresher`]: rebuild the routing table from the registry
//! - [`SignalListener`]: SIGHUP for refresh, SIGTERM/SIGINT for shutdown
//! - [`DrainCoordinator`]: stop accepting, then wait for open connections

mod coordinator;
mod refresh;
mod signals;

pub use coordinator::{ConnectionGuard, DrainCoordinator};
pub use refresh::{RefreshSummary, RegistryRefresher};
pub use signals::{SignalListener, SignalType};
