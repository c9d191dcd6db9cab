//! Shared types for the Switchyard edge proxy.
//!
//! - [`ids`]: identifier newtypes for domains and registry entries
//! - [`host`]: Host header / SNI normalization used as the routing key

pub mod host;
pub mod ids;

pub use host::{normalize_host, strip_port};
pub use ids::{DomainId, DomainName, DomainNameError};
