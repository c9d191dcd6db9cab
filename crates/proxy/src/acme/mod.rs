//! Automatic certificate management over ACME HTTP-01
//!
//! - [`CertificateLifecycleManager`] drives each domain from "no
//!   certificate" to an installed one, and renews it inside the window
//! - [`CertificateAuthority`] / [`PendingOrder`] abstract the CA;
//!   [`AcmeClient`] is the `instant-acme` implementation
//! - [`ChallengeManager`] holds the tokens the plaintext listener answers
//! - [`CertificateStorage`] persists account credentials and certificates
//! - [`RenewalScheduler`] sweeps TLS domains periodically
//! - [`IssuanceQueue`] funnels on-demand requests into the runner
//!
//! # Challenge Flow
//!
//! 1. The lifecycle manager opens an order for one domain
//! 2. Each HTTP-01 token is registered with the [`ChallengeManager`]
//! 3. The CA is told the responses are ready and fetches
//!    `/.well-known/acme-challenge/<token>` over plaintext HTTP
//! 4. Once the order is ready it is finalized with a fresh key and CSR
//! 5. The certificate is parsed, persisted and published to the SNI resolver
//! 6. Tokens are withdrawn, whatever the outcome

mod challenge;
mod client;
mod error;
mod lifecycle;
mod scheduler;
mod storage;

pub use challenge::{ChallengeManager, ACME_CHALLENGE_PREFIX};
pub use client::{AcmeClient, CertificateAuthority, HttpChallenge, IssuedCertificate, PendingOrder};
pub use error::{AcmeError, StorageError};
pub use lifecycle::{AcmePolicy, CertState, CertificateLifecycleManager, EnsureOutcome, IssuanceQueue};
pub use scheduler::{RenewalScheduler, SweepSummary};
pub use storage::{CertificateMeta, CertificateStorage};
