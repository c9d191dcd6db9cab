//! Certificate authority client
//!
//! [`CertificateAuthority`] and [`PendingOrder`] are the seam between the
//! lifecycle manager and the CA. [`AcmeClient`] implements them over
//! `instant-acme`; tests drive the lifecycle with an in-process fake.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use switchyard_common::DomainName;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use super::error::AcmeError;
use super::lifecycle::AcmePolicy;
use super::storage::CertificateStorage;

const POLL_MAX: Duration = Duration::from_secs(5);
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(90);

/// An HTTP-01 token and the key authorization to serve for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpChallenge {
    pub token: String,
    pub key_authorization: String,
}

/// What the CA hands back from a finalized order
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Leaf first, then intermediates
    pub chain_pem: String,
    pub key_pem: String,
}

/// A certificate authority able to open orders for single domains
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn new_order(&self, domain: &DomainName) -> Result<Box<dyn PendingOrder>, AcmeError>;
}

/// An open order, driven through validation and finalization
#[async_trait]
pub trait PendingOrder: Send {
    /// Challenges that still need answering; empty when the CA already
    /// holds a valid authorization for the domain
    fn challenges(&self) -> &[HttpChallenge];

    /// Tell the CA the challenge responses are being served
    async fn notify_ready(&mut self) -> Result<(), AcmeError>;

    /// Wait until the CA has validated every challenge
    async fn await_validation(&mut self, timeout: Duration) -> Result<(), AcmeError>;

    /// Submit a CSR for a freshly generated key and collect the certificate
    async fn finalize(&mut self) -> Result<IssuedCertificate, AcmeError>;
}

/// ACME client over `instant-acme`
///
/// The account is created (or restored from `credentials.json`) on first
/// use, so constructing a client never touches the network.
pub struct AcmeClient {
    directory_url: String,
    contact_email: Option<String>,
    poll_interval: Duration,
    storage: Arc<CertificateStorage>,
    account: OnceCell<Account>,
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("contact_email", &self.contact_email)
            .finish()
    }
}

impl AcmeClient {
    pub fn new(policy: &AcmePolicy, storage: Arc<CertificateStorage>) -> Self {
        if policy.directory.is_staging() {
            info!("Using ACME staging directory; certificates will not be publicly trusted");
        }
        Self {
            directory_url: policy.directory.url().to_string(),
            contact_email: policy.contact_email.clone(),
            poll_interval: policy.poll_interval,
            storage,
            account: OnceCell::new(),
        }
    }

    pub fn storage_path(&self) -> &Path {
        self.storage.base_path()
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        if let Some(json) = self.storage.load_credentials_json()? {
            match serde_json::from_str::<AccountCredentials>(&json) {
                Ok(credentials) => {
                    let account = Account::from_credentials(credentials)
                        .await
                        .map_err(|e| AcmeError::Account(e.to_string()))?;
                    debug!("Restored ACME account from storage");
                    return Ok(account);
                }
                Err(e) => {
                    warn!(error = %e, "Stored ACME credentials are unreadable, creating a new account");
                }
            }
        }

        let email = self.contact_email.as_deref().ok_or_else(|| {
            AcmeError::Config("a contact email (SSL_EMAIL) is required to register with the CA".to_string())
        })?;
        let contact = format!("mailto:{email}");
        let contacts = [contact.as_str()];

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::Account(e.to_string()))?;

        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::Account(e.to_string()))?;
        self.storage.save_credentials_json(&json)?;

        info!(
            directory = %self.directory_url,
            contact = ?self.contact_email,
            "Created ACME account"
        );
        Ok(account)
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    async fn new_order(&self, domain: &DomainName) -> Result<Box<dyn PendingOrder>, AcmeError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| match AcmeError::from(e) {
                AcmeError::Protocol(msg) => AcmeError::OrderCreation(msg),
                other => other,
            })?;

        let authorizations = order.authorizations().await?;

        let mut challenges = Vec::new();
        let mut challenge_urls = Vec::new();
        for authz in &authorizations {
            match &authz.status {
                AuthorizationStatus::Valid => {
                    trace!(domain = %domain, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(AcmeError::Validation {
                        domain: domain.to_string(),
                        reason: format!("authorization is {status:?}"),
                    });
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcmeError::NoHttpChallenge(domain.to_string()))?;

            challenges.push(HttpChallenge {
                token: challenge.token.clone(),
                key_authorization: order.key_authorization(challenge).as_str().to_string(),
            });
            challenge_urls.push(challenge.url.clone());
        }

        debug!(
            domain = %domain,
            challenges = challenges.len(),
            "Created ACME order"
        );

        Ok(Box::new(AcmeOrder {
            domain: domain.clone(),
            poll_interval: self.poll_interval,
            order,
            challenges,
            challenge_urls,
        }))
    }
}

struct AcmeOrder {
    domain: DomainName,
    poll_interval: Duration,
    order: Order,
    challenges: Vec<HttpChallenge>,
    challenge_urls: Vec<String>,
}

impl AcmeOrder {
    /// Failure detail from the first invalid challenge, if the CA gave one
    async fn failure_reason(&mut self) -> String {
        let Ok(authorizations) = self.order.authorizations().await else {
            return "order became invalid".to_string();
        };
        authorizations
            .iter()
            .flat_map(|a| a.challenges.iter())
            .find_map(|c| c.error.as_ref().and_then(|p| p.detail.clone()))
            .unwrap_or_else(|| "order became invalid".to_string())
    }

    async fn poll_until<F>(&mut self, timeout: Duration, done: F) -> Result<(), AcmeError>
    where
        F: Fn(OrderStatus) -> bool + Send + Sync,
    {
        let domain = self.domain.to_string();
        let mut delay = self.poll_interval;

        let poll = async {
            loop {
                let status = match self.order.refresh().await {
                    Ok(state) => state.status,
                    Err(e) => return Err(AcmeError::from(e)),
                };
                trace!(domain = %self.domain, ?status, "Polled ACME order");

                if done(status) {
                    return Ok(());
                }
                if status == OrderStatus::Invalid {
                    return Err(AcmeError::Validation {
                        domain: self.domain.to_string(),
                        reason: self.failure_reason().await,
                    });
                }

                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(POLL_MAX);
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| AcmeError::Timeout {
                domain,
                after: timeout,
            })?
    }
}

#[async_trait]
impl PendingOrder for AcmeOrder {
    fn challenges(&self) -> &[HttpChallenge] {
        &self.challenges
    }

    async fn notify_ready(&mut self) -> Result<(), AcmeError> {
        for url in &self.challenge_urls {
            self.order.set_challenge_ready(url).await?;
        }
        Ok(())
    }

    async fn await_validation(&mut self, timeout: Duration) -> Result<(), AcmeError> {
        self.poll_until(timeout, |status| {
            matches!(status, OrderStatus::Ready | OrderStatus::Valid)
        })
        .await
    }

    async fn finalize(&mut self) -> Result<IssuedCertificate, AcmeError> {
        let mut params = rcgen::CertificateParams::new(vec![self.domain.to_string()])
            .map_err(|e| AcmeError::Finalize(e.to_string()))?;
        params.distinguished_name = rcgen::DistinguishedName::new();

        let key = rcgen::KeyPair::generate().map_err(|e| AcmeError::Finalize(e.to_string()))?;
        let csr = params
            .serialize_request(&key)
            .map_err(|e| AcmeError::Finalize(e.to_string()))?;

        self.order
            .finalize(csr.der())
            .await
            .map_err(|e| AcmeError::Finalize(e.to_string()))?;

        self.poll_until(FINALIZE_TIMEOUT, |status| status == OrderStatus::Valid)
            .await?;

        let mut delay = self.poll_interval;
        let chain_pem = loop {
            if let Some(chain) = self.order.certificate().await? {
                break chain;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
        };

        info!(domain = %self.domain, "ACME order finalized");

        Ok(IssuedCertificate {
            chain_pem,
            key_pem: key.serialize_pem(),
        })
    }
}
