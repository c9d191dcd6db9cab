//! Harness for end-to-end tests: an echo upstream, a certificate
//! authority that validates through the proxy's plaintext listener, and
//! small HTTP and TLS clients.

#![allow(dead_code)]

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;

use switchyard_common::DomainName;
use switchyard_proxy::acme::{HttpChallenge, IssuedCertificate, PendingOrder};
use switchyard_proxy::{AcmeError, CertificateAuthority};

/// Start an upstream that echoes what it received as `name: value` lines
///
/// Requests with an `Upgrade` header are switched over and every byte sent
/// afterwards is echoed back.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|mut req: Request<hyper::body::Incoming>| async move {
                    if let Some(protocol) = req.headers().get(http::header::UPGRADE).cloned() {
                        let on_upgrade = hyper::upgrade::on(&mut req);
                        tokio::spawn(async move {
                            if let Ok(upgraded) = on_upgrade.await {
                                let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
                                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                            }
                        });
                        let mut resp = Response::new(Full::new(Bytes::new()));
                        *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
                        resp.headers_mut()
                            .insert(http::header::CONNECTION, HeaderValue::from_static("upgrade"));
                        resp.headers_mut().insert(http::header::UPGRADE, protocol);
                        return Ok::<_, Infallible>(resp);
                    }

                    let mut body = format!("{} {}\n", req.method(), req.uri());
                    for (name, value) in req.headers() {
                        body.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("?")));
                    }
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

/// One GET over an already connected stream
async fn get_over<S>(io: S, host: &str, path: &str) -> (StatusCode, http::HeaderMap, String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::get(path)
        .header(http::header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

/// Plaintext GET to `addr` with the given `Host`
pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> (StatusCode, http::HeaderMap, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    get_over(stream, host, path).await
}

/// GET over TLS with `sni` as server name; `Err` when the handshake fails
pub async fn https_get(
    addr: SocketAddr,
    sni: &str,
    path: &str,
) -> Result<(StatusCode, http::HeaderMap, String), std::io::Error> {
    let stream = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(sni.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let tls = tls_connector().connect(name, stream).await?;
    Ok(get_over(tls, sni, path).await)
}

/// Retry `https_get` until the handshake succeeds or `deadline` passes
pub async fn wait_for_https(
    addr: SocketAddr,
    sni: &str,
    path: &str,
    deadline: Duration,
) -> Option<(StatusCode, http::HeaderMap, String)> {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if let Ok(result) = https_get(addr, sni, path).await {
            return Some(result);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

fn tls_connector() -> TlsConnector {
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Test certificates are self-signed; trust whatever the proxy presents
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Certificate authority that fetches each challenge from the proxy's
/// plaintext listener, like a real CA would, and signs self-signed
/// certificates
pub struct LoopbackAuthority {
    plaintext: SocketAddr,
    rejected: HashSet<String>,
    hold: Option<Arc<Notify>>,
    orders: AtomicUsize,
}

impl LoopbackAuthority {
    pub fn new(plaintext: SocketAddr) -> Self {
        Self {
            plaintext,
            rejected: HashSet::new(),
            hold: None,
            orders: AtomicUsize::new(0),
        }
    }

    /// Fail validation for `domain` regardless of what is served
    pub fn rejecting(mut self, domain: &str) -> Self {
        self.rejected.insert(domain.to_string());
        self
    }

    /// Block validation until `release` is notified
    pub fn holding(mut self, release: Arc<Notify>) -> Self {
        self.hold = Some(release);
        self
    }

    pub fn orders(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for LoopbackAuthority {
    async fn new_order(&self, domain: &DomainName) -> Result<Box<dyn PendingOrder>, AcmeError> {
        let n = self.orders.fetch_add(1, Ordering::SeqCst);
        let token = format!("tok{n}-{}", domain.as_str().replace('.', "-"));
        Ok(Box::new(LoopbackOrder {
            domain: domain.clone(),
            plaintext: self.plaintext,
            reject: self.rejected.contains(domain.as_str()),
            hold: self.hold.clone(),
            challenges: vec![HttpChallenge {
                key_authorization: format!("{token}.loopback-thumbprint"),
                token,
            }],
        }))
    }
}

struct LoopbackOrder {
    domain: DomainName,
    plaintext: SocketAddr,
    reject: bool,
    hold: Option<Arc<Notify>>,
    challenges: Vec<HttpChallenge>,
}

#[async_trait]
impl PendingOrder for LoopbackOrder {
    fn challenges(&self) -> &[HttpChallenge] {
        &self.challenges
    }

    async fn notify_ready(&mut self) -> Result<(), AcmeError> {
        Ok(())
    }

    async fn await_validation(&mut self, _timeout: Duration) -> Result<(), AcmeError> {
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }

        if self.reject {
            return Err(AcmeError::Validation {
                domain: self.domain.to_string(),
                reason: "authorization rejected".to_string(),
            });
        }

        for challenge in &self.challenges {
            let path = format!("/.well-known/acme-challenge/{}", challenge.token);
            let (status, _, body) = http_get(self.plaintext, self.domain.as_str(), &path).await;
            if status != StatusCode::OK || body != challenge.key_authorization {
                return Err(AcmeError::Validation {
                    domain: self.domain.to_string(),
                    reason: format!("challenge answered {status} with '{body}'"),
                });
            }
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<IssuedCertificate, AcmeError> {
        let key = rcgen::KeyPair::generate().map_err(|e| AcmeError::Finalize(e.to_string()))?;
        let cert = rcgen::CertificateParams::new(vec![self.domain.to_string()])
            .and_then(|params| params.self_signed(&key))
            .map_err(|e| AcmeError::Finalize(e.to_string()))?;
        Ok(IssuedCertificate {
            chain_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}
