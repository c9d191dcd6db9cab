//! Per-request dispatch by Host header
//!
//! Answers ACME HTTP-01 challenges, redirects TLS domains to HTTPS, and
//! forwards everything else to the domain's upstream over HTTP/1.1. Bodies
//! stream in both directions; nothing is buffered.
//!
//! Requests carrying `Connection: upgrade` (WebSocket and the like) keep
//! their `Upgrade` header on the way upstream. When the upstream answers
//! `101 Switching Protocols`, both connections are taken over from HTTP and
//! bytes are copied between them until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper_util::rt::TokioIo;
use switchyard_common::normalize_host;
use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::acme::ChallengeManager;
use crate::routing::{Route, RoutingHandle};
use crate::tls::CertificateStore;

/// Response body type for everything the dispatcher returns
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Connection-scoped headers that are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Which listener a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Bound on connecting to the upstream and on receiving its response head
    pub upstream_timeout: Duration,
    pub redirect_to_https: bool,
    /// Port used in redirect locations
    pub https_port: u16,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(600),
            redirect_to_https: true,
            https_port: 443,
        }
    }
}

#[derive(Debug, Error)]
enum UpstreamError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("upstream switched protocols without being asked to")]
    UnrequestedUpgrade,
}

impl UpstreamError {
    fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Routes requests for both listeners
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Dispatcher {
    routes: RoutingHandle,
    challenges: ChallengeManager,
    certificates: Arc<dyn CertificateStore>,
    settings: Arc<DispatchSettings>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        routes: RoutingHandle,
        challenges: ChallengeManager,
        certificates: Arc<dyn CertificateStore>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            routes,
            challenges,
            certificates,
            settings: Arc::new(settings),
        }
    }

    /// Produce the response for one request. Never fails; every error
    /// becomes a status code.
    pub async fn dispatch<B>(&self, req: Request<B>, scheme: Scheme, client: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some(token) = ChallengeManager::extract_token(req.uri().path()) {
            return self.challenge_response(token);
        }

        let Some(host) = request_host(&req) else {
            debug!(client = %client, "Request without Host header");
            return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
        };

        let Some(route) = self.routes.lookup(&host) else {
            debug!(host = %host, "No route for host");
            return text_response(
                StatusCode::NOT_FOUND,
                format!("No route registered for host '{host}'"),
            );
        };

        if scheme == Scheme::Http && self.should_redirect(&route) {
            return self.redirect(&host, req.uri());
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.forward(req, &route, scheme, client).await {
            Ok(response) => {
                trace!(
                    host = %host,
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    "Forwarded request"
                );
                response
            }
            Err(e) => {
                warn!(
                    host = %host,
                    upstream = %route.upstream,
                    method = %method,
                    path = %path,
                    error = %e,
                    "Upstream request failed"
                );
                let status = e.status();
                text_response(status, status.canonical_reason().unwrap_or("Upstream error"))
            }
        }
    }

    fn challenge_response(&self, token: &str) -> Response<ProxyBody> {
        match self.challenges.get_response(token) {
            Some(key_authorization) => {
                debug!(token = %token, "Answered ACME challenge");
                text_response(StatusCode::OK, key_authorization)
            }
            None => {
                debug!(token = %token, "Unknown ACME challenge token");
                text_response(StatusCode::NOT_FOUND, "Unknown challenge token")
            }
        }
    }

    fn should_redirect(&self, route: &Route) -> bool {
        if !self.settings.redirect_to_https || !route.tls {
            return false;
        }
        self.certificates
            .get(&route.domain)
            .is_some_and(|installed| !installed.record.is_expired_at(Utc::now()))
    }

    fn redirect(&self, host: &str, uri: &Uri) -> Response<ProxyBody> {
        let port = match self.settings.https_port {
            443 => String::new(),
            p => format!(":{p}"),
        };
        let path = uri.path_and_query().map(PathAndQuery::as_str).unwrap_or("/");
        let location = format!("https://{host}{port}{path}");

        let Ok(value) = HeaderValue::from_str(&location) else {
            return text_response(StatusCode::BAD_REQUEST, "Invalid request target");
        };

        debug!(location = %location, "Redirecting to HTTPS");
        let mut response = text_response(StatusCode::MOVED_PERMANENTLY, "");
        response.headers_mut().insert(header::LOCATION, value);
        response
    }

    async fn forward<B>(
        &self,
        mut req: Request<B>,
        route: &Route,
        scheme: Scheme,
        client: SocketAddr,
    ) -> Result<Response<ProxyBody>, UpstreamError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let limit = self.settings.upstream_timeout;
        let authority = route.upstream.authority();

        let stream = timeout(limit, TcpStream::connect(&authority))
            .await
            .map_err(|_| UpstreamError::Timeout(limit))?
            .map_err(UpstreamError::Connect)?;
        let _ = stream.set_nodelay(true);

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(UpstreamError::Handshake)?;

        let upstream = authority.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!(upstream = %upstream, error = %e, "Upstream connection closed with error");
            }
        });

        let requested = upgrade_protocol(req.headers());
        let client_upgrade = requested.is_some().then(|| hyper::upgrade::on(&mut req));

        prepare_upstream_request(&mut req, scheme, client);

        let mut response = timeout(limit, sender.send_request(req))
            .await
            .map_err(|_| UpstreamError::Timeout(limit))?
            .map_err(UpstreamError::Request)?;

        let switched = if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let client_upgrade = client_upgrade.ok_or(UpstreamError::UnrequestedUpgrade)?;
            let protocol = response
                .headers()
                .get(header::UPGRADE)
                .cloned()
                .or(requested);
            tunnel(client_upgrade, hyper::upgrade::on(&mut response), authority);
            protocol
        } else {
            None
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = switched {
            restore_upgrade(&mut parts.headers, protocol);
        }

        Ok(Response::from_parts(parts, body.boxed_unsync()))
    }
}

/// Copy bytes between client and upstream once both sides have switched
/// protocols
fn tunnel(client: hyper::upgrade::OnUpgrade, upstream: hyper::upgrade::OnUpgrade, authority: String) {
    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(upstream = %authority, error = %e, "Protocol upgrade did not complete");
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                debug!(upstream = %authority, sent, received, "Upgraded connection closed");
            }
            Err(e) => {
                debug!(upstream = %authority, error = %e, "Upgraded connection closed with error");
            }
        }
    });
}

/// Host the request is addressed to, normalized for routing
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    normalize_host(raw)
}

/// Rewrite a client request for the upstream hop
fn prepare_upstream_request<B>(req: &mut Request<B>, scheme: Scheme, client: SocketAddr) {
    // Origin-form target on the upstream hop
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let original_authority = req.uri().authority().cloned();
    *req.uri_mut() = Uri::from(path);
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    let upgrade = upgrade_protocol(headers);
    strip_hop_by_hop(headers);
    if let Some(protocol) = upgrade {
        restore_upgrade(headers, protocol);
    }

    if !headers.contains_key(header::HOST) {
        if let Some(authority) = original_authority {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(header::HOST, value);
            }
        }
    }

    let client_ip = client.ip().to_string();
    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));

    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// Requested protocol when `Connection` lists `upgrade` and `Upgrade` is set
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let asks_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !asks_upgrade {
        return None;
    }
    headers.get(header::UPGRADE).cloned()
}

fn restore_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, protocol);
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let body = Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
