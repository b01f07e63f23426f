//! Single-upstream reverse proxy
//!
//! Requests are relayed to the configured backend with only connection
//! scoped headers adjusted. Bodies stream through in both directions.

use crate::config::UpstreamTarget;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Response body type used by both listeners
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers scoped to a single connection that never cross the proxy
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Forwards every request to one fixed upstream
pub struct ReverseProxy {
    upstream: UpstreamTarget,
    client: Client<HttpConnector, Incoming>,
}

impl ReverseProxy {
    pub fn new(upstream: UpstreamTarget) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self { upstream, client }
    }

    pub fn upstream(&self) -> &UpstreamTarget {
        &self.upstream
    }

    /// Relay `req` upstream; failures become `502 Bad Gateway`
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.try_forward(req, remote_addr).await {
            Ok(response) => {
                debug!(%method, %path, status = response.status().as_u16(), "Proxied request");
                response
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!(
                    upstream = %self.upstream.authority(),
                    %method,
                    %path,
                    error = %reason,
                    "Upstream request failed"
                );
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    async fn try_forward(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let client_upgrade = upgrade_protocol(req.headers())
            .map(|protocol| (protocol, hyper::upgrade::on(&mut req)));

        let (mut parts, body) = req.into_parts();

        let original_host = parts.headers.get(HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

        let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        parts.uri = self
            .upstream
            .uri_for(path_and_query)
            .context("Invalid upstream URI")?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        if let Some((protocol, _)) = &client_upgrade {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(UPGRADE, protocol.clone());
        }

        if let Some(host) = original_host {
            parts.headers.entry(HOST).or_insert(host.clone());
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
        append_forwarded_for(&mut parts.headers, remote_addr);
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        let mut response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .with_context(|| format!("Failed to reach upstream {}", self.upstream.authority()))?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some((_, on_client)) = client_upgrade else {
                anyhow::bail!("Upstream switched protocols without an upgrade request");
            };
            let on_upstream = hyper::upgrade::on(&mut response);
            tokio::spawn(splice(on_client, on_upstream));
            return Ok(response.map(|body| body.boxed()));
        }

        strip_hop_by_hop(response.headers_mut());
        Ok(response.map(|body| body.boxed()))
    }
}

/// Protocol the client asks to switch to, if any
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Remove hop-by-hop headers, including any the `Connection` header names
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, remote_addr: SocketAddr) {
    let client_ip = remote_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Join the two upgraded connections until either side closes
async fn splice(on_client: OnUpgrade, on_upstream: OnUpgrade) {
    match tokio::try_join!(on_client, on_upstream) {
        Ok((client, upstream)) => {
            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((sent, received)) => debug!(sent, received, "Upgraded connection closed"),
                Err(e) => debug!(error = %e, "Upgraded connection ended with error"),
            }
        }
        Err(e) => warn!(error = %e, "Protocol upgrade failed"),
    }
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
