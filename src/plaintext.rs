//! Plaintext listener
//!
//! Answers pending ACME HTTP-01 challenges and sends every other request
//! to the `https://` version of the same URL.

use crate::certificate::CertificateManager;
use crate::config::Timeouts;
use crate::proxy::{empty_body, text_response, ProxyBody};
use crate::timeout::TimeoutIo;
use anyhow::{anyhow, Result};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Serves the insecure port
pub struct PlaintextListener {
    manager: Arc<CertificateManager>,
    timeouts: Timeouts,
}

impl PlaintextListener {
    pub fn new(manager: Arc<CertificateManager>, timeouts: Timeouts) -> Self {
        Self { manager, timeouts }
    }

    /// Handle a single HTTP connection
    pub async fn serve_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let io = TokioIo::new(TimeoutIo::new(stream, self.timeouts));

        http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let listener = Arc::clone(&self);
                    async move { Ok::<_, Infallible>(listener.route(req, remote_addr)) }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Challenge answer if one is pending for this path, otherwise a redirect
    pub fn route(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        let path = req.uri().path();

        if let Some(key_authorization) = self.manager.handle_challenge(path) {
            info!(%path, %remote_addr, "Answered ACME challenge");
            return text_response(StatusCode::OK, &key_authorization);
        }

        match redirect_target(&req) {
            Some(location) => {
                debug!(from = %req.uri(), to = %location, "Redirecting HTTP to HTTPS");
                redirect_response(&location)
            }
            None => text_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        }
    }
}

/// `https://` URL with the original host, path and query
///
/// Any host is redirected, not only the allowed domain; certificates are
/// still only ever served for the allowed domain.
pub fn redirect_target<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .filter(|h| !h.is_empty())?;

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Some(format!("https://{host}{path_and_query}"))
}

/// Create redirect response
fn redirect_response(location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(location) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::FOUND;
            response.headers_mut().insert(LOCATION, location);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Bad Request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_redirect_preserves_path_and_query() {
        let req = request("/a/b?x=1", Some("example.com"));
        assert_eq!(
            redirect_target(&req).as_deref(),
            Some("https://example.com/a/b?x=1")
        );
    }

    #[test]
    fn test_redirect_root() {
        let req = request("/", Some("example.com"));
        assert_eq!(redirect_target(&req).as_deref(), Some("https://example.com/"));
    }

    #[test]
    fn test_redirect_keeps_unlisted_hosts() {
        let req = request("/login", Some("other.example.net"));
        assert_eq!(
            redirect_target(&req).as_deref(),
            Some("https://other.example.net/login")
        );
    }

    #[test]
    fn test_redirect_absolute_form_without_host() {
        let req = request("http://example.com/a?b=c", None);
        assert_eq!(
            redirect_target(&req).as_deref(),
            Some("https://example.com/a?b=c")
        );
    }

    #[test]
    fn test_redirect_requires_host() {
        let req = request("/a", None);
        assert!(redirect_target(&req).is_none());
    }

    #[test]
    fn test_redirect_response_is_found() {
        let response = redirect_response("https://example.com/a/b?x=1");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://example.com/a/b?x=1"
        );
    }
}
