//! Secure listener
//!
//! The ClientHello is read before any TLS configuration exists, so the
//! certificate for its server name can be looked up (or issued) while the
//! handshake waits.

use crate::certificate::CertificateManager;
use crate::config::Timeouts;
use crate::proxy::ReverseProxy;
use crate::timeout::TimeoutIo;
use anyhow::{anyhow, Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Serves the TLS port, forwarding every request through [`ReverseProxy`]
pub struct SecureListener {
    manager: Arc<CertificateManager>,
    proxy: Arc<ReverseProxy>,
    timeouts: Timeouts,
}

impl SecureListener {
    pub fn new(manager: Arc<CertificateManager>, proxy: Arc<ReverseProxy>, timeouts: Timeouts) -> Self {
        Self {
            manager,
            proxy,
            timeouts,
        }
    }

    /// Handshake and serve one TLS connection
    ///
    /// A handshake without a certificate (no SNI, another host, failed
    /// issuance) ends with the socket closed and nothing forwarded. Reading
    /// the ClientHello and finishing the handshake are each bounded by the
    /// read timeout; certificate lookup in between is not.
    pub async fn serve_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
        let io = TimeoutIo::for_handshake(stream, self.timeouts);
        let tunnel = io.tunnel_switch();

        let start = timeout(self.timeouts.read, LazyConfigAcceptor::new(Acceptor::default(), io))
            .await
            .map_err(|_| anyhow!("Timed out waiting for ClientHello"))?
            .context("Failed to read ClientHello")?;

        let server_name = start.client_hello().server_name().map(str::to_string);
        let served = match self
            .manager
            .get_certificate(server_name.as_deref().unwrap_or(""))
            .await
        {
            Ok(served) => served,
            Err(e) => {
                debug!(
                    %remote_addr,
                    server_name = server_name.as_deref().unwrap_or("-"),
                    error = %e,
                    "Refusing TLS handshake"
                );
                return Ok(());
            }
        };

        let config = tls_config(Arc::clone(&served.certified_key))?;
        let mut tls = timeout(self.timeouts.read, start.into_stream(config))
            .await
            .map_err(|_| anyhow!("Timed out completing TLS handshake"))?
            .context("TLS handshake failed")?;
        tls.get_mut().0.start_receiving();

        http1::Builder::new()
            .serve_connection(
                TokioIo::new(tls),
                service_fn(move |req| {
                    let proxy = Arc::clone(&self.proxy);
                    let tunnel = tunnel.clone();
                    async move {
                        let response = proxy.forward(req, remote_addr).await;
                        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                            tunnel.engage();
                        }
                        Ok::<_, Infallible>(response)
                    }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTPS service error: {}", e))
    }
}

/// Server configuration presenting exactly one certificate
pub fn tls_config(certified_key: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ResolvedCertificate(certified_key)));
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    Ok(Arc::new(config))
}

/// The certificate already chosen from the ClientHello
#[derive(Debug)]
struct ResolvedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for ResolvedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}
