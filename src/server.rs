//! Server runtime
//!
//! Binds both ports, then runs the plaintext and secure accept loops side
//! by side. Neither loop is expected to return; if one does, the whole
//! server stops with an error.

use crate::certificate::CertificateManager;
use crate::config::ProxyConfig;
use crate::plaintext::PlaintextListener;
use crate::proxy::ReverseProxy;
use crate::secure::SecureListener;
use anyhow::{anyhow, bail, Context, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// How often the allowed domain's certificate is checked for renewal
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Main proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    manager: Arc<CertificateManager>,
    proxy: Arc<ReverseProxy>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, manager: Arc<CertificateManager>) -> Self {
        let proxy = Arc::new(ReverseProxy::new(config.upstream.clone()));
        Self {
            config,
            manager,
            proxy,
        }
    }

    pub fn manager(&self) -> &Arc<CertificateManager> {
        &self.manager
    }

    /// Start the proxy server
    ///
    /// Only returns on failure: a bind error, a fatal accept error, or an
    /// accept loop that stopped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let http = TcpListener::bind(self.config.http_addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", self.config.http_addr))?;
        let https = TcpListener::bind(self.config.https_addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener on {}", self.config.https_addr))?;

        info!(
            domain = %self.manager.allowed_domain(),
            upstream = %self.proxy.upstream().authority(),
            "Proxy server starting"
        );
        info!("HTTP server listening on {}", http.local_addr()?);
        info!("HTTPS server listening on {}", https.local_addr()?);

        let renewal = self
            .manager
            .spawn_renewal(self.config.renew_before, RENEWAL_INTERVAL);

        let plaintext = Arc::new(PlaintextListener::new(
            Arc::clone(&self.manager),
            self.config.timeouts,
        ));
        let secure = Arc::new(SecureListener::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.proxy),
            self.config.timeouts,
        ));

        let mut secure_loop = tokio::spawn(accept_loop(https, "HTTPS", move |stream, remote_addr| {
            Arc::clone(&secure).serve_connection(stream, remote_addr)
        }));
        let plaintext_loop = accept_loop(http, "HTTP", move |stream, remote_addr| {
            Arc::clone(&plaintext).serve_connection(stream, remote_addr)
        });

        let (name, outcome) = tokio::select! {
            joined = &mut secure_loop => ("HTTPS", joined.unwrap_or_else(|e| Err(anyhow!(e)))),
            result = plaintext_loop => ("HTTP", result),
        };

        secure_loop.abort();
        renewal.abort();

        match outcome {
            Ok(()) => bail!("{} listener stopped unexpectedly", name),
            Err(e) => Err(e.context(format!("{} listener failed", name))),
        }
    }
}

/// Accept connections until a non-transient error, serving each on its own task
async fn accept_loop<F, Fut>(listener: TcpListener, name: &'static str, serve: F) -> Result<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) if is_transient(&e) => {
                warn!(listener = name, error = %e, "Accept failed, continuing");
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("{} accept failed", name)),
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%remote_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let connection = serve(stream, remote_addr);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("{} connection error from {}: {:#}", name, remote_addr, e);
            }
        });
    }
}

/// Errors that concern one pending connection rather than the listener
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
