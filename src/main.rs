//! Veryxorp - Main entry point
//!
//! A single-domain TLS-terminating reverse proxy

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use veryxorp::config::{AcmeSettings, DEFAULT_CERTS_DIR, LETS_ENCRYPT_DIRECTORY_URL};
use veryxorp::{CertificateManager, ProxyConfig, ProxyServer, Timeouts, UpstreamTarget};

/// Veryxorp - TLS in front of one internal service, for one domain
#[derive(Parser, Debug)]
#[command(name = "veryxorp")]
#[command(author = "Veryxorp Contributors")]
#[command(version)]
#[command(about = "A single-domain TLS-terminating reverse proxy with automatic certificates")]
struct Args {
    /// Certificate cache directory
    #[arg(long, env = "CERTS_DIR", default_value = DEFAULT_CERTS_DIR)]
    certs_dir: PathBuf,

    /// The only domain certificates are issued for
    #[arg(long, env = "ALLOWED_DOMAIN")]
    allowed_domain: String,

    /// Upstream host every HTTPS request is forwarded to
    #[arg(long, env = "INTERNAL_HOST")]
    internal_host: String,

    /// Upstream port
    #[arg(long, env = "INTERNAL_PORT")]
    internal_port: u16,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "80")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "443")]
    https_port: u16,

    /// Address both listeners bind to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Seconds a request (or TLS handshake) may take to arrive
    #[arg(long, default_value = "5")]
    read_timeout_secs: u64,

    /// Seconds a write may stall
    #[arg(long, default_value = "5")]
    write_timeout_secs: u64,

    /// Seconds a keep-alive connection may sit idle
    #[arg(long, default_value = "120")]
    idle_timeout_secs: u64,

    /// ACME directory URL (Let's Encrypt)
    #[arg(long, env = "ACME_DIRECTORY_URL", default_value = LETS_ENCRYPT_DIRECTORY_URL)]
    acme_directory_url: String,

    /// Contact e-mail for the ACME account
    #[arg(long, env = "ACME_CONTACT")]
    acme_contact: Option<String>,

    /// Renew certificates this many days before they expire
    #[arg(long, env = "RENEW_BEFORE_DAYS", default_value = "30")]
    renew_before_days: u64,

    /// Issue self-signed certificates instead of using ACME
    #[arg(long, env = "SELF_SIGNED", default_value = "false")]
    self_signed: bool,

    /// Write logs to this file instead of stdout
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        let upstream = UpstreamTarget::new(self.internal_host, self.internal_port);
        let mut config = ProxyConfig::new(self.allowed_domain, upstream);

        config.certs_dir = self.certs_dir;
        config.http_addr = SocketAddr::new(self.bind_address, self.http_port);
        config.https_addr = SocketAddr::new(self.bind_address, self.https_port);
        config.timeouts = Timeouts {
            read: Duration::from_secs(self.read_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
            idle: Duration::from_secs(self.idle_timeout_secs),
        };
        config.acme = AcmeSettings {
            directory_url: self.acme_directory_url,
            contact: self.acme_contact,
        };
        config.renew_before = Duration::from_secs(self.renew_before_days.saturating_mul(24 * 60 * 60));
        config.self_signed = self.self_signed;
        config
    }
}

/// Install the global subscriber; the guard must live as long as logging does
fn init_logging(log_level: &str, log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            builder.with_ansi(false).with_writer(writer).init();
            Ok(Some(guard))
        }
        None => {
            builder.compact().init();
            Ok(None)
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _log_guard = init_logging(&args.log_level, args.log_file.as_ref())?;

    info!("Starting Veryxorp v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();
    config.validate().context("Invalid configuration")?;

    info!("Allowed domain: {}", config.allowed_domain);
    info!("Upstream: {}", config.upstream.authority());
    info!("Certificates directory: {}", config.certs_dir.display());

    let manager = Arc::new(
        CertificateManager::from_config(&config).context("Failed to initialize certificate manager")?,
    );
    let server = Arc::new(ProxyServer::new(config, manager));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Proxy server stopped: {:#}", e);
            }
            result
        }
        signal = shutdown_signal() => {
            signal?;
            info!("Received shutdown signal");
            Ok(())
        }
    }
}
