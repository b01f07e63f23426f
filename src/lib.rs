//! Veryxorp - A single-domain TLS-terminating reverse proxy
//!
//! - Certificates for exactly one allowed domain, issued on first
//!   handshake through ACME HTTP-01 and kept on disk
//! - Plain HTTP answers ACME challenges and redirects everything else
//!   to HTTPS
//! - HTTPS requests are forwarded to one internal upstream
//! - Read, write and idle deadlines on every connection

pub mod certificate;
pub mod config;
pub mod error;
pub mod plaintext;
pub mod proxy;
pub mod secure;
pub mod server;
pub mod timeout;

pub use certificate::{CertificateManager, CertificateRecord, CertificateStore, Issuer};
pub use config::{ProxyConfig, Timeouts, UpstreamTarget};
pub use error::{CertificateError, ConfigError, StoreError};
pub use proxy::ReverseProxy;
pub use server::ProxyServer;
