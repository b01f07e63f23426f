//! Proxy configuration
//!
//! Built once at startup and handed to every component; nothing here is
//! mutated after the listeners start.

use crate::error::ConfigError;
use hyper::Uri;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Default certificate directory
pub const DEFAULT_CERTS_DIR: &str = "/certs";

/// The single backend every secure request is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing bare IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Absolute upstream URI for an incoming request target
    pub fn uri_for(&self, path_and_query: &str) -> Result<Uri, hyper::http::uri::InvalidUri> {
        format!("http://{}{}", self.authority(), path_and_query).parse()
    }
}

/// Per-connection deadlines applied by both listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Longest a request may take to arrive, counted from its first byte
    pub read: Duration,
    /// Longest a write or flush may stall
    pub write: Duration,
    /// Longest a keep-alive connection may wait for its next request, and
    /// longest an upgraded connection may stay silent
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
            idle: Duration::from_secs(120),
        }
    }
}

/// ACME account and directory settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeSettings {
    pub directory_url: String,
    pub contact: Option<String>,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_DIRECTORY_URL.to_string(),
            contact: None,
        }
    }
}

/// Longest renewal window accepted; certificates never live this long
pub const MAX_RENEW_BEFORE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Dot-separated labels of ASCII letters, digits and `-`
///
/// Also the rule for certificate file names, so every accepted domain can
/// be stored.
pub fn is_plain_host_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// The only host name certificates are ever requested or served for
    pub allowed_domain: String,
    pub upstream: UpstreamTarget,
    pub certs_dir: PathBuf,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub timeouts: Timeouts,
    pub acme: AcmeSettings,
    /// Re-issue this long before the current certificate expires
    pub renew_before: Duration,
    /// Issue self-signed certificates locally instead of using ACME
    pub self_signed: bool,
}

impl ProxyConfig {
    /// Configuration with the standard ports and timeouts
    pub fn new(allowed_domain: impl Into<String>, upstream: UpstreamTarget) -> Self {
        Self {
            allowed_domain: allowed_domain.into().trim_end_matches('.').to_ascii_lowercase(),
            upstream,
            certs_dir: PathBuf::from(DEFAULT_CERTS_DIR),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80)),
            https_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 443)),
            timeouts: Timeouts::default(),
            acme: AcmeSettings::default(),
            renew_before: Duration::from_secs(30 * 24 * 60 * 60),
            self_signed: false,
        }
    }

    /// Reject values that would widen certificate issuance or break forwarding
    pub fn validate(&self) -> Result<(), ConfigError> {
        let domain = &self.allowed_domain;
        if domain.is_empty() {
            return Err(ConfigError::EmptyDomain);
        }
        if !is_plain_host_name(domain) {
            return Err(ConfigError::InvalidDomain(domain.clone()));
        }
        if self.upstream.host.trim().is_empty() {
            return Err(ConfigError::EmptyInternalHost);
        }
        if self.upstream.port == 0 {
            return Err(ConfigError::InvalidInternalPort);
        }
        if self.renew_before > MAX_RENEW_BEFORE {
            return Err(ConfigError::RenewBeforeTooLong {
                days: self.renew_before.as_secs() / (24 * 60 * 60),
            });
        }
        Ok(())
    }
}
