//! Certificate lifecycle for the single allowed domain
//!
//! The [`CertificateManager`] decides, for every TLS handshake, whether to
//! serve a cached certificate, issue a new one, or refuse. Per domain the
//! lifecycle is
//!
//! ```text
//! NoCertificate -> Issuing -> Valid -> Expired -> Issuing -> Valid -> ...
//! ```
//!
//! `Issuing` is guarded by a per-domain lock: handshakes arriving while an
//! issuance run is in flight wait for it and reuse its result.

mod challenge;
mod issuer;
mod locks;
mod store;

pub use challenge::{PendingChallengeGuard, PendingChallenges, ACME_CHALLENGE_PREFIX};
pub use issuer::{AcmeIssuer, Issuer, SelfSignedIssuer};
pub use locks::KeyedLocks;
pub use store::CertificateStore;

use crate::config::ProxyConfig;
use crate::error::CertificateError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Certificate chain and key for one domain
#[derive(Clone)]
pub struct CertificateRecord {
    pub domain: String,
    /// PEM chain, leaf first
    pub cert_pem: String,
    /// PEM private key
    pub key_pem: String,
    /// `notAfter` of the leaf certificate
    pub expires: DateTime<Utc>,
}

impl CertificateRecord {
    /// Parse PEM material, reading the expiry from the leaf certificate
    pub fn from_pem(
        domain: &str,
        cert_pem: String,
        key_pem: String,
    ) -> Result<Self, CertificateError> {
        let chain = parse_chain(&cert_pem)?;
        parse_key(&key_pem)?;

        let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref())
            .map_err(CertificateError::invalid)?;
        let expires = DateTime::from_timestamp(leaf.validity().not_after.timestamp(), 0)
            .ok_or_else(|| CertificateError::invalid("expiry out of range"))?;

        Ok(Self {
            domain: domain.to_string(),
            cert_pem,
            key_pem,
            expires,
        })
    }

    /// Servable only strictly before expiry
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires
    }

    /// Build the rustls signing material for this record
    pub fn served(self) -> Result<ServedCertificate, CertificateError> {
        let chain = parse_chain(&self.cert_pem)?;
        let key = parse_key(&self.key_pem)?;
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&key).map_err(CertificateError::invalid)?;

        Ok(ServedCertificate {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            record: self,
        })
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("domain", &self.domain)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

fn parse_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let chain = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(CertificateError::invalid)?;
    if chain.is_empty() {
        return Err(CertificateError::invalid("no certificate in PEM data"));
    }
    Ok(chain)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, CertificateError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(CertificateError::invalid)?
        .ok_or_else(|| CertificateError::invalid("no private key in PEM data"))
}

/// A record ready to be presented during a handshake
#[derive(Debug)]
pub struct ServedCertificate {
    pub record: CertificateRecord,
    pub certified_key: Arc<CertifiedKey>,
}

/// Lowercase, without a trailing dot
pub fn normalize_host(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Owns issuance policy and the served-certificate cache
pub struct CertificateManager {
    allowed_domain: String,
    store: Arc<CertificateStore>,
    issuer: Arc<dyn Issuer>,
    challenges: PendingChallenges,
    served: DashMap<String, Arc<ServedCertificate>>,
    issuing: KeyedLocks,
}

impl CertificateManager {
    pub fn new(
        allowed_domain: &str,
        store: Arc<CertificateStore>,
        issuer: Arc<dyn Issuer>,
        challenges: PendingChallenges,
    ) -> Self {
        Self {
            allowed_domain: normalize_host(allowed_domain),
            store,
            issuer,
            challenges,
            served: DashMap::new(),
            issuing: KeyedLocks::new(),
        }
    }

    /// Open the store and pick the issuer the configuration asks for
    pub fn from_config(config: &ProxyConfig) -> Result<Self, CertificateError> {
        let store = Arc::new(CertificateStore::new(&config.certs_dir)?);
        let challenges = PendingChallenges::new();

        let issuer: Arc<dyn Issuer> = if config.self_signed {
            warn!("Self-signed certificates enabled; clients will not trust them");
            Arc::new(SelfSignedIssuer::new())
        } else {
            Arc::new(AcmeIssuer::new(
                config.acme.clone(),
                Arc::clone(&store),
                challenges.clone(),
            ))
        };

        Ok(Self::new(&config.allowed_domain, store, issuer, challenges))
    }

    pub fn allowed_domain(&self) -> &str {
        &self.allowed_domain
    }

    pub fn challenges(&self) -> &PendingChallenges {
        &self.challenges
    }

    /// Host policy: only the allowed domain is ever accepted
    pub fn decide_host(&self, host: &str) -> Result<(), CertificateError> {
        if normalize_host(host) == self.allowed_domain {
            Ok(())
        } else {
            Err(CertificateError::HostNotAllowed {
                host: host.to_string(),
                allowed: self.allowed_domain.clone(),
            })
        }
    }

    /// Certificate to present for a handshake naming `server_name`
    ///
    /// Nothing is read from disk or requested from the issuer for names the
    /// host policy rejects. Failed issuance is not remembered; the next
    /// handshake tries again.
    pub async fn get_certificate(
        &self,
        server_name: &str,
    ) -> Result<Arc<ServedCertificate>, CertificateError> {
        let domain = normalize_host(server_name);
        if domain.is_empty() {
            return Err(CertificateError::MissingServerName);
        }
        if let Err(e) = self.decide_host(&domain) {
            debug!(server_name = %server_name, "Rejected handshake by host policy");
            return Err(e);
        }

        if let Some(served) = self.valid_cached(&domain) {
            trace!(domain = %domain, "Serving cached certificate");
            return Ok(served);
        }

        let _issuing = self.issuing.lock(&domain).await;

        // Another handshake may have finished issuing while this one waited
        if let Some(served) = self.valid_cached(&domain) {
            return Ok(served);
        }

        if let Some(record) = self.store.load(&domain).await? {
            if record.is_valid_at(Utc::now()) {
                info!(domain = %domain, expires = %record.expires, "Using stored certificate");
                return self.install(record);
            }
            info!(domain = %domain, expired = %record.expires, "Stored certificate expired");
        }

        self.issue_locked(&domain).await
    }

    /// Expected body for a challenge request path, if it is one we are waiting on
    pub fn handle_challenge(&self, path: &str) -> Option<String> {
        let token = PendingChallenges::extract_token(path)?;
        self.challenges.response(token)
    }

    /// Re-issue the allowed domain's certificate when it expires within `renew_before`
    ///
    /// Returns whether a new certificate was issued. A domain that never had
    /// a certificate is left to the first handshake.
    pub async fn renew_if_due(&self, renew_before: Duration) -> Result<bool, CertificateError> {
        let domain = self.allowed_domain.clone();
        let _issuing = self.issuing.lock(&domain).await;

        let cached = self.served.get(&domain).map(|s| s.record.expires);
        let current = match cached {
            Some(expires) => Some(expires),
            None => self.store.load(&domain).await?.map(|r| r.expires),
        };
        let Some(expires) = current else {
            return Ok(false);
        };

        // Already expired counts as zero time left
        let remaining = (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining > renew_before {
            debug!(domain = %domain, expires = %expires, "Certificate not due for renewal");
            return Ok(false);
        }

        info!(domain = %domain, expires = %expires, "Renewing certificate");
        self.issue_locked(&domain).await?;
        Ok(true)
    }

    /// Check for renewal now and then every `interval`
    pub fn spawn_renewal(self: &Arc<Self>, renew_before: Duration, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match manager.renew_if_due(renew_before).await {
                    Ok(true) => info!(domain = %manager.allowed_domain, "Certificate renewed"),
                    Ok(false) => {}
                    Err(e) => warn!(domain = %manager.allowed_domain, error = %e, "Certificate renewal failed"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    fn valid_cached(&self, domain: &str) -> Option<Arc<ServedCertificate>> {
        let served = self.served.get(domain)?;
        served
            .record
            .is_valid_at(Utc::now())
            .then(|| Arc::clone(&served))
    }

    /// Caller must hold the issuing lock for `domain`
    async fn issue_locked(&self, domain: &str) -> Result<Arc<ServedCertificate>, CertificateError> {
        info!(domain = %domain, "Requesting certificate");

        let record = match self.issuer.issue(domain).await {
            Ok(record) => record,
            Err(e) => {
                warn!(domain = %domain, error = %e, "Certificate issuance failed");
                return Err(e);
            }
        };
        if !record.is_valid_at(Utc::now()) {
            return Err(CertificateError::invalid("issued certificate is already expired"));
        }

        // Keep the fresh certificate servable even if persisting it fails
        let served = self.install(record)?;
        self.store.save(domain, &served.record).await?;

        info!(domain = %domain, expires = %served.record.expires, "Certificate issued");
        Ok(served)
    }

    fn install(&self, record: CertificateRecord) -> Result<Arc<ServedCertificate>, CertificateError> {
        let domain = record.domain.clone();
        let served = Arc::new(record.served()?);
        self.served.insert(domain, Arc::clone(&served));
        Ok(served)
    }
}
