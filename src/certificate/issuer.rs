//! Certificate issuance
//!
//! [`AcmeIssuer`] drives the ACME protocol against an external authority
//! and proves domain control with HTTP-01. [`SelfSignedIssuer`] produces
//! local certificates for development setups without a public name.

use super::challenge::PendingChallenges;
use super::store::CertificateStore;
use super::CertificateRecord;
use crate::config::AcmeSettings;
use crate::error::{CertificateError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Polls of the order before giving up on the authority
const POLL_ATTEMPTS: u32 = 10;
const INITIAL_POLL_DELAY: Duration = Duration::from_millis(250);
const MAX_POLL_DELAY: Duration = Duration::from_secs(10);

/// Source of new certificates for a domain that already passed host policy
#[async_trait]
pub trait Issuer: Send + Sync {
    async fn issue(&self, domain: &str) -> Result<CertificateRecord, CertificateError>;
}

/// ACME client answering HTTP-01 challenges through [`PendingChallenges`]
pub struct AcmeIssuer {
    settings: AcmeSettings,
    store: Arc<CertificateStore>,
    challenges: PendingChallenges,
    account: OnceCell<Account>,
}

impl AcmeIssuer {
    pub fn new(
        settings: AcmeSettings,
        store: Arc<CertificateStore>,
        challenges: PendingChallenges,
    ) -> Self {
        Self {
            settings,
            store,
            challenges,
            account: OnceCell::new(),
        }
    }

    /// Load the persisted account, registering a new one on first use
    async fn account(&self) -> Result<&Account, CertificateError> {
        self.account
            .get_or_try_init(|| async {
                if let Some(json) = self.store.load_account().await? {
                    let credentials: AccountCredentials =
                        serde_json::from_str(&json).map_err(StoreError::from)?;
                    debug!("Restored ACME account from store");
                    return Account::from_credentials(credentials)
                        .await
                        .map_err(CertificateError::issuance);
                }

                let contact = self.settings.contact.as_deref().map(|c| {
                    if c.starts_with("mailto:") {
                        c.to_string()
                    } else {
                        format!("mailto:{c}")
                    }
                });
                let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contacts,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.settings.directory_url,
                    None,
                )
                .await
                .map_err(CertificateError::issuance)?;

                let json = serde_json::to_string_pretty(&credentials).map_err(StoreError::from)?;
                self.store.save_account(&json).await?;
                info!(directory = %self.settings.directory_url, "Registered ACME account");

                Ok::<_, CertificateError>(account)
            })
            .await
    }
}

#[async_trait]
impl Issuer for AcmeIssuer {
    async fn issue(&self, domain: &str) -> Result<CertificateRecord, CertificateError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(CertificateError::issuance)?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(CertificateError::issuance)?;

        // Challenges stay answerable until this run returns, whatever the outcome
        let mut pending = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                ref status => {
                    return Err(CertificateError::Issuance(format!(
                        "authorization for {domain} is {status:?}"
                    )))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    CertificateError::Issuance(format!("no http-01 challenge offered for {domain}"))
                })?;

            let key_authorization = order.key_authorization(challenge);
            pending.push(
                self.challenges
                    .register(&challenge.token, key_authorization.as_str()),
            );
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(CertificateError::issuance)?;
        }

        wait_until_ready(&mut order, domain).await?;

        let mut params =
            CertificateParams::new(vec![domain.to_string()]).map_err(CertificateError::invalid)?;
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate().map_err(CertificateError::invalid)?;
        let csr = params
            .serialize_request(&key)
            .map_err(CertificateError::invalid)?;

        order
            .finalize(csr.der())
            .await
            .map_err(CertificateError::issuance)?;

        let chain = download_certificate(&mut order, domain).await?;
        drop(pending);

        info!(domain = %domain, "ACME order completed");
        CertificateRecord::from_pem(domain, chain, key.serialize_pem())
    }
}

async fn wait_until_ready(order: &mut Order, domain: &str) -> Result<(), CertificateError> {
    let mut delay = INITIAL_POLL_DELAY;
    for _ in 0..POLL_ATTEMPTS {
        tokio::time::sleep(delay).await;
        let state = order.refresh().await.map_err(CertificateError::issuance)?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => {
                return Err(CertificateError::Issuance(format!(
                    "order for {domain} was rejected by the authority"
                )))
            }
            _ => debug!(domain = %domain, delay_ms = delay.as_millis() as u64, "Order not ready yet"),
        }
        delay = (delay * 2).min(MAX_POLL_DELAY);
    }
    Err(CertificateError::Issuance(format!(
        "order for {domain} did not become ready"
    )))
}

async fn download_certificate(order: &mut Order, domain: &str) -> Result<String, CertificateError> {
    let mut delay = INITIAL_POLL_DELAY;
    for _ in 0..POLL_ATTEMPTS {
        if let Some(chain) = order
            .certificate()
            .await
            .map_err(CertificateError::issuance)?
        {
            return Ok(chain);
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_POLL_DELAY);
    }
    Err(CertificateError::Issuance(format!(
        "certificate for {domain} was never published"
    )))
}

/// Locally signed certificates; browsers will not trust these
#[derive(Debug, Clone)]
pub struct SelfSignedIssuer {
    valid_for: chrono::Duration,
}

impl SelfSignedIssuer {
    pub fn new() -> Self {
        Self {
            valid_for: chrono::Duration::days(90),
        }
    }

    /// Generate a self-signed certificate for `domain` expiring at `not_after`
    pub fn generate(
        domain: &str,
        not_after: DateTime<Utc>,
    ) -> Result<CertificateRecord, CertificateError> {
        let not_before = not_after.min(Utc::now()) - chrono::Duration::days(1);

        let mut params =
            CertificateParams::new(vec![domain.to_string()]).map_err(CertificateError::invalid)?;
        params.distinguished_name.push(DnType::CommonName, domain);
        let (year, month, day) = ymd(not_before)?;
        params.not_before = rcgen::date_time_ymd(year, month, day);
        let (year, month, day) = ymd(not_after)?;
        params.not_after = rcgen::date_time_ymd(year, month, day);

        let key = KeyPair::generate().map_err(CertificateError::invalid)?;
        let cert = params
            .self_signed(&key)
            .map_err(CertificateError::invalid)?;

        CertificateRecord::from_pem(domain, cert.pem(), key.serialize_pem())
    }
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Issuer for SelfSignedIssuer {
    async fn issue(&self, domain: &str) -> Result<CertificateRecord, CertificateError> {
        info!(domain = %domain, "Generating self-signed certificate");
        Self::generate(domain, Utc::now() + self.valid_for)
    }
}

fn ymd(at: DateTime<Utc>) -> Result<(i32, u8, u8), CertificateError> {
    let month = u8::try_from(at.month()).map_err(CertificateError::invalid)?;
    let day = u8::try_from(at.day()).map_err(CertificateError::invalid)?;
    Ok((at.year(), month, day))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_self_signed_covers_domain() {
        let record = SelfSignedIssuer::new().issue("example.com").await.unwrap();

        assert_eq!(record.domain, "example.com");
        assert!(record.is_valid_at(Utc::now()));
        assert!(record.expires > Utc::now() + chrono::Duration::days(80));
        assert!(record.served().is_ok());
    }

    #[test]
    fn test_self_signed_in_the_past_is_expired() {
        let record =
            SelfSignedIssuer::generate("example.com", Utc::now() - chrono::Duration::days(3))
                .unwrap();
        assert!(!record.is_valid_at(Utc::now()));
    }
}
