//! On-disk certificate cache
//!
//! # Directory Structure
//!
//! ```text
//! certs/
//! ├── acme_account.json   # ACME account credentials
//! ├── example.com.crt     # PEM certificate chain, leaf first
//! └── example.com.key     # PEM private key
//! ```
//!
//! Files are replaced by writing a temporary sibling and renaming it, so a
//! reader never observes a partially written certificate.

use super::locks::KeyedLocks;
use super::CertificateRecord;
use crate::config::is_plain_host_name;
use crate::error::StoreError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const ACCOUNT_FILE: &str = "acme_account.json";

/// Durable certificate storage keyed by domain
#[derive(Debug)]
pub struct CertificateStore {
    dir: PathBuf,
    write_locks: KeyedLocks,
}

impl CertificateStore {
    /// Open the store, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        info!(certs_dir = %dir.display(), "Opened certificate store");

        Ok(Self {
            dir,
            write_locks: KeyedLocks::new(),
        })
    }

    /// File stem for a domain; anything that could escape the directory is refused
    fn file_stem(domain: &str) -> Result<&str, StoreError> {
        if is_plain_host_name(domain) {
            Ok(domain)
        } else {
            Err(StoreError::InvalidDomain(domain.to_string()))
        }
    }

    fn cert_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.crt"))
    }

    fn key_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.key"))
    }

    /// Load the stored record for `domain`
    ///
    /// Missing files mean no record. Files that exist but do not parse are
    /// reported as absent so the next issuance replaces them.
    pub async fn load(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        let stem = Self::file_stem(domain)?;

        let Some(cert_pem) = read_optional(&self.cert_path(stem)).await? else {
            debug!(domain = %domain, "No stored certificate");
            return Ok(None);
        };
        let Some(key_pem) = read_optional(&self.key_path(stem)).await? else {
            warn!(domain = %domain, "Stored certificate has no private key");
            return Ok(None);
        };

        match CertificateRecord::from_pem(domain, cert_pem, key_pem) {
            Ok(record) => {
                debug!(domain = %domain, expires = %record.expires, "Loaded stored certificate");
                Ok(Some(record))
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Ignoring unreadable stored certificate");
                Ok(None)
            }
        }
    }

    /// Persist `record`, replacing any previous one for the same domain
    pub async fn save(&self, domain: &str, record: &CertificateRecord) -> Result<(), StoreError> {
        let stem = Self::file_stem(domain)?;
        let _guard = self.write_locks.lock(stem).await;

        // Key first: a new chain must never be paired with the old key
        write_atomic(&self.key_path(stem), record.key_pem.as_bytes(), 0o600).await?;
        write_atomic(&self.cert_path(stem), record.cert_pem.as_bytes(), 0o644).await?;

        info!(domain = %domain, expires = %record.expires, "Saved certificate to store");
        Ok(())
    }

    /// Raw ACME account credentials, if an account was created before
    pub async fn load_account(&self) -> Result<Option<String>, StoreError> {
        read_optional(&self.dir.join(ACCOUNT_FILE)).await
    }

    pub async fn save_account(&self, credentials_json: &str) -> Result<(), StoreError> {
        let _guard = self.write_locks.lock(ACCOUNT_FILE).await;
        write_atomic(&self.dir.join(ACCOUNT_FILE), credentials_json.as_bytes(), 0o600).await?;
        info!("Saved ACME account credentials");
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}
