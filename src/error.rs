//! Error types shared by the certificate lifecycle and configuration code

use std::io;

use thiserror::Error;

/// Invalid startup configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("allowed domain must not be empty")]
    EmptyDomain,

    #[error("allowed domain {0:?} is not a single host name")]
    InvalidDomain(String),

    #[error("internal host must not be empty")]
    EmptyInternalHost,

    #[error("internal port must be non-zero")]
    InvalidInternalPort,

    #[error("renewal window of {days} days is longer than one year")]
    RenewBeforeTooLong { days: u64 },
}

/// Failures while reading or writing the certificate directory
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("certificate store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("refusing to store certificate for {0:?}")]
    InvalidDomain(String),

    #[error("malformed ACME account credentials: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a certificate could not be produced for a handshake
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("client did not send a server name")]
    MissingServerName,

    #[error("only {allowed} host is allowed (requested {host})")]
    HostNotAllowed { host: String, allowed: String },

    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    #[error("invalid certificate material: {0}")]
    InvalidCertificate(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl CertificateError {
    pub(crate) fn issuance(err: impl std::fmt::Display) -> Self {
        Self::Issuance(err.to_string())
    }

    pub(crate) fn invalid(err: impl std::fmt::Display) -> Self {
        Self::InvalidCertificate(err.to_string())
    }
}
