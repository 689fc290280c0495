//! Error types for tenantseal

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tenantseal
#[derive(Error, Debug)]
pub enum Error {
    // Tenancy errors
    #[error("Unknown organization: {0}")]
    UnknownOrganization(String),

    #[error("Organization already exists: {0}")]
    OrganizationAlreadyExists(String),

    #[error("Organization mismatch: ciphertext does not belong to {0}")]
    OrganizationMismatch(String),

    // Crypto errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Integrity violation: authentication tag verification failed")]
    IntegrityViolation,

    #[error("Unknown key version {version} for organization {organization_id}")]
    UnknownKeyVersion {
        organization_id: String,
        version: u32,
    },

    // Rotation errors
    #[error("Rotation already in progress for organization {0}")]
    RotationAlreadyInProgress(String),

    #[error("Rotation job not found: {0}")]
    RotationJobNotFound(String),

    #[error("Rotation job {job_id} exceeded failure threshold: {failed} records failed")]
    RotationBatchFailure { job_id: String, failed: u64 },

    #[error("Master secret rotation in progress for organization {0}")]
    MasterSecretRotationInProgress(String),

    // Document errors
    #[error("Document too large: {size} bytes exceeds limit of {limit} bytes")]
    DocumentTooLarge { size: usize, limit: usize },

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures that indicate tampering, corruption or a
    /// wrong-tenant access attempt rather than an operational fault.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Error::OrganizationMismatch(_)
                | Error::IntegrityViolation
                | Error::InvalidCiphertext(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
