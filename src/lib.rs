//! tenantseal - Tenant-isolated field and document encryption engine
//!
//! This library derives per-organization encryption keys, performs
//! authenticated encryption of field values and binary documents, produces
//! equality-searchable blind-index tokens, and runs resumable background
//! key-rotation jobs. One organization's key material can never successfully
//! decrypt another's ciphertext.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod document;
pub mod error;
pub mod field;
pub mod keys;
pub mod rotation;
pub mod store;
pub mod verify;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::document::DocumentEncryption;
    pub use crate::error::{Error, Result};
    pub use crate::field::FieldEncryption;
    pub use crate::keys::{KeyMaterialStore, KeyService};
    pub use crate::rotation::{JobStatus, RotationManager};
    pub use crate::verify::{IntegrityVerifier, VerifyOutcome};
}
