//! Cryptography module for tenantseal
//!
//! Provides AES-256-GCM authenticated encryption with versioned slow key
//! derivation. Every blob is self-describing: it carries the key version
//! and an organization fingerprint in an authenticated header.

mod cipher;
mod kdf;

pub use cipher::{open, org_fingerprint, seal, EncryptedBlob};
pub use kdf::{expand_subkey, DerivationParams, WorkingKey};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of the per-blob salt in bytes
pub const SALT_SIZE: usize = 32;

/// Size of the organization fingerprint embedded in each blob
pub const FINGERPRINT_SIZE: usize = 8;

/// Blob format tag (first byte of every encoded blob)
pub const BLOB_FORMAT_V1: u8 = 0x01;

/// Size of the authenticated blob header: format ‖ key version ‖ fingerprint
pub const HEADER_SIZE: usize = 1 + 4 + FINGERPRINT_SIZE;

/// Minimum size of a well-formed blob (header + salt + nonce + tag)
pub const MIN_BLOB_SIZE: usize = HEADER_SIZE + SALT_SIZE + NONCE_SIZE + TAG_SIZE;

/// Fixed PBKDF2 iteration count for version-1 key derivation
pub const PBKDF2_ITERATIONS: u32 = 100_000;
