//! Versioned slow key derivation
//!
//! Each key version of an organization records the parameter set it was
//! derived with. The supported sets form a closed enum, so an unrecognized
//! version can only fail closed instead of silently falling back.

use crate::crypto::{KEY_SIZE, PBKDF2_ITERATIONS};
use crate::error::{Error, Result};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use zeroize::Zeroizing;

/// Derivation parameter set for one key version.
///
/// Externally tagged so it round-trips through bincode (internally tagged
/// enums require self-describing formats).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DerivationParams {
    /// PBKDF2-HMAC-SHA256 with a fixed iteration count
    Pbkdf2Sha256 { iterations: u32 },

    /// Argon2id, memory-hard variant for newer key versions
    Argon2id {
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
    },
}

impl Default for DerivationParams {
    fn default() -> Self {
        DerivationParams::Pbkdf2Sha256 {
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

/// A derived 256-bit working key, zeroized on drop
#[derive(Clone)]
pub struct WorkingKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl WorkingKey {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        WorkingKey {
            key: Zeroizing::new(key),
        }
    }

    /// Get the raw key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for WorkingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never leak through Debug output
        f.write_str("WorkingKey(..)")
    }
}

impl DerivationParams {
    /// Derive a working key from an organization master secret and a
    /// per-version salt. Deliberately slow; results are cached upstream.
    pub fn derive(&self, master_secret: &[u8], salt: &[u8]) -> Result<WorkingKey> {
        let mut output = Zeroizing::new([0u8; KEY_SIZE]);

        match self {
            DerivationParams::Pbkdf2Sha256 { iterations } => {
                let iterations = NonZeroU32::new(*iterations).ok_or_else(|| {
                    Error::KeyDerivation("PBKDF2 iteration count must be non-zero".to_string())
                })?;
                pbkdf2::derive(
                    pbkdf2::PBKDF2_HMAC_SHA256,
                    iterations,
                    salt,
                    master_secret,
                    output.as_mut(),
                );
            }
            DerivationParams::Argon2id {
                memory_kib,
                iterations,
                parallelism,
            } => {
                let params = argon2::Params::new(
                    *memory_kib,
                    *iterations,
                    *parallelism,
                    Some(KEY_SIZE),
                )
                .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 params: {}", e)))?;
                let argon2 = argon2::Argon2::new(
                    argon2::Algorithm::Argon2id,
                    argon2::Version::V0x13,
                    params,
                );
                argon2
                    .hash_password_into(master_secret, salt, output.as_mut())
                    .map_err(|e| Error::KeyDerivation(format!("Argon2 failed: {}", e)))?;
            }
        }

        Ok(WorkingKey::new(*output))
    }
}

/// HKDF key type for ring
struct HkdfKeyType;

impl hkdf::KeyType for HkdfKeyType {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}

/// Expand a purpose-specific subkey from a working key.
///
/// Used for the per-blob AEAD subkey and the search-token MAC key. Fast
/// (HKDF-SHA256), in contrast to the slow master-secret derivation above.
pub fn expand_subkey(key: &[u8; KEY_SIZE], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let salt = Salt::new(HKDF_SHA256, salt);
    let prk = salt.extract(key);

    let mut output = [0u8; KEY_SIZE];
    prk.expand(&[info], HkdfKeyType)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
        .fill(&mut output)
        .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;

    Ok(output)
}
