//! Integrity verification
//!
//! Thin policy layer used in security-sensitive contexts (incident response,
//! periodic sweeps) to assert that a stored blob authenticates correctly and
//! belongs to the tenant it is filed under. Failures are classified so
//! callers can decide whether to alert, quarantine or just log.

use crate::crypto::{self, EncryptedBlob};
use crate::error::{Error, Result};
use crate::keys::KeyService;
use std::sync::Arc;
use tracing::warn;

/// Classification of a verification run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Blob authenticates and belongs to the expected organization
    Ok { key_version: u32 },
    /// Blob was produced under a different organization's key material
    WrongTenant,
    /// Embedded key version was never provisioned for this organization
    UnknownVersion { version: u32 },
    /// Authentication failed: tampering, corruption or a swapped binding
    TamperSuspected,
}

impl VerifyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerifyOutcome::Ok { .. })
    }
}

/// Verifies stored blobs without surfacing plaintext
pub struct IntegrityVerifier {
    keys: Arc<KeyService>,
}

impl IntegrityVerifier {
    pub fn new(keys: Arc<KeyService>) -> Self {
        IntegrityVerifier { keys }
    }

    /// Verify a stored blob against the organization it is filed under.
    ///
    /// Undecodable input is an `InvalidCiphertext` error; everything else is
    /// a classified outcome. Decrypted plaintext is discarded, never returned.
    pub fn verify(&self, encoded: &str, expected_organization_id: &str) -> Result<VerifyOutcome> {
        let blob = EncryptedBlob::decode(encoded)?;

        if blob.org_fingerprint != crypto::org_fingerprint(expected_organization_id) {
            warn!(
                organization_id = expected_organization_id,
                key_version = blob.key_version,
                "Blob fingerprint does not match expected tenant"
            );
            return Ok(VerifyOutcome::WrongTenant);
        }

        let key = match self.keys.derive(expected_organization_id, blob.key_version) {
            Ok(key) => key,
            Err(Error::UnknownKeyVersion { version, .. }) => {
                warn!(
                    organization_id = expected_organization_id,
                    version, "Blob references unknown key version"
                );
                return Ok(VerifyOutcome::UnknownVersion { version });
            }
            Err(e) => return Err(e),
        };

        match crypto::open(key.key(), &blob, &[]) {
            Ok(_) => Ok(VerifyOutcome::Ok {
                key_version: blob.key_version,
            }),
            Err(Error::IntegrityViolation) => {
                warn!(
                    organization_id = expected_organization_id,
                    key_version = blob.key_version,
                    "Blob failed authentication"
                );
                Ok(VerifyOutcome::TamperSuspected)
            }
            Err(e) => Err(e),
        }
    }
}
