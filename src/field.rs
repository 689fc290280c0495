//! Field-level encryption
//!
//! Encrypts scalar values (strings, serialized structures) for one
//! organization and produces deterministic search tokens for equality lookup
//! on ciphertext. Decryption across an organization boundary never succeeds;
//! that is the core tenant-isolation guarantee of the engine.

use crate::audit::{self, AuditAction};
use crate::crypto::{self, expand_subkey, EncryptedBlob};
use crate::error::{Error, Result};
use crate::keys::KeyService;
use ring::hmac;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// HKDF salt/info for the search-token MAC key
const SEARCH_TOKEN_SALT: &[u8] = b"tenantseal-search-v1";
const SEARCH_TOKEN_INFO: &[u8] = b"search-token";

/// Field encryption service for all organizations
pub struct FieldEncryption {
    keys: Arc<KeyService>,
}

impl FieldEncryption {
    pub fn new(keys: Arc<KeyService>) -> Self {
        FieldEncryption { keys }
    }

    /// Encrypt a field value under the organization's active key version.
    ///
    /// The active version is read fresh per call so rotation activation is
    /// observed immediately. Returns the opaque storage string.
    pub fn encrypt_field(&self, plaintext: &str, organization_id: &str) -> Result<String> {
        let version = self.keys.store().active_version(organization_id)?;
        self.encrypt_field_with_version(plaintext, organization_id, version)
    }

    /// Encrypt a field value under an explicit key version.
    pub fn encrypt_field_with_version(
        &self,
        plaintext: &str,
        organization_id: &str,
        version: u32,
    ) -> Result<String> {
        let key = self.keys.derive(organization_id, version)?;
        let blob = crypto::seal(
            key.key(),
            version,
            crypto::org_fingerprint(organization_id),
            plaintext.as_bytes(),
            &[],
        )?;
        audit::record(AuditAction::Encrypt, organization_id, None, version, "ok");
        Ok(blob.encode())
    }

    /// Decrypt a field value.
    ///
    /// Fails with `OrganizationMismatch` when the blob belongs to a different
    /// tenant, `UnknownKeyVersion` for versions the organization never had,
    /// `InvalidCiphertext` for malformed input and `IntegrityViolation` when
    /// authentication fails.
    pub fn decrypt_field(&self, encoded: &str, organization_id: &str) -> Result<String> {
        let blob = EncryptedBlob::decode(encoded)?;
        let plaintext = self.open_blob(&blob, organization_id)?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::InvalidCiphertext("plaintext is not valid UTF-8".to_string()))
    }

    /// Encrypt a serializable structure as a JSON field value.
    pub fn encrypt_value<T: Serialize>(
        &self,
        value: &T,
        organization_id: &str,
    ) -> Result<String> {
        let json = serde_json::to_string(value)?;
        self.encrypt_field(&json, organization_id)
    }

    /// Decrypt a JSON field value back into a structure.
    pub fn decrypt_value<T: DeserializeOwned>(
        &self,
        encoded: &str,
        organization_id: &str,
    ) -> Result<T> {
        let json = self.decrypt_field(encoded, organization_id)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Encrypt a field and return its search token alongside the blob.
    /// The blob is non-deterministic; the token is the deterministic
    /// secondary lookup key.
    pub fn encrypt_searchable(
        &self,
        plaintext: &str,
        organization_id: &str,
    ) -> Result<(String, String)> {
        let version = self.keys.store().active_version(organization_id)?;
        let blob = self.encrypt_field_with_version(plaintext, organization_id, version)?;
        let token = self.search_token_with_version(plaintext, organization_id, version)?;
        Ok((blob, token))
    }

    /// Search token under the organization's active key version. Used at
    /// query time, independent of any stored blob.
    pub fn search_token(&self, plaintext: &str, organization_id: &str) -> Result<String> {
        let version = self.keys.store().active_version(organization_id)?;
        self.search_token_with_version(plaintext, organization_id, version)
    }

    /// Deterministic keyed digest of a plaintext for equality search.
    ///
    /// Same (organization, version, plaintext) always yields the same token;
    /// the MAC key is expanded from the organization's working key, so tokens
    /// never collide across organizations for the same plaintext.
    pub fn search_token_with_version(
        &self,
        plaintext: &str,
        organization_id: &str,
        version: u32,
    ) -> Result<String> {
        let key = self.keys.derive(organization_id, version)?;
        let mac_key = expand_subkey(key.key(), SEARCH_TOKEN_SALT, SEARCH_TOKEN_INFO)?;
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, &mac_key);
        let tag = hmac::sign(&hmac_key, plaintext.as_bytes());
        Ok(hex::encode(tag.as_ref()))
    }

    /// Decrypt path: classify tenant mismatch before touching keys,
    /// then authenticate.
    fn open_blob(&self, blob: &EncryptedBlob, organization_id: &str) -> Result<Vec<u8>> {
        if blob.org_fingerprint != crypto::org_fingerprint(organization_id) {
            audit::record(
                AuditAction::Decrypt,
                organization_id,
                None,
                blob.key_version,
                "organization_mismatch",
            );
            return Err(Error::OrganizationMismatch(organization_id.to_string()));
        }

        let key = self.keys.derive(organization_id, blob.key_version)?;
        match crypto::open(key.key(), blob, &[]) {
            Ok(plaintext) => {
                audit::record(
                    AuditAction::Decrypt,
                    organization_id,
                    None,
                    blob.key_version,
                    "ok",
                );
                Ok(plaintext)
            }
            Err(e) => {
                audit::record(
                    AuditAction::Decrypt,
                    organization_id,
                    None,
                    blob.key_version,
                    "integrity_violation",
                );
                Err(e)
            }
        }
    }
}
