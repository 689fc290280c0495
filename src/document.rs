//! Document encryption
//!
//! Encrypts uploaded binary documents for one organization, bound to a
//! specific document id through the AEAD associated data. A blob sealed for
//! document A fails authentication when opened for document B, so ciphertext
//! cannot be swapped between records even inside the same tenant.

use crate::audit::{self, AuditAction};
use crate::crypto::{self, EncryptedBlob};
use crate::error::{Error, Result};
use crate::keys::KeyService;
use bytes::Bytes;
use std::sync::Arc;

/// Default upper bound on document plaintext size: 64 MiB
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 64 * 1024 * 1024;

/// Document encryption service
pub struct DocumentEncryption {
    keys: Arc<KeyService>,
    /// Memory bound: whole-buffer processing is refused above this size
    max_document_bytes: usize,
}

impl DocumentEncryption {
    pub fn new(keys: Arc<KeyService>) -> Self {
        Self::with_limit(keys, DEFAULT_MAX_DOCUMENT_BYTES)
    }

    pub fn with_limit(keys: Arc<KeyService>, max_document_bytes: usize) -> Self {
        DocumentEncryption {
            keys,
            max_document_bytes,
        }
    }

    pub(crate) fn binding_aad(document_id: &str) -> Vec<u8> {
        format!("doc:{}", document_id).into_bytes()
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_document_bytes {
            return Err(Error::DocumentTooLarge {
                size,
                limit: self.max_document_bytes,
            });
        }
        Ok(())
    }

    /// Encrypt a document under the organization's active key version,
    /// bound to `document_id`.
    pub fn encrypt_document(
        &self,
        buffer: &[u8],
        organization_id: &str,
        document_id: &str,
    ) -> Result<String> {
        self.check_size(buffer.len())?;

        let (version, key) = self.keys.derive_active(organization_id)?;
        let blob = crypto::seal(
            key.key(),
            version,
            crypto::org_fingerprint(organization_id),
            buffer,
            &Self::binding_aad(document_id),
        )?;

        audit::record(
            AuditAction::Encrypt,
            organization_id,
            Some(document_id),
            version,
            "ok",
        );
        Ok(blob.encode())
    }

    /// Decrypt a document blob. The supplied `document_id` must match the one
    /// the blob was sealed for; a mismatch fails authentication.
    pub fn decrypt_document(
        &self,
        encoded: &str,
        organization_id: &str,
        document_id: &str,
    ) -> Result<Bytes> {
        let blob = EncryptedBlob::decode(encoded)?;
        self.check_size(blob.ciphertext.len())?;

        if blob.org_fingerprint != crypto::org_fingerprint(organization_id) {
            audit::record(
                AuditAction::Decrypt,
                organization_id,
                Some(document_id),
                blob.key_version,
                "organization_mismatch",
            );
            return Err(Error::OrganizationMismatch(organization_id.to_string()));
        }

        let key = self.keys.derive(organization_id, blob.key_version)?;
        match crypto::open(key.key(), &blob, &Self::binding_aad(document_id)) {
            Ok(plaintext) => {
                audit::record(
                    AuditAction::Decrypt,
                    organization_id,
                    Some(document_id),
                    blob.key_version,
                    "ok",
                );
                Ok(Bytes::from(plaintext))
            }
            Err(e) => {
                audit::record(
                    AuditAction::Decrypt,
                    organization_id,
                    Some(document_id),
                    blob.key_version,
                    "integrity_violation",
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DerivationParams;
    use crate::keys::KeyMaterialStore;

    fn setup(orgs: &[&str]) -> DocumentEncryption {
        let store = Arc::new(KeyMaterialStore::in_memory().unwrap());
        for org in orgs {
            store
                .provision(
                    org,
                    format!("secret-{}", org).into_bytes(),
                    DerivationParams::Pbkdf2Sha256 { iterations: 10 },
                )
                .unwrap();
        }
        DocumentEncryption::new(Arc::new(KeyService::new(store)))
    }

    #[test]
    fn test_roundtrip() {
        let docs = setup(&["org-1"]);
        let content = b"PDF-ish binary \x00\x01\x02 content";

        let blob = docs.encrypt_document(content, "org-1", "doc-42").unwrap();
        let back = docs.decrypt_document(&blob, "org-1", "doc-42").unwrap();
        assert_eq!(back.as_ref(), content);
    }

    #[test]
    fn test_empty_document_roundtrip() {
        let docs = setup(&["org-1"]);

        let blob = docs.encrypt_document(b"", "org-1", "doc-0").unwrap();
        let back = docs.decrypt_document(&blob, "org-1", "doc-0").unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_large_document_roundtrip() {
        let docs = setup(&["org-1"]);
        let content = vec![0x5Au8; 2 * 1024 * 1024];

        let blob = docs.encrypt_document(&content, "org-1", "doc-big").unwrap();
        let back = docs.decrypt_document(&blob, "org-1", "doc-big").unwrap();
        assert_eq!(back.as_ref(), content.as_slice());
    }

    #[test]
    fn test_document_binding() {
        let docs = setup(&["org-1"]);

        let blob = docs
            .encrypt_document(b"invoice scan", "org-1", "doc-a")
            .unwrap();

        // Same org, wrong document id: the binding AAD breaks authentication
        let result = docs.decrypt_document(&blob, "org-1", "doc-b");
        assert!(matches!(result, Err(Error::IntegrityViolation)));

        // Correct id still works
        let back = docs.decrypt_document(&blob, "org-1", "doc-a").unwrap();
        assert_eq!(back.as_ref(), b"invoice scan");
    }

    #[test]
    fn test_tenant_isolation() {
        let docs = setup(&["org-1", "org-2"]);

        let blob = docs
            .encrypt_document(b"contract", "org-1", "doc-a")
            .unwrap();
        let result = docs.decrypt_document(&blob, "org-2", "doc-a");
        assert!(matches!(result, Err(Error::OrganizationMismatch(_))));
    }

    #[test]
    fn test_size_limit_enforced() {
        let store = Arc::new(KeyMaterialStore::in_memory().unwrap());
        store
            .provision(
                "org-1",
                b"secret".to_vec(),
                DerivationParams::Pbkdf2Sha256 { iterations: 10 },
            )
            .unwrap();
        let docs = DocumentEncryption::with_limit(Arc::new(KeyService::new(store)), 1024);

        let result = docs.encrypt_document(&vec![0u8; 2048], "org-1", "doc-a");
        assert!(matches!(
            result,
            Err(Error::DocumentTooLarge { size: 2048, limit: 1024 })
        ));
    }

    #[test]
    fn test_tampered_document_fails() {
        let docs = setup(&["org-1"]);

        let encoded = docs
            .encrypt_document(b"original bytes", "org-1", "doc-a")
            .unwrap();
        let mut blob = EncryptedBlob::decode(&encoded).unwrap();
        blob.ciphertext[3] ^= 0x10;

        let result = docs.decrypt_document(&blob.encode(), "org-1", "doc-a");
        assert!(matches!(result, Err(Error::IntegrityViolation)));
    }
}
