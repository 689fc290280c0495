//! Cached key derivation
//!
//! Slow derivation runs once per (organization, key version); the result is
//! held in a concurrent map and handed out as cheap clones. Entries are
//! dropped (and zeroized) when rotation completes or a master secret is
//! swapped.

use crate::crypto::{expand_subkey, WorkingKey};
use crate::error::Result;
use crate::keys::KeyMaterialStore;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Derives and caches per-organization working keys
pub struct KeyService {
    store: Arc<KeyMaterialStore>,
    cache: DashMap<(String, u32), WorkingKey>,
}

impl KeyService {
    pub fn new(store: Arc<KeyMaterialStore>) -> Self {
        KeyService {
            store,
            cache: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<KeyMaterialStore> {
        &self.store
    }

    /// Derive the working key for (organization, key version).
    ///
    /// Fails with `UnknownOrganization` or `UnknownKeyVersion`; never
    /// persists derived material outside process memory.
    pub fn derive(&self, organization_id: &str, version: u32) -> Result<WorkingKey> {
        let cache_key = (organization_id.to_string(), version);
        if let Some(key) = self.cache.get(&cache_key) {
            return Ok(key.clone());
        }

        let material = self.store.get(organization_id)?;
        let params = material.version_params(version)?;
        let key = params
            .params
            .derive(material.master_secret(), &params.salt)?;

        debug!(organization_id, version, "Derived working key");
        self.cache.insert(cache_key, key.clone());
        Ok(key)
    }

    /// Derive the working key for the organization's current active version.
    /// The active version is read fresh from the store on every call.
    pub fn derive_active(&self, organization_id: &str) -> Result<(u32, WorkingKey)> {
        let version = self.store.active_version(organization_id)?;
        Ok((version, self.derive(organization_id, version)?))
    }

    /// Deterministic purpose-bound key material for collaborators
    /// (e.g. a document-store content key). Derived output only; the master
    /// secret itself is never exposed.
    pub fn derive_purpose_key(
        &self,
        organization_id: &str,
        purpose: &[u8],
    ) -> Result<[u8; crate::crypto::KEY_SIZE]> {
        let material = self.store.get(organization_id)?;
        let version = material.active_key_version;
        let salt = material.version_params(version)?.salt.clone();
        let working = self.derive(organization_id, version)?;
        expand_subkey(working.key(), &salt, purpose)
    }

    /// Drop all cached keys for an organization. Called on rotation
    /// completion and master-secret swap; dropped entries are zeroized.
    pub fn invalidate(&self, organization_id: &str) {
        self.cache.retain(|(org, _), _| org != organization_id);
        debug!(organization_id, "Key cache invalidated");
    }

    #[cfg(test)]
    pub(crate) fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DerivationParams;
    use crate::error::Error;

    fn service_with_org(org: &str) -> KeyService {
        let store = Arc::new(KeyMaterialStore::in_memory().unwrap());
        store
            .provision(
                org,
                b"master-secret".to_vec(),
                DerivationParams::Pbkdf2Sha256 { iterations: 10 },
            )
            .unwrap();
        KeyService::new(store)
    }

    #[test]
    fn test_derive_is_cached_and_stable() {
        let service = service_with_org("org-1");

        let k1 = service.derive("org-1", 1).unwrap();
        assert_eq!(service.cached_entries(), 1);

        let k2 = service.derive("org-1", 1).unwrap();
        assert_eq!(k1.key(), k2.key());
        assert_eq!(service.cached_entries(), 1);
    }

    #[test]
    fn test_unknown_version_fails_closed() {
        let service = service_with_org("org-1");
        let result = service.derive("org-1", 42);
        assert!(matches!(result, Err(Error::UnknownKeyVersion { .. })));
    }

    #[test]
    fn test_unknown_organization() {
        let service = service_with_org("org-1");
        let result = service.derive("org-2", 1);
        assert!(matches!(result, Err(Error::UnknownOrganization(_))));
    }

    #[test]
    fn test_different_orgs_different_keys() {
        let store = Arc::new(KeyMaterialStore::in_memory().unwrap());
        let params = DerivationParams::Pbkdf2Sha256 { iterations: 10 };
        // Same secret bytes still yield different keys: the salts differ
        store.provision("org-a", b"secret".to_vec(), params.clone()).unwrap();
        store.provision("org-b", b"secret".to_vec(), params).unwrap();
        let service = KeyService::new(store);

        let ka = service.derive("org-a", 1).unwrap();
        let kb = service.derive("org-b", 1).unwrap();
        assert_ne!(ka.key(), kb.key());
    }

    #[test]
    fn test_invalidate_scoped_to_org() {
        let store = Arc::new(KeyMaterialStore::in_memory().unwrap());
        let params = DerivationParams::Pbkdf2Sha256 { iterations: 10 };
        store.provision("org-a", b"sa".to_vec(), params.clone()).unwrap();
        store.provision("org-b", b"sb".to_vec(), params).unwrap();
        let service = KeyService::new(store);

        service.derive("org-a", 1).unwrap();
        service.derive("org-b", 1).unwrap();
        assert_eq!(service.cached_entries(), 2);

        service.invalidate("org-a");
        assert_eq!(service.cached_entries(), 1);
    }

    #[test]
    fn test_derive_active_follows_activation() {
        let service = service_with_org("org-1");
        let store = service.store().clone();

        let (v, _) = service.derive_active("org-1").unwrap();
        assert_eq!(v, 1);

        store
            .add_version("org-1", DerivationParams::Pbkdf2Sha256 { iterations: 10 })
            .unwrap();
        store.set_active_version("org-1", 2).unwrap();

        let (v, _) = service.derive_active("org-1").unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn test_purpose_keys_deterministic_and_purpose_bound() {
        let service = service_with_org("org-1");

        let k1 = service.derive_purpose_key("org-1", b"document-store").unwrap();
        let k2 = service.derive_purpose_key("org-1", b"document-store").unwrap();
        let other = service.derive_purpose_key("org-1", b"export-signing").unwrap();

        assert_eq!(k1, k2);
        assert_ne!(k1, other);
    }
}
