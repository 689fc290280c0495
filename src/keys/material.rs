//! Per-organization key material
//!
//! One `OrganizationKeyMaterial` record per tenant, exclusively owned by this
//! engine. The master secret never leaves the store API in plaintext; callers
//! only ever see keys derived from it.

use crate::crypto::{DerivationParams, SALT_SIZE};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use zeroize::Zeroize;

/// Derivation inputs for one key version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyVersionParams {
    /// Per-version derivation salt
    #[serde(with = "hex_serde")]
    pub salt: Vec<u8>,
    /// Parameter set used to derive this version's working key
    pub params: DerivationParams,
    /// When this version was provisioned
    pub created: DateTime<Utc>,
}

/// Key material for a single organization
#[derive(Clone, Serialize, Deserialize)]
pub struct OrganizationKeyMaterial {
    pub organization_id: String,
    /// Opaque master secret. Never logged, never exposed.
    master_secret: Vec<u8>,
    pub active_key_version: u32,
    pub versions: BTreeMap<u32, KeyVersionParams>,
    pub created: DateTime<Utc>,
}

impl OrganizationKeyMaterial {
    pub(crate) fn master_secret(&self) -> &[u8] {
        &self.master_secret
    }

    /// Parameters for a specific key version, failing closed on unknown tags
    pub fn version_params(&self, version: u32) -> Result<&KeyVersionParams> {
        self.versions
            .get(&version)
            .ok_or_else(|| Error::UnknownKeyVersion {
                organization_id: self.organization_id.clone(),
                version,
            })
    }
}

impl Drop for OrganizationKeyMaterial {
    fn drop(&mut self) {
        self.master_secret.zeroize();
    }
}

impl std::fmt::Debug for OrganizationKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrganizationKeyMaterial")
            .field("organization_id", &self.organization_id)
            .field("master_secret", &"<redacted>")
            .field("active_key_version", &self.active_key_version)
            .field("versions", &self.versions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Sled-backed store of organization key material
pub struct KeyMaterialStore {
    db: Db,
    organizations: Tree,
    /// Serializes read-modify-write cycles (version activation, secret swap)
    write_lock: Mutex<()>,
}

impl KeyMaterialStore {
    /// Open or create a key material store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::with_db(db)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self> {
        let organizations = db.open_tree("org_keys")?;
        info!(count = organizations.len(), "Key material store opened");
        Ok(KeyMaterialStore {
            db,
            organizations,
            write_lock: Mutex::new(()),
        })
    }

    fn random_salt() -> Vec<u8> {
        let mut salt = vec![0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        salt
    }

    fn save(&self, material: &OrganizationKeyMaterial) -> Result<()> {
        let bytes = bincode::serialize(material)?;
        self.organizations
            .insert(material.organization_id.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Provision key material for a new organization.
    ///
    /// Creates version 1 with a fresh salt and marks it active. Fails if the
    /// organization already has material.
    pub fn provision(
        &self,
        organization_id: &str,
        master_secret: Vec<u8>,
        params: DerivationParams,
    ) -> Result<OrganizationKeyMaterial> {
        if organization_id.is_empty() {
            return Err(Error::Internal(
                "Organization id cannot be empty".to_string(),
            ));
        }
        if master_secret.is_empty() {
            return Err(Error::Internal("Master secret cannot be empty".to_string()));
        }

        let _guard = self.write_lock.lock();

        if self.organizations.contains_key(organization_id.as_bytes())? {
            return Err(Error::OrganizationAlreadyExists(organization_id.to_string()));
        }

        let mut versions = BTreeMap::new();
        versions.insert(
            1,
            KeyVersionParams {
                salt: Self::random_salt(),
                params,
                created: Utc::now(),
            },
        );

        let material = OrganizationKeyMaterial {
            organization_id: organization_id.to_string(),
            master_secret,
            active_key_version: 1,
            versions,
            created: Utc::now(),
        };

        self.save(&material)?;
        info!(organization_id, "Provisioned key material");
        Ok(material)
    }

    /// Load an organization's key material
    pub fn get(&self, organization_id: &str) -> Result<OrganizationKeyMaterial> {
        match self.organizations.get(organization_id.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(Error::UnknownOrganization(organization_id.to_string())),
        }
    }

    pub fn exists(&self, organization_id: &str) -> Result<bool> {
        Ok(self.organizations.contains_key(organization_id.as_bytes())?)
    }

    /// Fresh read of the active key version. Called per encrypt operation so
    /// rotation activation is observed promptly.
    pub fn active_version(&self, organization_id: &str) -> Result<u32> {
        Ok(self.get(organization_id)?.active_key_version)
    }

    /// Register the next key version with a fresh salt. Does not activate it;
    /// activation happens when a rotation job completes.
    pub fn add_version(
        &self,
        organization_id: &str,
        params: DerivationParams,
    ) -> Result<u32> {
        let _guard = self.write_lock.lock();

        let mut material = self.get(organization_id)?;
        let next = material
            .versions
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            + 1;
        material.versions.insert(
            next,
            KeyVersionParams {
                salt: Self::random_salt(),
                params,
                created: Utc::now(),
            },
        );
        self.save(&material)?;

        info!(organization_id, version = next, "Registered key version");
        Ok(next)
    }

    /// Activate a key version. All encryptions after this call use the new
    /// version; older versions remain decryptable.
    pub fn set_active_version(&self, organization_id: &str, version: u32) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut material = self.get(organization_id)?;
        material.version_params(version)?;
        material.active_key_version = version;
        self.save(&material)?;

        info!(organization_id, version, "Activated key version");
        Ok(())
    }

    /// Emergency master-secret swap.
    ///
    /// Replaces the secret and starts over at a single fresh key version;
    /// prior versions are removed so stale ciphertext fails closed with
    /// `UnknownKeyVersion` instead of failing authentication confusingly.
    /// Callers must re-encrypt all ciphertext (rotation) before swapping.
    /// Returns the new active version.
    pub fn swap_master_secret(
        &self,
        organization_id: &str,
        new_secret: Vec<u8>,
        params: DerivationParams,
    ) -> Result<u32> {
        let _guard = self.write_lock.lock();

        let mut material = self.get(organization_id)?;
        let next = material
            .versions
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            + 1;

        material.master_secret.zeroize();
        material.master_secret = new_secret;
        material.versions.clear();
        material.versions.insert(
            next,
            KeyVersionParams {
                salt: Self::random_salt(),
                params,
                created: Utc::now(),
            },
        );
        material.active_key_version = next;
        self.save(&material)?;

        info!(organization_id, version = next, "Master secret swapped");
        Ok(next)
    }

    /// All provisioned organization ids
    pub fn list_organizations(&self) -> Result<Vec<String>> {
        let mut orgs = Vec::new();
        for entry in self.organizations.iter() {
            let (key, _) = entry?;
            orgs.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(orgs)
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
