//! Ciphertext record source
//!
//! The persistence layer owns the actual business records; rotation only
//! needs an enumerable, paginatable view of "all blobs for organization X"
//! plus a way to write a re-encrypted blob back. `RecordStore` is that seam.
//! `SledRecordStore` is the bundled implementation used by the CLI and tests.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;

/// One ciphertext-bearing record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherRecord {
    /// Record identifier within the owning organization
    pub record_id: String,
    /// Opaque encoded blob
    pub blob: String,
    /// Set when the blob is a document blob; rotation needs the binding id
    /// to re-seal it
    pub document_id: Option<String>,
}

/// Paginatable source of an organization's ciphertext
pub trait RecordStore: Send + Sync {
    /// Number of ciphertext-bearing records for the organization
    fn count_records(&self, organization_id: &str) -> Result<u64>;

    /// Load one bounded batch, ordered stably by record id
    fn load_batch(
        &self,
        organization_id: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<CipherRecord>>;

    /// Persist a re-encrypted blob for an existing record
    fn store_record(&self, organization_id: &str, record_id: &str, blob: &str) -> Result<()>;
}

/// Sled-backed record store
pub struct SledRecordStore {
    db: Db,
    records: Tree,
}

impl SledRecordStore {
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
        let records = db.open_tree("records")?;
        Ok(SledRecordStore { db, records })
    }

    /// Storage key: organization id and record id, NUL-separated so prefix
    /// scans cannot bleed across organizations
    fn record_key(organization_id: &str, record_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(organization_id.len() + 1 + record_id.len());
        key.extend_from_slice(organization_id.as_bytes());
        key.push(0);
        key.extend_from_slice(record_id.as_bytes());
        key
    }

    fn org_prefix(organization_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(organization_id.len() + 1);
        prefix.extend_from_slice(organization_id.as_bytes());
        prefix.push(0);
        prefix
    }

    /// Insert or replace a full record
    pub fn insert(&self, organization_id: &str, record: &CipherRecord) -> Result<()> {
        let key = Self::record_key(organization_id, &record.record_id);
        let value = bincode::serialize(record)?;
        self.records.insert(key, value)?;
        Ok(())
    }

    pub fn get(&self, organization_id: &str, record_id: &str) -> Result<CipherRecord> {
        let key = Self::record_key(organization_id, record_id);
        match self.records.get(key)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(Error::RecordNotFound(record_id.to_string())),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl RecordStore for SledRecordStore {
    fn count_records(&self, organization_id: &str) -> Result<u64> {
        let prefix = Self::org_prefix(organization_id);
        let mut count = 0u64;
        for entry in self.records.scan_prefix(&prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn load_batch(
        &self,
        organization_id: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<CipherRecord>> {
        let prefix = Self::org_prefix(organization_id);
        let mut batch = Vec::with_capacity(limit);

        for entry in self
            .records
            .scan_prefix(&prefix)
            .skip(offset as usize)
            .take(limit)
        {
            let (_, value) = entry?;
            batch.push(bincode::deserialize(&value)?);
        }

        Ok(batch)
    }

    fn store_record(&self, organization_id: &str, record_id: &str, blob: &str) -> Result<()> {
        let mut record = self.get(organization_id, record_id)?;
        record.blob = blob.to_string();
        self.insert(organization_id, &record)
    }
}
