//! Rotation execution
//!
//! `RotationManager` schedules jobs, runs them as background tasks and
//! answers status polls. A job processes one bounded batch per iteration,
//! persists its checkpoint, then yields, so foreground encrypt/decrypt
//! traffic is never starved. At most one job per organization is active;
//! jobs for different organizations run concurrently.

use crate::audit::{self, AuditAction};
use crate::crypto::{self, EncryptedBlob};
use crate::document::DocumentEncryption;
use crate::error::{Error, Result};
use crate::keys::KeyService;
use crate::rotation::{JobStatus, RotationJob, RotationJobStore};
use crate::store::{CipherRecord, RecordStore};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

/// Rotation tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Records per batch; a batch is the atomic unit of work
    pub batch_size: usize,

    /// Keep going when a single record fails to re-encrypt
    pub continue_on_error: bool,

    /// Fail the job when more than this many records fail (None = no limit)
    pub max_failed_records: Option<u64>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            batch_size: 100,
            continue_on_error: true,
            max_failed_records: None,
        }
    }
}

/// In-process exclusivity holder for one organization. Rotation and
/// master-secret swap contend for the same slot, so check-and-acquire is a
/// single atomic entry operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OrgGuard {
    /// A rotation job (by id) holds the organization
    Rotation(String),
    /// A master-secret swap is in flight
    Swap,
}

/// Schedules and executes rotation jobs
pub struct RotationManager {
    keys: Arc<KeyService>,
    records: Arc<dyn RecordStore>,
    jobs: Arc<RotationJobStore>,
    config: RotationConfig,
    /// Per-organization guard shared by rotation and secret swap
    guards: DashMap<String, OrgGuard>,
    /// Cooperative cancellation flags per job
    cancel_flags: DashMap<String, Arc<AtomicBool>>,
}

impl RotationManager {
    pub fn new(
        keys: Arc<KeyService>,
        records: Arc<dyn RecordStore>,
        jobs: Arc<RotationJobStore>,
        config: RotationConfig,
    ) -> Self {
        RotationManager {
            keys,
            records,
            jobs,
            config,
            guards: DashMap::new(),
            cancel_flags: DashMap::new(),
        }
    }

    fn check_batch_size(&self) -> Result<()> {
        if self.config.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "Rotation batch size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Map an occupied guard to the rejection the caller should see
    fn guard_rejection(organization_id: &str, guard: &OrgGuard) -> Error {
        match guard {
            OrgGuard::Rotation(job_id) => Error::RotationAlreadyInProgress(format!(
                "{} (job {})",
                organization_id, job_id
            )),
            OrgGuard::Swap => {
                Error::MasterSecretRotationInProgress(organization_id.to_string())
            }
        }
    }

    /// Schedule a rotation of all of the organization's ciphertext to
    /// `target_version`. The target must already be registered; at most one
    /// job per organization may be active.
    pub fn schedule(&self, organization_id: &str, target_version: u32) -> Result<RotationJob> {
        self.check_batch_size()?;

        let material = self.keys.store().get(organization_id)?;
        material.version_params(target_version)?;

        if let Some(existing) = self.jobs.active_job_for(organization_id)? {
            return Err(Error::RotationAlreadyInProgress(format!(
                "{} (job {})",
                organization_id, existing.id
            )));
        }

        let total = self.records.count_records(organization_id)?;
        let job = RotationJob::new(
            organization_id,
            material.active_key_version,
            target_version,
            total,
        );

        // Atomic check-and-acquire against both rotations and swaps
        match self.guards.entry(organization_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                return Err(Self::guard_rejection(organization_id, e.get()));
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(OrgGuard::Rotation(job.id.clone()));
            }
        }

        self.cancel_flags
            .insert(job.id.clone(), Arc::new(AtomicBool::new(false)));
        if let Err(e) = self.jobs.save(&job) {
            self.release(&job);
            return Err(e);
        }

        info!(
            organization_id,
            job_id = %job.id,
            source = job.source_version,
            target_version,
            total,
            "Rotation scheduled"
        );
        Ok(job)
    }

    /// Poll a job's current state. Available at any time, including while the
    /// job is running (checkpoints are persisted at batch boundaries).
    pub fn status(&self, job_id: &str) -> Result<RotationJob> {
        self.jobs.get(job_id)
    }

    /// All known jobs
    pub fn list(&self) -> Result<Vec<RotationJob>> {
        self.jobs.list()
    }

    /// Ask a running job to stop after its current batch. The job ends in
    /// CANCELLED with its checkpoint intact and can be re-run later.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        self.jobs.get(job_id)?;
        self.cancel_flags
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .store(true, Ordering::SeqCst);
        info!(job_id, "Rotation cancellation requested");
        Ok(())
    }

    /// Run a job to a terminal or cancelled state on the current task.
    /// Resumes from the persisted checkpoint when re-running an interrupted
    /// or cancelled job.
    pub async fn run(&self, job_id: &str) -> Result<RotationJob> {
        self.check_batch_size()?;

        let mut job = self.jobs.get(job_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        // Re-acquire the per-org guard; it is lost on process restart
        match self.guards.entry(job.organization_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => match e.get() {
                OrgGuard::Rotation(id) if id == &job.id => {}
                guard => return Err(Self::guard_rejection(&job.organization_id, guard)),
            },
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(OrgGuard::Rotation(job.id.clone()));
            }
        }

        let cancel = self
            .cancel_flags
            .entry(job.id.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        if job.status == JobStatus::Cancelled {
            // Explicit re-run of a cancelled job clears the stale request
            cancel.store(false, Ordering::SeqCst);
        }

        job.status = JobStatus::Running;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        self.save_or_release(&job)?;
        info!(
            job_id = %job.id,
            organization_id = %job.organization_id,
            checkpoint = job.progress.processed_records,
            "Rotation running"
        );

        loop {
            let batch = match self.records.load_batch(
                &job.organization_id,
                job.progress.processed_records,
                self.config.batch_size,
            ) {
                Ok(batch) => batch,
                Err(e) => return self.fail(job, e.to_string()),
            };
            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len() as u64;
            for record in &batch {
                match self.rotate_record(&job.organization_id, job.target_version, record) {
                    Ok(Some(new_blob)) => {
                        if let Err(e) = self.records.store_record(
                            &job.organization_id,
                            &record.record_id,
                            &new_blob,
                        ) {
                            // Storage failures are catastrophic, not per-record
                            return self.fail(job, e.to_string());
                        }
                    }
                    Ok(None) => {} // already at the target version
                    Err(e) if Self::is_record_failure(&e) => {
                        job.progress.failed_records += 1;
                        warn!(
                            job_id = %job.id,
                            record_id = %record.record_id,
                            error = %e,
                            "Record failed to rotate"
                        );
                        if !self.config.continue_on_error {
                            return self.fail(job, format!("record {}: {}", record.record_id, e));
                        }
                    }
                    Err(e) => return self.fail(job, e.to_string()),
                }
            }

            // Checkpoint at the batch boundary
            job.progress.processed_records += batch_len;
            self.save_or_release(&job)?;

            if cancel.load(Ordering::SeqCst) {
                job.status = JobStatus::Cancelled;
                self.save_or_release(&job)?;
                self.release(&job);
                audit::record(
                    AuditAction::Rotate,
                    &job.organization_id,
                    Some(&job.id),
                    job.target_version,
                    "cancelled",
                );
                info!(job_id = %job.id, "Rotation cancelled at checkpoint");
                return Ok(job);
            }

            // Yield so rotation cannot starve foreground traffic
            tokio::task::yield_now().await;
        }

        if let Some(max) = self.config.max_failed_records {
            if job.progress.failed_records > max {
                let reason = Error::RotationBatchFailure {
                    job_id: job.id.clone(),
                    failed: job.progress.failed_records,
                }
                .to_string();
                return self.fail(job, reason);
            }
        }

        // Activation: new encryptions observe the target version from the
        // next fresh read; cached source-version keys are dropped.
        if let Err(e) = self
            .keys
            .store()
            .set_active_version(&job.organization_id, job.target_version)
        {
            return self.fail(job, e.to_string());
        }
        self.keys.invalidate(&job.organization_id);

        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        self.save_or_release(&job)?;
        self.release(&job);

        audit::record(
            AuditAction::Rotate,
            &job.organization_id,
            Some(&job.id),
            job.target_version,
            "completed",
        );
        info!(
            job_id = %job.id,
            organization_id = %job.organization_id,
            processed = job.progress.processed_records,
            failed = job.progress.failed_records,
            "Rotation completed"
        );
        Ok(job)
    }

    /// Spawn a job onto the runtime as a background task
    pub fn spawn(self: &Arc<Self>, job_id: String) -> JoinHandle<Result<RotationJob>> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(&job_id).await })
    }

    /// Emergency master-secret swap, rejected while any rotation for the
    /// organization is active (conservative: never interleave the two).
    pub fn swap_master_secret(
        &self,
        organization_id: &str,
        new_secret: Vec<u8>,
        params: crate::crypto::DerivationParams,
    ) -> Result<u32> {
        // Same atomic guard acquisition as scheduling; a concurrent
        // schedule and swap can never both pass
        match self.guards.entry(organization_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                return Err(Self::guard_rejection(organization_id, e.get()));
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(OrgGuard::Swap);
            }
        }

        let result = match self.jobs.active_job_for(organization_id) {
            Ok(Some(_)) => Err(Error::RotationAlreadyInProgress(
                organization_id.to_string(),
            )),
            Ok(None) => self
                .keys
                .store()
                .swap_master_secret(organization_id, new_secret, params),
            Err(e) => Err(e),
        };

        self.keys.invalidate(organization_id);
        self.guards
            .remove_if(organization_id, |_, guard| *guard == OrgGuard::Swap);
        result
    }

    /// Decrypt one record under its embedded version and re-seal it under
    /// the target. Returns None when the record is already at the target.
    fn rotate_record(
        &self,
        organization_id: &str,
        target_version: u32,
        record: &CipherRecord,
    ) -> Result<Option<String>> {
        let blob = EncryptedBlob::decode(&record.blob)?;
        if blob.key_version == target_version {
            return Ok(None);
        }

        let fingerprint = crypto::org_fingerprint(organization_id);
        if blob.org_fingerprint != fingerprint {
            return Err(Error::OrganizationMismatch(organization_id.to_string()));
        }

        let aad = record
            .document_id
            .as_deref()
            .map(DocumentEncryption::binding_aad)
            .unwrap_or_default();

        let source_key = self.keys.derive(organization_id, blob.key_version)?;
        let plaintext = Zeroizing::new(crypto::open(source_key.key(), &blob, &aad)?);

        let target_key = self.keys.derive(organization_id, target_version)?;
        let new_blob = crypto::seal(
            target_key.key(),
            target_version,
            fingerprint,
            &plaintext,
            &aad,
        )?;
        Ok(Some(new_blob.encode()))
    }

    /// Per-record failures are counted; anything else fails the whole job
    fn is_record_failure(e: &Error) -> bool {
        e.is_security_failure() || matches!(e, Error::UnknownKeyVersion { .. })
    }

    /// Persist job state, dropping the in-process guard if persistence fails
    /// so the organization is not wedged until restart
    fn save_or_release(&self, job: &RotationJob) -> Result<()> {
        if let Err(e) = self.jobs.save(job) {
            self.release(job);
            return Err(e);
        }
        Ok(())
    }

    fn fail(&self, mut job: RotationJob, reason: String) -> Result<RotationJob> {
        error!(job_id = %job.id, organization_id = %job.organization_id, reason, "Rotation failed");
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.last_error = Some(reason);
        let saved = self.jobs.save(&job);
        self.release(&job);
        saved?;
        audit::record(
            AuditAction::Rotate,
            &job.organization_id,
            Some(&job.id),
            job.target_version,
            "failed",
        );
        Ok(job)
    }

    fn release(&self, job: &RotationJob) {
        // Only drop the guard this job actually holds
        self.guards.remove_if(&job.organization_id, |_, guard| {
            matches!(guard, OrgGuard::Rotation(id) if id == &job.id)
        });
        self.cancel_flags.remove(&job.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DerivationParams;
    use crate::field::FieldEncryption;
    use crate::keys::KeyMaterialStore;
    use crate::store::SledRecordStore;

    fn fast_params() -> DerivationParams {
        DerivationParams::Pbkdf2Sha256 { iterations: 10 }
    }

    struct Fixture {
        keys: Arc<KeyService>,
        fields: FieldEncryption,
        documents: DocumentEncryption,
        records: Arc<SledRecordStore>,
        manager: Arc<RotationManager>,
    }

    fn fixture(config: RotationConfig, orgs: &[&str]) -> Fixture {
        let material = Arc::new(KeyMaterialStore::in_memory().unwrap());
        for org in orgs {
            material
                .provision(org, format!("secret-{}", org).into_bytes(), fast_params())
                .unwrap();
        }
        let keys = Arc::new(KeyService::new(material));
        let records = Arc::new(SledRecordStore::in_memory().unwrap());
        let jobs = Arc::new(RotationJobStore::in_memory().unwrap());
        let manager = Arc::new(RotationManager::new(
            keys.clone(),
            records.clone() as Arc<dyn RecordStore>,
            jobs,
            config,
        ));
        Fixture {
            fields: FieldEncryption::new(keys.clone()),
            documents: DocumentEncryption::new(keys.clone()),
            keys,
            records,
            manager,
        }
    }

    fn seed_fields(fx: &Fixture, org: &str, count: usize) {
        for i in 0..count {
            let blob = fx
                .fields
                .encrypt_field(&format!("value-{}", i), org)
                .unwrap();
            fx.records
                .insert(
                    org,
                    &CipherRecord {
                        record_id: format!("r{:03}", i),
                        blob,
                        document_id: None,
                    },
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_rotation_completes_and_activates() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        seed_fields(&fx, "org-1", 12);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();

        let job = fx.manager.schedule("org-1", v2).unwrap();
        let done = fx.manager.run(&job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.processed_records, 12);
        assert_eq!(done.progress.failed_records, 0);
        assert!(done.completed_at.is_some());

        // Every record now carries the target version and still decrypts
        for record in fx.records.load_batch("org-1", 0, 100).unwrap() {
            let blob = EncryptedBlob::decode(&record.blob).unwrap();
            assert_eq!(blob.key_version, v2);
            let i: usize = record.record_id[1..].parse().unwrap();
            assert_eq!(
                fx.fields.decrypt_field(&record.blob, "org-1").unwrap(),
                format!("value-{}", i)
            );
        }

        // New encryptions pick up the activated version
        assert_eq!(fx.keys.store().active_version("org-1").unwrap(), v2);
        let fresh = fx.fields.encrypt_field("fresh", "org-1").unwrap();
        assert_eq!(EncryptedBlob::decode(&fresh).unwrap().key_version, v2);
    }

    #[tokio::test]
    async fn test_document_records_rotate_with_binding() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);

        let blob = fx
            .documents
            .encrypt_document(b"scan bytes", "org-1", "doc-7")
            .unwrap();
        fx.records
            .insert(
                "org-1",
                &CipherRecord {
                    record_id: "rec-doc".to_string(),
                    blob,
                    document_id: Some("doc-7".to_string()),
                },
            )
            .unwrap();

        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        let job = fx.manager.schedule("org-1", v2).unwrap();
        let done = fx.manager.run(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let record = fx.records.get("org-1", "rec-doc").unwrap();
        assert_eq!(EncryptedBlob::decode(&record.blob).unwrap().key_version, v2);
        let back = fx
            .documents
            .decrypt_document(&record.blob, "org-1", "doc-7")
            .unwrap();
        assert_eq!(back.as_ref(), b"scan bytes");
    }

    #[tokio::test]
    async fn test_one_active_job_per_org() {
        let fx = fixture(RotationConfig::default(), &["org-1", "org-2"]);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();

        fx.manager.schedule("org-1", v2).unwrap();
        let second = fx.manager.schedule("org-1", v2);
        assert!(matches!(second, Err(Error::RotationAlreadyInProgress(_))));

        // A different organization is unaffected
        let other_v2 = fx.keys.store().add_version("org-2", fast_params()).unwrap();
        assert!(fx.manager.schedule("org-2", other_v2).is_ok());
    }

    #[tokio::test]
    async fn test_schedule_requires_registered_target() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        let result = fx.manager.schedule("org-1", 5);
        assert!(matches!(result, Err(Error::UnknownKeyVersion { .. })));
    }

    #[tokio::test]
    async fn test_swap_rejected_while_rotation_active() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        fx.manager.schedule("org-1", v2).unwrap();

        let result = fx
            .manager
            .swap_master_secret("org-1", b"new-secret".to_vec(), fast_params());
        assert!(matches!(result, Err(Error::RotationAlreadyInProgress(_))));
    }

    #[tokio::test]
    async fn test_swap_after_completion() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        seed_fields(&fx, "org-1", 3);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        let job = fx.manager.schedule("org-1", v2).unwrap();
        fx.manager.run(&job.id).await.unwrap();

        let v3 = fx
            .manager
            .swap_master_secret("org-1", b"new-secret".to_vec(), fast_params())
            .unwrap();
        assert_eq!(v3, 3);

        // Post-swap ciphertext under the fresh secret round-trips
        let blob = fx.fields.encrypt_field("after swap", "org-1").unwrap();
        assert_eq!(fx.fields.decrypt_field(&blob, "org-1").unwrap(), "after swap");

        // Pre-swap versions were dropped and fail closed
        let old = fx.records.load_batch("org-1", 0, 1).unwrap().remove(0);
        assert!(matches!(
            fx.fields.decrypt_field(&old.blob, "org-1"),
            Err(Error::UnknownKeyVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_per_record_failure_is_counted_not_fatal() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        seed_fields(&fx, "org-1", 5);
        // A record that never parses as a blob
        fx.records
            .insert(
                "org-1",
                &CipherRecord {
                    record_id: "zzz-corrupt".to_string(),
                    blob: "garbage".to_string(),
                    document_id: None,
                },
            )
            .unwrap();

        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        let job = fx.manager.schedule("org-1", v2).unwrap();
        let done = fx.manager.run(&job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.processed_records, 6);
        assert_eq!(done.progress.failed_records, 1);
    }

    #[tokio::test]
    async fn test_failure_threshold_fails_job() {
        let config = RotationConfig {
            max_failed_records: Some(0),
            ..RotationConfig::default()
        };
        let fx = fixture(config, &["org-1"]);
        seed_fields(&fx, "org-1", 2);
        fx.records
            .insert(
                "org-1",
                &CipherRecord {
                    record_id: "zzz-corrupt".to_string(),
                    blob: "garbage".to_string(),
                    document_id: None,
                },
            )
            .unwrap();

        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        let job = fx.manager.schedule("org-1", v2).unwrap();
        let done = fx.manager.run(&job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.last_error.is_some());
        // Activation must not have happened
        assert_eq!(fx.keys.store().active_version("org-1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_on_first_error_when_configured() {
        let config = RotationConfig {
            continue_on_error: false,
            batch_size: 10,
            ..RotationConfig::default()
        };
        let fx = fixture(config, &["org-1"]);
        fx.records
            .insert(
                "org-1",
                &CipherRecord {
                    record_id: "a-corrupt".to_string(),
                    blob: "garbage".to_string(),
                    document_id: None,
                },
            )
            .unwrap();
        seed_fields(&fx, "org-1", 3);

        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        let job = fx.manager.schedule("org-1", v2).unwrap();
        let done = fx.manager.run(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_checkpoints_and_resume_completes() {
        let config = RotationConfig {
            batch_size: 2,
            ..RotationConfig::default()
        };
        let fx = fixture(config, &["org-1"]);
        seed_fields(&fx, "org-1", 6);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();

        let job = fx.manager.schedule("org-1", v2).unwrap();
        fx.manager.cancel(&job.id).unwrap();

        // The pre-set flag stops the run after its first batch
        let cancelled = fx.manager.run(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.progress.processed_records, 2);

        // Poll sees the persisted checkpoint
        let polled = fx.manager.status(&job.id).unwrap();
        assert_eq!(polled.progress.processed_records, 2);
        assert_eq!(fx.keys.store().active_version("org-1").unwrap(), 1);

        // Re-running resumes from the checkpoint and finishes
        let done = fx.manager.run(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.processed_records, 6);
        assert_eq!(fx.keys.store().active_version("org-1").unwrap(), v2);
    }

    #[tokio::test]
    async fn test_run_spawned_in_background() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        seed_fields(&fx, "org-1", 4);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();

        let job = fx.manager.schedule("org-1", v2).unwrap();
        let handle = fx.manager.spawn(job.id.clone());
        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_rerun_terminal_job_is_a_noop() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        seed_fields(&fx, "org-1", 2);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        let job = fx.manager.schedule("org-1", v2).unwrap();
        fx.manager.run(&job.id).await.unwrap();

        let again = fx.manager.run(&job.id).await.unwrap();
        assert_eq!(again.status, JobStatus::Completed);
        assert_eq!(again.progress.processed_records, 2);
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let config = RotationConfig {
            batch_size: 0,
            ..RotationConfig::default()
        };
        let fx = fixture(config, &["org-1"]);
        seed_fields(&fx, "org-1", 3);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();

        // A zero batch size would terminate the loop before touching any
        // record; it must never reach activation
        let result = fx.manager.schedule("org-1", v2);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert_eq!(fx.keys.store().active_version("org-1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_swap_guard_blocks_scheduling() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();

        // While a swap holds the organization, scheduling must lose the
        // guard race deterministically
        fx.manager
            .guards
            .insert("org-1".to_string(), OrgGuard::Swap);
        let result = fx.manager.schedule("org-1", v2);
        assert!(matches!(
            result,
            Err(Error::MasterSecretRotationInProgress(_))
        ));

        fx.manager.guards.remove("org-1");
        assert!(fx.manager.schedule("org-1", v2).is_ok());
    }

    #[tokio::test]
    async fn test_resume_running_job_after_restart() {
        let config = RotationConfig {
            batch_size: 2,
            ..RotationConfig::default()
        };
        let fx = fixture(config, &["org-1"]);
        seed_fields(&fx, "org-1", 6);
        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();

        // Simulate a crash mid-run: a persisted RUNNING job with a nonzero
        // checkpoint and no in-process guard
        let mut job = RotationJob::new("org-1", 1, v2, 6);
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.progress.processed_records = 2;
        fx.manager.jobs.save(&job).unwrap();

        let done = fx.manager.run(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.processed_records, 6);
        assert_eq!(fx.keys.store().active_version("org-1").unwrap(), v2);

        // Records past the checkpoint carry the target version
        for record in fx.records.load_batch("org-1", 2, 10).unwrap() {
            assert_eq!(
                EncryptedBlob::decode(&record.blob).unwrap().key_version,
                v2
            );
        }
    }

    #[tokio::test]
    async fn test_guard_released_after_failed_job() {
        let config = RotationConfig {
            max_failed_records: Some(0),
            ..RotationConfig::default()
        };
        let fx = fixture(config, &["org-1"]);
        fx.records
            .insert(
                "org-1",
                &CipherRecord {
                    record_id: "corrupt".to_string(),
                    blob: "garbage".to_string(),
                    document_id: None,
                },
            )
            .unwrap();

        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        let job = fx.manager.schedule("org-1", v2).unwrap();
        let done = fx.manager.run(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);

        // The organization is not wedged: guard dropped, new job accepted
        assert!(fx.manager.guards.get("org-1").is_none());
        assert!(fx.manager.schedule("org-1", v2).is_ok());
    }

    #[tokio::test]
    async fn test_search_tokens_regenerated_for_new_version() {
        let fx = fixture(RotationConfig::default(), &["org-1"]);
        seed_fields(&fx, "org-1", 1);

        let token_v1 = fx.fields.search_token("needle", "org-1").unwrap();

        let v2 = fx.keys.store().add_version("org-1", fast_params()).unwrap();
        let job = fx.manager.schedule("org-1", v2).unwrap();
        fx.manager.run(&job.id).await.unwrap();

        // Query-time tokens now key off the new active version
        let token_v2 = fx.fields.search_token("needle", "org-1").unwrap();
        assert_ne!(token_v1, token_v2);
    }
}
