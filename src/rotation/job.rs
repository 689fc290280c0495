//! Rotation job state machine and persistence
//!
//! A job is PENDING when scheduled, RUNNING while its loop executes, and
//! terminal in COMPLETED or FAILED. CANCELLED jobs keep their checkpoint and
//! can be re-run. Progress is persisted at batch boundaries so an
//! interrupted job resumes instead of reprocessing from zero.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use uuid::Uuid;

/// Lifecycle state of a rotation job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states cannot transition further
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Active states block a second rotation for the same organization
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Running | JobStatus::Cancelled
        )
    }
}

/// Record-level progress counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationProgress {
    pub total_records: u64,
    /// Checkpoint: records fully processed and persisted
    pub processed_records: u64,
    pub failed_records: u64,
}

/// A scheduled or running rotation job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationJob {
    pub id: String,
    pub organization_id: String,
    pub source_version: u32,
    pub target_version: u32,
    pub status: JobStatus,
    pub progress: RotationProgress,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last catastrophic error, for FAILED jobs
    pub last_error: Option<String>,
}

impl RotationJob {
    pub fn new(
        organization_id: &str,
        source_version: u32,
        target_version: u32,
        total_records: u64,
    ) -> Self {
        RotationJob {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            source_version,
            target_version,
            status: JobStatus::Pending,
            progress: RotationProgress {
                total_records,
                processed_records: 0,
                failed_records: 0,
            },
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }
}

/// Sled-backed store of rotation jobs
pub struct RotationJobStore {
    db: Db,
    jobs: Tree,
}

impl RotationJobStore {
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
        let jobs = db.open_tree("rotation_jobs")?;
        Ok(RotationJobStore { db, jobs })
    }

    /// Persist a job. Called at scheduling, state transitions and batch
    /// boundaries (checkpoints).
    pub fn save(&self, job: &RotationJob) -> Result<()> {
        let bytes = bincode::serialize(job)?;
        self.jobs.insert(job.id.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<RotationJob> {
        match self.jobs.get(job_id.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(Error::RotationJobNotFound(job_id.to_string())),
        }
    }

    /// All jobs, newest unordered; callers sort as needed
    pub fn list(&self) -> Result<Vec<RotationJob>> {
        let mut jobs = Vec::new();
        for entry in self.jobs.iter() {
            let (_, bytes) = entry?;
            jobs.push(bincode::deserialize(&bytes)?);
        }
        Ok(jobs)
    }

    /// The active (pending, running or cancelled-resumable) job for an
    /// organization, if any
    pub fn active_job_for(&self, organization_id: &str) -> Result<Option<RotationJob>> {
        for job in self.list()? {
            if job.organization_id == organization_id && job.status.is_active() {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}
