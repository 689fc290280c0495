//! Background key rotation
//!
//! Bulk re-encryption of an organization's ciphertext from an old key
//! version to a new one, as an explicit, checkpointed state machine driven
//! by a background task.

mod job;
mod runner;

pub use job::{JobStatus, RotationJob, RotationJobStore, RotationProgress};
pub use runner::{RotationConfig, RotationManager};
