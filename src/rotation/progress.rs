//! Read-only projection of rotation state.
//!
//! Depends only on the job store, so a process that does not own the
//! engine (an API frontend polling a shared database, say) can still
//! answer progress queries.

use std::sync::Arc;

use crate::error::{Result, VaultError};
use crate::store::traits::RotationStore;
use crate::types::{RotationJob, RotationProgress, RotationStatus};

#[derive(Clone)]
pub struct RotationProgressReporter {
    jobs: Arc<dyn RotationStore>,
}

impl RotationProgressReporter {
    pub fn new(jobs: Arc<dyn RotationStore>) -> Self {
        Self { jobs }
    }

    pub fn progress(&self, id: &str) -> Result<RotationProgress> {
        self.jobs
            .get_job(id)?
            .map(|job| job.progress())
            .ok_or_else(|| VaultError::RotationNotFound(id.to_string()))
    }

    pub fn rotations(&self, status: Option<RotationStatus>) -> Result<Vec<RotationJob>> {
        self.jobs.list_jobs(status)
    }
}
