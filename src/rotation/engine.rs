//! Rotation orchestration: start, cancel, observe, resume.
//!
//! A rotation is a durable job row plus a worker task. The engine owns
//! the registry of live workers; everything else it reads straight from
//! the job store, so a restarted process can pick up where it left off
//! with `resume_inflight`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VaultError};
use crate::events::{EventSink, VaultEvent};
use crate::store::traits::{BlobStore, ImageStore, KeyStore, RotationStore};
use crate::types::{
    RotationJob, RotationProgress, RotationRequest, RotationStatus,
};

use super::worker;

pub(crate) struct RunningRotation {
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: watch::Sender<RotationProgress>,
}

pub(crate) struct EngineShared {
    pub(crate) keys: Arc<dyn KeyStore>,
    pub(crate) images: Arc<dyn ImageStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) jobs: Arc<dyn RotationStore>,
    pub(crate) events: Arc<dyn EventSink>,
    /// Live workers by rotation id. An entry exists exactly while the
    /// worker task runs; dropping it closes the progress channel.
    pub(crate) running: Mutex<HashMap<String, RunningRotation>>,
}

#[derive(Clone)]
pub struct RotationEngine {
    inner: Arc<EngineShared>,
}

impl RotationEngine {
    pub fn new(
        keys: Arc<dyn KeyStore>,
        images: Arc<dyn ImageStore>,
        blobs: Arc<dyn BlobStore>,
        jobs: Arc<dyn RotationStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineShared {
                keys,
                images,
                blobs,
                jobs,
                events,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validate and persist a new rotation job, then launch its worker.
    ///
    /// Returns as soon as the job row exists; the batch loop runs on a
    /// spawned task (the caller must be inside a Tokio runtime).
    /// `total_images` is snapshotted here and never recomputed.
    pub fn start_rotation(&self, request: RotationRequest) -> Result<RotationJob> {
        if request.batch_size < 1 {
            return Err(VaultError::InvalidBatchSize(request.batch_size));
        }

        self.inner
            .keys
            .get_key(request.to_key_id)?
            .ok_or(VaultError::KeyNotFound(request.to_key_id))?;
        if let Some(from) = request.from_key_id {
            self.inner
                .keys
                .get_key(from)?
                .ok_or(VaultError::KeyNotFound(from))?;
        }

        let source = crate::types::RotationSource::from_key_id(request.from_key_id);
        let total_images = self.inner.images.count_images(source)?;

        let job = RotationJob {
            id: uuid::Uuid::new_v4().to_string(),
            from_key_id: request.from_key_id,
            to_key_id: request.to_key_id,
            status: RotationStatus::InProgress,
            total_images,
            processed_images: 0,
            failed_images: 0,
            batch_size: request.batch_size,
            started_at: Utc::now(),
            completed_at: None,
            initiated_by: request.initiated_by,
            is_automatic: request.is_automatic,
            error_message: None,
        };

        // Conflict with another InProgress job over the same source is
        // rejected here, atomically with the insert.
        self.inner.jobs.create_job(&job)?;

        self.inner.events.emit(&VaultEvent::RotationStarted {
            rotation_id: job.id.clone(),
            from_key_id: job.from_key_id,
            to_key_id: job.to_key_id,
            total_images,
        });

        self.spawn_worker(job.clone());
        Ok(job)
    }

    /// Request cooperative cancellation. Returns false when the job is
    /// already terminal. The worker observes the flag at the next batch
    /// boundary; an image mid-migration always finishes or never starts.
    pub fn cancel_rotation(&self, id: &str) -> Result<bool> {
        let job = self
            .inner
            .jobs
            .get_job(id)?
            .ok_or_else(|| VaultError::RotationNotFound(id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        if let Some(run) = self.inner.running.lock().get(id) {
            run.cancel.cancel();
            return Ok(true);
        }

        // InProgress on disk but no live worker (crashed process, not yet
        // resumed): finalize the row directly.
        if self
            .inner
            .jobs
            .finish_job(id, RotationStatus::Cancelled, None, Utc::now())?
        {
            self.inner.events.emit(&VaultEvent::RotationCancelled {
                rotation_id: id.to_string(),
            });
        }
        Ok(true)
    }

    /// Point-in-time progress snapshot.
    pub fn progress(&self, id: &str) -> Result<RotationProgress> {
        let job = self
            .inner
            .jobs
            .get_job(id)?
            .ok_or_else(|| VaultError::RotationNotFound(id.to_string()))?;
        Ok(job.progress())
    }

    pub fn get_rotation(&self, id: &str) -> Result<RotationJob> {
        self.inner
            .jobs
            .get_job(id)?
            .ok_or_else(|| VaultError::RotationNotFound(id.to_string()))
    }

    pub fn rotations(&self, status: Option<RotationStatus>) -> Result<Vec<RotationJob>> {
        self.inner.jobs.list_jobs(status)
    }

    /// Subscribe to progress snapshots for one rotation. The channel
    /// yields the latest snapshot after every batch and closes once the
    /// job leaves InProgress; for an already-terminal job the receiver
    /// holds the final snapshot and is closed immediately.
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<RotationProgress>> {
        let job = self
            .inner
            .jobs
            .get_job(id)?
            .ok_or_else(|| VaultError::RotationNotFound(id.to_string()))?;

        if !job.status.is_terminal() {
            if let Some(run) = self.inner.running.lock().get(id) {
                return Ok(run.progress.subscribe());
            }
        }

        // Terminal (or not currently driven): hand out the row's snapshot
        // on an already-closed channel.
        let (tx, rx) = watch::channel(job.progress());
        drop(tx);
        Ok(rx)
    }

    /// Re-launch workers for every job still marked InProgress. Intended
    /// as a startup hook: keyset selection makes the resume point
    /// implicit, so a restarted drive processes only what is left.
    pub fn resume_inflight(&self) -> Result<Vec<RotationJob>> {
        let inflight = self.inner.jobs.list_jobs(Some(RotationStatus::InProgress))?;
        let mut resumed = Vec::new();
        for job in inflight {
            if self.inner.running.lock().contains_key(&job.id) {
                continue;
            }
            self.spawn_worker(job.clone());
            resumed.push(job);
        }
        Ok(resumed)
    }

    fn spawn_worker(&self, job: RotationJob) {
        let cancel = CancellationToken::new();
        let (progress_tx, _) = watch::channel(job.progress());
        self.inner.running.lock().insert(
            job.id.clone(),
            RunningRotation {
                cancel: cancel.clone(),
                progress: progress_tx,
            },
        );

        let shared = Arc::clone(&self.inner);
        tokio::spawn(async move {
            worker::run(shared, job, cancel).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSink;
    use crate::store::memory::{MemoryBlobStore, MemoryImageStore};
    use crate::store::sqlite::SqliteStore;

    fn engine() -> (RotationEngine, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.initialize().unwrap();
        let engine = RotationEngine::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            Arc::new(MemoryImageStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::clone(&store) as Arc<dyn RotationStore>,
            Arc::new(TracingSink),
        );
        (engine, store)
    }

    #[tokio::test]
    async fn rejects_zero_batch_size() {
        let (engine, _) = engine();
        let err = engine
            .start_rotation(RotationRequest {
                from_key_id: None,
                to_key_id: 1,
                batch_size: 0,
                initiated_by: None,
                is_automatic: false,
            })
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidBatchSize(0)));
    }

    #[tokio::test]
    async fn rejects_unknown_target_key() {
        let (engine, _) = engine();
        let err = engine
            .start_rotation(RotationRequest {
                from_key_id: None,
                to_key_id: 42,
                batch_size: 10,
                initiated_by: None,
                is_automatic: false,
            })
            .unwrap_err();
        assert!(matches!(err, VaultError::KeyNotFound(42)));
    }

    #[tokio::test]
    async fn unknown_rotation_queries_fail() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.progress("nope").unwrap_err(),
            VaultError::RotationNotFound(_)
        ));
        assert!(matches!(
            engine.cancel_rotation("nope").unwrap_err(),
            VaultError::RotationNotFound(_)
        ));
        assert!(matches!(
            engine.subscribe("nope").unwrap_err(),
            VaultError::RotationNotFound(_)
        ));
    }
}
