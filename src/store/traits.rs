//! Storage seams.
//!
//! Key and rotation-job rows are owned by this core and persisted through
//! [`KeyStore`] / [`RotationStore`]. Image metadata and raw bytes belong
//! to the surrounding system; [`ImageStore`] and [`BlobStore`] are the
//! narrow contracts the core consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use boxvault_crypto::KeyMaterial;

use crate::error::Result;
use crate::types::{
    ActivateOutcome, EncryptionKey, ImageRecord, KeyId, RotationJob, RotationSource,
    RotationStatus,
};

/// Fields for a key row about to be inserted. The store assigns the id
/// and the next version.
pub struct NewKey {
    pub material: KeyMaterial,
    pub algorithm: String,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub trait KeyStore: Send + Sync {
    /// Insert a key with status Created and version = max existing + 1.
    fn insert_key(&self, new: NewKey) -> Result<EncryptionKey>;

    fn get_key(&self, id: KeyId) -> Result<Option<EncryptionKey>>;

    /// All keys, newest version first.
    fn list_keys(&self) -> Result<Vec<EncryptionKey>>;

    fn get_active_key(&self) -> Result<Option<EncryptionKey>>;

    /// Atomically demote the current Active key (if any) to Deprecated and
    /// promote `id` to Active. The two-row swap happens in one transaction
    /// so no other transaction ever observes two Active keys.
    ///
    /// Errors: `KeyNotFound` for an unknown id; `InvalidKeyState` when the
    /// target is Deprecated or Retired (the lifecycle only moves forward).
    /// Activating the already-Active key is an idempotent no-op.
    fn activate_key(&self, id: KeyId, now: DateTime<Utc>) -> Result<ActivateOutcome>;

    /// Move a key to Retired. Allowed from any earlier state; retiring a
    /// Retired key is a no-op. Errors with `KeyNotFound` for an unknown id.
    fn retire_key(&self, id: KeyId, now: DateTime<Utc>) -> Result<EncryptionKey>;
}

pub trait RotationStore: Send + Sync {
    /// Persist a new job row. Checks for another InProgress job with the
    /// same source and inserts in one transaction; rejects with
    /// `RotationConflict` when one exists.
    fn create_job(&self, job: &RotationJob) -> Result<()>;

    fn get_job(&self, id: &str) -> Result<Option<RotationJob>>;

    fn list_jobs(&self, status: Option<RotationStatus>) -> Result<Vec<RotationJob>>;

    /// Durable progress checkpoint, written after every batch. Ignored for
    /// jobs already in a terminal state.
    fn checkpoint(&self, id: &str, processed: u64, failed: u64) -> Result<()>;

    /// Move the job to a terminal status. Returns false when the job was
    /// already terminal (terminal states never change again).
    fn finish_job(
        &self,
        id: &str,
        status: RotationStatus,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;
}

pub trait ImageStore: Send + Sync {
    fn insert_image(&self, image: &ImageRecord) -> Result<()>;

    fn get_image(&self, id: &str) -> Result<Option<ImageRecord>>;

    /// Count of images currently matching `source`.
    fn count_images(&self, source: RotationSource) -> Result<u64>;

    /// `(image count, total byte size)` of images encrypted under `key_id`.
    fn key_usage(&self, key_id: KeyId) -> Result<(u64, i64)>;

    /// The next `limit` images still matching `source`, ordered by image
    /// id, skipping ids in `exclude`. Migrated images drop out of the
    /// result on their own because their key id changes.
    fn next_batch(
        &self,
        source: RotationSource,
        limit: usize,
        exclude: &[String],
    ) -> Result<Vec<ImageRecord>>;

    /// Replace the encryption triple (key id, IV, tag) as one update and
    /// mark the record encrypted. The three fields are never written
    /// independently.
    fn set_encryption(&self, image_id: &str, key_id: KeyId, iv: &[u8], auth_tag: &[u8])
        -> Result<()>;
}

/// Raw byte storage. Implementation and location are opaque to the core.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;
    async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<()>;
}
