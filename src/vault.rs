//! Vault facade: wires the stores, key lifecycle, and rotation engine,
//! and carries the image upload/download paths.

use std::sync::Arc;

use boxvault_crypto as crypto;

use crate::error::{Result, VaultError};
use crate::events::EventSink;
use crate::keys::{Activation, KeyLifecycleManager};
use crate::rotation::RotationEngine;
use crate::store::traits::{BlobStore, ImageStore, KeyStore, RotationStore};
use crate::types::{ImageRecord, KeyId, RotationJob, RotationRequest};

#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Batch size used by activation-triggered rotations.
    pub default_batch_size: u32,
    /// Kick off an automatic rotation when an activation demotes a key
    /// that still owns images.
    pub auto_rotate_on_activation: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            auto_rotate_on_activation: true,
        }
    }
}

pub struct Vault {
    keys: KeyLifecycleManager,
    rotation: RotationEngine,
    keystore: Arc<dyn KeyStore>,
    images: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
    config: VaultConfig,
}

impl Vault {
    pub fn new(
        keystore: Arc<dyn KeyStore>,
        jobs: Arc<dyn RotationStore>,
        images: Arc<dyn ImageStore>,
        blobs: Arc<dyn BlobStore>,
        events: Arc<dyn EventSink>,
        config: VaultConfig,
    ) -> Self {
        let keys = KeyLifecycleManager::new(
            Arc::clone(&keystore),
            Arc::clone(&images),
            Arc::clone(&events),
        );
        let rotation = RotationEngine::new(
            Arc::clone(&keystore),
            Arc::clone(&images),
            Arc::clone(&blobs),
            jobs,
            events,
        );
        Self {
            keys,
            rotation,
            keystore,
            images,
            blobs,
            config,
        }
    }

    pub fn keys(&self) -> &KeyLifecycleManager {
        &self.keys
    }

    pub fn rotation(&self) -> &RotationEngine {
        &self.rotation
    }

    /// Activate a key and, when the demoted key still owns images, kick
    /// off an automatic rotation from it to the new key.
    ///
    /// Activation success is decoupled from kickoff success: a failed
    /// kickoff (say, a conflicting rotation already running) is reported
    /// and swallowed, never rolled back into the activation.
    pub fn activate_key_with_rotation(
        &self,
        id: KeyId,
        initiated_by: Option<String>,
    ) -> Result<(Activation, Option<RotationJob>)> {
        let activation = self.keys.activate_key(id)?;

        if !self.config.auto_rotate_on_activation {
            return Ok((activation, None));
        }
        let Some(previous) = activation.previous_active else {
            return Ok((activation, None));
        };

        let job = match self.start_auto_rotation(previous, id, initiated_by) {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(
                    key_id = id,
                    from_key_id = previous,
                    error = %err,
                    "automatic rotation kickoff failed; activation stands"
                );
                None
            }
        };
        Ok((activation, job))
    }

    fn start_auto_rotation(
        &self,
        from: KeyId,
        to: KeyId,
        initiated_by: Option<String>,
    ) -> Result<Option<RotationJob>> {
        let (image_count, _) = self.images.key_usage(from)?;
        if image_count == 0 {
            return Ok(None);
        }
        let job = self.rotation.start_rotation(RotationRequest {
            from_key_id: Some(from),
            to_key_id: to,
            batch_size: self.config.default_batch_size,
            initiated_by,
            is_automatic: true,
        })?;
        Ok(Some(job))
    }

    /// Encrypt and store a new image under the Active key. Fails with
    /// `NoActiveKey` before the first key is activated.
    pub async fn store_image(
        &self,
        id: &str,
        storage_path: &str,
        bytes: &[u8],
    ) -> Result<ImageRecord> {
        let key = self.keys.active_key()?.ok_or(VaultError::NoActiveKey)?;
        let sealed = crypto::seal(bytes, &key.material)?;

        self.blobs
            .write_bytes(storage_path, &sealed.ciphertext)
            .await?;
        let record = ImageRecord {
            id: id.to_string(),
            storage_path: storage_path.to_string(),
            size_bytes: bytes.len() as i64,
            is_encrypted: true,
            encryption_key_id: Some(key.id),
            iv: Some(sealed.iv.to_vec()),
            auth_tag: Some(sealed.tag.to_vec()),
        };
        self.images.insert_image(&record)?;
        Ok(record)
    }

    /// Read an image back, decrypting with whichever key its record
    /// references — Active, Deprecated and Retired keys all decrypt.
    pub async fn load_image(&self, id: &str) -> Result<Vec<u8>> {
        let record = self
            .images
            .get_image(id)?
            .ok_or_else(|| VaultError::ImageNotFound(id.to_string()))?;
        let raw = self.blobs.read_bytes(&record.storage_path).await?;

        if !record.is_encrypted {
            return Ok(raw);
        }
        let (Some(key_id), Some(iv), Some(tag)) =
            (record.encryption_key_id, &record.iv, &record.auth_tag)
        else {
            return Err(VaultError::CorruptImageMetadata(record.id.clone()));
        };
        let key = self
            .keystore
            .get_key(key_id)?
            .ok_or(VaultError::KeyNotFound(key_id))?;

        Ok(crypto::open(&raw, iv, tag, &key.material)?)
    }

    /// Startup hook: re-drive any rotation still marked InProgress.
    pub fn resume_inflight(&self) -> Result<Vec<RotationJob>> {
        self.rotation.resume_inflight()
    }
}
