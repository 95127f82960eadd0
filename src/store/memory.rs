//! In-memory image and blob stores.
//!
//! The surrounding system owns real image metadata and blob storage; these
//! doubles implement the same contracts for embedding and tests. The blob
//! store can poison individual paths to exercise per-image failure
//! isolation.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, VaultError};
use crate::types::{ImageRecord, KeyId, RotationSource};

use super::traits::{BlobStore, ImageStore};

// ============================================================================
// MemoryImageStore
// ============================================================================

/// Image metadata held in a `BTreeMap` so scans come back in id order,
/// matching the stable keyset ordering the rotation loop relies on.
#[derive(Default)]
pub struct MemoryImageStore {
    images: Mutex<BTreeMap<String, ImageRecord>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(image: &ImageRecord, source: RotationSource) -> bool {
        match source {
            RotationSource::Key(key_id) => {
                image.is_encrypted && image.encryption_key_id == Some(key_id)
            }
            RotationSource::Unencrypted => !image.is_encrypted,
        }
    }
}

impl ImageStore for MemoryImageStore {
    fn insert_image(&self, image: &ImageRecord) -> Result<()> {
        self.images
            .lock()
            .insert(image.id.clone(), image.clone());
        Ok(())
    }

    fn get_image(&self, id: &str) -> Result<Option<ImageRecord>> {
        Ok(self.images.lock().get(id).cloned())
    }

    fn count_images(&self, source: RotationSource) -> Result<u64> {
        let images = self.images.lock();
        Ok(images.values().filter(|i| Self::matches(i, source)).count() as u64)
    }

    fn key_usage(&self, key_id: KeyId) -> Result<(u64, i64)> {
        let images = self.images.lock();
        let mut count = 0u64;
        let mut bytes = 0i64;
        for image in images.values() {
            if image.encryption_key_id == Some(key_id) {
                count += 1;
                bytes += image.size_bytes;
            }
        }
        Ok((count, bytes))
    }

    fn next_batch(
        &self,
        source: RotationSource,
        limit: usize,
        exclude: &[String],
    ) -> Result<Vec<ImageRecord>> {
        let images = self.images.lock();
        Ok(images
            .values()
            .filter(|i| Self::matches(i, source))
            .filter(|i| !exclude.contains(&i.id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn set_encryption(
        &self,
        image_id: &str,
        key_id: KeyId,
        iv: &[u8],
        auth_tag: &[u8],
    ) -> Result<()> {
        let mut images = self.images.lock();
        let image = images
            .get_mut(image_id)
            .ok_or_else(|| VaultError::ImageNotFound(image_id.to_string()))?;
        image.is_encrypted = true;
        image.encryption_key_id = Some(key_id);
        image.iv = Some(iv.to_vec());
        image.auth_tag = Some(auth_tag.to_vec());
        Ok(())
    }
}

// ============================================================================
// MemoryBlobStore
// ============================================================================

/// Blob bytes in a HashMap, with per-path fault injection.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    poisoned: Mutex<HashSet<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read of `path` fail until [`Self::heal`] is called.
    pub fn poison(&self, path: &str) {
        self.poisoned.lock().insert(path.to_string());
    }

    pub fn heal(&self, path: &str) {
        self.poisoned.lock().remove(path);
    }

    /// Direct peek for assertions.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(path).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        if self.poisoned.lock().contains(path) {
            return Err(VaultError::Blob {
                path: path.to_string(),
                message: "read failed".to_string(),
            });
        }
        self.blobs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| VaultError::Blob {
                path: path.to_string(),
                message: "no such blob".to_string(),
            })
    }

    async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.lock().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}
