//! Key lifecycle: create, activate, retire, inspect.
//!
//! The manager owns no state of its own; the store enforces the atomic
//! parts (version assignment, the two-row activation swap) and this layer
//! adds key-material generation, event emission, and the aggregate views.

use std::sync::Arc;

use chrono::Utc;

use boxvault_crypto::KeyMaterial;

use crate::error::{Result, VaultError};
use crate::events::{EventSink, VaultEvent};
use crate::store::traits::{ImageStore, KeyStore, NewKey};
use crate::types::{ActivateOutcome, EncryptionKey, KeyId, KeyStats, KeyStatus, ALGORITHM_AES_256_GCM};

/// Outcome of a successful activation.
#[derive(Debug, Clone)]
pub struct Activation {
    pub key: EncryptionKey,
    /// Key demoted to Deprecated by this activation, if any. The caller
    /// uses it to decide whether to kick off an automatic rotation.
    pub previous_active: Option<KeyId>,
}

pub struct KeyLifecycleManager {
    keys: Arc<dyn KeyStore>,
    images: Arc<dyn ImageStore>,
    events: Arc<dyn EventSink>,
}

impl KeyLifecycleManager {
    pub fn new(
        keys: Arc<dyn KeyStore>,
        images: Arc<dyn ImageStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            keys,
            images,
            events,
        }
    }

    /// Generate a fresh 256-bit key with the next version, status Created.
    pub fn create_key(
        &self,
        description: Option<String>,
        created_by: Option<String>,
    ) -> Result<EncryptionKey> {
        let material = KeyMaterial::generate()?;
        let key = self.keys.insert_key(NewKey {
            material,
            algorithm: ALGORITHM_AES_256_GCM.to_string(),
            description,
            created_by,
            created_at: Utc::now(),
        })?;
        self.events.emit(&VaultEvent::KeyCreated {
            key_id: key.id,
            version: key.version,
        });
        Ok(key)
    }

    /// Promote a key to Active, demoting the previous Active key to
    /// Deprecated in the same transaction. Idempotent for the key that is
    /// already Active.
    pub fn activate_key(&self, id: KeyId) -> Result<Activation> {
        let outcome = self.keys.activate_key(id, Utc::now())?;
        let key = self
            .keys
            .get_key(id)?
            .ok_or(VaultError::KeyNotFound(id))?;

        match outcome {
            ActivateOutcome::Activated { previous_active } => {
                self.events.emit(&VaultEvent::KeyActivated {
                    key_id: id,
                    previous_active,
                });
                Ok(Activation {
                    key,
                    previous_active,
                })
            }
            ActivateOutcome::AlreadyActive => Ok(Activation {
                key,
                previous_active: None,
            }),
        }
    }

    /// Retire a key. Retired keys stay in the store so legacy images keep
    /// decrypting; they are just no longer eligible for activation.
    pub fn retire_key(&self, id: KeyId) -> Result<EncryptionKey> {
        let current = self
            .keys
            .get_key(id)?
            .ok_or(VaultError::KeyNotFound(id))?;
        if current.status == KeyStatus::Retired {
            return Ok(current);
        }

        let key = self.keys.retire_key(id, Utc::now())?;
        self.events.emit(&VaultEvent::KeyRetired { key_id: id });
        Ok(key)
    }

    pub fn active_key(&self) -> Result<Option<EncryptionKey>> {
        self.keys.get_active_key()
    }

    pub fn get_key(&self, id: KeyId) -> Result<EncryptionKey> {
        self.keys.get_key(id)?.ok_or(VaultError::KeyNotFound(id))
    }

    /// All keys, newest version first.
    pub fn list_keys(&self) -> Result<Vec<EncryptionKey>> {
        self.keys.list_keys()
    }

    /// Per-key usage aggregate over the image metadata.
    pub fn key_stats(&self, id: KeyId) -> Result<KeyStats> {
        let key = self.get_key(id)?;
        let (image_count, total_size_bytes) = self.images.key_usage(id)?;
        Ok(KeyStats {
            key_id: key.id,
            version: key.version,
            status: key.status,
            image_count,
            total_size_bytes,
            created_at: key.created_at,
            activated_at: key.activated_at,
        })
    }
}
