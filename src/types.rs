//! Core data model: key records, image metadata, rotation jobs, and the
//! wire-facing projections the HTTP layer consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boxvault_crypto::KeyMaterial;

/// Stable integer identifier of an encryption key record.
pub type KeyId = i64;

/// Fixed algorithm descriptor stored on every key record.
pub const ALGORITHM_AES_256_GCM: &str = "AES-256-GCM";

// ============================================================================
// Key lifecycle
// ============================================================================

/// Lifecycle state of an encryption key. States only ever move forward:
/// Created → Active → Deprecated → Retired. Forward jumps are allowed
/// (e.g. retiring a key straight from Active); no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Created,
    Active,
    Deprecated,
    Retired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Created => "created",
            KeyStatus::Active => "active",
            KeyStatus::Deprecated => "deprecated",
            KeyStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(KeyStatus::Created),
            "active" => Some(KeyStatus::Active),
            "deprecated" => Some(KeyStatus::Deprecated),
            "retired" => Some(KeyStatus::Retired),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            KeyStatus::Created => 0,
            KeyStatus::Active => 1,
            KeyStatus::Deprecated => 2,
            KeyStatus::Retired => 3,
        }
    }

    /// Whether the forward-only lifecycle permits moving to `next`.
    pub fn can_advance_to(self, next: KeyStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned data-encryption key. Never serialized: the material must
/// not leave the process through an encoder.
#[derive(Debug, Clone)]
pub struct EncryptionKey {
    pub id: KeyId,
    /// Monotonically increasing; ties broken nowhere — the newest key is
    /// the one with the highest version.
    pub version: i64,
    pub material: KeyMaterial,
    pub status: KeyStatus,
    pub algorithm: String,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub deprecated_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// Result of an activation swap at the store level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateOutcome {
    /// The key moved to Active; carries the id of the key demoted to
    /// Deprecated in the same transaction, if one existed.
    Activated { previous_active: Option<KeyId> },
    /// The key was already Active; nothing changed.
    AlreadyActive,
}

/// Aggregated view of one key for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub key_id: KeyId,
    pub version: i64,
    pub status: KeyStatus,
    pub image_count: u64,
    pub total_size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Image metadata
// ============================================================================

/// Image metadata as the core sees it. Owned by the surrounding system;
/// the core only reads it and replaces the encryption triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub is_encrypted: bool,
    pub encryption_key_id: Option<KeyId>,
    /// 12-byte nonce, unique per encryption operation.
    pub iv: Option<Vec<u8>>,
    /// 16-byte GCM authentication tag.
    pub auth_tag: Option<Vec<u8>>,
}

impl ImageRecord {
    /// A record for bytes stored without encryption.
    pub fn plaintext(id: impl Into<String>, storage_path: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            id: id.into(),
            storage_path: storage_path.into(),
            size_bytes,
            is_encrypted: false,
            encryption_key_id: None,
            iv: None,
            auth_tag: None,
        }
    }

    /// `is_encrypted` ⇔ key id, iv and tag are all present.
    pub fn metadata_consistent(&self) -> bool {
        let triple = self.encryption_key_id.is_some() && self.iv.is_some() && self.auth_tag.is_some();
        self.is_encrypted == triple
    }
}

// ============================================================================
// Rotation
// ============================================================================

/// The population a rotation migrates away from: images encrypted under
/// one key, or images not yet encrypted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationSource {
    Key(KeyId),
    Unencrypted,
}

impl RotationSource {
    pub fn from_key_id(from_key_id: Option<KeyId>) -> Self {
        match from_key_id {
            Some(id) => RotationSource::Key(id),
            None => RotationSource::Unencrypted,
        }
    }

    pub fn key_id(&self) -> Option<KeyId> {
        match self {
            RotationSource::Key(id) => Some(*id),
            RotationSource::Unencrypted => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStatus::InProgress => "in_progress",
            RotationStatus::Completed => "completed",
            RotationStatus::Failed => "failed",
            RotationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(RotationStatus::InProgress),
            "completed" => Some(RotationStatus::Completed),
            "failed" => Some(RotationStatus::Failed),
            "cancelled" => Some(RotationStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RotationStatus::InProgress)
    }
}

impl std::fmt::Display for RotationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for starting a rotation.
#[derive(Debug, Clone)]
pub struct RotationRequest {
    /// None = migrate the currently-unencrypted population.
    pub from_key_id: Option<KeyId>,
    pub to_key_id: KeyId,
    pub batch_size: u32,
    pub initiated_by: Option<String>,
    pub is_automatic: bool,
}

/// A durable rotation job row. Mutated only by the rotation engine's own
/// batch loop.
#[derive(Debug, Clone, Serialize)]
pub struct RotationJob {
    pub id: String,
    pub from_key_id: Option<KeyId>,
    pub to_key_id: KeyId,
    pub status: RotationStatus,
    /// Snapshot taken at start; never recomputed mid-run.
    pub total_images: u64,
    pub processed_images: u64,
    pub failed_images: u64,
    pub batch_size: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub initiated_by: Option<String>,
    pub is_automatic: bool,
    pub error_message: Option<String>,
}

impl RotationJob {
    pub fn source(&self) -> RotationSource {
        RotationSource::from_key_id(self.from_key_id)
    }

    pub fn progress(&self) -> RotationProgress {
        RotationProgress {
            rotation_id: self.id.clone(),
            status: self.status,
            total_images: self.total_images,
            processed_images: self.processed_images,
            failed_images: self.failed_images,
        }
    }
}

/// Point-in-time snapshot for polling and push consumers.
/// Percent-complete is `(processed + failed) / total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationProgress {
    pub rotation_id: String,
    pub status: RotationStatus,
    pub total_images: u64,
    pub processed_images: u64,
    pub failed_images: u64,
}
