use thiserror::Error;

use crate::types::{KeyId, KeyStatus};
use boxvault_crypto::CryptoError;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Encryption key {0} not found")]
    KeyNotFound(KeyId),

    #[error("Rotation {0} not found")]
    RotationNotFound(String),

    #[error("Image {0} not found")]
    ImageNotFound(String),

    /// Another InProgress rotation already targets the same source
    /// population.
    #[error("A rotation for this source is already in progress (job {existing})")]
    RotationConflict {
        from_key_id: Option<KeyId>,
        existing: String,
    },

    #[error("Batch size must be at least 1, got {0}")]
    InvalidBatchSize(u32),

    #[error("No active encryption key")]
    NoActiveKey,

    /// The key lifecycle only moves forward; this transition would revisit
    /// an earlier state.
    #[error("Key {id} cannot move from {from} to {to}")]
    InvalidKeyState {
        id: KeyId,
        from: KeyStatus,
        to: KeyStatus,
    },

    /// A record claims to be encrypted but its key id, IV or tag is
    /// missing.
    #[error("Image {0} has inconsistent encryption metadata")]
    CorruptImageMetadata(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Blob store error at {path}: {message}")]
    Blob { path: String, message: String },
}

impl VaultError {
    /// True when the decrypt side of a migration hit a tag-verification
    /// failure, as opposed to a missing record or an I/O fault.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, VaultError::Crypto(CryptoError::IntegrityFailure))
    }
}
