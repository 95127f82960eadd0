//! boxvault — encryption key lifecycle and image re-encryption engine.
//!
//! Versioned AES-256-GCM keys protect uploaded images at rest. Activating
//! a new key demotes the old one and can kick off a background rotation
//! that re-encrypts the image population batch by batch — resumable,
//! cancellable, and tolerant of individual bad images.

pub mod error;
pub mod events;
pub mod keys;
pub mod rotation;
pub mod store;
pub mod types;
pub mod vault;

pub use boxvault_crypto as crypto;

pub use error::{Result, VaultError};
pub use events::{EventSink, TracingSink, VaultEvent};
pub use keys::{Activation, KeyLifecycleManager};
pub use rotation::{RotationEngine, RotationProgressReporter};
pub use store::memory::{MemoryBlobStore, MemoryImageStore};
pub use store::sqlite::SqliteStore;
pub use store::traits::{BlobStore, ImageStore, KeyStore, NewKey, RotationStore};
pub use types::{
    ActivateOutcome, EncryptionKey, ImageRecord, KeyId, KeyStats, KeyStatus, RotationJob,
    RotationProgress, RotationRequest, RotationSource, RotationStatus, ALGORITHM_AES_256_GCM,
};
pub use vault::{Vault, VaultConfig};
