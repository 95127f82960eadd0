//! Structured event sink for state transitions.
//!
//! Observability stays outside the control flow: components emit an event
//! at each transition and the sink decides what to do with it. The default
//! sink forwards to `tracing` with structured fields.

use crate::types::KeyId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    KeyCreated {
        key_id: KeyId,
        version: i64,
    },
    KeyActivated {
        key_id: KeyId,
        previous_active: Option<KeyId>,
    },
    KeyRetired {
        key_id: KeyId,
    },
    RotationStarted {
        rotation_id: String,
        from_key_id: Option<KeyId>,
        to_key_id: KeyId,
        total_images: u64,
    },
    RotationCompleted {
        rotation_id: String,
        processed_images: u64,
        failed_images: u64,
    },
    RotationFailed {
        rotation_id: String,
        message: String,
    },
    RotationCancelled {
        rotation_id: String,
    },
    ImageMigrationFailed {
        rotation_id: String,
        image_id: String,
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &VaultEvent);
}

/// Default sink: one `tracing` call per transition.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &VaultEvent) {
        match event {
            VaultEvent::KeyCreated { key_id, version } => {
                tracing::info!(key_id, version, "encryption key created");
            }
            VaultEvent::KeyActivated {
                key_id,
                previous_active,
            } => {
                tracing::info!(key_id, ?previous_active, "encryption key activated");
            }
            VaultEvent::KeyRetired { key_id } => {
                tracing::info!(key_id, "encryption key retired");
            }
            VaultEvent::RotationStarted {
                rotation_id,
                from_key_id,
                to_key_id,
                total_images,
            } => {
                tracing::info!(
                    rotation_id = %rotation_id,
                    ?from_key_id,
                    to_key_id,
                    total_images,
                    "rotation started"
                );
            }
            VaultEvent::RotationCompleted {
                rotation_id,
                processed_images,
                failed_images,
            } => {
                tracing::info!(
                    rotation_id = %rotation_id,
                    processed_images,
                    failed_images,
                    "rotation completed"
                );
            }
            VaultEvent::RotationFailed {
                rotation_id,
                message,
            } => {
                tracing::error!(rotation_id = %rotation_id, message = %message, "rotation failed");
            }
            VaultEvent::RotationCancelled { rotation_id } => {
                tracing::info!(rotation_id = %rotation_id, "rotation cancelled");
            }
            VaultEvent::ImageMigrationFailed {
                rotation_id,
                image_id,
                message,
            } => {
                tracing::warn!(
                    rotation_id = %rotation_id,
                    image_id = %image_id,
                    message = %message,
                    "image migration failed"
                );
            }
        }
    }
}
