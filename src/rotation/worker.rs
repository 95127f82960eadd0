//! The rotation batch loop.
//!
//! One worker drives one job: select a batch of images still matching the
//! source condition, migrate each image, checkpoint the counters, repeat.
//! A migrated image's key id changes, so it drops out of the next
//! selection on its own — "already migrated" and "never existed" look the
//! same to the query, which is what makes a crashed drive resumable
//! without cursor bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use boxvault_crypto as crypto;

use crate::error::{Result, VaultError};
use crate::events::VaultEvent;
use crate::types::{EncryptionKey, ImageRecord, RotationJob, RotationProgress, RotationStatus};

use super::engine::EngineShared;

enum Drive {
    Completed { processed: u64, failed: u64 },
    Cancelled,
}

pub(crate) async fn run(shared: Arc<EngineShared>, job: RotationJob, cancel: CancellationToken) {
    let rotation_id = job.id.clone();

    match drive(&shared, &job, &cancel).await {
        Ok(Drive::Completed { processed, failed }) => {
            if finish(&shared, &rotation_id, RotationStatus::Completed, None) {
                shared.events.emit(&VaultEvent::RotationCompleted {
                    rotation_id: rotation_id.clone(),
                    processed_images: processed,
                    failed_images: failed,
                });
            }
        }
        Ok(Drive::Cancelled) => {
            if finish(&shared, &rotation_id, RotationStatus::Cancelled, None) {
                shared.events.emit(&VaultEvent::RotationCancelled {
                    rotation_id: rotation_id.clone(),
                });
            }
        }
        Err(err) => {
            // A driver-level failure, as opposed to a single bad image.
            let message = err.to_string();
            if finish(&shared, &rotation_id, RotationStatus::Failed, Some(&message)) {
                shared.events.emit(&VaultEvent::RotationFailed {
                    rotation_id: rotation_id.clone(),
                    message,
                });
            }
        }
    }

    publish_terminal(&shared, &rotation_id);
    shared.running.lock().remove(&rotation_id);
}

async fn drive(
    shared: &EngineShared,
    job: &RotationJob,
    cancel: &CancellationToken,
) -> Result<Drive> {
    let source = job.source();
    let from_key = match job.from_key_id {
        Some(id) => Some(
            shared
                .keys
                .get_key(id)?
                .ok_or(VaultError::KeyNotFound(id))?,
        ),
        None => None,
    };
    let to_key = shared
        .keys
        .get_key(job.to_key_id)?
        .ok_or(VaultError::KeyNotFound(job.to_key_id))?;

    let mut processed = job.processed_images;
    // Failed candidates stay in the source population, so a fresh drive
    // (after a crash) retries them and recounts from zero.
    let mut failed = 0u64;
    // Images that failed in this drive; excluded from selection so the
    // loop cannot spin on a persistently bad image.
    let mut skipped: Vec<String> = Vec::new();
    // The total is a snapshot: never migrate more than it allows, even if
    // new matching images appear mid-run.
    let mut budget = job.total_images.saturating_sub(processed);

    loop {
        // Cancellation is only observed between batches.
        if cancel.is_cancelled() {
            return Ok(Drive::Cancelled);
        }
        if budget == 0 {
            return Ok(Drive::Completed { processed, failed });
        }

        let limit = u64::from(job.batch_size).min(budget) as usize;
        let batch = shared.images.next_batch(source, limit, &skipped)?;
        if batch.is_empty() {
            return Ok(Drive::Completed { processed, failed });
        }

        for image in &batch {
            match migrate_image(shared, image, from_key.as_ref(), &to_key).await {
                Ok(()) => processed += 1,
                Err(err) => {
                    failed += 1;
                    skipped.push(image.id.clone());
                    shared.events.emit(&VaultEvent::ImageMigrationFailed {
                        rotation_id: job.id.clone(),
                        image_id: image.id.clone(),
                        message: err.to_string(),
                    });
                }
            }
            budget -= 1;
        }

        // Durable checkpoint after every batch.
        shared.jobs.checkpoint(&job.id, processed, failed)?;
        publish(
            shared,
            &job.id,
            RotationProgress {
                rotation_id: job.id.clone(),
                status: RotationStatus::InProgress,
                total_images: job.total_images,
                processed_images: processed,
                failed_images: failed,
            },
        );
    }
}

/// Migrate one image to the target key: read, decrypt (or take the raw
/// bytes when the source is the unencrypted population), re-encrypt with
/// a fresh nonce, write the blob, then replace the metadata triple.
///
/// The blob is written before the metadata so a crash in between leaves
/// the record pointing at the old key; the image then resurfaces as a
/// failed candidate on the next drive instead of vanishing.
async fn migrate_image(
    shared: &EngineShared,
    image: &ImageRecord,
    from_key: Option<&EncryptionKey>,
    to_key: &EncryptionKey,
) -> Result<()> {
    let raw = shared.blobs.read_bytes(&image.storage_path).await?;

    let plaintext = match from_key {
        Some(key) => {
            let (iv, tag) = match (&image.iv, &image.auth_tag) {
                (Some(iv), Some(tag)) => (iv.as_slice(), tag.as_slice()),
                _ => return Err(VaultError::CorruptImageMetadata(image.id.clone())),
            };
            crypto::open(&raw, iv, tag, &key.material)?
        }
        None => raw,
    };

    let sealed = crypto::seal(&plaintext, &to_key.material)?;

    shared
        .blobs
        .write_bytes(&image.storage_path, &sealed.ciphertext)
        .await?;
    shared
        .images
        .set_encryption(&image.id, to_key.id, &sealed.iv, &sealed.tag)?;
    Ok(())
}

fn finish(
    shared: &EngineShared,
    rotation_id: &str,
    status: RotationStatus,
    error_message: Option<&str>,
) -> bool {
    match shared
        .jobs
        .finish_job(rotation_id, status, error_message, Utc::now())
    {
        Ok(changed) => changed,
        Err(err) => {
            tracing::error!(
                rotation_id = %rotation_id,
                error = %err,
                "could not finalize rotation job"
            );
            false
        }
    }
}

fn publish(shared: &EngineShared, rotation_id: &str, progress: RotationProgress) {
    if let Some(run) = shared.running.lock().get(rotation_id) {
        run.progress.send_replace(progress);
    }
}

/// Push the final row state to subscribers before the channel closes.
fn publish_terminal(shared: &EngineShared, rotation_id: &str) {
    if let Ok(Some(job)) = shared.jobs.get_job(rotation_id) {
        publish(shared, rotation_id, job.progress());
    }
}
