//! SQLite persistence for keys, rotation jobs, and image metadata.
//!
//! Interior mutability via `parking_lot::Mutex<Connection>`. The
//! single-active-key invariant is enforced twice: by the transactional
//! two-row swap in `activate_key`, and by a partial unique index so even
//! a bug elsewhere cannot persist two Active rows.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use std::path::Path;

use boxvault_crypto::KeyMaterial;

use crate::error::{Result, VaultError};
use crate::types::{
    ActivateOutcome, EncryptionKey, ImageRecord, KeyId, KeyStatus, RotationJob, RotationSource,
    RotationStatus,
};

use super::traits::{ImageStore, KeyStore, NewKey, RotationStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS encryption_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,
    material BLOB NOT NULL,
    status TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    description TEXT,
    created_by TEXT,
    created_at TEXT NOT NULL,
    activated_at TEXT,
    deprecated_at TEXT,
    retired_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_keys_single_active
    ON encryption_keys (status) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS rotation_jobs (
    id TEXT PRIMARY KEY,
    from_key_id INTEGER REFERENCES encryption_keys (id),
    to_key_id INTEGER NOT NULL REFERENCES encryption_keys (id),
    status TEXT NOT NULL,
    total_images INTEGER NOT NULL,
    processed_images INTEGER NOT NULL DEFAULT 0,
    failed_images INTEGER NOT NULL DEFAULT 0,
    batch_size INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    initiated_by TEXT,
    is_automatic INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_rotation_jobs_status ON rotation_jobs (status);

CREATE TABLE IF NOT EXISTS images (
    id TEXT PRIMARY KEY,
    storage_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    is_encrypted INTEGER NOT NULL DEFAULT 0,
    encryption_key_id INTEGER REFERENCES encryption_keys (id),
    iv BLOB,
    auth_tag BLOB
);

CREATE INDEX IF NOT EXISTS idx_images_key
    ON images (encryption_key_id) WHERE encryption_key_id IS NOT NULL;
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Idempotent schema setup. Call once after open.
    pub fn initialize(&self) -> Result<()> {
        self.conn.lock().execute_batch(SCHEMA)?;
        Ok(())
    }
}

// ============================================================================
// Row mapping helpers
// ============================================================================

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, format!("bad timestamp {s:?}: {e}")))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, format!("bad timestamp {s:?}: {e}"))),
        None => Ok(None),
    }
}

fn map_key_row(row: &Row<'_>) -> rusqlite::Result<EncryptionKey> {
    let material_bytes: Vec<u8> = row.get(2)?;
    let material = KeyMaterial::from_slice(&material_bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Blob, Box::new(e)))?;
    let status_str: String = row.get(3)?;
    let status = KeyStatus::parse(&status_str)
        .ok_or_else(|| conversion_err(3, format!("unknown key status {status_str:?}")))?;

    Ok(EncryptionKey {
        id: row.get(0)?,
        version: row.get(1)?,
        material,
        status,
        algorithm: row.get(4)?,
        description: row.get(5)?,
        created_by: row.get(6)?,
        created_at: ts_col(row, 7)?,
        activated_at: opt_ts_col(row, 8)?,
        deprecated_at: opt_ts_col(row, 9)?,
        retired_at: opt_ts_col(row, 10)?,
    })
}

const KEY_COLUMNS: &str = "id, version, material, status, algorithm, description, created_by, \
     created_at, activated_at, deprecated_at, retired_at";

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<RotationJob> {
    let status_str: String = row.get(3)?;
    let status = RotationStatus::parse(&status_str)
        .ok_or_else(|| conversion_err(3, format!("unknown rotation status {status_str:?}")))?;
    let total: i64 = row.get(4)?;
    let processed: i64 = row.get(5)?;
    let failed: i64 = row.get(6)?;
    let batch_size: i64 = row.get(7)?;

    Ok(RotationJob {
        id: row.get(0)?,
        from_key_id: row.get(1)?,
        to_key_id: row.get(2)?,
        status,
        total_images: total as u64,
        processed_images: processed as u64,
        failed_images: failed as u64,
        batch_size: batch_size as u32,
        started_at: ts_col(row, 8)?,
        completed_at: opt_ts_col(row, 9)?,
        initiated_by: row.get(10)?,
        is_automatic: row.get(11)?,
        error_message: row.get(12)?,
    })
}

const JOB_COLUMNS: &str = "id, from_key_id, to_key_id, status, total_images, processed_images, \
     failed_images, batch_size, started_at, completed_at, initiated_by, is_automatic, \
     error_message";

fn map_image_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        storage_path: row.get(1)?,
        size_bytes: row.get(2)?,
        is_encrypted: row.get(3)?,
        encryption_key_id: row.get(4)?,
        iv: row.get(5)?,
        auth_tag: row.get(6)?,
    })
}

const IMAGE_COLUMNS: &str = "id, storage_path, size_bytes, is_encrypted, encryption_key_id, iv, auth_tag";

// ============================================================================
// KeyStore
// ============================================================================

impl KeyStore for SqliteStore {
    fn insert_key(&self, new: NewKey) -> Result<EncryptionKey> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM encryption_keys",
            [],
            |r| r.get(0),
        )?;

        tx.execute(
            "INSERT INTO encryption_keys
                 (version, material, status, algorithm, description, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version,
                new.material.as_bytes(),
                KeyStatus::Created.as_str(),
                new.algorithm,
                new.description,
                new.created_by,
                ts(new.created_at),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(EncryptionKey {
            id,
            version,
            material: new.material,
            status: KeyStatus::Created,
            algorithm: new.algorithm,
            description: new.description,
            created_by: new.created_by,
            created_at: new.created_at,
            activated_at: None,
            deprecated_at: None,
            retired_at: None,
        })
    }

    fn get_key(&self, id: KeyId) -> Result<Option<EncryptionKey>> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM encryption_keys WHERE id = ?1"),
                [id],
                map_key_row,
            )
            .optional()?;
        Ok(key)
    }

    fn list_keys(&self) -> Result<Vec<EncryptionKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys ORDER BY version DESC"
        ))?;
        let keys = stmt
            .query_map([], map_key_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn get_active_key(&self) -> Result<Option<EncryptionKey>> {
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM encryption_keys WHERE status = 'active'"),
                [],
                map_key_row,
            )
            .optional()?;
        Ok(key)
    }

    fn activate_key(&self, id: KeyId, now: DateTime<Utc>) -> Result<ActivateOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM encryption_keys WHERE id = ?1",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        let status = match status {
            Some(s) => KeyStatus::parse(&s)
                .ok_or_else(|| conversion_err(0, format!("unknown key status {s:?}")))?,
            None => return Err(VaultError::KeyNotFound(id)),
        };

        match status {
            KeyStatus::Active => {
                // Idempotent: already the active key.
                Ok(ActivateOutcome::AlreadyActive)
            }
            KeyStatus::Created => {
                let previous_active: Option<KeyId> = tx
                    .query_row(
                        "SELECT id FROM encryption_keys WHERE status = 'active'",
                        [],
                        |r| r.get(0),
                    )
                    .optional()?;

                if let Some(previous) = previous_active {
                    tx.execute(
                        "UPDATE encryption_keys
                             SET status = 'deprecated', deprecated_at = ?1
                         WHERE id = ?2",
                        params![ts(now), previous],
                    )?;
                }
                tx.execute(
                    "UPDATE encryption_keys SET status = 'active', activated_at = ?1 WHERE id = ?2",
                    params![ts(now), id],
                )?;
                tx.commit()?;

                Ok(ActivateOutcome::Activated { previous_active })
            }
            KeyStatus::Deprecated | KeyStatus::Retired => Err(VaultError::InvalidKeyState {
                id,
                from: status,
                to: KeyStatus::Active,
            }),
        }
    }

    fn retire_key(&self, id: KeyId, now: DateTime<Utc>) -> Result<EncryptionKey> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let key = tx
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM encryption_keys WHERE id = ?1"),
                [id],
                map_key_row,
            )
            .optional()?;
        let mut key = match key {
            Some(k) => k,
            None => return Err(VaultError::KeyNotFound(id)),
        };

        if key.status != KeyStatus::Retired {
            tx.execute(
                "UPDATE encryption_keys SET status = 'retired', retired_at = ?1 WHERE id = ?2",
                params![ts(now), id],
            )?;
            key.status = KeyStatus::Retired;
            key.retired_at = Some(now);
        }
        tx.commit()?;

        Ok(key)
    }
}

// ============================================================================
// RotationStore
// ============================================================================

impl RotationStore for SqliteStore {
    fn create_job(&self, job: &RotationJob) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // `IS` instead of `=` so a NULL source (unencrypted population)
        // conflicts with another NULL-source job.
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM rotation_jobs WHERE status = 'in_progress' AND from_key_id IS ?1",
                params![job.from_key_id],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            return Err(VaultError::RotationConflict {
                from_key_id: job.from_key_id,
                existing,
            });
        }

        tx.execute(
            "INSERT INTO rotation_jobs
                 (id, from_key_id, to_key_id, status, total_images, processed_images,
                  failed_images, batch_size, started_at, completed_at, initiated_by,
                  is_automatic, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id,
                job.from_key_id,
                job.to_key_id,
                job.status.as_str(),
                job.total_images as i64,
                job.processed_images as i64,
                job.failed_images as i64,
                job.batch_size as i64,
                ts(job.started_at),
                job.completed_at.map(ts),
                job.initiated_by,
                job.is_automatic,
                job.error_message,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<RotationJob>> {
        let conn = self.conn.lock();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM rotation_jobs WHERE id = ?1"),
                [id],
                map_job_row,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs(&self, status: Option<RotationStatus>) -> Result<Vec<RotationJob>> {
        let conn = self.conn.lock();
        let jobs = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM rotation_jobs WHERE status = ?1 ORDER BY started_at"
                ))?;
                let jobs = stmt
                    .query_map([status.as_str()], map_job_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                jobs
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM rotation_jobs ORDER BY started_at"
                ))?;
                let jobs = stmt
                    .query_map([], map_job_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                jobs
            }
        };
        Ok(jobs)
    }

    fn checkpoint(&self, id: &str, processed: u64, failed: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE rotation_jobs
                 SET processed_images = ?1, failed_images = ?2
             WHERE id = ?3 AND status = 'in_progress'",
            params![processed as i64, failed as i64, id],
        )?;
        Ok(())
    }

    fn finish_job(
        &self,
        id: &str,
        status: RotationStatus,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        // The status guard makes terminal states immutable.
        let changed = conn.execute(
            "UPDATE rotation_jobs
                 SET status = ?1, error_message = ?2, completed_at = ?3
             WHERE id = ?4 AND status = 'in_progress'",
            params![status.as_str(), error_message, ts(completed_at), id],
        )?;
        Ok(changed == 1)
    }
}

// ============================================================================
// ImageStore
// ============================================================================

impl ImageStore for SqliteStore {
    fn insert_image(&self, image: &ImageRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO images
                 (id, storage_path, size_bytes, is_encrypted, encryption_key_id, iv, auth_tag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                image.id,
                image.storage_path,
                image.size_bytes,
                image.is_encrypted,
                image.encryption_key_id,
                image.iv,
                image.auth_tag,
            ],
        )?;
        Ok(())
    }

    fn get_image(&self, id: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn.lock();
        let image = conn
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1"),
                [id],
                map_image_row,
            )
            .optional()?;
        Ok(image)
    }

    fn count_images(&self, source: RotationSource) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = match source {
            RotationSource::Key(key_id) => conn.query_row(
                "SELECT COUNT(*) FROM images WHERE is_encrypted = 1 AND encryption_key_id = ?1",
                [key_id],
                |r| r.get(0),
            )?,
            RotationSource::Unencrypted => conn.query_row(
                "SELECT COUNT(*) FROM images WHERE is_encrypted = 0",
                [],
                |r| r.get(0),
            )?,
        };
        Ok(count as u64)
    }

    fn key_usage(&self, key_id: KeyId) -> Result<(u64, i64)> {
        let conn = self.conn.lock();
        let (count, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0)
                 FROM images WHERE encryption_key_id = ?1",
            [key_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((count as u64, bytes))
    }

    fn next_batch(
        &self,
        source: RotationSource,
        limit: usize,
        exclude: &[String],
    ) -> Result<Vec<ImageRecord>> {
        let mut sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE ");
        let mut bind: Vec<Box<dyn ToSql>> = Vec::new();

        match source {
            RotationSource::Key(key_id) => {
                sql.push_str("is_encrypted = 1 AND encryption_key_id = ?");
                bind.push(Box::new(key_id));
            }
            RotationSource::Unencrypted => sql.push_str("is_encrypted = 0"),
        }

        if !exclude.is_empty() {
            let placeholders = vec!["?"; exclude.len()].join(", ");
            sql.push_str(&format!(" AND id NOT IN ({placeholders})"));
            for id in exclude {
                bind.push(Box::new(id.clone()));
            }
        }

        sql.push_str(" ORDER BY id LIMIT ?");
        bind.push(Box::new(limit as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let images = stmt
            .query_map(params_from_iter(bind), map_image_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    fn set_encryption(
        &self,
        image_id: &str,
        key_id: KeyId,
        iv: &[u8],
        auth_tag: &[u8],
    ) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE images
                 SET is_encrypted = 1, encryption_key_id = ?1, iv = ?2, auth_tag = ?3
             WHERE id = ?4",
            params![key_id, iv, auth_tag, image_id],
        )?;
        if changed == 0 {
            return Err(VaultError::ImageNotFound(image_id.to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
