//! Integration tests for the rotation engine: full migrations, failure
//! isolation, resumability, cancellation, and progress reporting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use boxvault::crypto;
use boxvault::{
    EncryptionKey, EventSink, ImageRecord, ImageStore, KeyLifecycleManager, KeyStore,
    MemoryBlobStore, MemoryImageStore, RotationEngine, RotationJob, RotationRequest,
    RotationSource, RotationStatus, RotationStore, SqliteStore, VaultEvent,
};

// ============================================================================
// Helpers
// ============================================================================

struct RecordingSink(Mutex<Vec<VaultEvent>>);

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Vec::new())))
    }

    fn events(&self) -> Vec<VaultEvent> {
        self.0.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &VaultEvent) {
        self.0.lock().push(event.clone());
    }
}

/// ImageStore wrapper that counts batch selections.
struct CountingImageStore {
    inner: MemoryImageStore,
    batch_calls: AtomicUsize,
}

impl CountingImageStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryImageStore::new(),
            batch_calls: AtomicUsize::new(0),
        })
    }

    fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }
}

impl ImageStore for CountingImageStore {
    fn insert_image(&self, image: &ImageRecord) -> boxvault::Result<()> {
        self.inner.insert_image(image)
    }

    fn get_image(&self, id: &str) -> boxvault::Result<Option<ImageRecord>> {
        self.inner.get_image(id)
    }

    fn count_images(&self, source: RotationSource) -> boxvault::Result<u64> {
        self.inner.count_images(source)
    }

    fn key_usage(&self, key_id: i64) -> boxvault::Result<(u64, i64)> {
        self.inner.key_usage(key_id)
    }

    fn next_batch(
        &self,
        source: RotationSource,
        limit: usize,
        exclude: &[String],
    ) -> boxvault::Result<Vec<ImageRecord>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.next_batch(source, limit, exclude)
    }

    fn set_encryption(
        &self,
        image_id: &str,
        key_id: i64,
        iv: &[u8],
        auth_tag: &[u8],
    ) -> boxvault::Result<()> {
        self.inner.set_encryption(image_id, key_id, iv, auth_tag)
    }
}

/// RotationStore wrapper whose first checkpoint blocks until released,
/// pinning the worker between two batches.
struct GatedJobStore {
    inner: Arc<SqliteStore>,
    armed: AtomicBool,
    reached: mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl GatedJobStore {
    fn new(inner: Arc<SqliteStore>) -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Arc::new(Self {
            inner,
            armed: AtomicBool::new(true),
            reached: reached_tx,
            release: Mutex::new(release_rx),
        });
        (store, reached_rx, release_tx)
    }
}

impl RotationStore for GatedJobStore {
    fn create_job(&self, job: &RotationJob) -> boxvault::Result<()> {
        self.inner.create_job(job)
    }

    fn get_job(&self, id: &str) -> boxvault::Result<Option<RotationJob>> {
        self.inner.get_job(id)
    }

    fn list_jobs(&self, status: Option<RotationStatus>) -> boxvault::Result<Vec<RotationJob>> {
        self.inner.list_jobs(status)
    }

    fn checkpoint(&self, id: &str, processed: u64, failed: u64) -> boxvault::Result<()> {
        let result = self.inner.checkpoint(id, processed, failed);
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.reached.send(());
            let _ = self.release.lock().recv();
        }
        result
    }

    fn finish_job(
        &self,
        id: &str,
        status: RotationStatus,
        error_message: Option<&str>,
        completed_at: chrono::DateTime<Utc>,
    ) -> boxvault::Result<bool> {
        self.inner.finish_job(id, status, error_message, completed_at)
    }
}

struct Harness {
    engine: RotationEngine,
    manager: KeyLifecycleManager,
    store: Arc<SqliteStore>,
    images: Arc<CountingImageStore>,
    blobs: Arc<MemoryBlobStore>,
    sink: Arc<RecordingSink>,
}

fn harness() -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.initialize().unwrap();
    let images = CountingImageStore::new();
    let blobs = Arc::new(MemoryBlobStore::new());
    let sink = RecordingSink::new();

    let engine = RotationEngine::new(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        Arc::clone(&images) as Arc<dyn ImageStore>,
        Arc::clone(&blobs) as Arc<dyn boxvault::BlobStore>,
        Arc::clone(&store) as Arc<dyn RotationStore>,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );
    let manager = KeyLifecycleManager::new(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        Arc::clone(&images) as Arc<dyn ImageStore>,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );

    Harness {
        engine,
        manager,
        store,
        images,
        blobs,
        sink,
    }
}

fn image_id(i: usize) -> String {
    format!("img-{i:04}")
}

fn body(i: usize) -> Vec<u8> {
    format!("image body {i}").into_bytes()
}

/// Seed one image encrypted under `key`, blob and metadata both written.
async fn seed_encrypted(h: &Harness, key: &EncryptionKey, i: usize) {
    let id = image_id(i);
    let path = format!("blobs/{id}");
    let sealed = crypto::seal(&body(i), &key.material).unwrap();
    boxvault::BlobStore::write_bytes(h.blobs.as_ref(), &path, &sealed.ciphertext)
        .await
        .unwrap();
    h.images
        .insert_image(&ImageRecord {
            id,
            storage_path: path,
            size_bytes: body(i).len() as i64,
            is_encrypted: true,
            encryption_key_id: Some(key.id),
            iv: Some(sealed.iv.to_vec()),
            auth_tag: Some(sealed.tag.to_vec()),
        })
        .unwrap();
}

/// Seed one unencrypted image.
async fn seed_plaintext(h: &Harness, i: usize) {
    let id = image_id(i);
    let path = format!("blobs/{id}");
    boxvault::BlobStore::write_bytes(h.blobs.as_ref(), &path, &body(i))
        .await
        .unwrap();
    h.images
        .insert_image(&ImageRecord::plaintext(id, path, body(i).len() as i64))
        .unwrap();
}

async fn wait_terminal(engine: &RotationEngine, id: &str) -> RotationJob {
    for _ in 0..500 {
        let job = engine.get_rotation(id).unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("rotation {id} did not reach a terminal state");
}

fn request(from: Option<i64>, to: i64, batch_size: u32) -> RotationRequest {
    RotationRequest {
        from_key_id: from,
        to_key_id: to,
        batch_size,
        initiated_by: Some("tests".to_string()),
        is_automatic: false,
    }
}

// ============================================================================
// Full migrations
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrates_whole_population_between_keys() {
    let h = harness();
    let k1 = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(k1.id).unwrap();
    for i in 0..250 {
        seed_encrypted(&h, &k1, i).await;
    }

    let k2 = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(k2.id).unwrap();

    let job = h
        .engine
        .start_rotation(request(Some(k1.id), k2.id, 100))
        .unwrap();
    assert_eq!(job.total_images, 250);
    assert_eq!(job.status, RotationStatus::InProgress);

    let done = wait_terminal(&h.engine, &job.id).await;
    assert_eq!(done.status, RotationStatus::Completed);
    assert_eq!(done.processed_images, 250);
    assert_eq!(done.failed_images, 0);
    assert!(done.completed_at.is_some());

    // 100 + 100 + 50, no trailing empty selection.
    assert_eq!(h.images.batch_calls(), 3);

    assert_eq!(h.images.count_images(RotationSource::Key(k2.id)).unwrap(), 250);
    assert_eq!(h.images.count_images(RotationSource::Key(k1.id)).unwrap(), 0);

    // Every image decrypts under the new key to its original bytes.
    for i in [0, 99, 100, 249] {
        let record = h.images.get_image(&image_id(i)).unwrap().unwrap();
        let raw = boxvault::BlobStore::read_bytes(h.blobs.as_ref(), &record.storage_path)
            .await
            .unwrap();
        let plain = crypto::open(
            &raw,
            record.iv.as_deref().unwrap(),
            record.auth_tag.as_deref().unwrap(),
            &k2.material,
        )
        .unwrap();
        assert_eq!(plain, body(i));
    }

    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, VaultEvent::RotationCompleted { processed_images: 250, .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encrypts_unencrypted_population() {
    let h = harness();
    let key = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(key.id).unwrap();
    for i in 0..50 {
        seed_plaintext(&h, i).await;
    }

    let job = h.engine.start_rotation(request(None, key.id, 20)).unwrap();
    assert_eq!(job.total_images, 50);

    let done = wait_terminal(&h.engine, &job.id).await;
    assert_eq!(done.status, RotationStatus::Completed);
    assert_eq!(done.processed_images, 50);
    assert_eq!(done.failed_images, 0);

    // 20 + 20 + 10.
    assert_eq!(h.images.batch_calls(), 3);

    assert_eq!(h.images.count_images(RotationSource::Unencrypted).unwrap(), 0);
    assert_eq!(h.images.count_images(RotationSource::Key(key.id)).unwrap(), 50);

    let record = h.images.get_image(&image_id(7)).unwrap().unwrap();
    assert!(record.is_encrypted);
    assert!(record.metadata_consistent());
    let raw = boxvault::BlobStore::read_bytes(h.blobs.as_ref(), &record.storage_path)
        .await
        .unwrap();
    assert_ne!(raw, body(7));
    let plain = crypto::open(
        &raw,
        record.iv.as_deref().unwrap(),
        record.auth_tag.as_deref().unwrap(),
        &key.material,
    )
    .unwrap();
    assert_eq!(plain, body(7));
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_bad_image_never_aborts_the_job() {
    let h = harness();
    let k1 = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(k1.id).unwrap();
    for i in 0..5 {
        seed_encrypted(&h, &k1, i).await;
    }
    h.blobs.poison(&format!("blobs/{}", image_id(2)));

    let k2 = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(k2.id).unwrap();

    let job = h
        .engine
        .start_rotation(request(Some(k1.id), k2.id, 2))
        .unwrap();
    let done = wait_terminal(&h.engine, &job.id).await;

    // Partial success is still Completed, distinguishable by the count.
    assert_eq!(done.status, RotationStatus::Completed);
    assert_eq!(done.processed_images, 4);
    assert_eq!(done.failed_images, 1);
    assert!(done.processed_images + done.failed_images <= done.total_images);

    // The failed image still references the old key.
    let bad = h.images.get_image(&image_id(2)).unwrap().unwrap();
    assert_eq!(bad.encryption_key_id, Some(k1.id));
    assert_eq!(h.images.count_images(RotationSource::Key(k2.id)).unwrap(), 4);

    let failed_event = h.sink.events().into_iter().find_map(|e| match e {
        VaultEvent::ImageMigrationFailed { image_id, .. } => Some(image_id),
        _ => None,
    });
    assert_eq!(failed_event.as_deref(), Some(image_id(2).as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tampered_blob_fails_integrity_but_job_completes() {
    let h = harness();
    let k1 = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(k1.id).unwrap();
    for i in 0..3 {
        seed_encrypted(&h, &k1, i).await;
    }

    // Flip one bit in one ciphertext so the old key's tag no longer
    // verifies.
    let path = format!("blobs/{}", image_id(1));
    let mut blob = h.blobs.get(&path).unwrap();
    blob[0] ^= 0x01;
    boxvault::BlobStore::write_bytes(h.blobs.as_ref(), &path, &blob)
        .await
        .unwrap();

    let k2 = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(k2.id).unwrap();

    let job = h
        .engine
        .start_rotation(request(Some(k1.id), k2.id, 10))
        .unwrap();
    let done = wait_terminal(&h.engine, &job.id).await;
    assert_eq!(done.status, RotationStatus::Completed);
    assert_eq!(done.processed_images, 2);
    assert_eq!(done.failed_images, 1);

    let message = h
        .sink
        .events()
        .into_iter()
        .find_map(|e| match e {
            VaultEvent::ImageMigrationFailed { message, .. } => Some(message),
            _ => None,
        })
        .unwrap();
    assert!(message.contains("Authentication tag verification failed"));
}

/// ImageStore wrapper whose second batch selection fails, simulating a
/// fault in the batch-loop driver itself.
struct FailingImageStore {
    inner: MemoryImageStore,
    batches_served: AtomicUsize,
}

impl FailingImageStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryImageStore::new(),
            batches_served: AtomicUsize::new(0),
        })
    }
}

impl ImageStore for FailingImageStore {
    fn insert_image(&self, image: &ImageRecord) -> boxvault::Result<()> {
        self.inner.insert_image(image)
    }

    fn get_image(&self, id: &str) -> boxvault::Result<Option<ImageRecord>> {
        self.inner.get_image(id)
    }

    fn count_images(&self, source: RotationSource) -> boxvault::Result<u64> {
        self.inner.count_images(source)
    }

    fn key_usage(&self, key_id: i64) -> boxvault::Result<(u64, i64)> {
        self.inner.key_usage(key_id)
    }

    fn next_batch(
        &self,
        source: RotationSource,
        limit: usize,
        exclude: &[String],
    ) -> boxvault::Result<Vec<ImageRecord>> {
        if self.batches_served.fetch_add(1, Ordering::SeqCst) >= 1 {
            return Err(boxvault::VaultError::Storage(rusqlite::Error::InvalidQuery));
        }
        self.inner.next_batch(source, limit, exclude)
    }

    fn set_encryption(
        &self,
        image_id: &str,
        key_id: i64,
        iv: &[u8],
        auth_tag: &[u8],
    ) -> boxvault::Result<()> {
        self.inner.set_encryption(image_id, key_id, iv, auth_tag)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn driver_failure_marks_the_job_failed() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.initialize().unwrap();
    let images = FailingImageStore::new();
    let blobs = Arc::new(MemoryBlobStore::new());
    let sink = RecordingSink::new();
    let engine = RotationEngine::new(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        Arc::clone(&images) as Arc<dyn ImageStore>,
        Arc::clone(&blobs) as Arc<dyn boxvault::BlobStore>,
        Arc::clone(&store) as Arc<dyn RotationStore>,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );
    let manager = KeyLifecycleManager::new(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        Arc::clone(&images) as Arc<dyn ImageStore>,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );

    let key = manager.create_key(None, None).unwrap();
    manager.activate_key(key.id).unwrap();
    for i in 0..4 {
        let id = format!("img-{i}");
        let path = format!("blobs/{id}");
        boxvault::BlobStore::write_bytes(blobs.as_ref(), &path, b"plain")
            .await
            .unwrap();
        images
            .insert_image(&ImageRecord::plaintext(id, path, 5))
            .unwrap();
    }

    let job = engine
        .start_rotation(RotationRequest {
            from_key_id: None,
            to_key_id: key.id,
            batch_size: 2,
            initiated_by: None,
            is_automatic: false,
        })
        .unwrap();

    let done = wait_terminal(&engine, &job.id).await;
    assert_eq!(done.status, RotationStatus::Failed);
    assert!(done.error_message.is_some());
    // The first batch's checkpoint survived the failure.
    assert_eq!(done.processed_images, 2);

    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, VaultEvent::RotationFailed { .. })));
}

// ============================================================================
// Resumability
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumes_inflight_job_without_retouching_migrated_images() {
    let h = harness();
    let k1 = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(k1.id).unwrap();
    for i in 0..12 {
        seed_encrypted(&h, &k1, i).await;
    }
    let k2 = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(k2.id).unwrap();

    // Simulate a crash mid-rotation: four images already migrated, the
    // job row still InProgress, no worker alive.
    for i in 0..4 {
        let id = image_id(i);
        let path = format!("blobs/{id}");
        let sealed = crypto::seal(&body(i), &k2.material).unwrap();
        boxvault::BlobStore::write_bytes(h.blobs.as_ref(), &path, &sealed.ciphertext)
            .await
            .unwrap();
        h.images
            .set_encryption(&id, k2.id, &sealed.iv, &sealed.tag)
            .unwrap();
    }
    let job = RotationJob {
        id: uuid::Uuid::new_v4().to_string(),
        from_key_id: Some(k1.id),
        to_key_id: k2.id,
        status: RotationStatus::InProgress,
        total_images: 12,
        processed_images: 4,
        failed_images: 0,
        batch_size: 5,
        started_at: Utc::now(),
        completed_at: None,
        initiated_by: None,
        is_automatic: false,
        error_message: None,
    };
    RotationStore::create_job(h.store.as_ref(), &job).unwrap();

    let migrated_iv = h.images.get_image(&image_id(0)).unwrap().unwrap().iv;

    let resumed = h.engine.resume_inflight().unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].id, job.id);

    let done = wait_terminal(&h.engine, &job.id).await;
    assert_eq!(done.status, RotationStatus::Completed);
    assert_eq!(done.processed_images, 12);
    assert_eq!(done.failed_images, 0);

    // Already-migrated images were not selected again.
    let iv_after = h.images.get_image(&image_id(0)).unwrap().unwrap().iv;
    assert_eq!(iv_after, migrated_iv);
    assert_eq!(h.images.count_images(RotationSource::Key(k1.id)).unwrap(), 0);
    assert_eq!(h.images.count_images(RotationSource::Key(k2.id)).unwrap(), 12);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_between_batches_stops_the_loop() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.initialize().unwrap();
    let (jobs, reached, release) = GatedJobStore::new(Arc::clone(&store));
    let images = Arc::new(MemoryImageStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let sink = RecordingSink::new();
    let engine = RotationEngine::new(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        Arc::clone(&images) as Arc<dyn ImageStore>,
        Arc::clone(&blobs) as Arc<dyn boxvault::BlobStore>,
        jobs,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );
    let manager = KeyLifecycleManager::new(
        Arc::clone(&store) as Arc<dyn KeyStore>,
        Arc::clone(&images) as Arc<dyn ImageStore>,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );

    let key = manager.create_key(None, None).unwrap();
    manager.activate_key(key.id).unwrap();
    for i in 0..4 {
        let id = format!("img-{i}");
        let path = format!("blobs/{id}");
        boxvault::BlobStore::write_bytes(blobs.as_ref(), &path, b"plain")
            .await
            .unwrap();
        images
            .insert_image(&ImageRecord::plaintext(id, path, 5))
            .unwrap();
    }

    let job = engine
        .start_rotation(RotationRequest {
            from_key_id: None,
            to_key_id: key.id,
            batch_size: 2,
            initiated_by: None,
            is_automatic: false,
        })
        .unwrap();

    // The worker is now parked inside its first checkpoint, between
    // batch one and batch two.
    reached.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(engine.cancel_rotation(&job.id).unwrap());
    release.send(()).unwrap();

    let done = wait_terminal(&engine, &job.id).await;
    assert_eq!(done.status, RotationStatus::Cancelled);
    assert_eq!(done.processed_images, 2);

    // No second batch ran.
    assert_eq!(images.count_images(RotationSource::Key(key.id)).unwrap(), 2);
    assert_eq!(images.count_images(RotationSource::Unencrypted).unwrap(), 2);

    // Cancelling a terminal job reports false.
    assert!(!engine.cancel_rotation(&job.id).unwrap());
}

// ============================================================================
// Progress reporting
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_is_monotone_and_bounded() {
    let h = harness();
    let key = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(key.id).unwrap();
    for i in 0..30 {
        seed_plaintext(&h, i).await;
    }

    let job = h.engine.start_rotation(request(None, key.id, 7)).unwrap();
    let mut rx = h.engine.subscribe(&job.id).unwrap();
    let collector = tokio::spawn(async move {
        let mut snaps = vec![rx.borrow().clone()];
        while rx.changed().await.is_ok() {
            snaps.push(rx.borrow().clone());
        }
        snaps
    });

    let done = wait_terminal(&h.engine, &job.id).await;
    assert_eq!(done.status, RotationStatus::Completed);

    let snaps = collector.await.unwrap();
    assert!(!snaps.is_empty());
    let mut last = 0u64;
    for snap in &snaps {
        let sum = snap.processed_images + snap.failed_images;
        assert!(sum >= last, "progress went backwards: {sum} < {last}");
        assert!(sum <= snap.total_images);
        last = sum;
    }
    // The stream ends on a terminal snapshot.
    assert!(snaps.last().unwrap().status.is_terminal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribing_to_finished_rotation_yields_closed_terminal_snapshot() {
    let h = harness();
    let key = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(key.id).unwrap();
    seed_plaintext(&h, 0).await;

    let job = h.engine.start_rotation(request(None, key.id, 1)).unwrap();
    wait_terminal(&h.engine, &job.id).await;

    let mut rx = h.engine.subscribe(&job.id).unwrap();
    assert_eq!(rx.borrow().status, RotationStatus::Completed);
    assert!(rx.changed().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_population_is_fixed_at_start() {
    let h = harness();
    let key = h.manager.create_key(None, None).unwrap();
    h.manager.activate_key(key.id).unwrap();
    for i in 0..3 {
        seed_plaintext(&h, i).await;
    }

    let job = h.engine.start_rotation(request(None, key.id, 10)).unwrap();
    assert_eq!(job.total_images, 3);

    let done = wait_terminal(&h.engine, &job.id).await;
    assert_eq!(done.total_images, 3);
    assert!(done.processed_images + done.failed_images <= done.total_images);
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_source_rotation_is_rejected() {
    let h = harness();
    let k1 = h.manager.create_key(None, None).unwrap();
    let k2 = h.manager.create_key(None, None).unwrap();

    // A lingering InProgress row for the same source, no worker attached.
    let stale = RotationJob {
        id: uuid::Uuid::new_v4().to_string(),
        from_key_id: Some(k1.id),
        to_key_id: k2.id,
        status: RotationStatus::InProgress,
        total_images: 1,
        processed_images: 0,
        failed_images: 0,
        batch_size: 1,
        started_at: Utc::now(),
        completed_at: None,
        initiated_by: None,
        is_automatic: false,
        error_message: None,
    };
    RotationStore::create_job(h.store.as_ref(), &stale).unwrap();

    let err = h
        .engine
        .start_rotation(request(Some(k1.id), k2.id, 5))
        .unwrap_err();
    assert!(matches!(err, boxvault::VaultError::RotationConflict { .. }));

    // A rotation over a different source is unaffected.
    h.engine.start_rotation(request(None, k2.id, 5)).unwrap();
}
