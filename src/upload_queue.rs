//! Phase-gated drain of the durable upload queue.
//!
//! The drainer sleeps through the PROCESSING phase. When the coordinator
//! flips to UPLOADING it resets stuck rows, then repeatedly works through
//! pending rows plus retry-eligible failures until neither has work,
//! refreshes the remote client, and hands the system back to the workers.
//! Failed uploads back off exponentially per retry; files that vanished and
//! fatal remote errors freeze the job so it is never picked again.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cloud::CloudManager;
use crate::config::{Config, RemoteConfig};
use crate::db::{Store, UploadJob, UploadStatus};
use crate::phase::PhaseCoordinator;
use crate::sync::FlagEvent;

const SHOULD_UPLOAD_TIMEOUT: Duration = Duration::from_secs(2);
const STUCK_UPLOAD_AGE: Duration = Duration::from_secs(5 * 60);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, Copy)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
    pub frozen: usize,
}

fn retry_backoff(base_seconds: u64, retry_count: u32) -> Duration {
    let exp = 2u64.saturating_pow(retry_count);
    Duration::from_secs(base_seconds.saturating_mul(exp)).min(MAX_RETRY_BACKOFF)
}

/// Push one job to the remote, recording the outcome.
fn upload_one(
    store: &Store,
    cloud: &Arc<CloudManager>,
    shutdown: &FlagEvent,
    remote_cfg: &RemoteConfig,
    job: &UploadJob,
    report: &mut DrainReport,
) -> Result<()> {
    let local_path = Path::new(&job.local_path);

    if !local_path.exists() {
        warn!(upload_id = job.id, path = %job.local_path, "local file vanished, freezing job");
        store.freeze_upload(job.id, remote_cfg.max_retries, "file not found")?;
        report.frozen += 1;
        return Ok(());
    }

    // Retries wait out their backoff first; shutdown cuts the wait short
    if job.status == UploadStatus::Failed && job.retry_count > 0 {
        let delay = retry_backoff(remote_cfg.retry_delay, job.retry_count);
        if shutdown.wait_timeout(delay) {
            return Ok(());
        }
    }

    store.update_upload(job.id, UploadStatus::Uploading, None, false)?;

    match cloud.upload_file(local_path, Path::new(&job.relative_to)) {
        Ok(()) => {
            store.update_upload(job.id, UploadStatus::Completed, None, false)?;
            debug!(upload_id = job.id, path = %job.local_path, "upload completed");
            report.completed += 1;
        }
        Err(e) if e.is_fatal() => {
            error!(upload_id = job.id, error = %e, "fatal remote error, freezing job");
            store.freeze_upload(job.id, remote_cfg.max_retries, &e.to_string())?;
            report.frozen += 1;
        }
        Err(e) => {
            warn!(upload_id = job.id, retry = job.retry_count + 1, error = %e, "upload failed");
            store.update_upload(job.id, UploadStatus::Failed, Some(&e.to_string()), true)?;
            report.failed += 1;
        }
    }
    Ok(())
}

/// One full UPLOADING turn: drain everything currently eligible.
pub fn drain_once(
    store: &Store,
    cloud: &Arc<CloudManager>,
    shutdown: &FlagEvent,
    remote_cfg: &RemoteConfig,
) -> Result<DrainReport> {
    let mut report = DrainReport::default();

    store.reset_stuck_uploads(STUCK_UPLOAD_AGE)?;

    loop {
        if shutdown.is_set() {
            break;
        }

        let pending = store.pending_uploads(remote_cfg.batch_size)?;
        let failed = store.failed_uploads(remote_cfg.max_retries)?;
        if pending.is_empty() && failed.is_empty() {
            break;
        }

        for job in pending.iter().chain(failed.iter()) {
            if shutdown.is_set() {
                return Ok(report);
            }
            upload_one(store, cloud, shutdown, remote_cfg, job, &mut report)?;
        }
    }

    Ok(report)
}

fn run_loop(
    store: Store,
    cloud: Arc<CloudManager>,
    coordinator: Arc<PhaseCoordinator>,
    shutdown: Arc<FlagEvent>,
    remote_cfg: RemoteConfig,
) {
    info!("upload queue worker started");

    while !shutdown.is_set() {
        if !coordinator.should_upload(SHOULD_UPLOAD_TIMEOUT) {
            continue;
        }
        if shutdown.is_set() {
            break;
        }

        match drain_once(&store, &cloud, &shutdown, &remote_cfg) {
            Ok(report) => {
                if report.completed + report.failed + report.frozen > 0 {
                    info!(
                        completed = report.completed,
                        failed = report.failed,
                        frozen = report.frozen,
                        "upload drain finished"
                    );
                }
            }
            Err(e) => error!(error = %e, "upload drain errored"),
        }

        if shutdown.is_set() {
            break;
        }

        // Quiet window between batches: refresh the remote client
        cloud.rebuild();
        coordinator.on_uploads_complete();
    }

    info!("upload queue worker stopped");
}

/// Handle to the background drainer thread.
pub struct UploadQueue {
    handle: Option<JoinHandle<()>>,
}

impl UploadQueue {
    /// Start the drainer. Returns `None` when the queue is disabled by
    /// configuration or no remote backend is wired.
    pub fn start(
        store: Store,
        cloud: Arc<CloudManager>,
        coordinator: Arc<PhaseCoordinator>,
        shutdown: Arc<FlagEvent>,
        config: &Config,
    ) -> Option<Self> {
        if !config.remote.queue_enabled {
            info!("upload queue disabled in configuration");
            return None;
        }
        if !cloud.is_enabled() {
            info!("remote store not configured, upload queue will not start");
            return None;
        }

        let remote_cfg = config.remote.clone();
        let handle = std::thread::Builder::new()
            .name("upload-queue".into())
            .spawn(move || run_loop(store, cloud, coordinator, shutdown, remote_cfg))
            .ok()?;
        Some(Self { handle: Some(handle) })
    }

    /// Join the worker thread. The shared shutdown flag must already be set.
    pub fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{MemoryRemote, RecordingRemote};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config, Store) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.event_root = dir.path().join("event");
        config.database.path = dir.path().join("test.db");
        config.remote.retry_delay = 0;
        config.ensure_directories().unwrap();
        let store = Store::open(&config.database.path).unwrap();
        (dir, config, store)
    }

    fn routed_file(config: &Config, person: &str, bucket: &str, photo_id: i64) -> String {
        let path = config
            .people_dir()
            .join(person)
            .join(bucket)
            .join(format!("{photo_id:06}.jpg"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"jpeg").unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn drain_completes_pending_jobs() {
        let (_dir, config, store) = setup();
        let remote = MemoryRemote::shared();
        let cloud = Arc::new(CloudManager::new(remote.clone(), None, false));
        let shutdown = FlagEvent::new(false);

        let photo_id = store.create_photo("h", "/in/a.jpg").unwrap();
        let solo = routed_file(&config, "Person_001", "Solo", 1);
        let group = routed_file(&config, "Person_002", "Group", 2);
        store.enqueue_upload(photo_id, &solo, &config.event_root.to_string_lossy()).unwrap();
        store.enqueue_upload(photo_id, &group, &config.event_root.to_string_lossy()).unwrap();

        let report = drain_once(&store, &cloud, &shutdown, &config.remote).unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);

        let stats = store.upload_stats().unwrap();
        assert_eq!(stats.get("completed"), Some(&2));
        assert_eq!(
            remote.uploaded(),
            vec![
                "People/Person_001/Solo/000001.jpg",
                "People/Person_002/Group/000002.jpg"
            ]
        );
    }

    #[test]
    fn missing_local_file_freezes_job() {
        let (_dir, config, store) = setup();
        let cloud = Arc::new(CloudManager::new(MemoryRemote::shared(), None, false));
        let shutdown = FlagEvent::new(false);

        let photo_id = store.create_photo("h", "/in/a.jpg").unwrap();
        store
            .enqueue_upload(photo_id, "/nowhere/000001.jpg", &config.event_root.to_string_lossy())
            .unwrap();

        let report = drain_once(&store, &cloud, &shutdown, &config.remote).unwrap();
        assert_eq!(report.frozen, 1);

        // Frozen: failed with retries exhausted, never eligible again
        assert!(store.failed_uploads(config.remote.max_retries).unwrap().is_empty());
        let stats = store.upload_stats().unwrap();
        assert_eq!(stats.get("failed"), Some(&1));
    }

    #[test]
    fn fatal_remote_error_freezes_without_retries() {
        let (_dir, config, store) = setup();
        let remote = MemoryRemote::with_fatal_name("000003.jpg");
        let cloud = Arc::new(CloudManager::new(remote.clone(), None, false));
        let shutdown = FlagEvent::new(false);

        let photo_id = store.create_photo("h", "/in/a.jpg").unwrap();
        let path = routed_file(&config, "Person_001", "Solo", 3);
        store.enqueue_upload(photo_id, &path, &config.event_root.to_string_lossy()).unwrap();

        let report = drain_once(&store, &cloud, &shutdown, &config.remote).unwrap();
        assert_eq!(report.frozen, 1);
        assert_eq!(remote.upload_calls(), 1);
        assert!(store.failed_uploads(config.remote.max_retries).unwrap().is_empty());
    }

    #[test]
    fn transient_failure_retries_within_one_drain() {
        let (_dir, config, store) = setup();
        // Three transient failures exhaust the remote-call retry budget once,
        // so the job lands in `failed` and succeeds on the queue-level retry.
        let remote = MemoryRemote::failing_transient(3);
        let cloud = Arc::new(CloudManager::new(remote.clone(), None, false));
        let shutdown = FlagEvent::new(false);

        let photo_id = store.create_photo("h", "/in/a.jpg").unwrap();
        let path = routed_file(&config, "Person_001", "Solo", 4);
        store.enqueue_upload(photo_id, &path, &config.event_root.to_string_lossy()).unwrap();

        let report = drain_once(&store, &cloud, &shutdown, &config.remote).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(store.upload_stats().unwrap().get("completed"), Some(&1));
        assert_eq!(remote.uploaded().len(), 1);
    }

    #[test]
    fn drain_waits_for_upload_phase_and_hands_back() {
        let (_dir, config, store) = setup();
        let remote = MemoryRemote::shared();
        let cloud = Arc::new(CloudManager::new(remote.clone(), None, false));
        let coordinator = Arc::new(PhaseCoordinator::new(1));
        let shutdown = Arc::new(FlagEvent::new(false));

        let photo_id = store.create_photo("h", "/in/a.jpg").unwrap();
        let path = routed_file(&config, "Person_001", "Solo", 5);
        store.enqueue_upload(photo_id, &path, &config.event_root.to_string_lossy()).unwrap();

        let queue = UploadQueue::start(
            store.clone(),
            cloud,
            coordinator.clone(),
            shutdown.clone(),
            &config,
        )
        .expect("queue should start");

        // Still PROCESSING: the drainer must not touch the queue
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(store.upload_stats().unwrap().get("pending"), Some(&1));

        // One processed photo fills the batch and flips the phase
        coordinator.on_processed();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = store.upload_stats().unwrap();
            if stats.get("completed") == Some(&1) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "upload never completed");
            std::thread::sleep(Duration::from_millis(20));
        }

        // Drainer hands control back and the remote client was rebuilt
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while coordinator.status().phase != crate::phase::Phase::Processing {
            assert!(std::time::Instant::now() < deadline, "phase never flipped back");
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(coordinator.status().batches_done, 1);
        assert!(remote.rebuild_count() >= 1);

        shutdown.set();
        queue.stop();
    }

    /// Phase exclusion, checked with a tracing remote: no `on_processed`
    /// report may fall inside an open `upload_file` interval, even with
    /// several workers overlapping drain turns.
    #[test]
    fn no_on_processed_overlaps_a_remote_upload() {
        use std::sync::atomic::{AtomicI64, Ordering};
        use std::sync::Mutex;
        use std::time::Instant;

        let (_dir, config, store) = setup();
        let remote = RecordingRemote::shared(Duration::from_millis(25));
        let cloud = Arc::new(CloudManager::new(remote.clone(), None, false));
        let coordinator = Arc::new(PhaseCoordinator::new(3));
        let shutdown = Arc::new(FlagEvent::new(false));

        let queue = UploadQueue::start(
            store.clone(),
            cloud,
            coordinator.clone(),
            shutdown.clone(),
            &config,
        )
        .expect("queue should start");

        // Two simulated workers: claim a slot, enqueue an upload, report
        // the photo. Their reports interleave with several drain turns.
        let seq = Arc::new(AtomicI64::new(0));
        let reports: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut producers = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            let config = config.clone();
            let coordinator = coordinator.clone();
            let seq = seq.clone();
            let reports = reports.clone();
            producers.push(std::thread::spawn(move || {
                for _ in 0..6 {
                    while !coordinator.begin_photo(Duration::from_millis(100)) {}
                    let n = seq.fetch_add(1, Ordering::SeqCst) + 1;
                    let path = routed_file(&config, "Person_001", "Solo", n);
                    let photo_id = store.create_photo(&format!("hash-{n}"), "/in/x.jpg").unwrap();
                    store
                        .enqueue_upload(photo_id, &path, &config.event_root.to_string_lossy())
                        .unwrap();
                    let before = Instant::now();
                    coordinator.on_processed();
                    reports.lock().unwrap().push((before, Instant::now()));
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        // Flush any trailing partial batch the way the supervisor would
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let stats = store.upload_stats().unwrap();
            if stats.get("completed") == Some(&12) {
                break;
            }
            assert!(Instant::now() < deadline, "uploads never drained: {stats:?}");
            coordinator.flush_if_idle();
            std::thread::sleep(Duration::from_millis(20));
        }

        shutdown.set();
        queue.stop();

        let uploads = remote.upload_intervals();
        assert_eq!(uploads.len(), 12);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 12);
        for (report_start, report_end) in reports.iter() {
            for (upload_start, upload_end) in &uploads {
                assert!(
                    report_end <= upload_start || upload_end <= report_start,
                    "on_processed at {report_start:?}..{report_end:?} overlapped \
                     an upload at {upload_start:?}..{upload_end:?}"
                );
            }
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(retry_backoff(2, 0), Duration::from_secs(2));
        assert_eq!(retry_backoff(2, 1), Duration::from_secs(4));
        assert_eq!(retry_backoff(2, 3), Duration::from_secs(16));
        assert_eq!(retry_backoff(2, 10), MAX_RETRY_BACKOFF);
    }
}
