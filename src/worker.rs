//! The processing worker pool: drains the job queue and runs each photo
//! through normalize → detect → cluster → route → enqueue uploads.
//!
//! Workers respect the phase coordinator: they claim a slot before pulling
//! a job, pause while the upload drainer owns the system, and report every
//! finished photo, failed or not, so the batch counter always advances.
//! The coordinator hears about a finished photo before the progress
//! tracker does, so an idle check can never observe a photo as done while
//! its phase bookkeeping is still pending.

use anyhow::{bail, Result};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::analyzer::{AnalyzerFactory, FaceAnalyzer};
use crate::cloud::CloudManager;
use crate::cluster;
use crate::config::Config;
use crate::db::{PhotoStatus, Store};
use crate::phase::PhaseCoordinator;
use crate::processor;
use crate::router;
use crate::sync::FlagEvent;
use crate::watcher::{PhotoJob, SharedJobQueue};

const QUEUE_POP_TIMEOUT: Duration = Duration::from_secs(1);
const CLAIM_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct ProgressStatus {
    pub total: usize,
    pub completed: usize,
    pub active: usize,
    pub remaining: usize,
    pub all_done: bool,
}

#[derive(Default)]
struct ProgressInner {
    total: usize,
    completed: usize,
    active: usize,
    idle_reported: bool,
}

/// Thread-safe counters for batch progress reporting.
pub struct ProgressTracker {
    inner: Mutex<ProgressInner>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self { inner: Mutex::new(ProgressInner::default()) }
    }

    pub fn on_enqueue(&self, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.total += count;
        inner.idle_reported = false;
    }

    /// Returns a `[current/total]` progress tag for logging.
    pub fn on_start(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.active += 1;
        format!("[{}/{}]", inner.completed + 1, inner.total)
    }

    pub fn on_complete(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.completed += 1;
        inner.active = inner.active.saturating_sub(1);
        format!("[{}/{}]", inner.completed, inner.total)
    }

    pub fn status(&self) -> ProgressStatus {
        let inner = self.inner.lock().unwrap();
        ProgressStatus {
            total: inner.total,
            completed: inner.completed,
            active: inner.active,
            remaining: inner.total.saturating_sub(inner.completed),
            all_done: inner.total > 0 && inner.completed >= inner.total,
        }
    }

    /// True exactly once per busy→idle transition.
    pub fn check_and_report_idle(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.total > 0 && inner.completed >= inner.total && !inner.idle_reported {
            inner.idle_reported = true;
            return true;
        }
        false
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct PipelineSummary {
    face_count: usize,
    person_count: usize,
}

fn run_pipeline(
    store: &Store,
    analyzer: &mut dyn FaceAnalyzer,
    cloud: &Arc<CloudManager>,
    config: &Config,
    job: &PhotoJob,
) -> Result<PipelineSummary> {
    store.set_photo_processing(job.photo_id)?;

    let outcome = processor::process_photo(&job.path, job.photo_id, analyzer, config)?;
    let thumbnail = outcome.thumbnail_path.as_ref().map(|p| p.to_string_lossy().to_string());

    if outcome.faces.is_empty() {
        // The processed JPEG moves to Admin/NoFaces and that location is
        // what the row keeps pointing at.
        let moved =
            router::route_photo(store, cloud, job.photo_id, &outcome.processed_path, &[], config)?;
        let final_path = moved
            .first()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| outcome.processed_path.to_string_lossy().to_string());
        store.set_photo_completed(
            job.photo_id,
            &final_path,
            thumbnail.as_deref(),
            0,
            PhotoStatus::NoFaces,
        )?;
        info!(photo_id = job.photo_id, "no faces detected");
        return Ok(PipelineSummary { face_count: 0, person_count: 0 });
    }

    // Faces and their person assignments land in one transaction
    let person_ids = cluster::assign_photo_faces(
        store,
        job.photo_id,
        &outcome.faces,
        config.processing.cluster_threshold,
    )?;

    let routed = router::route_photo(
        store,
        cloud,
        job.photo_id,
        &outcome.processed_path,
        &person_ids,
        config,
    )?;
    if routed.is_empty() {
        // Faces are persisted but no destination was realized
        bail!("no routing destination succeeded for photo {}", job.photo_id);
    }

    if config.remote.queue_enabled && cloud.is_enabled() && !config.routing.dry_run {
        for path in &routed {
            store.enqueue_upload(
                job.photo_id,
                &path.to_string_lossy(),
                &config.event_root.to_string_lossy(),
            )?;
        }
        debug!(photo_id = job.photo_id, count = routed.len(), "queued uploads");
    }

    store.set_photo_completed(
        job.photo_id,
        &outcome.processed_path.to_string_lossy(),
        thumbnail.as_deref(),
        outcome.faces.len() as i64,
        PhotoStatus::Completed,
    )?;

    let mut unique = person_ids.clone();
    unique.sort_unstable();
    unique.dedup();
    Ok(PipelineSummary { face_count: outcome.faces.len(), person_count: unique.len() })
}

/// Process one job end to end. Failures mark the photo `error` and move the
/// original into `Admin/Errors`. Returns true on success. The caller owns
/// the finished-photo reporting (coordinator first, then progress).
pub fn process_single_photo(
    store: &Store,
    analyzer: &mut dyn FaceAnalyzer,
    cloud: &Arc<CloudManager>,
    progress: &ProgressTracker,
    config: &Config,
    job: &PhotoJob,
) -> bool {
    let started = Instant::now();
    let tag = progress.on_start();
    info!(
        photo_id = job.photo_id,
        name = %job.path.file_name().unwrap_or_default().to_string_lossy(),
        "processing {tag}"
    );

    match run_pipeline(store, analyzer, cloud, config, job) {
        Ok(summary) => {
            info!(
                photo_id = job.photo_id,
                faces = summary.face_count,
                persons = summary.person_count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "completed {tag}"
            );
            true
        }
        Err(e) => {
            error!(photo_id = job.photo_id, error = %e, "processing failed");
            if let Err(db_err) = store.set_photo_error(job.photo_id) {
                error!(photo_id = job.photo_id, error = %db_err, "could not record error status");
            }
            match router::route_to_errors(&job.path, config) {
                Ok(dst) => info!(photo_id = job.photo_id, ?dst, "moved original to Errors"),
                Err(move_err) => error!(
                    photo_id = job.photo_id,
                    error = %move_err,
                    "could not move original to Errors, file remains at {:?}",
                    job.path
                ),
            }
            false
        }
    }
}

/// One worker's main loop. Exits on the poison pill or shutdown.
#[allow(clippy::too_many_arguments)]
fn worker_loop(
    store: Store,
    analyzer_factory: Arc<dyn AnalyzerFactory>,
    cloud: Arc<CloudManager>,
    queue: SharedJobQueue,
    coordinator: Arc<PhaseCoordinator>,
    progress: Arc<ProgressTracker>,
    shutdown: Arc<FlagEvent>,
    config: Config,
) {
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("worker");

    // One analyzer per worker thread keeps model state unshared
    let mut analyzer = match analyzer_factory.create() {
        Ok(analyzer) => analyzer,
        Err(e) => {
            error!(worker = name, error = %e, "analyzer initialization failed, worker exiting");
            return;
        }
    };

    info!(worker = name, batch_size = coordinator.batch_size(), "worker started");

    while !shutdown.is_set() {
        // Claims a slot; blocks during the upload phase and re-checks
        // shutdown on timeout
        if !coordinator.begin_photo(CLAIM_TIMEOUT) {
            continue;
        }

        let Some(job) = queue.pop_timeout(QUEUE_POP_TIMEOUT) else {
            coordinator.cancel_photo();
            continue;
        };
        let Some(job) = job else {
            coordinator.cancel_photo();
            debug!(worker = name, "poison pill received");
            break;
        };

        process_single_photo(&store, analyzer.as_mut(), &cloud, &progress, &config, &job);

        // Success or failure, the batch advances. The coordinator must hear
        // about the photo before the progress tracker shows it as done, or
        // an idle flush could start the drainer with this report pending.
        coordinator.on_processed();
        progress.on_complete();
        let status = coordinator.status();
        debug!(worker = name, in_batch = status.in_batch, batch_size = status.batch_size, "batch progress");
    }

    info!(worker = name, "worker stopped");
}

/// Spawn the fixed-size worker pool.
#[allow(clippy::too_many_arguments)]
pub fn spawn_workers(
    store: &Store,
    analyzer_factory: &Arc<dyn AnalyzerFactory>,
    cloud: &Arc<CloudManager>,
    queue: &SharedJobQueue,
    coordinator: &Arc<PhaseCoordinator>,
    progress: &Arc<ProgressTracker>,
    shutdown: &Arc<FlagEvent>,
    config: &Config,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(config.processing.worker_count);
    for index in 0..config.processing.worker_count {
        let store = store.clone();
        let analyzer_factory = analyzer_factory.clone();
        let cloud = cloud.clone();
        let queue = queue.clone();
        let coordinator = coordinator.clone();
        let progress = progress.clone();
        let shutdown = shutdown.clone();
        let config = config.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                worker_loop(
                    store,
                    analyzer_factory,
                    cloud,
                    queue,
                    coordinator,
                    progress,
                    shutdown,
                    config,
                )
            })?;
        handles.push(handle);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::fake::{face_at, FakeAnalyzer};
    use crate::cloud::fake::MemoryRemote;
    use crate::db::PhotoStatus;
    use crate::watcher::compute_file_hash;
    use image::RgbImage;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config, Store) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.event_root = dir.path().join("event");
        config.database.path = dir.path().join("test.db");
        config.processing.max_image_size = 256;
        config.processing.thumbnail_size = 32;
        config.ensure_directories().unwrap();
        let store = Store::open(&config.database.path).unwrap();
        (dir, config, store)
    }

    fn drop_photo(config: &Config, store: &Store, name: &str, seed: u8) -> PhotoJob {
        let path = config.incoming_dir().join(name);
        let img = RgbImage::from_fn(320, 240, |x, y| {
            image::Rgb([seed, (x % 256) as u8, (y % 256) as u8])
        });
        img.save(&path).unwrap();
        let file_hash = compute_file_hash(&path).unwrap();
        let photo_id = store.create_photo(&file_hash, &path.to_string_lossy()).unwrap();
        PhotoJob { photo_id, path, file_hash }
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[axis] = 1.0;
        v
    }

    fn solo_file(config: &Config, person: &str, photo_id: i64) -> std::path::PathBuf {
        config.people_dir().join(person).join("Solo").join(format!("{photo_id:06}.jpg"))
    }

    #[test]
    fn single_face_happy_path() {
        let (_dir, config, store) = setup();
        let remote = MemoryRemote::shared();
        let cloud = Arc::new(CloudManager::new(remote, None, false));
        let progress = ProgressTracker::new();
        let job = drop_photo(&config, &store, "alice.jpg", 1);

        let mut analyzer = FakeAnalyzer::new(vec![vec![face_at(10, 10, unit(8, 0), 0.97)]]);
        assert!(process_single_photo(&store, &mut analyzer, &cloud, &progress, &config, &job));

        let photo = store.photo_by_id(job.photo_id).unwrap().unwrap();
        assert_eq!(photo.status, PhotoStatus::Completed);
        assert_eq!(photo.face_count, Some(1));

        let persons = store.all_persons().unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].name, "Person_001");
        assert_eq!(persons[0].face_count, 1);

        assert!(solo_file(&config, "Person_001", job.photo_id).exists());

        let uploads = store.pending_uploads(10).unwrap();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].local_path.ends_with("000001.jpg"));
        assert_eq!(uploads[0].relative_to, config.event_root.to_string_lossy());
    }

    #[test]
    fn two_known_faces_route_to_group_folders() {
        let (_dir, config, store) = setup();
        let remote = MemoryRemote::shared();
        let cloud = Arc::new(CloudManager::new(remote, None, false));
        let progress = ProgressTracker::new();

        // Seed Person_001 / Person_002 with distinct embeddings
        let first = drop_photo(&config, &store, "a.jpg", 1);
        let mut analyzer = FakeAnalyzer::new(vec![vec![face_at(0, 0, unit(8, 0), 0.9)]]);
        process_single_photo(&store, &mut analyzer, &cloud, &progress, &config, &first);
        let second = drop_photo(&config, &store, "b.jpg", 2);
        let mut analyzer = FakeAnalyzer::new(vec![vec![face_at(0, 0, unit(8, 1), 0.9)]]);
        process_single_photo(&store, &mut analyzer, &cloud, &progress, &config, &second);

        // The duo photo matches both existing persons
        let duo = drop_photo(&config, &store, "duo.jpg", 3);
        let mut analyzer = FakeAnalyzer::new(vec![vec![
            face_at(0, 0, unit(8, 0), 0.95),
            face_at(100, 0, unit(8, 1), 0.94),
        ]]);
        assert!(process_single_photo(&store, &mut analyzer, &cloud, &progress, &config, &duo));

        let photo = store.photo_by_id(duo.photo_id).unwrap().unwrap();
        assert_eq!(photo.status, PhotoStatus::Completed);
        assert_eq!(photo.face_count, Some(2));
        assert_eq!(store.all_persons().unwrap().len(), 2);

        let group_name = format!("{:06}.jpg", duo.photo_id);
        for person in ["Person_001", "Person_002"] {
            assert!(config.people_dir().join(person).join("Group").join(&group_name).exists());
            assert!(!config.people_dir().join(person).join("Solo").join(&group_name).exists());
        }
        // Two upload jobs for the duo photo
        let uploads = store.pending_uploads(10).unwrap();
        let duo_uploads: Vec<_> =
            uploads.iter().filter(|u| u.photo_id == duo.photo_id).collect();
        assert_eq!(duo_uploads.len(), 2);
    }

    #[test]
    fn zero_faces_moves_to_no_faces() {
        let (_dir, config, store) = setup();
        let cloud = Arc::new(CloudManager::disabled());
        let progress = ProgressTracker::new();
        let job = drop_photo(&config, &store, "scenery.jpg", 7);

        let mut analyzer = FakeAnalyzer::new(vec![vec![]]);
        assert!(process_single_photo(&store, &mut analyzer, &cloud, &progress, &config, &job));

        let photo = store.photo_by_id(job.photo_id).unwrap().unwrap();
        assert_eq!(photo.status, PhotoStatus::NoFaces);
        assert_eq!(photo.face_count, Some(0));
        let stored = photo.processed_path.unwrap();
        assert!(Path::new(&stored).exists());
        assert!(stored.contains("NoFaces"));
        assert!(store.all_persons().unwrap().is_empty());
    }

    #[test]
    fn decode_failure_marks_error_and_moves_original() {
        let (_dir, config, store) = setup();
        let cloud = Arc::new(CloudManager::disabled());
        let progress = ProgressTracker::new();

        let path = config.incoming_dir().join("broken.jpg");
        std::fs::write(&path, b"not a jpeg").unwrap();
        let file_hash = compute_file_hash(&path).unwrap();
        let photo_id = store.create_photo(&file_hash, &path.to_string_lossy()).unwrap();
        let job = PhotoJob { photo_id, path: path.clone(), file_hash };

        let mut analyzer = FakeAnalyzer::new(vec![]);
        assert!(!process_single_photo(&store, &mut analyzer, &cloud, &progress, &config, &job));

        let photo = store.photo_by_id(photo_id).unwrap().unwrap();
        assert_eq!(photo.status, PhotoStatus::Error);
        assert!(!path.exists());
        assert!(config.errors_dir().join("broken.jpg").exists());
        // The loop reports errors like successes; the counters balance out
        progress.on_complete();
        let status = progress.status();
        assert_eq!(status.completed, 1);
        assert_eq!(status.active, 0);
    }

    #[test]
    fn disabled_remote_skips_upload_enqueue() {
        let (_dir, config, store) = setup();
        let cloud = Arc::new(CloudManager::disabled());
        let progress = ProgressTracker::new();
        let job = drop_photo(&config, &store, "alice.jpg", 1);

        let mut analyzer = FakeAnalyzer::new(vec![vec![face_at(0, 0, unit(8, 0), 0.9)]]);
        assert!(process_single_photo(&store, &mut analyzer, &cloud, &progress, &config, &job));

        assert_eq!(store.photo_by_id(job.photo_id).unwrap().unwrap().status, PhotoStatus::Completed);
        assert!(store.pending_uploads(10).unwrap().is_empty());
    }

    #[test]
    fn progress_tracker_counts_transitions() {
        let progress = ProgressTracker::new();
        progress.on_enqueue(2);
        assert_eq!(progress.status().remaining, 2);

        assert_eq!(progress.on_start(), "[1/2]");
        assert_eq!(progress.on_complete(), "[1/2]");
        assert!(!progress.check_and_report_idle());

        progress.on_start();
        progress.on_complete();
        let status = progress.status();
        assert!(status.all_done);
        assert_eq!(status.active, 0);
        assert!(progress.check_and_report_idle());
        // Idle is reported once per transition
        assert!(!progress.check_and_report_idle());
        progress.on_enqueue(1);
        assert!(!progress.status().all_done);
    }
}
