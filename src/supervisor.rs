//! Lifecycle owner: startup recovery, task wiring, periodic health sweeps
//! and orderly shutdown.
//!
//! Startup order matters: the store is opened and crash recovery runs
//! before anything can take a job, leftover `pending` photos are re-queued,
//! and only then do the watcher, workers and upload drainer start. The main
//! loop logs progress, flushes partial batches when the system goes idle,
//! and periodically rescues jobs abandoned by dead workers.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::analyzer::AnalyzerFactory;
use crate::cloud::{CloudManager, RemoteStore};
use crate::config::Config;
use crate::db::Store;
use crate::phase::{Phase, PhaseCoordinator};
use crate::router;
use crate::sync::{FlagEvent, JobQueue};
use crate::upload_queue::UploadQueue;
use crate::watcher::{DropZoneWatcher, PhotoJob, SharedJobQueue};
use crate::worker::{self, ProgressTracker};

const MAIN_LOOP_TICK: Duration = Duration::from_secs(5);
/// Stuck-processing sweep cadence, in main-loop ticks (~2 minutes).
const STUCK_SWEEP_TICKS: u64 = 24;
const STUCK_PROCESSING_AGE: Duration = Duration::from_secs(10 * 60);

/// Run the whole engine until `shutdown` is set.
pub fn run(
    config: &Config,
    analyzer_factory: Arc<dyn AnalyzerFactory>,
    remote: Option<Arc<dyn RemoteStore>>,
    shutdown: Arc<FlagEvent>,
) -> Result<()> {
    info!(event_root = ?config.event_root, db = ?config.database.path, "engine starting");
    config.ensure_directories()?;

    let store = Store::open(&config.database.path)?;
    let recovered = store.recover_interrupted()?;
    if recovered > 0 {
        info!(recovered, "recovered photo(s) from interrupted run");
    }

    let cloud = Arc::new(match remote {
        Some(backend) => CloudManager::new(
            backend,
            config.remote.root_folder_id.clone(),
            config.routing.dry_run,
        ),
        None => CloudManager::disabled(),
    });
    if !cloud.is_enabled() {
        info!("remote mirroring disabled");
    }

    let queue: SharedJobQueue = Arc::new(JobQueue::new());
    let progress = Arc::new(ProgressTracker::new());
    let coordinator = Arc::new(PhaseCoordinator::new(config.processing.batch_size));

    // After a restart the in-memory queue is empty, but the store may still
    // hold photos that never got processed.
    let pending = store.pending_photos()?;
    if !pending.is_empty() {
        info!(count = pending.len(), "resuming pending photo(s) from previous run");
        for photo in pending {
            let path = std::path::PathBuf::from(&photo.original_path);
            if path.exists() {
                queue.push(Some(PhotoJob {
                    photo_id: photo.id,
                    path,
                    file_hash: photo.file_hash,
                }));
                progress.on_enqueue(1);
            } else {
                warn!(
                    photo_id = photo.id,
                    path = %photo.original_path,
                    "skipping resume, original file is gone"
                );
            }
        }
    }

    let watcher = DropZoneWatcher::start(
        store.clone(),
        queue.clone(),
        progress.clone(),
        config.clone(),
    )?;

    let upload_queue = UploadQueue::start(
        store.clone(),
        cloud.clone(),
        coordinator.clone(),
        shutdown.clone(),
        config,
    );

    info!(workers = config.processing.worker_count, "starting worker pool");
    let workers = worker::spawn_workers(
        &store,
        &analyzer_factory,
        &cloud,
        &queue,
        &coordinator,
        &progress,
        &shutdown,
        config,
    )?;

    // Main loop: progress snapshots, idle flushes, stuck sweeps
    let mut tick: u64 = 0;
    while !shutdown.wait_timeout(MAIN_LOOP_TICK) {
        tick += 1;

        let status = progress.status();
        let queued = queue.len();

        if status.active > 0 || queued > 0 {
            let phase = coordinator.status();
            info!(
                completed = status.completed,
                total = status.total,
                active = status.active,
                queued,
                phase = phase.phase.as_str(),
                in_batch = phase.in_batch,
                batch_size = phase.batch_size,
                "progress"
            );
        } else if progress.check_and_report_idle() {
            info!(total = status.total, "all photos processed, waiting for new files");
        }

        // Small final batches would otherwise never reach the upload phase
        if status.active == 0 && queued == 0 {
            coordinator.flush_if_idle();
        }

        // Without a drainer nobody would ever hand the phase back
        if upload_queue.is_none() && coordinator.status().phase == Phase::Uploading {
            coordinator.on_uploads_complete();
        }

        if tick % STUCK_SWEEP_TICKS == 0 {
            match store.reset_stuck_processing(STUCK_PROCESSING_AGE) {
                Ok(0) => {}
                Ok(count) => warn!(count, "rescued stuck processing photo(s)"),
                Err(e) => error!(error = %e, "stuck-processing sweep failed"),
            }
            log_stats(&store, config);
        }
    }

    // Shutdown: stop intake, drain the pool, then the uploader
    info!("shutting down...");
    watcher.stop();

    for _ in 0..config.processing.worker_count {
        queue.push(None);
    }
    for handle in workers {
        if let Err(e) = handle.join() {
            error!("worker panicked during shutdown: {e:?}");
        }
    }

    if let Some(upload_queue) = upload_queue {
        upload_queue.stop();
    }

    log_stats(&store, config);
    info!("shutdown complete");
    Ok(())
}

/// Progress snapshot in the logs: photo counters, upload backlog and the
/// per-person folder distribution.
fn log_stats(store: &Store, config: &Config) {
    let stats = match store.stats() {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "could not read store stats");
            return;
        }
    };
    info!(
        photos = ?stats.photos_by_status,
        faces = stats.total_faces,
        persons = stats.total_persons,
        enrollments = stats.total_enrollments,
        "store stats"
    );

    if let Ok(upload_stats) = store.upload_stats() {
        if !upload_stats.is_empty() {
            info!(uploads = ?upload_stats, "upload queue");
        }
    }

    let summary = router::routing_summary(config);
    info!(
        processed = summary.processed_count,
        no_faces = summary.no_faces_count,
        errors = summary.errors_count,
        "routing summary"
    );
    for (name, counts) in &summary.persons {
        info!(
            person = %name,
            solo = counts.solo,
            group = counts.group,
            enrolled = counts.enrolled,
            "person distribution"
        );
    }
}
