//! Drop-zone ingestion: turn files appearing in `Incoming/` into pipeline
//! jobs exactly once.
//!
//! Two mechanisms run side by side. Filesystem events (notify) give low
//! latency; a periodic scan catches anything events miss. Both funnel into
//! the same ingest path, and content hashing makes the pair idempotent: a
//! file is identified by its SHA-256, so renames, copies and double
//! deliveries collapse into one photo row.

use anyhow::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{Store, StoreError};
use crate::sync::{FlagEvent, JobQueue};
use crate::worker::ProgressTracker;

/// One unit of work for the processing pool.
#[derive(Debug, Clone)]
pub struct PhotoJob {
    pub photo_id: i64,
    pub path: PathBuf,
    pub file_hash: String,
}

/// Shared job queue; `None` is the poison pill that stops a worker.
pub type SharedJobQueue = Arc<JobQueue<Option<PhotoJob>>>;

/// SHA-256 of a file's content, streamed in 8 KiB chunks.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// A file is ready when it is non-empty, not exclusively held by a writer,
/// and its size stays stable across a short wait.
pub fn is_file_ready(path: &Path, wait: Duration) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let initial_size = metadata.len();
    if initial_size == 0 {
        return false;
    }

    // An exclusive writer lock shows up as an open failure on some platforms
    if std::fs::OpenOptions::new().append(true).open(path).is_err() {
        return false;
    }

    std::thread::sleep(wait);
    match std::fs::metadata(path) {
        Ok(metadata) => metadata.len() == initial_size && metadata.len() > 0,
        Err(_) => false,
    }
}

/// Run one candidate file through the ingest steps. Returns true when a new
/// job was enqueued.
pub fn ingest_candidate(
    store: &Store,
    queue: &SharedJobQueue,
    progress: &ProgressTracker,
    config: &Config,
    path: &Path,
    ready_wait: Duration,
) -> Result<bool> {
    if !config.is_supported_extension(path) {
        return Ok(false);
    }
    if !is_file_ready(path, ready_wait) {
        debug!(?path, "file not ready, skipping");
        return Ok(false);
    }

    let file_hash = compute_file_hash(path)?;
    if store.photo_exists(&file_hash)? {
        debug!(?path, "content already ingested, skipping");
        return Ok(false);
    }

    match store.create_photo(&file_hash, &path.to_string_lossy()) {
        Ok(photo_id) => {
            queue.push(Some(PhotoJob {
                photo_id,
                path: path.to_path_buf(),
                file_hash,
            }));
            progress.on_enqueue(1);
            info!(photo_id, name = %path.file_name().unwrap_or_default().to_string_lossy(), "enqueued");
            Ok(true)
        }
        // The other ingest mechanism won the race; that is the point of
        // content-hash identity.
        Err(e) if e.downcast_ref::<StoreError>().is_some() => {
            debug!(?path, "duplicate hash raced in, skipping");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// List the drop zone and ingest whatever is there.
pub fn scan_incoming(
    store: &Store,
    queue: &SharedJobQueue,
    progress: &ProgressTracker,
    config: &Config,
) -> Result<usize> {
    let incoming = config.incoming_dir();
    if !incoming.exists() {
        return Ok(0);
    }

    let mut enqueued = 0;
    for entry in std::fs::read_dir(&incoming)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match ingest_candidate(store, queue, progress, config, &path, Duration::from_millis(100)) {
            Ok(true) => enqueued += 1,
            Ok(false) => {}
            Err(e) => error!(?path, error = %e, "scanner ingest failed"),
        }
    }

    if enqueued > 0 {
        info!(enqueued, "scanner enqueued file(s)");
    }
    Ok(enqueued)
}

/// Event-driven plus periodic-scan watcher over the drop zone.
pub struct DropZoneWatcher {
    stop: Arc<FlagEvent>,
    threads: Vec<JoinHandle<()>>,
    // Kept alive for the lifetime of the watcher; dropping it unsubscribes
    _fs_watcher: Option<RecommendedWatcher>,
}

impl DropZoneWatcher {
    pub fn start(
        store: Store,
        queue: SharedJobQueue,
        progress: Arc<ProgressTracker>,
        config: Config,
    ) -> Result<Self> {
        let incoming = config.incoming_dir();
        std::fs::create_dir_all(&incoming)?;

        let stop = Arc::new(FlagEvent::new(false));
        let mut threads = Vec::new();

        // Filesystem events feed a channel drained by its own thread so the
        // notify callback never blocks on hashing or the database.
        let (event_tx, event_rx) = mpsc::channel::<Event>();
        let fs_watcher = match RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => warn!(error = %e, "watch error"),
            },
            notify::Config::default(),
        ) {
            Ok(mut watcher) => match watcher.watch(&incoming, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!(path = ?incoming, "watching drop zone");
                    Some(watcher)
                }
                Err(e) => {
                    warn!(error = %e, "filesystem events unavailable, relying on periodic scan");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "could not create filesystem watcher, relying on periodic scan");
                None
            }
        };

        {
            let store = store.clone();
            let queue = queue.clone();
            let progress = progress.clone();
            let config = config.clone();
            let stop = stop.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("watch-events".into())
                    .spawn(move || {
                        while !stop.is_set() {
                            let event = match event_rx.recv_timeout(Duration::from_millis(500)) {
                                Ok(event) => event,
                                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                            };
                            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                                continue;
                            }
                            for path in &event.paths {
                                if let Err(e) = ingest_candidate(
                                    &store,
                                    &queue,
                                    &progress,
                                    &config,
                                    path,
                                    Duration::from_millis(500),
                                ) {
                                    error!(?path, error = %e, "event ingest failed");
                                }
                            }
                        }
                        debug!("event drain stopped");
                    })?,
            );
        }

        // Periodic scanner, with an immediate pass on startup
        {
            let stop = stop.clone();
            let interval = Duration::from_secs(config.watcher.scan_interval.max(1));
            threads.push(
                std::thread::Builder::new()
                    .name("watch-scanner".into())
                    .spawn(move || {
                        info!(interval = ?interval, "scanner started");
                        loop {
                            if let Err(e) = scan_incoming(&store, &queue, &progress, &config) {
                                error!(error = %e, "scan failed");
                            }
                            if stop.wait_timeout(interval) {
                                break;
                            }
                        }
                        debug!("scanner stopped");
                    })?,
            );
        }

        Ok(Self { stop, threads, _fs_watcher: fs_watcher })
    }

    pub fn stop(mut self) {
        self.stop.set();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config, Store, SharedJobQueue, Arc<ProgressTracker>) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.event_root = dir.path().join("event");
        config.database.path = dir.path().join("test.db");
        config.ensure_directories().unwrap();
        let store = Store::open(&config.database.path).unwrap();
        let queue: SharedJobQueue = Arc::new(JobQueue::new());
        (dir, config, store, queue, Arc::new(ProgressTracker::new()))
    }

    #[test]
    fn hash_depends_only_on_content() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("renamed.jpg");
        let c = dir.path().join("c.jpg");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        std::fs::write(&c, b"different").unwrap();

        assert_eq!(compute_file_hash(&a).unwrap(), compute_file_hash(&b).unwrap());
        assert_ne!(compute_file_hash(&a).unwrap(), compute_file_hash(&c).unwrap());
    }

    #[test]
    fn empty_or_missing_files_are_not_ready() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.jpg");
        assert!(!is_file_ready(&missing, Duration::ZERO));

        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();
        assert!(!is_file_ready(&empty, Duration::ZERO));

        let full = dir.path().join("full.jpg");
        std::fs::write(&full, b"data").unwrap();
        assert!(is_file_ready(&full, Duration::from_millis(10)));
    }

    #[test]
    fn ingest_enqueues_new_content_once() {
        let (_dir, config, store, queue, progress) = setup();
        let file = config.incoming_dir().join("alice.jpg");
        std::fs::write(&file, b"alice bytes").unwrap();

        let first =
            ingest_candidate(&store, &queue, &progress, &config, &file, Duration::ZERO).unwrap();
        assert!(first);
        let job = queue.pop_timeout(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(job.path, file);
        assert!(store.photo_exists(&job.file_hash).unwrap());

        // Byte-identical copy under a new name is dropped
        let copy = config.incoming_dir().join("alice_copy.jpg");
        std::fs::write(&copy, b"alice bytes").unwrap();
        let second =
            ingest_candidate(&store, &queue, &progress, &config, &copy, Duration::ZERO).unwrap();
        assert!(!second);
        assert!(queue.pop_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(store.pending_photos().unwrap().len(), 1);
    }

    #[test]
    fn ingest_ignores_unsupported_extensions() {
        let (_dir, config, store, queue, progress) = setup();
        let file = config.incoming_dir().join("notes.txt");
        std::fs::write(&file, b"some text").unwrap();

        let ingested =
            ingest_candidate(&store, &queue, &progress, &config, &file, Duration::ZERO).unwrap();
        assert!(!ingested);
        assert!(store.pending_photos().unwrap().is_empty());
    }

    #[test]
    fn scan_picks_up_dropped_files() {
        let (_dir, config, store, queue, progress) = setup();
        std::fs::write(config.incoming_dir().join("a.jpg"), b"photo a").unwrap();
        std::fs::write(config.incoming_dir().join("b.jpg"), b"photo b").unwrap();
        std::fs::write(config.incoming_dir().join("skip.txt"), b"text").unwrap();

        let enqueued = scan_incoming(&store, &queue, &progress, &config).unwrap();
        assert_eq!(enqueued, 2);
        assert_eq!(queue.len(), 2);

        // Re-scan is a no-op thanks to hash dedup
        let again = scan_incoming(&store, &queue, &progress, &config).unwrap();
        assert_eq!(again, 0);
        assert_eq!(store.pending_photos().unwrap().len(), 2);
    }
}
