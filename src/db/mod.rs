//! Durable state for the pipeline: photos, faces, persons, enrollments and
//! the upload queue.
//!
//! The `Store` is a cheap handle over the database path. Every thread that
//! touches it lazily opens its own connection (SQLite connections must not
//! be shared across threads), configured for WAL journaling and a long busy
//! timeout. Writes that still hit a locked database are retried with capped
//! exponential backoff before the error surfaces.

mod schema;
pub mod enrollments;
pub mod faces;
pub mod persons;
pub mod photos;
pub mod uploads;

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::{info, warn};

pub use enrollments::Enrollment;
pub use faces::{bytes_to_embedding, embedding_to_bytes, BoundingBox, Face};
pub use persons::Person;
pub use photos::{Photo, PhotoStatus};
pub use uploads::{UploadJob, UploadStatus};

use schema::SCHEMA;

const LOCK_RETRIES: u32 = 5;
const LOCK_BASE_DELAY: Duration = Duration::from_secs(1);

/// Typed store failures callers may need to branch on.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a photo with this content hash already exists")]
    DuplicateHash,
}

thread_local! {
    static CONNECTIONS: RefCell<HashMap<PathBuf, Rc<Connection>>> =
        RefCell::new(HashMap::new());
}

/// Handle to the SQLite store. Clone freely; connections are per-thread.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path: path.to_path_buf() };
        let conn = store.conn()?;
        conn.execute_batch(SCHEMA)
            .context("failed to apply database schema")?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Get or create this thread's connection.
    fn conn(&self) -> Result<Rc<Connection>> {
        CONNECTIONS.with(|cell| {
            let mut map = cell.borrow_mut();
            if let Some(conn) = map.get(&self.db_path) {
                return Ok(conn.clone());
            }
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("failed to open database at {:?}", self.db_path))?;
            conn.execute_batch(
                "PRAGMA busy_timeout = 60000;
                 PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA synchronous = NORMAL;",
            )?;
            let conn = Rc::new(conn);
            map.insert(self.db_path.clone(), conn.clone());
            Ok(conn)
        })
    }

    /// Run a single operation, retrying `database is locked` errors.
    fn with_retry<T>(
        &self,
        name: &str,
        mut op: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn()?;
        let mut delay = LOCK_BASE_DELAY;
        for attempt in 0..=LOCK_RETRIES {
            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_locked(&e) && attempt < LOCK_RETRIES => {
                    warn!(
                        op = name,
                        attempt = attempt + 1,
                        "database locked, retrying in {:?}",
                        delay
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(e).with_context(|| format!("store operation {name} failed")),
            }
        }
        unreachable!("retry loop always returns")
    }

    /// Run `f` inside one transaction; commit on Ok, roll back on Err.
    /// Locked-database errors restart the whole transaction.
    pub fn with_tx<T>(&self, f: impl Fn(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        let mut delay = LOCK_BASE_DELAY;
        for attempt in 0..=LOCK_RETRIES {
            let result = (|| -> Result<T> {
                let tx = conn.unchecked_transaction()?;
                let out = f(&StoreTx { conn: &*tx })?;
                tx.commit()?;
                Ok(out)
            })();
            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let locked = e
                        .downcast_ref::<rusqlite::Error>()
                        .map(is_locked)
                        .unwrap_or(false);
                    if locked && attempt < LOCK_RETRIES {
                        warn!(attempt = attempt + 1, "transaction hit locked database, retrying in {:?}", delay);
                        std::thread::sleep(delay);
                        delay *= 2;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    // ========================================================================
    // Photo operations
    // ========================================================================

    pub fn photo_exists(&self, file_hash: &str) -> Result<bool> {
        self.with_retry("photo_exists", |c| photos::exists(c, file_hash))
    }

    /// Create a pending photo row. Fails with [`StoreError::DuplicateHash`]
    /// when the content hash is already known.
    pub fn create_photo(&self, file_hash: &str, original_path: &str) -> Result<i64> {
        let conn = self.conn()?;
        match photos::insert(&conn, file_hash, original_path) {
            Ok(id) => Ok(id),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateHash.into()),
            Err(e) if is_locked(&e) => {
                // Fall back to the retry path for contended inserts
                self.with_retry("create_photo", |c| photos::insert(c, file_hash, original_path))
                    .map_err(|e| match e.downcast_ref::<rusqlite::Error>() {
                        Some(inner) if is_unique_violation(inner) => StoreError::DuplicateHash.into(),
                        _ => e,
                    })
            }
            Err(e) => Err(e).context("store operation create_photo failed"),
        }
    }

    pub fn pending_photos(&self) -> Result<Vec<Photo>> {
        self.with_retry("pending_photos", photos::pending)
    }

    pub fn photo_by_id(&self, photo_id: i64) -> Result<Option<Photo>> {
        self.with_retry("photo_by_id", |c| photos::by_id(c, photo_id))
    }

    pub fn photo_by_hash(&self, file_hash: &str) -> Result<Option<Photo>> {
        self.with_retry("photo_by_hash", |c| photos::by_hash(c, file_hash))
    }

    pub fn set_photo_processing(&self, photo_id: i64) -> Result<()> {
        self.with_retry("set_photo_processing", |c| {
            photos::set_status(c, photo_id, PhotoStatus::Processing)
        })
    }

    pub fn set_photo_error(&self, photo_id: i64) -> Result<()> {
        self.with_retry("set_photo_error", |c| {
            photos::set_status(c, photo_id, PhotoStatus::Error)
        })
    }

    /// Record the outcome of processing; `status` must be `Completed` or
    /// `NoFaces`.
    pub fn set_photo_completed(
        &self,
        photo_id: i64,
        processed_path: &str,
        thumbnail_path: Option<&str>,
        face_count: i64,
        status: PhotoStatus,
    ) -> Result<()> {
        self.with_retry("set_photo_completed", |c| {
            photos::set_completed(c, photo_id, processed_path, thumbnail_path, face_count, status)
        })
    }

    /// Reset photos stuck in `processing` longer than `max_age` to `pending`.
    pub fn reset_stuck_processing(&self, max_age: Duration) -> Result<usize> {
        let cutoff = cutoff_str(max_age);
        let count = self.with_retry("reset_stuck_processing", |c| {
            photos::reset_stuck(c, &cutoff)
        })?;
        if count > 0 {
            warn!(count, "reset stuck processing photo(s) back to pending");
        }
        Ok(count)
    }

    // ========================================================================
    // Face / person operations
    // ========================================================================

    pub fn faces_of_photo(&self, photo_id: i64) -> Result<Vec<Face>> {
        self.with_retry("faces_of_photo", |c| faces::of_photo(c, photo_id))
    }

    pub fn distinct_persons_of_photo(&self, photo_id: i64) -> Result<Vec<i64>> {
        self.with_retry("distinct_persons_of_photo", |c| {
            faces::distinct_persons(c, photo_id)
        })
    }

    pub fn all_persons(&self) -> Result<Vec<Person>> {
        self.with_retry("all_persons", persons::all)
    }

    pub fn person_by_id(&self, person_id: i64) -> Result<Option<Person>> {
        self.with_retry("person_by_id", |c| persons::by_id(c, person_id))
    }

    pub fn rename_person(&self, person_id: i64, name: &str) -> Result<()> {
        self.with_retry("rename_person", |c| persons::rename(c, person_id, name))
    }

    // ========================================================================
    // Enrollment operations
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn create_enrollment(
        &self,
        person_id: i64,
        user_name: &str,
        phone: Option<&str>,
        email: Option<&str>,
        selfie_path: &str,
        match_confidence: f32,
        consent_given: bool,
    ) -> Result<i64> {
        self.with_retry("create_enrollment", |c| {
            enrollments::insert(
                c,
                person_id,
                user_name,
                phone,
                email,
                selfie_path,
                match_confidence,
                consent_given,
            )
        })
    }

    pub fn enrollment_of_person(&self, person_id: i64) -> Result<Option<Enrollment>> {
        self.with_retry("enrollment_of_person", |c| {
            enrollments::of_person(c, person_id)
        })
    }

    pub fn is_enrolled(&self, person_id: i64) -> Result<bool> {
        self.with_retry("is_enrolled", |c| enrollments::exists(c, person_id))
    }

    pub fn all_enrollments(&self) -> Result<Vec<Enrollment>> {
        self.with_retry("all_enrollments", enrollments::all)
    }

    // ========================================================================
    // Upload queue operations
    // ========================================================================

    pub fn enqueue_upload(&self, photo_id: i64, local_path: &str, relative_to: &str) -> Result<i64> {
        self.with_retry("enqueue_upload", |c| {
            uploads::insert(c, photo_id, local_path, relative_to)
        })
    }

    pub fn pending_uploads(&self, limit: usize) -> Result<Vec<UploadJob>> {
        self.with_retry("pending_uploads", |c| uploads::pending(c, limit))
    }

    pub fn failed_uploads(&self, max_retries: u32) -> Result<Vec<UploadJob>> {
        self.with_retry("failed_uploads", |c| uploads::failed(c, max_retries))
    }

    pub fn update_upload(
        &self,
        upload_id: i64,
        status: UploadStatus,
        error: Option<&str>,
        increment_retry: bool,
    ) -> Result<()> {
        self.with_retry("update_upload", |c| {
            uploads::update(c, upload_id, status, error, increment_retry)
        })
    }

    /// Mark an upload failed with its retry budget exhausted so it is never
    /// picked again.
    pub fn freeze_upload(&self, upload_id: i64, max_retries: u32, error: &str) -> Result<()> {
        self.with_retry("freeze_upload", |c| {
            uploads::freeze(c, upload_id, max_retries, error)
        })
    }

    /// Rewrite the path segment of pending and failed uploads after a person
    /// folder rename. Completed rows are left untouched.
    pub fn rewrite_upload_paths(&self, old_segment: &str, new_segment: &str) -> Result<usize> {
        let count = self.with_retry("rewrite_upload_paths", |c| {
            uploads::rewrite_paths(c, old_segment, new_segment)
        })?;
        if count > 0 {
            info!(count, old = old_segment, new = new_segment, "rewrote queued upload paths");
        }
        Ok(count)
    }

    /// Reset uploads stuck in `uploading` longer than `max_age` to `pending`.
    pub fn reset_stuck_uploads(&self, max_age: Duration) -> Result<usize> {
        let cutoff = cutoff_str(max_age);
        let count = self.with_retry("reset_stuck_uploads", |c| uploads::reset_stuck(c, &cutoff))?;
        if count > 0 {
            warn!(count, "reset stuck upload(s) back to pending");
        }
        Ok(count)
    }

    pub fn upload_stats(&self) -> Result<HashMap<String, i64>> {
        self.with_retry("upload_stats", uploads::stats)
    }

    pub fn upload_stats_unique(&self) -> Result<HashMap<String, i64>> {
        self.with_retry("upload_stats_unique", uploads::stats_unique_photos)
    }

    // ========================================================================
    // Statistics & recovery
    // ========================================================================

    pub fn stats(&self) -> Result<Stats> {
        self.with_retry("stats", |c| {
            Ok(Stats {
                photos_by_status: photos::count_by_status(c)?,
                total_faces: faces::count(c)?,
                total_persons: persons::count(c)?,
                total_enrollments: enrollments::count(c)?,
            })
        })
    }

    /// Clean up after a crash that left photos mid-pipeline.
    ///
    /// For every photo stuck in `processing`: delete its face rows, then for
    /// each person those faces pointed at either recompute the centroid and
    /// face count from the surviving faces or delete the person outright,
    /// and finally put the photo back to `pending`. Each photo is handled in
    /// its own transaction so a crash during recovery leaves a consistent
    /// store. Running this twice in a row is a no-op.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let stuck = self.with_retry("processing_photos", photos::processing)?;
        if stuck.is_empty() {
            return Ok(0);
        }
        info!(count = stuck.len(), "recovering photos interrupted mid-processing");

        for photo in &stuck {
            self.with_tx(|tx| {
                let orphans = tx.faces_of_photo(photo.id)?;
                let mut touched: Vec<i64> =
                    orphans.iter().filter_map(|f| f.person_id).collect();
                touched.sort_unstable();
                touched.dedup();

                tx.delete_faces_of_photo(photo.id)?;

                for person_id in touched {
                    let survivors = tx.faces_of_person(person_id)?;
                    if survivors.is_empty() {
                        tx.delete_person(person_id)?;
                        warn!(person_id, photo_id = photo.id, "removed person with no surviving faces");
                    } else {
                        let centroid = mean_embedding(&survivors);
                        tx.update_centroid(person_id, &centroid, survivors.len() as i64)?;
                    }
                }

                tx.set_photo_status(photo.id, PhotoStatus::Pending)?;
                Ok(())
            })?;
        }

        Ok(stuck.len())
    }
}

/// Transaction-scoped view of the store. All mutations performed through it
/// commit or roll back together.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    pub fn create_face(
        &self,
        photo_id: i64,
        bbox: &BoundingBox,
        embedding: &[f32],
        confidence: f32,
        person_id: Option<i64>,
    ) -> Result<i64> {
        faces::insert(self.conn, photo_id, bbox, embedding, confidence, person_id)
            .context("create_face failed")
    }

    pub fn assign_face(&self, face_id: i64, person_id: i64) -> Result<()> {
        faces::assign(self.conn, face_id, person_id).context("assign_face failed")
    }

    pub fn faces_of_photo(&self, photo_id: i64) -> Result<Vec<Face>> {
        faces::of_photo(self.conn, photo_id).context("faces_of_photo failed")
    }

    pub fn faces_of_person(&self, person_id: i64) -> Result<Vec<Face>> {
        faces::of_person(self.conn, person_id).context("faces_of_person failed")
    }

    pub fn delete_faces_of_photo(&self, photo_id: i64) -> Result<usize> {
        faces::delete_of_photo(self.conn, photo_id).context("delete_faces_of_photo failed")
    }

    pub fn reassign_faces(&self, from_person: i64, to_person: i64) -> Result<usize> {
        faces::reassign(self.conn, from_person, to_person).context("reassign_faces failed")
    }

    pub fn all_persons(&self) -> Result<Vec<Person>> {
        persons::all(self.conn).context("all_persons failed")
    }

    pub fn person_by_id(&self, person_id: i64) -> Result<Option<Person>> {
        persons::by_id(self.conn, person_id).context("person_by_id failed")
    }

    pub fn create_person(&self, name: &str, centroid: &[f32]) -> Result<i64> {
        persons::insert(self.conn, name, centroid).context("create_person failed")
    }

    pub fn update_centroid(&self, person_id: i64, centroid: &[f32], face_count: i64) -> Result<()> {
        persons::update_centroid(self.conn, person_id, centroid, face_count)
            .context("update_centroid failed")
    }

    pub fn next_person_number(&self) -> Result<i64> {
        persons::next_number(self.conn).context("next_person_number failed")
    }

    pub fn delete_person(&self, person_id: i64) -> Result<()> {
        persons::delete(self.conn, person_id).context("delete_person failed")
    }

    pub fn set_photo_status(&self, photo_id: i64, status: PhotoStatus) -> Result<()> {
        photos::set_status(self.conn, photo_id, status).context("set_photo_status failed")
    }
}

/// Snapshot of pipeline counters for logging and the CLI.
#[derive(Debug, Clone)]
pub struct Stats {
    pub photos_by_status: HashMap<String, i64>,
    pub total_faces: i64,
    pub total_persons: i64,
    pub total_enrollments: i64,
}

fn is_locked(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e.sqlite_error_code(), Some(ErrorCode::ConstraintViolation))
        && e.to_string().contains("file_hash")
}

/// Current UTC time in the same format SQLite's CURRENT_TIMESTAMP uses, so
/// string comparisons against schema defaults stay consistent.
pub(crate) fn now_str() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn cutoff_str(max_age: Duration) -> String {
    let age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
    (chrono::Utc::now() - age).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Unit-normalized mean of the faces' embeddings.
fn mean_embedding(survivors: &[Face]) -> Vec<f32> {
    let dim = survivors.iter().map(|f| f.embedding.len()).max().unwrap_or(0);
    let mut mean = vec![0.0f32; dim];
    for face in survivors {
        for (acc, v) in mean.iter_mut().zip(face.embedding.iter()) {
            *acc += v;
        }
    }
    let n = survivors.len() as f32;
    for v in mean.iter_mut() {
        *v /= n;
    }
    let norm: f32 = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in mean.iter_mut() {
            *v /= norm;
        }
    }
    mean
}
