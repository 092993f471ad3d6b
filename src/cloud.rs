//! Remote mirroring: the `RemoteStore` capability seam and the
//! `CloudManager` that layers caching, per-path locking, retries and
//! dry-run handling on top of it.
//!
//! The backend protocol (credentials, HTTP, resumable uploads) lives behind
//! the trait; this module never talks to the network itself.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Remote failures split by retryability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// Timeouts, resets, 5xx: worth retrying.
    #[error("transient remote error: {0}")]
    Transient(String),
    /// Auth, permission, not-found: retrying cannot help.
    #[error("fatal remote error: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Fatal(_))
    }
}

/// Operations the remote object store must provide. `parent_id = None`
/// addresses the backend's root.
pub trait RemoteStore: Send + Sync {
    fn find_folder(&self, name: &str, parent_id: Option<&str>)
        -> Result<Option<String>, RemoteError>;
    fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String, RemoteError>;
    fn rename_folder(&self, folder_id: &str, new_name: &str) -> Result<(), RemoteError>;
    /// Returns the id of the uploaded object.
    fn upload_file(&self, local_path: &Path, parent_id: &str) -> Result<String, RemoteError>;
    fn grant_public_read(&self, folder_id: &str) -> Result<(), RemoteError>;
    /// Refresh credentials / connection pools between batches.
    fn rebuild(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

const REMOTE_RETRIES: u32 = 3;
const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(2);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(16);
const PATH_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-path lock set: same path serializes, different paths run in
/// parallel. Acquisition is bounded so a stuck path cannot deadlock others.
struct PathLocks {
    held: Mutex<HashSet<String>>,
    cvar: Condvar,
}

impl PathLocks {
    fn new() -> Self {
        Self { held: Mutex::new(HashSet::new()), cvar: Condvar::new() }
    }

    fn acquire(&self, key: &str, timeout: Duration) -> bool {
        let held = self.held.lock().unwrap();
        let (mut held, result) = self
            .cvar
            .wait_timeout_while(held, timeout, |set| set.contains(key))
            .unwrap();
        if result.timed_out() && held.contains(key) {
            return false;
        }
        held.insert(key.to_string());
        true
    }

    fn release(&self, key: &str) {
        self.held.lock().unwrap().remove(key);
        self.cvar.notify_all();
    }
}

/// Coordinated view over an optional remote backend.
pub struct CloudManager {
    backend: Option<Arc<dyn RemoteStore>>,
    root_folder_id: Option<String>,
    dry_run: bool,
    folder_cache: Mutex<HashMap<String, String>>,
    path_locks: PathLocks,
}

impl CloudManager {
    pub fn new(
        backend: Arc<dyn RemoteStore>,
        root_folder_id: Option<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            backend: Some(backend),
            root_folder_id,
            dry_run,
            folder_cache: Mutex::new(HashMap::new()),
            path_locks: PathLocks::new(),
        }
    }

    /// A manager with no backend: every operation is a cheap no-op.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            root_folder_id: None,
            dry_run: false,
            folder_cache: Mutex::new(HashMap::new()),
            path_locks: PathLocks::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Retry transient failures with doubling delay; fatal errors surface
    /// immediately.
    fn with_retry<T>(
        &self,
        what: &str,
        op: impl Fn(&dyn RemoteStore) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let backend = self
            .backend
            .as_deref()
            .ok_or_else(|| RemoteError::Fatal("remote store not configured".into()))?;

        let mut delay = RETRY_INITIAL_DELAY;
        let mut last = None;
        for attempt in 1..=REMOTE_RETRIES {
            match op(backend) {
                Ok(value) => return Ok(value),
                Err(e @ RemoteError::Fatal(_)) => {
                    error!(op = what, error = %e, "non-retryable remote error");
                    return Err(e);
                }
                Err(e) => {
                    if attempt < REMOTE_RETRIES {
                        warn!(op = what, attempt, error = %e, "remote call failed, retrying in {:?}", delay);
                        std::thread::sleep(delay);
                        delay = (delay * 2).min(RETRY_MAX_DELAY);
                    } else {
                        error!(op = what, error = %e, "remote call failed after {} attempts", REMOTE_RETRIES);
                    }
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| RemoteError::Transient("remote call never ran".into())))
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.folder_cache.lock().unwrap().get(key).cloned()
    }

    /// Ensure the folder hierarchy `parts` exists remotely and return the id
    /// of the final folder. Returns `Ok(None)` when the remote is disabled
    /// or in dry-run mode.
    pub fn ensure_folder_path(&self, parts: &[&str]) -> Result<Option<String>, RemoteError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        if self.dry_run {
            info!(path = parts.join("/"), "[dry run] would ensure remote folder");
            return Ok(None);
        }

        let mut parent_id = self.root_folder_id.clone();
        let mut path_key = String::new();

        for part in parts {
            path_key = if path_key.is_empty() {
                (*part).to_string()
            } else {
                format!("{path_key}/{part}")
            };

            if let Some(id) = self.cached(&path_key) {
                parent_id = Some(id);
                continue;
            }

            if !self.path_locks.acquire(&path_key, PATH_LOCK_TIMEOUT) {
                return Err(RemoteError::Transient(format!(
                    "timed out waiting for folder lock on {path_key}"
                )));
            }
            let ensured = (|| {
                // Another thread may have resolved this level while we waited
                if let Some(id) = self.cached(&path_key) {
                    return Ok(id);
                }
                let parent = parent_id.as_deref();
                let found = self.with_retry("find_folder", |b| b.find_folder(part, parent))?;
                let id = match found {
                    Some(id) => id,
                    None => {
                        let id = self.with_retry("create_folder", |b| b.create_folder(part, parent))?;
                        debug!(folder = %part, id = %id, "created remote folder");
                        id
                    }
                };
                self.folder_cache.lock().unwrap().insert(path_key.clone(), id.clone());
                Ok(id)
            })();
            self.path_locks.release(&path_key);

            parent_id = Some(ensured?);
        }

        Ok(parent_id)
    }

    /// Rename a folder found by name under `parent_parts`. Returns false
    /// when the folder does not exist remotely.
    pub fn rename_folder(
        &self,
        old_name: &str,
        new_name: &str,
        parent_parts: &[&str],
    ) -> Result<bool, RemoteError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        if self.dry_run {
            info!(old = old_name, new = new_name, "[dry run] would rename remote folder");
            return Ok(true);
        }

        let parent_id = self.ensure_folder_path(parent_parts)?;
        let folder_id =
            self.with_retry("find_folder", |b| b.find_folder(old_name, parent_id.as_deref()))?;
        let folder_id = match folder_id {
            Some(id) => id,
            None => {
                warn!(folder = old_name, "remote folder not found for rename");
                return Ok(false);
            }
        };

        self.with_retry("rename_folder", |b| b.rename_folder(&folder_id, new_name))?;
        info!(old = old_name, new = new_name, id = %folder_id, "renamed remote folder");

        // Drop every cache entry referencing the old name, then re-cache the
        // renamed folder under its new path.
        let mut cache = self.folder_cache.lock().unwrap();
        cache.retain(|key, _| !key.split('/').any(|segment| segment == old_name));
        let mut new_key: Vec<&str> = parent_parts.to_vec();
        new_key.push(new_name);
        cache.insert(new_key.join("/"), folder_id);

        Ok(true)
    }

    /// Mirror `local_path` into the remote tree, relative to `relative_to`.
    /// Already-present objects (same name in the same folder) are skipped.
    pub fn upload_file(&self, local_path: &Path, relative_to: &Path) -> Result<(), RemoteError> {
        if !self.is_enabled() {
            return Err(RemoteError::Fatal("remote store not configured".into()));
        }
        if self.dry_run {
            info!(path = ?local_path, "[dry run] would upload");
            return Ok(());
        }

        let relative = local_path.strip_prefix(relative_to).map_err(|_| {
            RemoteError::Fatal(format!(
                "{local_path:?} is not under the mirror root {relative_to:?}"
            ))
        })?;
        let folder_parts: Vec<&str> = relative
            .parent()
            .map(|p| p.iter().filter_map(|c| c.to_str()).collect())
            .unwrap_or_default();
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RemoteError::Fatal(format!("{local_path:?} has no file name")))?;

        let parent_id = self
            .ensure_folder_path(&folder_parts)?
            .ok_or_else(|| RemoteError::Fatal("remote folder ensure returned nothing".into()))?;

        let existing =
            self.with_retry("find_folder", |b| b.find_folder(file_name, Some(&parent_id)))?;
        if existing.is_some() {
            debug!(name = file_name, "already mirrored, skipping");
            return Ok(());
        }

        let id = self.with_retry("upload_file", |b| b.upload_file(local_path, &parent_id))?;
        info!(name = file_name, id = %id, "uploaded");
        Ok(())
    }

    /// Set anyone-with-the-link read access on a folder.
    pub fn share_folder_publicly(&self, folder_id: &str) -> Result<(), RemoteError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.dry_run {
            info!(folder_id, "[dry run] would grant public read");
            return Ok(());
        }
        self.with_retry("grant_public_read", |b| b.grant_public_read(folder_id))?;
        info!(folder_id, "granted public read");
        Ok(())
    }

    /// Refresh the backend between upload batches.
    pub fn rebuild(&self) {
        if !self.is_enabled() || self.dry_run {
            return;
        }
        if let Err(e) = self.with_retry("rebuild", |b| b.rebuild()) {
            warn!(error = %e, "remote client rebuild failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory remote store for tests: records folders, files, renames
    //! and rebuilds, with injectable failures. `RecordingRemote` adds call
    //! tracing for phase-exclusion checks.

    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    #[derive(Default)]
    struct RemoteState {
        // folder id -> (name, parent id)
        folders: HashMap<String, (String, Option<String>)>,
        // (parent folder id, file name) -> local source
        files: HashMap<(String, String), PathBuf>,
        next_id: u64,
        rebuilds: usize,
        upload_calls: usize,
        /// Uploads that should fail with a transient error before one succeeds
        transient_failures: usize,
        /// File names that always fail fatally
        fatal_names: HashSet<String>,
    }

    #[derive(Default)]
    pub struct MemoryRemote {
        state: Mutex<RemoteState>,
    }

    impl MemoryRemote {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing_transient(count: usize) -> Arc<Self> {
            let remote = Self::default();
            remote.state.lock().unwrap().transient_failures = count;
            Arc::new(remote)
        }

        pub fn with_fatal_name(name: &str) -> Arc<Self> {
            let remote = Self::default();
            remote.state.lock().unwrap().fatal_names.insert(name.to_string());
            Arc::new(remote)
        }

        pub fn rebuild_count(&self) -> usize {
            self.state.lock().unwrap().rebuilds
        }

        pub fn upload_calls(&self) -> usize {
            self.state.lock().unwrap().upload_calls
        }

        fn folder_path(state: &RemoteState, id: &str) -> String {
            let mut parts = Vec::new();
            let mut cursor = Some(id.to_string());
            while let Some(current) = cursor {
                if let Some((name, parent)) = state.folders.get(&current) {
                    parts.push(name.clone());
                    cursor = parent.clone();
                } else {
                    break;
                }
            }
            parts.reverse();
            parts.join("/")
        }

        /// Uploaded files as `folder/path/name` strings.
        pub fn uploaded(&self) -> Vec<String> {
            let state = self.state.lock().unwrap();
            let mut names: Vec<String> = state
                .files
                .keys()
                .map(|(folder, name)| format!("{}/{}", Self::folder_path(&state, folder), name))
                .collect();
            names.sort();
            names
        }

        /// Folder paths that exist remotely.
        pub fn folder_paths(&self) -> Vec<String> {
            let state = self.state.lock().unwrap();
            let mut paths: Vec<String> = state
                .folders
                .keys()
                .map(|id| Self::folder_path(&state, id))
                .collect();
            paths.sort();
            paths
        }
    }

    /// Tracing wrapper around [`MemoryRemote`] that records the enter and
    /// exit instants of every `upload_file` call, padded with an artificial
    /// delay so the open interval is wide enough to catch overlaps.
    pub struct RecordingRemote {
        inner: MemoryRemote,
        upload_delay: Duration,
        intervals: Mutex<Vec<(Instant, Instant)>>,
    }

    impl RecordingRemote {
        pub fn shared(upload_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryRemote::default(),
                upload_delay,
                intervals: Mutex::new(Vec::new()),
            })
        }

        /// (enter, exit) instants of every completed `upload_file` call.
        pub fn upload_intervals(&self) -> Vec<(Instant, Instant)> {
            self.intervals.lock().unwrap().clone()
        }
    }

    impl RemoteStore for RecordingRemote {
        fn find_folder(
            &self,
            name: &str,
            parent_id: Option<&str>,
        ) -> Result<Option<String>, RemoteError> {
            self.inner.find_folder(name, parent_id)
        }

        fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String, RemoteError> {
            self.inner.create_folder(name, parent_id)
        }

        fn rename_folder(&self, folder_id: &str, new_name: &str) -> Result<(), RemoteError> {
            self.inner.rename_folder(folder_id, new_name)
        }

        fn upload_file(&self, local_path: &Path, parent_id: &str) -> Result<String, RemoteError> {
            let entered = Instant::now();
            std::thread::sleep(self.upload_delay);
            let result = self.inner.upload_file(local_path, parent_id);
            self.intervals.lock().unwrap().push((entered, Instant::now()));
            result
        }

        fn grant_public_read(&self, folder_id: &str) -> Result<(), RemoteError> {
            self.inner.grant_public_read(folder_id)
        }

        fn rebuild(&self) -> Result<(), RemoteError> {
            self.inner.rebuild()
        }
    }

    impl RemoteStore for MemoryRemote {
        fn find_folder(
            &self,
            name: &str,
            parent_id: Option<&str>,
        ) -> Result<Option<String>, RemoteError> {
            let state = self.state.lock().unwrap();
            // Files share the name lookup so upload dedup works
            if let Some(parent) = parent_id {
                if state.files.contains_key(&(parent.to_string(), name.to_string())) {
                    return Ok(Some(format!("file:{parent}/{name}")));
                }
            }
            let found = state
                .folders
                .iter()
                .find(|(_, (n, p))| n == name && p.as_deref() == parent_id)
                .map(|(id, _)| id.clone());
            Ok(found)
        }

        fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<String, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = format!("folder-{}", state.next_id);
            state
                .folders
                .insert(id.clone(), (name.to_string(), parent_id.map(str::to_string)));
            Ok(id)
        }

        fn rename_folder(&self, folder_id: &str, new_name: &str) -> Result<(), RemoteError> {
            let mut state = self.state.lock().unwrap();
            match state.folders.get_mut(folder_id) {
                Some((name, _)) => {
                    *name = new_name.to_string();
                    Ok(())
                }
                None => Err(RemoteError::Fatal(format!("no such folder {folder_id}"))),
            }
        }

        fn upload_file(&self, local_path: &Path, parent_id: &str) -> Result<String, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.upload_calls += 1;
            let name = local_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed")
                .to_string();
            if state.fatal_names.contains(&name) {
                return Err(RemoteError::Fatal(format!("forbidden object {name}")));
            }
            if state.transient_failures > 0 {
                state.transient_failures -= 1;
                return Err(RemoteError::Transient("connection reset".into()));
            }
            state
                .files
                .insert((parent_id.to_string(), name.clone()), local_path.to_path_buf());
            Ok(format!("file:{parent_id}/{name}"))
        }

        fn grant_public_read(&self, _folder_id: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        fn rebuild(&self) -> Result<(), RemoteError> {
            self.state.lock().unwrap().rebuilds += 1;
            Ok(())
        }
    }
}
