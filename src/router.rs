//! Fan-out of processed photos into the per-person folder tree.
//!
//! Solo: exactly one person in the photo. Group: two or more, one copy per
//! person. Zero faces land in `Admin/NoFaces`, broken inputs in
//! `Admin/Errors`. Local folders are created synchronously; the matching
//! remote folders are ensured on a detached thread so network retries never
//! stall a worker.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::cloud::CloudManager;
use crate::config::Config;
use crate::db::Store;

/// Ensure `People/<name>/Solo` and `.../Group` exist for a person, locally
/// and (asynchronously) on the remote. Returns (solo_dir, group_dir).
pub fn ensure_person_folders(
    store: &Store,
    cloud: &Arc<CloudManager>,
    person_id: i64,
    config: &Config,
) -> Result<(PathBuf, PathBuf)> {
    let person_name = store
        .person_by_id(person_id)?
        .map(|p| p.name)
        .unwrap_or_else(|| format!("Person_{person_id:03}"));

    let person_dir = config.people_dir().join(&person_name);
    let solo_dir = person_dir.join("Solo");
    let group_dir = person_dir.join("Group");

    if config.routing.dry_run {
        info!(person = %person_name, "[dry run] would create person folders");
        return Ok((solo_dir, group_dir));
    }

    std::fs::create_dir_all(&solo_dir)
        .with_context(|| format!("failed to create {solo_dir:?}"))?;
    std::fs::create_dir_all(&group_dir)
        .with_context(|| format!("failed to create {group_dir:?}"))?;

    // Remote folder stubs must not block the worker; cloud retries can take
    // tens of seconds on flaky networks.
    if cloud.is_enabled() {
        let cloud = cloud.clone();
        let name = person_name.clone();
        std::thread::Builder::new()
            .name(format!("remote-folders-{name}"))
            .spawn(move || {
                for leaf in ["Solo", "Group"] {
                    if let Err(e) = cloud.ensure_folder_path(&["People", &name, leaf]) {
                        warn!(person = %name, leaf, error = %e, "remote folder ensure failed");
                        return;
                    }
                }
                debug!(person = %name, "remote folders ensured");
            })
            .ok();
    }

    Ok((solo_dir, group_dir))
}

/// Hardlink (when allowed) or copy `src` to `dst`. An existing destination
/// counts as already routed.
pub fn copy_or_link(src: &Path, dst: &Path, use_hardlinks: bool, dry_run: bool) -> Result<()> {
    if dry_run {
        info!(?src, ?dst, "[dry run] would copy");
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if dst.exists() {
        debug!(?dst, "destination already exists");
        return Ok(());
    }

    if use_hardlinks {
        match std::fs::hard_link(src, dst) {
            Ok(()) => {
                debug!(?src, ?dst, "hardlinked");
                return Ok(());
            }
            // Cross-device or unsupported filesystem: fall through to copy
            Err(e) => debug!(?src, ?dst, error = %e, "hardlink failed, copying"),
        }
    }

    std::fs::copy(src, dst).with_context(|| format!("failed to copy {src:?} -> {dst:?}"))?;
    debug!(?src, ?dst, "copied");
    Ok(())
}

/// Move a file into `dst_folder`, suffixing `_1`, `_2`, ... on name clashes.
/// Returns the final destination.
pub fn move_to_folder(src: &Path, dst_folder: &Path, dry_run: bool) -> Result<PathBuf> {
    let name = src
        .file_name()
        .with_context(|| format!("{src:?} has no file name"))?;
    let mut dst = dst_folder.join(name);

    if dry_run {
        info!(?src, ?dst, "[dry run] would move");
        return Ok(dst);
    }

    std::fs::create_dir_all(dst_folder)?;

    if dst.exists() {
        let stem = src.file_stem().unwrap_or_default().to_string_lossy().to_string();
        let ext = src
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut counter = 1;
        while dst.exists() {
            dst = dst_folder.join(format!("{stem}_{counter}{ext}"));
            counter += 1;
        }
    }

    // Rename first; fall back to copy+remove across filesystems
    if std::fs::rename(src, &dst).is_err() {
        std::fs::copy(src, &dst).with_context(|| format!("failed to move {src:?} -> {dst:?}"))?;
        std::fs::remove_file(src)?;
    }
    debug!(?src, ?dst, "moved");
    Ok(dst)
}

/// Fan a processed photo out to its persons' folders.
///
/// Zero persons moves the file to `Admin/NoFaces`. One person routes into
/// `Solo`, several into each person's `Group`. Folder creation failures are
/// fatal; individual copy failures only cost that destination. Returns the
/// local destinations actually realized.
pub fn route_photo(
    store: &Store,
    cloud: &Arc<CloudManager>,
    photo_id: i64,
    processed_path: &Path,
    person_ids: &[i64],
    config: &Config,
) -> Result<Vec<PathBuf>> {
    let unique: BTreeSet<i64> = person_ids.iter().copied().collect();
    let file_name = format!("{photo_id:06}.jpg");
    let mut routed = Vec::new();

    if unique.is_empty() {
        let dst = move_to_folder(processed_path, &config.no_faces_dir(), config.routing.dry_run)?;
        info!(photo_id, ?dst, "no persons, moved to NoFaces");
        routed.push(dst);
        return Ok(routed);
    }

    if unique.len() == 1 {
        let Some(&person_id) = unique.iter().next() else {
            return Ok(routed);
        };
        let (solo_dir, _) = ensure_person_folders(store, cloud, person_id, config)?;
        let dst = solo_dir.join(&file_name);
        match copy_or_link(processed_path, &dst, config.routing.use_hardlinks, config.routing.dry_run) {
            Ok(()) => routed.push(dst),
            Err(e) => error!(photo_id, person_id, error = %e, "solo routing failed"),
        }
    } else {
        for &person_id in &unique {
            let (_, group_dir) = ensure_person_folders(store, cloud, person_id, config)?;
            let dst = group_dir.join(&file_name);
            match copy_or_link(processed_path, &dst, config.routing.use_hardlinks, config.routing.dry_run) {
                Ok(()) => routed.push(dst),
                Err(e) => error!(photo_id, person_id, error = %e, "group routing failed"),
            }
        }
        debug!(photo_id, persons = unique.len(), routed = routed.len(), "group fan-out");
    }

    Ok(routed)
}

/// Move a failed original into `Admin/Errors`.
pub fn route_to_errors(original_path: &Path, config: &Config) -> Result<PathBuf> {
    move_to_folder(original_path, &config.errors_dir(), config.routing.dry_run)
}

/// Per-person file counts for the progress snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonFolderCounts {
    pub solo: usize,
    pub group: usize,
    pub enrolled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingSummary {
    pub processed_count: usize,
    pub no_faces_count: usize,
    pub errors_count: usize,
    pub persons: BTreeMap<String, PersonFolderCounts>,
}

fn count_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

/// Count files in each routing destination.
pub fn routing_summary(config: &Config) -> RoutingSummary {
    let mut summary = RoutingSummary {
        no_faces_count: count_files(&config.no_faces_dir()),
        errors_count: count_files(&config.errors_dir()),
        ..Default::default()
    };

    // Processed images, not counting thumbnail siblings
    let processed_dir = config.processed_dir();
    if processed_dir.exists() {
        summary.processed_count = WalkDir::new(&processed_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                !entry
                    .path()
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().ends_with("_thumb"))
                    .unwrap_or(false)
            })
            .count();
    }

    let people_dir = config.people_dir();
    if people_dir.exists() {
        for entry in WalkDir::new(&people_dir).min_depth(1).max_depth(1) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let counts = PersonFolderCounts {
                solo: count_files(&entry.path().join("Solo")),
                group: count_files(&entry.path().join("Group")),
                enrolled: !name.starts_with("Person_"),
            };
            summary.persons.insert(name, counts);
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config, Store, Arc<CloudManager>) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.event_root = dir.path().join("event");
        config.database.path = dir.path().join("test.db");
        config.ensure_directories().unwrap();
        let store = Store::open(&config.database.path).unwrap();
        let cloud = Arc::new(CloudManager::disabled());
        (dir, config, store, cloud)
    }

    fn add_person(store: &Store, name: &str) -> i64 {
        store
            .with_tx(|tx| tx.create_person(name, &[1.0, 0.0]))
            .unwrap()
    }

    fn processed_file(config: &Config, photo_id: i64) -> PathBuf {
        let path = config.processed_dir().join(format!("{photo_id:06}.jpg"));
        std::fs::write(&path, b"jpeg-bytes").unwrap();
        path
    }

    #[test]
    fn solo_photo_lands_in_solo_folder() {
        let (_dir, config, store, cloud) = setup();
        let person = add_person(&store, "Person_001");
        let processed = processed_file(&config, 1);

        let routed = route_photo(&store, &cloud, 1, &processed, &[person], &config).unwrap();
        let expected = config.people_dir().join("Person_001").join("Solo").join("000001.jpg");
        assert_eq!(routed, vec![expected.clone()]);
        assert!(expected.exists());
        // No group file for a solo photo
        assert!(!config.people_dir().join("Person_001").join("Group").join("000001.jpg").exists());
    }

    #[test]
    fn group_photo_fans_out_to_every_person() {
        let (_dir, config, store, cloud) = setup();
        let alice = add_person(&store, "Person_001");
        let bob = add_person(&store, "Person_002");
        let processed = processed_file(&config, 2);

        // Duplicate ids collapse to the unique person set
        let routed =
            route_photo(&store, &cloud, 2, &processed, &[alice, bob, alice], &config).unwrap();
        assert_eq!(routed.len(), 2);
        for name in ["Person_001", "Person_002"] {
            assert!(config.people_dir().join(name).join("Group").join("000002.jpg").exists());
            assert!(!config.people_dir().join(name).join("Solo").join("000002.jpg").exists());
        }
    }

    #[test]
    fn zero_persons_moves_to_no_faces() {
        let (_dir, config, store, cloud) = setup();
        let processed = processed_file(&config, 3);

        let routed = route_photo(&store, &cloud, 3, &processed, &[], &config).unwrap();
        assert_eq!(routed, vec![config.no_faces_dir().join("000003.jpg")]);
        assert!(!processed.exists());
        assert!(config.no_faces_dir().join("000003.jpg").exists());
    }

    #[test]
    fn routed_file_matches_source_content() {
        let (_dir, config, store, cloud) = setup();
        let person = add_person(&store, "Person_001");
        let processed = processed_file(&config, 4);

        let routed = route_photo(&store, &cloud, 4, &processed, &[person], &config).unwrap();
        assert_eq!(std::fs::read(&routed[0]).unwrap(), b"jpeg-bytes");
        // Source stays in Processed/ for copy-or-link routing
        assert!(processed.exists());
    }

    #[test]
    fn existing_destination_counts_as_routed() {
        let (_dir, config, store, cloud) = setup();
        let person = add_person(&store, "Person_001");
        let processed = processed_file(&config, 5);

        let first = route_photo(&store, &cloud, 5, &processed, &[person], &config).unwrap();
        let second = route_photo(&store, &cloud, 5, &processed, &[person], &config).unwrap();
        assert_eq!(first, second);
        assert!(first[0].exists());
    }

    #[test]
    fn move_to_folder_suffixes_on_clash() {
        let (dir, config, _store, _cloud) = setup();
        let src_a = dir.path().join("photo.jpg");
        let src_b = dir.path().join("other").join("photo.jpg");
        std::fs::create_dir_all(src_b.parent().unwrap()).unwrap();
        std::fs::write(&src_a, b"a").unwrap();
        std::fs::write(&src_b, b"b").unwrap();

        let first = move_to_folder(&src_a, &config.errors_dir(), false).unwrap();
        let second = move_to_folder(&src_b, &config.errors_dir(), false).unwrap();
        assert_eq!(first.file_name().unwrap(), "photo.jpg");
        assert_eq!(second.file_name().unwrap(), "photo_1.jpg");
        assert_eq!(std::fs::read(second).unwrap(), b"b");
    }

    #[test]
    fn dry_run_routes_nothing() {
        let (_dir, mut config, store, cloud) = setup();
        config.routing.dry_run = true;
        let person = add_person(&store, "Person_001");
        let processed = processed_file(&config, 6);

        let routed = route_photo(&store, &cloud, 6, &processed, &[person], &config).unwrap();
        assert_eq!(routed.len(), 1);
        assert!(!routed[0].exists());
        assert!(processed.exists());
    }

    #[test]
    fn unknown_person_gets_fallback_folder_name() {
        let (_dir, config, store, cloud) = setup();
        let (solo, _) = ensure_person_folders(&store, &cloud, 42, &config).unwrap();
        assert!(solo.ends_with(Path::new("Person_042").join("Solo")));
        assert!(solo.exists());
    }

    #[test]
    fn summary_counts_tree_contents() {
        let (_dir, config, store, cloud) = setup();
        let alice = add_person(&store, "Person_001");
        let jane = add_person(&store, "Jane_Doe");

        let p1 = processed_file(&config, 1);
        route_photo(&store, &cloud, 1, &p1, &[alice], &config).unwrap();
        let p2 = processed_file(&config, 2);
        route_photo(&store, &cloud, 2, &p2, &[alice, jane], &config).unwrap();
        let p3 = processed_file(&config, 3);
        route_photo(&store, &cloud, 3, &p3, &[], &config).unwrap();
        // Thumbnails are not counted as processed photos
        std::fs::write(config.processed_dir().join("000001_thumb.jpg"), b"t").unwrap();

        let summary = routing_summary(&config);
        assert_eq!(summary.processed_count, 2); // photo 3 moved to NoFaces
        assert_eq!(summary.no_faces_count, 1);
        assert_eq!(summary.errors_count, 0);
        assert_eq!(
            summary.persons.get("Person_001"),
            Some(&PersonFolderCounts { solo: 1, group: 1, enrolled: false })
        );
        assert_eq!(
            summary.persons.get("Jane_Doe"),
            Some(&PersonFolderCounts { solo: 0, group: 1, enrolled: true })
        );
    }
}
