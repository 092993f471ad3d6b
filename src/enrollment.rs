//! Selfie enrollment: bind a name and contact details to an existing
//! person cluster.
//!
//! The selfie's best face is matched against the person centroids with the
//! same distance function the clusterer uses. On a confident match the
//! person's folder is renamed to the user's name: local filesystem first,
//! then the store, then the queued upload paths; the remote rename is
//! best-effort. The selfie itself is kept in the folder as a reference
//! image whose `00_` prefix sorts it first.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::analyzer::FaceAnalyzer;
use crate::cloud::CloudManager;
use crate::cluster::{cosine_distance, normalize};
use crate::config::Config;
use crate::db::{Enrollment, Store};
use crate::processor;

pub const REFERENCE_SELFIE_NAME: &str = "00_REFERENCE_SELFIE.jpg";
const REFERENCE_SELFIE_MAX_SIZE: u32 = 800;

/// Why an enrollment attempt was refused.
#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error("no face detected in the selfie")]
    NoFace,
    #[error("no confident match for this face (best confidence {best_confidence:.3})")]
    NoMatch { best_confidence: f32 },
    #[error("this person is already enrolled as {user_name}")]
    AlreadyEnrolled { user_name: String },
    #[error("selfie file not found: {0:?}")]
    SelfieMissing(PathBuf),
    #[error("a user name is required")]
    EmptyName,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub selfie_path: PathBuf,
    pub user_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub consent_given: bool,
}

/// A successful enrollment.
#[derive(Debug, Clone)]
pub struct Enrolled {
    pub enrollment_id: i64,
    pub person_id: i64,
    pub person_name: String,
    pub match_confidence: f32,
    pub solo_dir: PathBuf,
    pub group_dir: PathBuf,
}

/// Folder-safe form of a user name: drop everything but alphanumerics,
/// underscores, hyphens and spaces, then join words with underscores.
pub fn sanitize_folder_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join("_");
    let capped: String = joined.chars().take(50).collect();
    if capped.is_empty() {
        "Unknown".to_string()
    } else {
        capped
    }
}

/// Make the folder name unique under `People/` by suffixing the person id.
fn unique_folder_name(base: &str, person_id: i64, config: &Config) -> String {
    if config.people_dir().join(base).exists() {
        format!("{base}_{person_id}")
    } else {
        base.to_string()
    }
}

/// Rename a person's folder tree to the user's name and propagate: local
/// filesystem first (checked), then the store, then the pending upload
/// paths. The remote rename never fails the operation.
fn rename_person_folder(
    store: &Store,
    cloud: &Arc<CloudManager>,
    person_id: i64,
    user_name: &str,
    config: &Config,
) -> Result<(String, PathBuf, PathBuf)> {
    let person = store
        .person_by_id(person_id)?
        .with_context(|| format!("person {person_id} not found"))?;
    let old_name = person.name;
    let old_path = config.people_dir().join(&old_name);

    let new_name = unique_folder_name(&sanitize_folder_name(user_name), person_id, config);
    let new_path = config.people_dir().join(&new_name);

    if old_path.exists() {
        std::fs::rename(&old_path, &new_path)
            .with_context(|| format!("failed to rename {old_path:?} -> {new_path:?}"))?;
        info!(old = %old_name, new = %new_name, "renamed person folder");
    } else {
        std::fs::create_dir_all(new_path.join("Solo"))?;
        std::fs::create_dir_all(new_path.join("Group"))?;
        info!(name = %new_name, "created person folder");
    }

    store.rename_person(person_id, &new_name)?;

    // Remote rename is best-effort; a miss means the tree was never
    // mirrored, so create it fresh under the new name instead.
    if cloud.is_enabled() {
        match cloud.rename_folder(&old_name, &new_name, &["People"]) {
            Ok(true) => info!(old = %old_name, new = %new_name, "renamed remote folder"),
            Ok(false) => {
                info!(name = %new_name, "remote folder absent, creating under new name");
                for leaf in ["Solo", "Group"] {
                    if let Err(e) = cloud.ensure_folder_path(&["People", &new_name, leaf]) {
                        warn!(error = %e, "remote folder create failed");
                        break;
                    }
                }
            }
            Err(e) => warn!(old = %old_name, new = %new_name, error = %e, "remote rename failed"),
        }
    }

    // Pending and failed uploads must target the renamed tree
    store.rewrite_upload_paths(&old_name, &new_name)?;

    Ok((new_name, new_path.join("Solo"), new_path.join("Group")))
}

/// Store the selfie as the folder's reference image, downscaled and upright.
fn save_reference_selfie(selfie_path: &Path, person_folder: &Path) -> Option<PathBuf> {
    let result = (|| -> Result<PathBuf> {
        let dest = person_folder.join(REFERENCE_SELFIE_NAME);
        let img = processor::load_upright(selfie_path)?;
        let img = if img.width().max(img.height()) > REFERENCE_SELFIE_MAX_SIZE {
            img.resize(
                REFERENCE_SELFIE_MAX_SIZE,
                REFERENCE_SELFIE_MAX_SIZE,
                image::imageops::FilterType::Lanczos3,
            )
        } else {
            img
        };
        std::fs::create_dir_all(person_folder)?;
        let file = std::fs::File::create(&dest)?;
        let mut writer = std::io::BufWriter::new(file);
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, 95);
        img.to_rgb8().write_with_encoder(encoder)?;
        Ok(dest)
    })();

    match result {
        Ok(dest) => {
            info!(?dest, "saved reference selfie");
            Some(dest)
        }
        Err(e) => {
            warn!(error = %e, "failed to save reference selfie");
            None
        }
    }
}

/// Full enrollment flow. See module docs for the ordering guarantees.
pub fn enroll_user(
    store: &Store,
    analyzer: &mut dyn FaceAnalyzer,
    cloud: &Arc<CloudManager>,
    config: &Config,
    request: &EnrollRequest,
) -> Result<Enrolled, EnrollError> {
    if !request.selfie_path.exists() {
        return Err(EnrollError::SelfieMissing(request.selfie_path.clone()));
    }
    if request.user_name.trim().is_empty() {
        return Err(EnrollError::EmptyName);
    }

    info!(user = %request.user_name, "processing enrollment selfie");
    let selfie = processor::load_upright(&request.selfie_path)
        .context("could not decode selfie")?;
    let faces = analyzer
        .detect_and_embed(&selfie)
        .context("face detection failed on selfie")?;

    if faces.is_empty() {
        return Err(EnrollError::NoFace);
    }
    if faces.len() > 1 {
        warn!(count = faces.len(), "multiple faces in selfie, using the most confident");
    }
    let Some(best_face) = faces
        .iter()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return Err(EnrollError::NoFace);
    };
    let embedding = normalize(&best_face.embedding);

    let persons = store.all_persons().map_err(EnrollError::Internal)?;
    if persons.is_empty() {
        return Err(EnrollError::NoMatch { best_confidence: 0.0 });
    }

    let Some((nearest, distance)) = persons
        .iter()
        .map(|p| (p, cosine_distance(&embedding, &p.centroid)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return Err(EnrollError::NoMatch { best_confidence: 0.0 });
    };

    if distance >= config.processing.cluster_threshold {
        return Err(EnrollError::NoMatch { best_confidence: 1.0 - distance });
    }

    if store.is_enrolled(nearest.id).map_err(EnrollError::Internal)? {
        let existing = store
            .enrollment_of_person(nearest.id)
            .map_err(EnrollError::Internal)?
            .map(|e| e.user_name)
            .unwrap_or_default();
        return Err(EnrollError::AlreadyEnrolled { user_name: existing });
    }

    let match_confidence = 1.0 - distance;
    info!(person = %nearest.name, confidence = match_confidence, "matched person cluster");

    let (folder_name, solo_dir, group_dir) =
        rename_person_folder(store, cloud, nearest.id, &request.user_name, config)?;

    let person_folder = config.people_dir().join(&folder_name);
    let saved_selfie = save_reference_selfie(&request.selfie_path, &person_folder);
    let recorded_selfie = saved_selfie.unwrap_or_else(|| request.selfie_path.clone());

    let enrollment_id = store
        .create_enrollment(
            nearest.id,
            &request.user_name,
            request.phone.as_deref(),
            request.email.as_deref(),
            &recorded_selfie.to_string_lossy(),
            match_confidence,
            request.consent_given,
        )
        .map_err(EnrollError::Internal)?;

    info!(enrollment_id, person = %folder_name, "enrollment complete");

    Ok(Enrolled {
        enrollment_id,
        person_id: nearest.id,
        person_name: folder_name,
        match_confidence,
        solo_dir,
        group_dir,
    })
}

/// Summary of who is and is not enrolled yet.
#[derive(Debug, Clone)]
pub struct EnrollmentStatus {
    pub total_persons: usize,
    pub total_enrolled: usize,
    pub pending_enrollment: usize,
    pub enrollments: Vec<Enrollment>,
}

pub fn enrollment_status(store: &Store) -> Result<EnrollmentStatus> {
    let persons = store.all_persons()?;
    let enrollments = store.all_enrollments()?;
    let enrolled: std::collections::HashSet<i64> =
        enrollments.iter().map(|e| e.person_id).collect();
    let pending = persons.iter().filter(|p| !enrolled.contains(&p.id)).count();
    Ok(EnrollmentStatus {
        total_persons: persons.len(),
        total_enrolled: enrollments.len(),
        pending_enrollment: pending,
        enrollments,
    })
}
