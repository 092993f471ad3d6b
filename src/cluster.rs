//! Incremental centroid clustering for face embeddings.
//!
//! Every new face is matched against the existing person centroids by
//! cosine distance. Close enough means the face joins that person and the
//! centroid shifts by a running weighted mean; otherwise a new person is
//! created with the face's embedding as its centroid.

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::analyzer::DetectedFace;
use crate::db::{Person, Store, StoreTx};

/// Cosine distance in [0, 2]: 0 identical, 1 orthogonal, 2 antipodal.
/// Zero vectors are treated as maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let similarity = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    1.0 - similarity
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize(embedding: &[f32]) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return embedding.to_vec();
    }
    embedding.iter().map(|v| v / norm).collect()
}

/// Find the person whose centroid is nearest to `embedding`.
/// Ties resolve to the smallest person id (persons arrive id-ordered).
pub fn find_nearest<'a>(embedding: &[f32], persons: &'a [Person]) -> Option<(&'a Person, f32)> {
    let mut best: Option<(&Person, f32)> = None;
    for person in persons {
        let distance = cosine_distance(embedding, &person.centroid);
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((person, distance)),
        }
    }
    best
}

/// Running weighted mean of a centroid with one new member, renormalized.
pub fn update_centroid(old_centroid: &[f32], new_embedding: &[f32], old_count: i64) -> Vec<f32> {
    let n = old_count as f32;
    let blended: Vec<f32> = old_centroid
        .iter()
        .zip(new_embedding.iter())
        .map(|(c, e)| (c * n + e) / (n + 1.0))
        .collect();
    normalize(&blended)
}

fn person_name(number: i64) -> String {
    format!("Person_{number:03}")
}

fn assign_one(tx: &StoreTx<'_>, embedding: &[f32], threshold: f32) -> Result<i64> {
    let persons = tx.all_persons()?;
    match find_nearest(embedding, &persons) {
        Some((person, distance)) if distance < threshold => {
            debug!(person_id = person.id, distance, "matched existing person");
            let centroid = update_centroid(&person.centroid, embedding, person.face_count);
            tx.update_centroid(person.id, &centroid, person.face_count + 1)?;
            Ok(person.id)
        }
        _ => {
            let name = person_name(tx.next_person_number()?);
            let person_id = tx.create_person(&name, embedding)?;
            info!(person_id, name, "created new person cluster");
            Ok(person_id)
        }
    }
}

/// Persist a photo's faces and their person assignments in one transaction.
///
/// Either every face row lands with its person id and every touched centroid
/// is updated, or nothing is committed. Returns the assigned person id per
/// face, in input order.
pub fn assign_photo_faces(
    store: &Store,
    photo_id: i64,
    faces: &[DetectedFace],
    threshold: f32,
) -> Result<Vec<i64>> {
    store.with_tx(|tx| {
        let mut person_ids = Vec::with_capacity(faces.len());
        for face in faces {
            let embedding = normalize(&face.embedding);
            let person_id = assign_one(tx, &embedding, threshold)?;
            tx.create_face(photo_id, &face.bbox, &embedding, face.confidence, Some(person_id))?;
            person_ids.push(person_id);
        }
        Ok(person_ids)
    })
}

/// Merge `remove` into `keep`: reassign faces, blend centroids weighted by
/// face count, delete the vacated person. Atomic.
pub fn merge_persons(store: &Store, keep: i64, remove: i64) -> Result<()> {
    if keep == remove {
        bail!("cannot merge a person into itself");
    }
    store.with_tx(|tx| {
        let person_keep = tx
            .person_by_id(keep)?
            .ok_or_else(|| anyhow::anyhow!("person {keep} not found"))?;
        let person_remove = tx
            .person_by_id(remove)?
            .ok_or_else(|| anyhow::anyhow!("person {remove} not found"))?;

        let total = person_keep.face_count + person_remove.face_count;
        let blended: Vec<f32> = person_keep
            .centroid
            .iter()
            .zip(person_remove.centroid.iter())
            .map(|(a, b)| {
                (a * person_keep.face_count as f32 + b * person_remove.face_count as f32)
                    / total as f32
            })
            .collect();

        tx.update_centroid(keep, &normalize(&blended), total)?;
        tx.reassign_faces(remove, keep)?;
        tx.delete_person(remove)?;
        Ok(())
    })?;
    info!(keep, remove, "merged person clusters");
    Ok(())
}

/// Summary of the current cluster population.
#[derive(Debug, Clone, Default)]
pub struct ClusterStats {
    pub total_persons: usize,
    pub total_faces: i64,
    pub min_faces: i64,
    pub max_faces: i64,
    pub avg_faces: f64,
}

pub fn cluster_stats(store: &Store) -> Result<ClusterStats> {
    let persons = store.all_persons()?;
    if persons.is_empty() {
        return Ok(ClusterStats::default());
    }
    let counts: Vec<i64> = persons.iter().map(|p| p.face_count).collect();
    let total: i64 = counts.iter().sum();
    Ok(ClusterStats {
        total_persons: persons.len(),
        total_faces: total,
        min_faces: counts.iter().copied().min().unwrap_or(0),
        max_faces: counts.iter().copied().max().unwrap_or(0),
        avg_faces: total as f64 / persons.len() as f64,
    })
}
