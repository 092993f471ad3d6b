//! Photo rows and their status transitions.

use rusqlite::{params, Connection, Row};

use super::now_str;

/// One ingested source file.
#[derive(Debug, Clone)]
pub struct Photo {
    pub id: i64,
    pub file_hash: String,
    pub original_path: String,
    pub processed_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub status: PhotoStatus,
    pub face_count: Option<i64>,
    pub created_at: String,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoStatus {
    Pending,
    Processing,
    Completed,
    Error,
    NoFaces,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoStatus::Pending => "pending",
            PhotoStatus::Processing => "processing",
            PhotoStatus::Completed => "completed",
            PhotoStatus::Error => "error",
            PhotoStatus::NoFaces => "no_faces",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PhotoStatus::Pending),
            "processing" => Some(PhotoStatus::Processing),
            "completed" => Some(PhotoStatus::Completed),
            "error" => Some(PhotoStatus::Error),
            "no_faces" => Some(PhotoStatus::NoFaces),
            _ => None,
        }
    }
}

fn row_to_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
    let status: String = row.get("status")?;
    Ok(Photo {
        id: row.get("id")?,
        file_hash: row.get("file_hash")?,
        original_path: row.get("original_path")?,
        processed_path: row.get("processed_path")?,
        thumbnail_path: row.get("thumbnail_path")?,
        status: PhotoStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown photo status {status:?}").into(),
            )
        })?,
        face_count: row.get("face_count")?,
        created_at: row.get("created_at")?,
        processed_at: row.get("processed_at")?,
    })
}

pub(crate) fn exists(conn: &Connection, file_hash: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM photos WHERE file_hash = ?")?;
    stmt.exists([file_hash])
}

pub(crate) fn insert(conn: &Connection, file_hash: &str, original_path: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO photos (file_hash, original_path, status, created_at)
         VALUES (?, ?, 'pending', ?)",
        params![file_hash, original_path, now_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn pending(conn: &Connection) -> rusqlite::Result<Vec<Photo>> {
    let mut stmt =
        conn.prepare("SELECT * FROM photos WHERE status = 'pending' ORDER BY created_at, id")?;
    let photos = stmt.query_map([], row_to_photo)?.collect::<Result<_, _>>()?;
    Ok(photos)
}

pub(crate) fn processing(conn: &Connection) -> rusqlite::Result<Vec<Photo>> {
    let mut stmt = conn.prepare("SELECT * FROM photos WHERE status = 'processing' ORDER BY id")?;
    let photos = stmt.query_map([], row_to_photo)?.collect::<Result<_, _>>()?;
    Ok(photos)
}

pub(crate) fn by_id(conn: &Connection, photo_id: i64) -> rusqlite::Result<Option<Photo>> {
    let mut stmt = conn.prepare("SELECT * FROM photos WHERE id = ?")?;
    let mut rows = stmt.query_map([photo_id], row_to_photo)?;
    rows.next().transpose()
}

pub(crate) fn by_hash(conn: &Connection, file_hash: &str) -> rusqlite::Result<Option<Photo>> {
    let mut stmt = conn.prepare("SELECT * FROM photos WHERE file_hash = ?")?;
    let mut rows = stmt.query_map([file_hash], row_to_photo)?;
    rows.next().transpose()
}

/// Status change with the transition time recorded in `processed_at`; the
/// stuck-processing sweep compares against that timestamp.
pub(crate) fn set_status(conn: &Connection, photo_id: i64, status: PhotoStatus) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE photos SET status = ?, processed_at = ? WHERE id = ?",
        params![status.as_str(), now_str(), photo_id],
    )?;
    Ok(())
}

pub(crate) fn set_completed(
    conn: &Connection,
    photo_id: i64,
    processed_path: &str,
    thumbnail_path: Option<&str>,
    face_count: i64,
    status: PhotoStatus,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE photos
         SET processed_path = ?, thumbnail_path = ?, face_count = ?, status = ?, processed_at = ?
         WHERE id = ?",
        params![
            processed_path,
            thumbnail_path,
            face_count,
            status.as_str(),
            now_str(),
            photo_id
        ],
    )?;
    Ok(())
}

pub(crate) fn reset_stuck(conn: &Connection, cutoff: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE photos SET status = 'pending'
         WHERE status = 'processing' AND (processed_at IS NULL OR processed_at <= ?)",
        [cutoff],
    )
}

pub(crate) fn count_by_status(
    conn: &Connection,
) -> rusqlite::Result<std::collections::HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM photos GROUP BY status")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<_, _>>()?;
    Ok(counts)
}
