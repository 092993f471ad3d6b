//! Upload queue rows: pending file copies into the remote mirror.

use rusqlite::{params, Connection, Row};
use std::collections::HashMap;

use super::now_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "uploading" => Some(UploadStatus::Uploading),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: i64,
    pub photo_id: i64,
    pub local_path: String,
    pub relative_to: String,
    pub status: UploadStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn row_to_upload(row: &Row<'_>) -> rusqlite::Result<UploadJob> {
    let status: String = row.get("status")?;
    Ok(UploadJob {
        id: row.get("id")?,
        photo_id: row.get("photo_id")?,
        local_path: row.get("local_path")?,
        relative_to: row.get("relative_to")?,
        status: UploadStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown upload status {status:?}").into(),
            )
        })?,
        retry_count: row.get("retry_count")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) fn insert(
    conn: &Connection,
    photo_id: i64,
    local_path: &str,
    relative_to: &str,
) -> rusqlite::Result<i64> {
    let now = now_str();
    conn.execute(
        "INSERT INTO upload_queue (photo_id, local_path, relative_to, status, created_at, updated_at)
         VALUES (?, ?, ?, 'pending', ?, ?)",
        params![photo_id, local_path, relative_to, now, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn pending(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<UploadJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM upload_queue WHERE status = 'pending' ORDER BY created_at, id LIMIT ?",
    )?;
    let jobs = stmt
        .query_map([limit as i64], row_to_upload)?
        .collect::<Result<_, _>>()?;
    Ok(jobs)
}

pub(crate) fn failed(conn: &Connection, max_retries: u32) -> rusqlite::Result<Vec<UploadJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM upload_queue
         WHERE status = 'failed' AND retry_count < ?
         ORDER BY updated_at, id",
    )?;
    let jobs = stmt
        .query_map([max_retries], row_to_upload)?
        .collect::<Result<_, _>>()?;
    Ok(jobs)
}

pub(crate) fn update(
    conn: &Connection,
    upload_id: i64,
    status: UploadStatus,
    error: Option<&str>,
    increment_retry: bool,
) -> rusqlite::Result<()> {
    if increment_retry {
        conn.execute(
            "UPDATE upload_queue
             SET status = ?, last_error = ?, retry_count = retry_count + 1, updated_at = ?
             WHERE id = ?",
            params![status.as_str(), error, now_str(), upload_id],
        )?;
    } else {
        conn.execute(
            "UPDATE upload_queue SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), error, now_str(), upload_id],
        )?;
    }
    Ok(())
}

pub(crate) fn freeze(
    conn: &Connection,
    upload_id: i64,
    max_retries: u32,
    error: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE upload_queue
         SET status = 'failed', last_error = ?, retry_count = ?, updated_at = ?
         WHERE id = ?",
        params![error, max_retries, now_str(), upload_id],
    )?;
    Ok(())
}

pub(crate) fn rewrite_paths(
    conn: &Connection,
    old_segment: &str,
    new_segment: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE upload_queue
         SET local_path = REPLACE(local_path, ?, ?), updated_at = ?
         WHERE status IN ('pending', 'failed') AND local_path LIKE ?",
        params![
            old_segment,
            new_segment,
            now_str(),
            format!("%{old_segment}%")
        ],
    )
}

pub(crate) fn reset_stuck(conn: &Connection, cutoff: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE upload_queue SET status = 'pending', updated_at = ?
         WHERE status = 'uploading' AND updated_at <= ?",
        params![now_str(), cutoff],
    )
}

pub(crate) fn stats(conn: &Connection) -> rusqlite::Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM upload_queue GROUP BY status")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<_, _>>()?;
    Ok(counts)
}

pub(crate) fn stats_unique_photos(conn: &Connection) -> rusqlite::Result<HashMap<String, i64>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(DISTINCT photo_id) FROM upload_queue GROUP BY status")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<_, _>>()?;
    Ok(counts)
}
