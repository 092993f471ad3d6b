//! Person rows: identity clusters with a running centroid.

use rusqlite::{params, Connection, Row};

use super::faces::{bytes_to_embedding, embedding_to_bytes};
use super::now_str;

#[derive(Debug, Clone)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub centroid: Vec<f32>,
    pub face_count: i64,
    pub created_at: String,
}

fn row_to_person(row: &Row<'_>) -> rusqlite::Result<Person> {
    let blob: Vec<u8> = row.get("centroid")?;
    Ok(Person {
        id: row.get("id")?,
        name: row.get("name")?,
        centroid: bytes_to_embedding(&blob),
        face_count: row.get("face_count")?,
        created_at: row.get("created_at")?,
    })
}

pub(crate) fn insert(conn: &Connection, name: &str, centroid: &[f32]) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO persons (name, centroid, face_count, created_at) VALUES (?, ?, 1, ?)",
        params![name, embedding_to_bytes(centroid), now_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_centroid(
    conn: &Connection,
    person_id: i64,
    centroid: &[f32],
    face_count: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE persons SET centroid = ?, face_count = ? WHERE id = ?",
        params![embedding_to_bytes(centroid), face_count, person_id],
    )?;
    Ok(())
}

pub(crate) fn rename(conn: &Connection, person_id: i64, name: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE persons SET name = ? WHERE id = ?",
        params![name, person_id],
    )?;
    Ok(())
}

pub(crate) fn all(conn: &Connection) -> rusqlite::Result<Vec<Person>> {
    let mut stmt = conn.prepare("SELECT * FROM persons ORDER BY id")?;
    let persons = stmt.query_map([], row_to_person)?.collect::<Result<_, _>>()?;
    Ok(persons)
}

pub(crate) fn by_id(conn: &Connection, person_id: i64) -> rusqlite::Result<Option<Person>> {
    let mut stmt = conn.prepare("SELECT * FROM persons WHERE id = ?")?;
    let mut rows = stmt.query_map([person_id], row_to_person)?;
    rows.next().transpose()
}

/// Number used for the next auto-generated person name (`max(id) + 1`).
pub(crate) fn next_number(conn: &Connection) -> rusqlite::Result<i64> {
    let max: Option<i64> = conn.query_row("SELECT MAX(id) FROM persons", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0) + 1)
}

pub(crate) fn delete(conn: &Connection, person_id: i64) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM persons WHERE id = ?", [person_id])?;
    Ok(())
}

pub(crate) fn count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM persons", [], |row| row.get(0))
}
