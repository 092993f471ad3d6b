//! Face rows: one detection inside one photo.

use rusqlite::{params, Connection, Row};

/// Face location in processed-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone)]
pub struct Face {
    pub id: i64,
    pub photo_id: i64,
    pub person_id: Option<i64>,
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// Serialize an embedding as little-endian f32 bytes for BLOB storage.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn row_to_face(row: &Row<'_>) -> rusqlite::Result<Face> {
    let blob: Vec<u8> = row.get("embedding")?;
    Ok(Face {
        id: row.get("id")?,
        photo_id: row.get("photo_id")?,
        person_id: row.get("person_id")?,
        bbox: BoundingBox {
            x: row.get("bbox_x")?,
            y: row.get("bbox_y")?,
            width: row.get("bbox_w")?,
            height: row.get("bbox_h")?,
        },
        embedding: bytes_to_embedding(&blob),
        confidence: row.get("confidence")?,
    })
}

pub(crate) fn insert(
    conn: &Connection,
    photo_id: i64,
    bbox: &BoundingBox,
    embedding: &[f32],
    confidence: f32,
    person_id: Option<i64>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO faces (photo_id, person_id, bbox_x, bbox_y, bbox_w, bbox_h, embedding, confidence)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            photo_id,
            person_id,
            bbox.x,
            bbox.y,
            bbox.width,
            bbox.height,
            embedding_to_bytes(embedding),
            confidence
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn assign(conn: &Connection, face_id: i64, person_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE faces SET person_id = ? WHERE id = ?",
        params![person_id, face_id],
    )?;
    Ok(())
}

pub(crate) fn of_photo(conn: &Connection, photo_id: i64) -> rusqlite::Result<Vec<Face>> {
    let mut stmt = conn.prepare("SELECT * FROM faces WHERE photo_id = ? ORDER BY id")?;
    let faces = stmt.query_map([photo_id], row_to_face)?.collect::<Result<_, _>>()?;
    Ok(faces)
}

pub(crate) fn of_person(conn: &Connection, person_id: i64) -> rusqlite::Result<Vec<Face>> {
    let mut stmt = conn.prepare("SELECT * FROM faces WHERE person_id = ? ORDER BY id")?;
    let faces = stmt.query_map([person_id], row_to_face)?.collect::<Result<_, _>>()?;
    Ok(faces)
}

pub(crate) fn distinct_persons(conn: &Connection, photo_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT person_id FROM faces
         WHERE photo_id = ? AND person_id IS NOT NULL
         ORDER BY person_id",
    )?;
    let ids = stmt
        .query_map([photo_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(ids)
}

pub(crate) fn delete_of_photo(conn: &Connection, photo_id: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])
}

pub(crate) fn reassign(conn: &Connection, from_person: i64, to_person: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE faces SET person_id = ? WHERE person_id = ?",
        params![to_person, from_person],
    )
}

pub(crate) fn count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))
}
