//! Enrollment rows: a named identity bound to a person cluster.

use rusqlite::{params, Connection, Row};

use super::now_str;

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub id: i64,
    pub person_id: i64,
    pub user_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub selfie_path: String,
    pub match_confidence: f32,
    pub consent_given: bool,
    pub created_at: String,
}

fn row_to_enrollment(row: &Row<'_>) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: row.get("id")?,
        person_id: row.get("person_id")?,
        user_name: row.get("user_name")?,
        phone: row.get("phone")?,
        email: row.get("email")?,
        selfie_path: row.get("selfie_path")?,
        match_confidence: row.get("match_confidence")?,
        consent_given: row.get::<_, i64>("consent_given")? != 0,
        created_at: row.get("created_at")?,
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn insert(
    conn: &Connection,
    person_id: i64,
    user_name: &str,
    phone: Option<&str>,
    email: Option<&str>,
    selfie_path: &str,
    match_confidence: f32,
    consent_given: bool,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO enrollments
         (person_id, user_name, phone, email, selfie_path, match_confidence, consent_given, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            person_id,
            user_name,
            phone,
            email,
            selfie_path,
            match_confidence,
            consent_given as i64,
            now_str()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn of_person(conn: &Connection, person_id: i64) -> rusqlite::Result<Option<Enrollment>> {
    let mut stmt = conn.prepare("SELECT * FROM enrollments WHERE person_id = ?")?;
    let mut rows = stmt.query_map([person_id], row_to_enrollment)?;
    rows.next().transpose()
}

pub(crate) fn exists(conn: &Connection, person_id: i64) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM enrollments WHERE person_id = ?")?;
    stmt.exists([person_id])
}

pub(crate) fn all(conn: &Connection) -> rusqlite::Result<Vec<Enrollment>> {
    let mut stmt = conn.prepare("SELECT * FROM enrollments ORDER BY created_at DESC, id DESC")?;
    let enrollments = stmt
        .query_map([], row_to_enrollment)?
        .collect::<Result<_, _>>()?;
    Ok(enrollments)
}

pub(crate) fn count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM enrollments", [], |row| row.get(0))
}
