use crate::db;
use crate::ipc::helpers::{
    bad_params, get_optional_str, get_required_str, not_found, query_failed, require_actor,
    row_exists, with_conn, write_failed, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};
use crate::roster::{self, Filiere, RosterRow};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub filiere: String,
    pub student_no: String,
    pub email: String,
}

impl StudentRecord {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "userId": self.user_id,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "filiere": self.filiere,
            "filiereLabel": Filiere::label_for_key(&self.filiere),
            "studentNo": self.student_no,
            "email": self.email,
        })
    }
}

const STUDENT_COLUMNS: &str = "id, user_id, first_name, last_name, filiere, student_no, email";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        id: r.get(0)?,
        user_id: r.get(1)?,
        first_name: r.get(2)?,
        last_name: r.get(3)?,
        filiere: r.get(4)?,
        student_no: r.get(5)?,
        email: r.get(6)?,
    })
}

/// Full roster, ordered by last name then first name.
pub fn list_all_students(conn: &Connection) -> Result<Vec<StudentRecord>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {STUDENT_COLUMNS} FROM students ORDER BY last_name, first_name"
        ))
        .map_err(query_failed)?;
    stmt.query_map([], student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)
}

pub fn get_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRecord>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?"),
        [student_id],
        student_from_row,
    )
    .optional()
    .map_err(query_failed)
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_actor(conn, params, &[Role::Delegate])?;
    let students = list_all_students(conn)?;
    Ok(json!({
        "students": students.iter().map(StudentRecord::to_json).collect::<Vec<_>>()
    }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_actor(conn, params, &[Role::Delegate])?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let filiere_raw = get_required_str(params, "filiere")?;
    let student_no = get_required_str(params, "studentNo")?;
    let email = get_optional_str(params, "email").unwrap_or_default();
    let filiere = Filiere::parse(&filiere_raw).ok_or_else(|| {
        bad_params(format!("unknown field of study '{}'", filiere_raw)).with_details(json!({
            "known": Filiere::ALL.iter().map(|f| f.key()).collect::<Vec<_>>()
        }))
    })?;

    let student_id = db::new_id();
    conn.execute(
        "INSERT INTO students(id, first_name, last_name, filiere, student_no, email, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &first_name,
            &last_name,
            filiere.key(),
            &student_no,
            &email,
            db::now_timestamp(),
        ),
    )
    .map_err(write_failed("db_insert_failed", "students"))?;

    Ok(json!({ "studentId": student_id }))
}

fn students_link_user(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_actor(conn, params, &[Role::Delegate])?;
    let student_id = get_required_str(params, "studentId")?;
    let user_id = get_required_str(params, "userId")?;
    if !row_exists(conn, "SELECT 1 FROM users WHERE id = ?", &user_id)? {
        return Err(not_found("user"));
    }
    let changed = conn
        .execute(
            "UPDATE students SET user_id = ?, updated_at = ? WHERE id = ?",
            (&user_id, db::now_timestamp(), &student_id),
        )
        .map_err(write_failed("db_update_failed", "students"))?;
    if changed == 0 {
        return Err(not_found("student"));
    }
    Ok(json!({ "studentId": student_id, "userId": user_id }))
}

enum Reconciled {
    Inserted,
    Updated,
}

// Student number is the identity key: a known number is refreshed in place.
fn reconcile_row(tx: &rusqlite::Transaction<'_>, row: &RosterRow) -> Result<Reconciled, HandlerErr> {
    let now = db::now_timestamp();
    let updated = tx
        .execute(
            "UPDATE students
             SET first_name = ?, last_name = ?, filiere = ?, email = ?, updated_at = ?
             WHERE student_no = ?",
            (
                &row.first_name,
                &row.last_name,
                row.filiere.key(),
                &row.email,
                &now,
                &row.student_no,
            ),
        )
        .map_err(write_failed("db_update_failed", "students"))?;
    if updated > 0 {
        return Ok(Reconciled::Updated);
    }
    tx.execute(
        "INSERT INTO students(id, first_name, last_name, filiere, student_no, email, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            db::new_id(),
            &row.first_name,
            &row.last_name,
            row.filiere.key(),
            &row.student_no,
            &row.email,
            &now,
        ),
    )
    .map_err(write_failed("db_insert_failed", "students"))?;
    Ok(Reconciled::Inserted)
}

fn students_import(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_actor(conn, params, &[Role::Delegate])?;
    let path = PathBuf::from(get_required_str(params, "path")?);
    let sheet = roster::read_roster_file(&path).map_err(|e| {
        HandlerErr::new("import_failed", e.to_string())
            .with_details(json!({ "path": path.to_string_lossy() }))
    })?;
    let max_reported = db::settings_get_i64(
        conn,
        "import.maxReportedErrors",
        db::DEFAULT_MAX_REPORTED_ERRORS,
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
    .max(0) as usize;

    let mut imported = 0usize;
    let mut updated = 0usize;
    let mut errors: Vec<String> = sheet.errors.iter().map(|e| e.to_string()).collect();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for row in &sheet.rows {
        match reconcile_row(&tx, row) {
            Ok(Reconciled::Inserted) => imported += 1,
            Ok(Reconciled::Updated) => updated += 1,
            Err(e) => errors.push(format!("Row {}: error - {}", row.row, e.message)),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Parse errors and write errors interleave; report them in sheet order.
    errors.sort_by_key(|m| row_number_of(m));
    let error_count = errors.len();
    let reported: Vec<String> = errors.into_iter().take(max_reported).collect();

    tracing::info!(
        path = %path.display(),
        imported,
        updated,
        errors = error_count,
        "roster import finished"
    );
    Ok(json!({
        "imported": imported,
        "updated": updated,
        "errorCount": error_count,
        "errors": reported,
        "moreErrors": error_count.saturating_sub(max_reported),
    }))
}

fn row_number_of(message: &str) -> usize {
    message
        .strip_prefix("Row ")
        .and_then(|rest| rest.split(':').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.linkUser" => Some(with_conn(state, req, students_link_user)),
        "students.import" => Some(with_conn(state, req, students_import)),
        _ => None,
    }
}
