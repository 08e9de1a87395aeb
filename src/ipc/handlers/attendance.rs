use crate::db;
use crate::ipc::helpers::{
    bad_params, get_optional_str, get_required_str, get_str_list, not_found, query_failed,
    require_actor, row_exists, with_conn, write_failed, HandlerErr,
};
use crate::ipc::types::{Actor, AppState, Request, Role};
use crate::roster::Filiere;
use chrono::{NaiveDate, NaiveTime};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

fn parse_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| bad_params("date must be YYYY-MM-DD"))
}

fn parse_time(key: &str, raw: &str) -> Result<NaiveTime, HandlerErr> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| bad_params(format!("{} must be HH:MM", key)))
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub subject_code: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub created_by: String,
    pub notes: String,
    pub present: i64,
    pub total: i64,
    pub comment_count: i64,
}

impl SessionRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "subject": {
                "id": self.subject_id,
                "name": self.subject_name,
                "code": self.subject_code,
            },
            "date": self.date,
            "startTime": self.start_time,
            "endTime": self.end_time,
            "createdBy": self.created_by,
            "notes": self.notes,
            "presentCount": self.present,
            "studentCount": self.total,
            "commentCount": self.comment_count,
        })
    }
}

/// Sessions matching the `AND`-joined clauses, newest first.
pub fn load_sessions(
    conn: &Connection,
    clauses: &[&str],
    args: Vec<Value>,
    limit: Option<usize>,
) -> Result<Vec<SessionRow>, HandlerErr> {
    let mut sql = String::from(
        "SELECT
           a.id, s.id, s.name, s.code, a.date, a.start_time, a.end_time, a.created_by, a.notes,
           (SELECT COUNT(*) FROM attendance x WHERE x.session_id = a.id AND x.is_present = 1),
           (SELECT COUNT(*) FROM attendance x WHERE x.session_id = a.id),
           (SELECT COUNT(*) FROM director_comments c WHERE c.session_id = a.id)
         FROM attendance_sessions a
         JOIN subjects s ON s.id = a.subject_id",
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY a.date DESC, a.start_time DESC");
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }

    let mut stmt = conn.prepare(&sql).map_err(query_failed)?;
    stmt.query_map(params_from_iter(args), |r| {
        Ok(SessionRow {
            id: r.get(0)?,
            subject_id: r.get(1)?,
            subject_name: r.get(2)?,
            subject_code: r.get(3)?,
            date: r.get(4)?,
            start_time: r.get(5)?,
            end_time: r.get(6)?,
            created_by: r.get(7)?,
            notes: r.get(8)?,
            present: r.get(9)?,
            total: r.get(10)?,
            comment_count: r.get(11)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

fn owned_session(conn: &Connection, actor: &Actor, session_id: &str) -> Result<SessionRow, HandlerErr> {
    load_sessions(
        conn,
        &["a.id = ?", "a.created_by = ?"],
        vec![
            Value::Text(session_id.to_string()),
            Value::Text(actor.id.clone()),
        ],
        Some(1),
    )?
    .into_iter()
    .next()
    .ok_or_else(|| not_found("session"))
}

fn attendance_rows(conn: &Connection, session_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT x.id, st.id, st.last_name, st.first_name, st.filiere, x.is_present, x.notes
             FROM attendance x
             JOIN students st ON st.id = x.student_id
             WHERE x.session_id = ?
             ORDER BY st.last_name, st.first_name",
        )
        .map_err(query_failed)?;
    stmt.query_map([session_id], |r| {
        let filiere: String = r.get(4)?;
        Ok(json!({
            "attendanceId": r.get::<_, String>(0)?,
            "studentId": r.get::<_, String>(1)?,
            "lastName": r.get::<_, String>(2)?,
            "firstName": r.get::<_, String>(3)?,
            "filiereLabel": Filiere::label_for_key(&filiere),
            "filiere": filiere,
            "isPresent": r.get::<_, i64>(5)? != 0,
            "notes": r.get::<_, String>(6)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

fn sessions_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Delegate])?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let start = parse_time("startTime", &get_required_str(params, "startTime")?)?;
    let end = parse_time("endTime", &get_required_str(params, "endTime")?)?;
    let notes = get_optional_str(params, "notes").unwrap_or_default();
    if end <= start {
        return Err(bad_params("endTime must be after startTime"));
    }
    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(not_found("subject"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let session_id = db::new_id();
    tx.execute(
        "INSERT INTO attendance_sessions(id, subject_id, date, start_time, end_time, created_by, created_at, notes)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            &subject_id,
            date.format("%Y-%m-%d").to_string(),
            start.format("%H:%M").to_string(),
            end.format("%H:%M").to_string(),
            &actor.id,
            db::now_timestamp(),
            &notes,
        ),
    )
    .map_err(write_failed("db_insert_failed", "attendance_sessions"))?;

    // Everyone on the roster starts out absent.
    let student_ids: Vec<String> = {
        let mut stmt = tx.prepare("SELECT id FROM students").map_err(query_failed)?;
        let ids = stmt
            .query_map([], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_failed)?;
        ids
    };
    for student_id in &student_ids {
        tx.execute(
            "INSERT INTO attendance(id, session_id, student_id, is_present) VALUES(?, ?, ?, 0)",
            (db::new_id(), &session_id, student_id),
        )
        .map_err(write_failed("db_insert_failed", "attendance"))?;
    }
    let roster_size = student_ids.len();
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::info!(session_id = %session_id, students = roster_size, "attendance session created");
    Ok(json!({ "sessionId": session_id, "studentCount": roster_size }))
}

fn sessions_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Delegate])?;
    let sessions = load_sessions(
        conn,
        &["a.created_by = ?"],
        vec![Value::Text(actor.id.clone())],
        None,
    )?;
    Ok(json!({
        "sessions": sessions.iter().map(SessionRow::to_json).collect::<Vec<_>>()
    }))
}

fn sessions_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Delegate])?;
    let session_id = get_required_str(params, "sessionId")?;
    let session = owned_session(conn, &actor, &session_id)?;
    let rows = attendance_rows(conn, &session.id)?;
    Ok(json!({ "session": session.to_json(), "attendances": rows }))
}

fn sessions_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Delegate])?;
    let session_id = get_required_str(params, "sessionId")?;
    let present: HashSet<String> = get_str_list(params, "presentStudentIds")?
        .into_iter()
        .collect();
    let session = owned_session(conn, &actor, &session_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let student_ids: Vec<String> = {
        let mut stmt = tx
            .prepare("SELECT student_id FROM attendance WHERE session_id = ?")
            .map_err(query_failed)?;
        let ids = stmt
            .query_map([&session.id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_failed)?;
        ids
    };
    let mut present_count = 0usize;
    for student_id in &student_ids {
        let is_present = present.contains(student_id);
        present_count += usize::from(is_present);
        tx.execute(
            "UPDATE attendance SET is_present = ? WHERE session_id = ? AND student_id = ?",
            (is_present as i64, &session.id, student_id),
        )
        .map_err(write_failed("db_update_failed", "attendance"))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let unknown: Vec<&String> = present
        .iter()
        .filter(|id| !student_ids.contains(*id))
        .collect();
    if !unknown.is_empty() {
        tracing::warn!(session_id = %session.id, unknown = unknown.len(), "ignored students not on the session");
    }
    Ok(json!({
        "sessionId": session.id,
        "present": present_count,
        "absent": student_ids.len() - present_count,
        "ignoredStudentIds": unknown,
    }))
}

fn director_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_actor(conn, params, &[Role::Director])?;
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    let subject_filter = get_optional_str(params, "subjectId");
    let date_filter = get_optional_str(params, "date");
    if let Some(subject_id) = &subject_filter {
        clauses.push("a.subject_id = ?");
        args.push(Value::Text(subject_id.clone()));
    }
    if let Some(date) = &date_filter {
        let d = parse_date(date)?;
        clauses.push("a.date = ?");
        args.push(Value::Text(d.format("%Y-%m-%d").to_string()));
    }
    let sessions = load_sessions(conn, &clauses, args, None)?;

    let mut stmt = conn
        .prepare("SELECT id, name, code FROM subjects ORDER BY code")
        .map_err(query_failed)?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({
        "sessions": sessions.iter().map(SessionRow::to_json).collect::<Vec<_>>(),
        "subjects": subjects,
        "filters": { "subjectId": subject_filter, "date": date_filter },
    }))
}

fn director_comment(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Director])?;
    let session_id = get_required_str(params, "sessionId")?;
    let comment = get_required_str(params, "comment")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attendance_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if exists.is_none() {
        return Err(not_found("session"));
    }

    let comment_id = db::new_id();
    conn.execute(
        "INSERT INTO director_comments(id, session_id, comment, created_by, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&comment_id, &session_id, &comment, &actor.id, db::now_timestamp()),
    )
    .map_err(write_failed("db_insert_failed", "director_comments"))?;
    Ok(json!({ "commentId": comment_id, "sessionId": session_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.sessions.create" => Some(with_conn(state, req, sessions_create)),
        "attendance.sessions.list" => Some(with_conn(state, req, sessions_list)),
        "attendance.sessions.open" => Some(with_conn(state, req, sessions_open)),
        "attendance.sessions.mark" => Some(with_conn(state, req, sessions_mark)),
        "attendance.director.list" => Some(with_conn(state, req, director_list)),
        "attendance.director.comment" => Some(with_conn(state, req, director_comment)),
        _ => None,
    }
}
