use crate::db;
use crate::ipc::helpers::{get_required_str, query_failed, with_conn, write_failed, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?;
    let teacher = get_required_str(params, "teacher")?;
    let teacher_email = get_required_str(params, "teacherEmail")?;

    let subject_id = db::new_id();
    conn.execute(
        "INSERT INTO subjects(id, name, code, teacher, teacher_email) VALUES(?, ?, ?, ?, ?)",
        (&subject_id, &name, &code, &teacher, &teacher_email),
    )
    .map_err(write_failed("db_insert_failed", "subjects"))?;

    Ok(json!({ "subjectId": subject_id, "code": code, "name": name }))
}

fn subjects_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, code, teacher, teacher_email FROM subjects ORDER BY code")
        .map_err(query_failed)?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "teacher": r.get::<_, String>(3)?,
                "teacherEmail": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        _ => None,
    }
}
