use crate::ipc::helpers::{get_required_str, not_found, query_failed, require_actor, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request, Role};
use crate::reports::{attendance_sheet, AttendanceLine, SessionInfo};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn load_session_info(conn: &Connection, session_id: &str) -> Result<Option<SessionInfo>, HandlerErr> {
    conn.query_row(
        "SELECT s.name, s.code, s.teacher, a.date, a.start_time, a.end_time,
                u.first_name, u.last_name, a.notes
         FROM attendance_sessions a
         JOIN subjects s ON s.id = a.subject_id
         JOIN users u ON u.id = a.created_by
         WHERE a.id = ?",
        [session_id],
        |r| {
            let first: String = r.get(6)?;
            let last: String = r.get(7)?;
            Ok(SessionInfo {
                subject_name: r.get(0)?,
                subject_code: r.get(1)?,
                teacher: r.get(2)?,
                date: r.get(3)?,
                start_time: r.get(4)?,
                end_time: r.get(5)?,
                delegate_name: format!("{} {}", first, last).trim().to_string(),
                notes: r.get(8)?,
            })
        },
    )
    .optional()
    .map_err(query_failed)
}

fn load_attendance_lines(conn: &Connection, session_id: &str) -> Result<Vec<AttendanceLine>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT st.last_name, st.first_name, st.filiere, x.is_present
             FROM attendance x
             JOIN students st ON st.id = x.student_id
             WHERE x.session_id = ?
             ORDER BY st.last_name, st.first_name",
        )
        .map_err(query_failed)?;
    stmt.query_map([session_id], |r| {
        Ok(AttendanceLine {
            last_name: r.get(0)?,
            first_name: r.get(1)?,
            filiere: r.get(2)?,
            present: r.get::<_, i64>(3)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

fn reports_attendance_sheet(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_actor(conn, params, &[Role::Delegate, Role::Director])?;
    let session_id = get_required_str(params, "sessionId")?;
    let info = load_session_info(conn, &session_id)?.ok_or_else(|| not_found("session"))?;
    let lines = load_attendance_lines(conn, &session_id)?;
    let sheet = attendance_sheet(&info, &lines);
    serde_json::to_value(&sheet)
        .map(|model| json!({ "sessionId": session_id, "sheet": model }))
        .map_err(|e| HandlerErr::new("report_failed", e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.attendanceSheet" => Some(with_conn(state, req, reports_attendance_sheet)),
        _ => None,
    }
}
