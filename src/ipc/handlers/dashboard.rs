use crate::ipc::helpers::{linked_student_id, query_failed, require_actor, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::{types::Value, Connection};
use serde_json::json;

use super::attendance::{load_sessions, SessionRow};
use super::groups::load_groups;
use super::projects::projects_for_student;
use super::students::get_student;

const RECENT_SESSIONS: usize = 5;

fn count(conn: &Connection, sql: &str, args: &[&str]) -> Result<i64, HandlerErr> {
    conn.query_row(sql, rusqlite::params_from_iter(args), |r| r.get(0))
        .map_err(query_failed)
}

fn dashboard_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Student, Role::Delegate, Role::Director])?;
    let mut out = json!({
        "user": {
            "id": actor.id,
            "fullName": actor.full_name(),
            "role": actor.role.as_str(),
        }
    });

    match actor.role {
        Role::Delegate => {
            let recent = load_sessions(
                conn,
                &["a.created_by = ?"],
                vec![Value::Text(actor.id.clone())],
                Some(RECENT_SESSIONS),
            )?;
            out["studentsCount"] = json!(count(conn, "SELECT COUNT(*) FROM students", &[])?);
            out["subjectsCount"] = json!(count(conn, "SELECT COUNT(*) FROM subjects", &[])?);
            out["groupsCount"] = json!(count(
                conn,
                "SELECT COUNT(*) FROM work_groups WHERE created_by = ?",
                &[actor.id.as_str()],
            )?);
            out["recentSessions"] = json!(recent.iter().map(SessionRow::to_json).collect::<Vec<_>>());
        }
        Role::Director => {
            let recent = load_sessions(conn, &[], Vec::new(), Some(RECENT_SESSIONS))?;
            out["totalSessions"] =
                json!(count(conn, "SELECT COUNT(*) FROM attendance_sessions", &[])?);
            out["pendingComments"] = json!(count(
                conn,
                "SELECT COUNT(*) FROM attendance_sessions a
                 WHERE NOT EXISTS (SELECT 1 FROM director_comments c WHERE c.session_id = a.id)",
                &[],
            )?);
            out["recentSessions"] = json!(recent.iter().map(SessionRow::to_json).collect::<Vec<_>>());
        }
        Role::Student => match linked_student_id(conn, &actor)? {
            Some(student_id) => {
                let student = get_student(conn, &student_id)?;
                out["student"] = student
                    .map(|s| s.to_json())
                    .unwrap_or(serde_json::Value::Null);
                out["myGroups"] = json!(load_groups(
                    conn,
                    "g.id IN (SELECT work_group_id FROM work_group_members WHERE student_id = ?)",
                    &student_id,
                )?);
                out["myProjects"] = json!(projects_for_student(conn, &student_id)?);
            }
            None => {
                out["warning"] = json!("student profile is not configured yet");
            }
        },
    }
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.get" => Some(with_conn(state, req, dashboard_get)),
        _ => None,
    }
}
