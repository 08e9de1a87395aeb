use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::types::{Actor, AppState, Request, Role};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("bad_params", message)
}

pub fn not_found(what: &str) -> HandlerErr {
    HandlerErr::new("not_found", format!("{} not found", what))
}

pub fn forbidden() -> HandlerErr {
    HandlerErr::new("forbidden", "not allowed for this user")
}

pub fn query_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

/// Maps a write failure, reporting unique-key collisions as `conflict`.
pub fn write_failed(code: &'static str, table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| {
        let is_constraint = matches!(
            &e,
            rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
        );
        let code = if is_constraint { "conflict" } else { code };
        HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
    }
}

pub fn internal(code: &'static str) -> impl Fn(anyhow::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, format!("{e:#}"))
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_optional_u64(params: &serde_json::Value, key: &str) -> Result<Option<u64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| bad_params(format!("{} must be a non-negative integer", key))),
    }
}

pub fn get_str_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Err(bad_params(format!("missing {}", key)));
    };
    let Some(items) = v.as_array() else {
        return Err(bad_params(format!("{} must be an array of strings", key)));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| bad_params(format!("{} must be an array of strings", key)))
        })
        .collect()
}

/// Loads `params.actorId` and checks its role against `allowed`.
pub fn require_actor(
    conn: &Connection,
    params: &serde_json::Value,
    allowed: &[Role],
) -> Result<Actor, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT role, first_name, last_name FROM users WHERE id = ?",
            [&actor_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(query_failed)?;
    let Some((role_raw, first_name, last_name)) = row else {
        return Err(not_found("user"));
    };
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::new("db_query_failed", format!("unknown role {}", role_raw)))?;
    if !allowed.contains(&role) {
        return Err(forbidden());
    }
    Ok(Actor {
        id: actor_id,
        role,
        first_name,
        last_name,
    })
}

/// Student record linked to the actor's account, if any.
pub fn linked_student_id(conn: &Connection, actor: &Actor) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT id FROM students WHERE user_id = ?",
        [&actor.id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_failed)
}

pub fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(query_failed)
}

/// Runs `f` against the open workspace and wraps the outcome in a response.
pub fn with_conn<F>(state: &AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    respond(req, f(conn, &req.params))
}

pub fn respond(req: &Request, outcome: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match outcome {
        Ok(result) => ok(&req.id, result),
        Err(error) => {
            tracing::warn!(method = %req.method, code = error.code, "{}", error.message);
            error.response(&req.id)
        }
    }
}
