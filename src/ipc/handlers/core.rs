use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bad_params, get_required_str, internal, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            tracing::info!(workspace = %path.display(), "workspace opened");
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => {
            tracing::warn!(workspace = %path.display(), "failed to open workspace: {e:#}");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

fn settings_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let defaults = db::settings_defaults();
    if let Some(key) = params.get("key").and_then(|v| v.as_str()) {
        let stored = db::settings_get_json(conn, key).map_err(internal("db_query_failed"))?;
        let value = stored
            .or_else(|| defaults.get(key).cloned())
            .unwrap_or(serde_json::Value::Null);
        return Ok(json!({ "key": key, "value": value }));
    }

    let mut all = defaults.as_object().cloned().unwrap_or_default();
    for key in all.keys().cloned().collect::<Vec<_>>() {
        if let Some(v) = db::settings_get_json(conn, &key).map_err(internal("db_query_failed"))? {
            all.insert(key, v);
        }
    }
    Ok(json!({ "settings": all }))
}

fn settings_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = get_required_str(params, "key")?;
    let Some(value) = params.get("value") else {
        return Err(bad_params("missing value"));
    };

    let min = match key.as_str() {
        "groups.defaultSize" | "groups.maxSize" => 2,
        "import.maxReportedErrors" => 0,
        _ => {
            return Err(bad_params(format!("unknown setting {}", key))
                .with_details(json!({ "known": db::settings_defaults() })))
        }
    };
    match value.as_i64() {
        Some(n) if n >= min => {}
        _ => return Err(bad_params(format!("{} must be an integer >= {}", key, min))),
    }

    db::settings_set_json(conn, &key, value).map_err(internal("db_update_failed"))?;
    tracing::info!(key = %key, value = %value, "setting updated");
    Ok(json!({ "key": key, "value": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.get" => Some(with_conn(state, req, settings_get)),
        "settings.set" => Some(with_conn(state, req, settings_set)),
        _ => None,
    }
}
