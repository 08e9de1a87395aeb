use crate::db;
use crate::ipc::helpers::{
    bad_params, get_optional_str, get_required_str, not_found, query_failed, with_conn,
    write_failed, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::Connection;
use serde_json::json;

fn insert_user(
    conn: &Connection,
    params: &serde_json::Value,
    role: Role,
) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let email = get_optional_str(params, "email").unwrap_or_default();

    let user_id = db::new_id();
    conn.execute(
        "INSERT INTO users(id, username, first_name, last_name, email, role, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &username,
            &first_name,
            &last_name,
            &email,
            role.as_str(),
            db::now_timestamp(),
        ),
    )
    .map_err(write_failed("db_insert_failed", "users"))?;

    tracing::info!(user_id = %user_id, role = role.as_str(), "user created");
    Ok(json!({
        "userId": user_id,
        "username": username,
        "role": role.as_str(),
    }))
}

// Self-service sign-up always yields a student account.
fn users_register(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    insert_user(conn, params, Role::Student)
}

fn users_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| bad_params("role must be one of: student, delegate, director"))?;
    insert_user(conn, params, role)
}

fn users_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, username, first_name, last_name, email, role
             FROM users
             ORDER BY username",
        )
        .map_err(query_failed)?;
    let users = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "lastName": r.get::<_, String>(3)?,
                "email": r.get::<_, String>(4)?,
                "role": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "users": users }))
}

fn users_set_role(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| bad_params("role must be one of: student, delegate, director"))?;
    let changed = conn
        .execute(
            "UPDATE users SET role = ? WHERE id = ?",
            (role.as_str(), &user_id),
        )
        .map_err(write_failed("db_update_failed", "users"))?;
    if changed == 0 {
        return Err(not_found("user"));
    }
    Ok(json!({ "userId": user_id, "role": role.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.register" => Some(with_conn(state, req, users_register)),
        "users.create" => Some(with_conn(state, req, users_create)),
        "users.list" => Some(with_conn(state, req, users_list)),
        "users.setRole" => Some(with_conn(state, req, users_set_role)),
        _ => None,
    }
}
