use crate::db;
use crate::groups::{self, GroupSpec, PartitionError, StudentRef};
use crate::ipc::helpers::{
    bad_params, get_optional_bool, get_optional_u64, get_required_str, internal,
    linked_student_id, not_found, query_failed, require_actor, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

use super::students::{list_all_students, StudentRecord};

impl From<PartitionError> for HandlerErr {
    fn from(e: PartitionError) -> Self {
        let message = match &e {
            PartitionError::EmptyInput => {
                "no students found; add students before creating groups".to_string()
            }
            PartitionError::InvalidSize(_) => e.to_string(),
        };
        HandlerErr::new(e.code(), message)
    }
}

fn groups_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Delegate])?;
    let subject_id = get_required_str(params, "subjectId")?;
    let subject_name: String = conn
        .query_row("SELECT name FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(query_failed)?
        .ok_or_else(|| not_found("subject"))?;

    let default_size = db::settings_get_i64(conn, "groups.defaultSize", db::DEFAULT_GROUP_SIZE)
        .map_err(internal("db_query_failed"))?;
    let max_size = db::settings_get_i64(conn, "groups.maxSize", db::DEFAULT_MAX_GROUP_SIZE)
        .map_err(internal("db_query_failed"))?;
    let size = match params.get("groupSize") {
        None | Some(serde_json::Value::Null) => default_size,
        Some(v) => v
            .as_i64()
            .ok_or_else(|| bad_params("groupSize must be an integer"))?,
    };
    if size > max_size {
        return Err(bad_params(format!("groupSize must be at most {}", max_size))
            .with_details(json!({ "groupSize": size, "maxSize": max_size })));
    }
    let size = usize::try_from(size).map_err(|_| {
        HandlerErr::new(
            "invalid_group_size",
            format!("group size must be at least 2 (got {})", size),
        )
    })?;
    let spec = GroupSpec {
        size,
        mixed: get_optional_bool(params, "isMixed")?.unwrap_or(false),
    };

    let roster: Vec<StudentRef> = list_all_students(conn)?
        .into_iter()
        .map(|s| StudentRef {
            id: s.id,
            filiere: s.filiere,
        })
        .collect();

    let mut rng = match get_optional_u64(params, "seed")? {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    let partition = groups::partition(&roster, spec, &mut rng)?;

    let stored = db::replace_work_groups(
        conn,
        &subject_id,
        &subject_name,
        &actor.id,
        spec.mixed,
        &partition,
    )
    .map_err(internal("db_insert_failed"))?;

    tracing::info!(
        subject_id = %subject_id,
        owner = %actor.id,
        students = roster.len(),
        groups = stored.len(),
        mixed = spec.mixed,
        "work groups created"
    );
    Ok(json!({
        "subjectId": subject_id,
        "groupSize": spec.size,
        "isMixed": spec.mixed,
        "groups": stored.iter().map(|g| json!({
            "id": g.id,
            "name": g.name,
            "studentIds": g.student_ids,
        })).collect::<Vec<_>>(),
    }))
}

/// Groups matching `filter_sql` (bound to `filter_arg`), with subject and members.
pub fn load_groups(
    conn: &Connection,
    filter_sql: &str,
    filter_arg: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT g.id, g.name, g.is_mixed, g.created_at, s.id, s.name, s.code
             FROM work_groups g
             JOIN subjects s ON s.id = g.subject_id
             WHERE {filter_sql}
             ORDER BY s.code, g.sort_order"
        ))
        .map_err(query_failed)?;
    let groups = stmt
        .query_map([filter_arg], |r| {
            Ok((
                r.get::<_, String>(0)?,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "isMixed": r.get::<_, i64>(2)? != 0,
                    "createdAt": r.get::<_, String>(3)?,
                    "subject": {
                        "id": r.get::<_, String>(4)?,
                        "name": r.get::<_, String>(5)?,
                        "code": r.get::<_, String>(6)?,
                    },
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut members_stmt = conn
        .prepare(
            "SELECT st.id, st.user_id, st.first_name, st.last_name, st.filiere, st.student_no, st.email
             FROM work_group_members m
             JOIN students st ON st.id = m.student_id
             WHERE m.work_group_id = ?
             ORDER BY st.last_name, st.first_name",
        )
        .map_err(query_failed)?;
    let mut out = Vec::with_capacity(groups.len());
    for (group_id, mut group) in groups {
        let members = members_stmt
            .query_map([&group_id], |r| {
                Ok(StudentRecord {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    first_name: r.get(2)?,
                    last_name: r.get(3)?,
                    filiere: r.get(4)?,
                    student_no: r.get(5)?,
                    email: r.get(6)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_failed)?;
        group["filiereCounts"] = json!(filiere_counts(&members));
        group["students"] = json!(members.iter().map(StudentRecord::to_json).collect::<Vec<_>>());
        out.push(group);
    }
    Ok(out)
}

fn filiere_counts(members: &[StudentRecord]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for m in members {
        *counts.entry(m.filiere.clone()).or_insert(0) += 1;
    }
    counts
}

fn groups_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Delegate])?;
    let groups = load_groups(conn, "g.created_by = ?", &actor.id)?;
    Ok(json!({ "groups": groups }))
}

fn groups_mine(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Student])?;
    let Some(student_id) = linked_student_id(conn, &actor)? else {
        return Err(not_found("student profile"));
    };
    let groups = load_groups(
        conn,
        "g.id IN (SELECT work_group_id FROM work_group_members WHERE student_id = ?)",
        &student_id,
    )?;
    Ok(json!({ "studentId": student_id, "groups": groups }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.create" => Some(with_conn(state, req, groups_create)),
        "groups.list" => Some(with_conn(state, req, groups_list)),
        "groups.mine" => Some(with_conn(state, req, groups_mine)),
        _ => None,
    }
}
