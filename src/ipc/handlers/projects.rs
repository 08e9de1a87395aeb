use crate::db;
use crate::ipc::error::err;
use crate::ipc::helpers::{
    bad_params, forbidden, get_optional_bool, get_optional_str, get_required_str,
    linked_student_id, not_found, query_failed, require_actor, respond, row_exists, with_conn,
    write_failed, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectType {
    Individual,
    Group,
}

impl ProjectType {
    fn as_str(self) -> &'static str {
        match self {
            ProjectType::Individual => "individual",
            ProjectType::Group => "group",
        }
    }

    fn parse(raw: &str) -> Option<ProjectType> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "individual" => Some(ProjectType::Individual),
            "group" => Some(ProjectType::Group),
            _ => None,
        }
    }
}

fn parse_due_at(raw: &str) -> Result<NaiveDateTime, HandlerErr> {
    let t = raw.trim();
    NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M"))
        .map_err(|_| bad_params("dueAt must be YYYY-MM-DDTHH:MM"))
}

#[derive(Debug, Clone)]
struct ProjectRow {
    id: String,
    title: String,
    description: String,
    subject_name: String,
    subject_code: String,
    project_type: String,
    due_at: String,
    work_group_id: Option<String>,
    work_group_name: Option<String>,
}

impl ProjectRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "subject": { "name": self.subject_name, "code": self.subject_code },
            "projectType": self.project_type,
            "dueAt": self.due_at,
            "workGroupId": self.work_group_id,
            "workGroupName": self.work_group_name,
        })
    }
}

const PROJECT_SELECT: &str = "SELECT p.id, p.title, p.description, s.name, s.code, p.project_type,
        p.due_at, p.work_group_id, g.name
 FROM projects p
 JOIN subjects s ON s.id = p.subject_id
 LEFT JOIN work_groups g ON g.id = p.work_group_id";

fn project_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok(ProjectRow {
        id: r.get(0)?,
        title: r.get(1)?,
        description: r.get(2)?,
        subject_name: r.get(3)?,
        subject_code: r.get(4)?,
        project_type: r.get(5)?,
        due_at: r.get(6)?,
        work_group_id: r.get(7)?,
        work_group_name: r.get(8)?,
    })
}

/// Individual projects plus those of groups the student belongs to.
pub fn projects_for_student(conn: &Connection, student_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "{PROJECT_SELECT}
             WHERE p.project_type = 'individual'
                OR p.work_group_id IN (
                  SELECT work_group_id FROM work_group_members WHERE student_id = ?1
                )
             ORDER BY p.due_at"
        ))
        .map_err(query_failed)?;
    let projects = stmt
        .query_map([student_id], project_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut sub_stmt = conn
        .prepare(
            "SELECT id, submitted_at, is_validated FROM project_submissions
             WHERE project_id = ? AND student_id = ?",
        )
        .map_err(query_failed)?;
    let mut out = Vec::with_capacity(projects.len());
    for p in projects {
        let submission = sub_stmt
            .query_row((&p.id, student_id), |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "submittedAt": r.get::<_, String>(1)?,
                    "isValidated": r.get::<_, i64>(2)? != 0,
                }))
            })
            .optional()
            .map_err(query_failed)?;
        let mut v = p.to_json();
        v["submission"] = submission.unwrap_or(serde_json::Value::Null);
        out.push(v);
    }
    Ok(out)
}

fn projects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Delegate])?;
    let title = get_required_str(params, "title")?;
    let description = get_required_str(params, "description")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let project_type = ProjectType::parse(&get_required_str(params, "projectType")?)
        .ok_or_else(|| bad_params("projectType must be individual or group"))?;
    let due_at = parse_due_at(&get_required_str(params, "dueAt")?)?;
    let work_group_id = get_optional_str(params, "workGroupId");

    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(not_found("subject"));
    }
    match (&work_group_id, project_type) {
        (None, ProjectType::Group) => {
            return Err(bad_params("group projects need a workGroupId"));
        }
        (Some(gid), _) => {
            if !row_exists(conn, "SELECT 1 FROM work_groups WHERE id = ?", gid)? {
                return Err(not_found("work group"));
            }
        }
        (None, ProjectType::Individual) => {}
    }

    let project_id = db::new_id();
    conn.execute(
        "INSERT INTO projects(id, title, description, subject_id, project_type, due_at, created_by, created_at, work_group_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &project_id,
            &title,
            &description,
            &subject_id,
            project_type.as_str(),
            due_at.format("%Y-%m-%dT%H:%M").to_string(),
            &actor.id,
            db::now_timestamp(),
            &work_group_id,
        ),
    )
    .map_err(write_failed("db_insert_failed", "projects"))?;
    Ok(json!({ "projectId": project_id }))
}

fn projects_mine(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Student])?;
    let Some(student_id) = linked_student_id(conn, &actor)? else {
        return Err(not_found("student profile"));
    };
    let projects = projects_for_student(conn, &student_id)?;
    Ok(json!({ "studentId": student_id, "projects": projects }))
}

fn can_submit(conn: &Connection, project: &ProjectRow, student_id: &str) -> Result<bool, HandlerErr> {
    if project.project_type == ProjectType::Individual.as_str() {
        return Ok(true);
    }
    let Some(group_id) = project.work_group_id.as_deref() else {
        return Ok(false);
    };
    conn.query_row(
        "SELECT 1 FROM work_group_members WHERE work_group_id = ? AND student_id = ?",
        (group_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(query_failed)
}

// Each upload gets its own stored name, so a failed resubmission never
// overwrites the file the current row points at.
fn stored_file_name(source: &Path) -> String {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "submission".to_string());
    format!("{}_{}", db::new_id(), name)
}

fn projects_submit(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(conn, params, &[Role::Student])?;
    let project_id = get_required_str(params, "projectId")?;
    let source = PathBuf::from(get_required_str(params, "sourcePath")?);
    let notes = get_optional_str(params, "notes").unwrap_or_default();

    let project = conn
        .query_row(
            &format!("{PROJECT_SELECT} WHERE p.id = ?"),
            [&project_id],
            project_from_row,
        )
        .optional()
        .map_err(query_failed)?
        .ok_or_else(|| not_found("project"))?;
    let Some(student_id) = linked_student_id(conn, &actor)? else {
        return Err(not_found("student profile"));
    };
    if !can_submit(conn, &project, &student_id)? {
        return Err(forbidden());
    }
    if !source.is_file() {
        return Err(bad_params("sourcePath must point to a file")
            .with_details(json!({ "sourcePath": source.to_string_lossy() })));
    }

    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, file_path FROM project_submissions WHERE project_id = ? AND student_id = ?",
            (&project_id, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_failed)?;
    let submission_id = existing
        .as_ref()
        .map(|(id, _)| id.clone())
        .unwrap_or_else(db::new_id);

    let rel_path = Path::new(db::SUBMISSIONS_DIR).join(stored_file_name(&source));
    let dest = workspace.join(&rel_path);
    std::fs::copy(&source, &dest).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string())
            .with_details(json!({ "sourcePath": source.to_string_lossy() }))
    })?;
    let rel_str = rel_path.to_string_lossy().replace('\\', "/");
    let original_name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let write = conn.execute(
        "INSERT INTO project_submissions(id, project_id, student_id, file_path, original_name, submitted_at, notes, is_validated)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0)
         ON CONFLICT(project_id, student_id) DO UPDATE SET
           file_path = excluded.file_path,
           original_name = excluded.original_name,
           submitted_at = excluded.submitted_at,
           notes = excluded.notes",
        (
            &submission_id,
            &project_id,
            &student_id,
            &rel_str,
            &original_name,
            db::now_timestamp(),
            &notes,
        ),
    );
    if let Err(e) = write {
        let _ = std::fs::remove_file(&dest);
        return Err(write_failed("db_insert_failed", "project_submissions")(e));
    }
    if let Some((_, old_path)) = &existing {
        if *old_path != rel_str {
            let _ = std::fs::remove_file(workspace.join(old_path));
        }
    }

    let action = if existing.is_some() { "updated" } else { "submitted" };
    tracing::info!(project_id = %project_id, student_id = %student_id, action, "project submission stored");
    Ok(json!({
        "submissionId": submission_id,
        "action": action,
        "filePath": rel_str,
    }))
}

fn submissions_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_actor(conn, params, &[Role::Delegate])?;
    let project_id = get_required_str(params, "projectId")?;
    if !row_exists(conn, "SELECT 1 FROM projects WHERE id = ?", &project_id)? {
        return Err(not_found("project"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT ps.id, st.id, st.last_name, st.first_name, ps.file_path, ps.original_name,
                    ps.submitted_at, ps.notes, ps.is_validated
             FROM project_submissions ps
             JOIN students st ON st.id = ps.student_id
             WHERE ps.project_id = ?
             ORDER BY st.last_name, st.first_name",
        )
        .map_err(query_failed)?;
    let submissions = stmt
        .query_map([&project_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "firstName": r.get::<_, String>(3)?,
                "filePath": r.get::<_, String>(4)?,
                "originalName": r.get::<_, String>(5)?,
                "submittedAt": r.get::<_, String>(6)?,
                "notes": r.get::<_, String>(7)?,
                "isValidated": r.get::<_, i64>(8)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "projectId": project_id, "submissions": submissions }))
}

fn submissions_validate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_actor(conn, params, &[Role::Delegate])?;
    let submission_id = get_required_str(params, "submissionId")?;
    let validated = get_optional_bool(params, "validated")?.unwrap_or(true);
    let changed = conn
        .execute(
            "UPDATE project_submissions SET is_validated = ? WHERE id = ?",
            (validated as i64, &submission_id),
        )
        .map_err(write_failed("db_update_failed", "project_submissions"))?;
    if changed == 0 {
        return Err(not_found("submission"));
    }
    Ok(json!({ "submissionId": submission_id, "isValidated": validated }))
}

fn handle_projects_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    respond(req, projects_submit(conn, workspace, &req.params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "projects.create" => Some(with_conn(state, req, projects_create)),
        "projects.mine" => Some(with_conn(state, req, projects_mine)),
        "projects.submit" => Some(handle_projects_submit(state, req)),
        "projects.submissions.list" => Some(with_conn(state, req, submissions_list)),
        "projects.submissions.validate" => Some(with_conn(state, req, submissions_validate)),
        _ => None,
    }
}
