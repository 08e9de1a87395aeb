use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::groups::Partition;

pub const DB_FILE: &str = "classroom.sqlite3";
pub const SUBMISSIONS_DIR: &str = "submissions";

pub const DEFAULT_GROUP_SIZE: i64 = 4;
pub const DEFAULT_MAX_GROUP_SIZE: i64 = 10;
pub const DEFAULT_MAX_REPORTED_ERRORS: i64 = 5;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    std::fs::create_dir_all(submissions_dir(workspace))?;
    let conn = Connection::open(workspace.join(DB_FILE))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            role TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            teacher TEXT NOT NULL,
            teacher_email TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            filiere TEXT NOT NULL,
            student_no TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL DEFAULT '',
            updated_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    ensure_students_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_name ON students(last_name, first_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS work_groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            is_mixed INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_work_groups_owner ON work_groups(subject_id, created_by)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS work_group_members(
            work_group_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(work_group_id, student_id),
            FOREIGN KEY(work_group_id) REFERENCES work_groups(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_work_group_members_student ON work_group_members(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_sessions(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_sessions_order ON attendance_sessions(date, start_time)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            is_present INTEGER NOT NULL DEFAULT 0,
            notes TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(session_id) REFERENCES attendance_sessions(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(session_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_session ON attendance(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS director_comments(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            comment TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES attendance_sessions(id),
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_director_comments_session ON director_comments(session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            project_type TEXT NOT NULL,
            due_at TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            work_group_id TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(created_by) REFERENCES users(id),
            FOREIGN KEY(work_group_id) REFERENCES work_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS project_submissions(
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            original_name TEXT NOT NULL DEFAULT '',
            submitted_at TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            is_validated INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(project_id) REFERENCES projects(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(project_id, student_id)
        )",
        [],
    )?;
    ensure_submissions_original_name(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    tracing::debug!(workspace = %workspace.display(), "schema ready");
    Ok(conn)
}

pub fn submissions_dir(workspace: &Path) -> PathBuf {
    workspace.join(SUBMISSIONS_DIR)
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_submissions_original_name(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "project_submissions", "original_name")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE project_submissions ADD COLUMN original_name TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    // Older rows only kept the stored path; its file name is the best we have.
    conn.execute(
        "UPDATE project_submissions
         SET original_name = replace(file_path, rtrim(file_path, replace(file_path, '/', '')), '')
         WHERE original_name = ''",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Integer setting, falling back to `default` when unset or not a number.
pub fn settings_get_i64(conn: &Connection, key: &str, default: i64) -> anyhow::Result<i64> {
    Ok(settings_get_json(conn, key)?
        .and_then(|v| v.as_i64())
        .unwrap_or(default))
}

pub fn settings_defaults() -> serde_json::Value {
    json!({
        "groups.defaultSize": DEFAULT_GROUP_SIZE,
        "groups.maxSize": DEFAULT_MAX_GROUP_SIZE,
        "import.maxReportedErrors": DEFAULT_MAX_REPORTED_ERRORS,
    })
}

#[derive(Debug, Clone)]
pub struct StoredGroup {
    pub id: String,
    pub name: String,
    pub student_ids: Vec<String>,
}

/// Replaces every work group `owner_id` holds for `subject_id` with `partition`.
///
/// Runs as one transaction, so calling it again with a new partition leaves
/// exactly the new groups behind. Projects pointing at a replaced group are
/// detached rather than deleted.
pub fn replace_work_groups(
    conn: &Connection,
    subject_id: &str,
    subject_name: &str,
    owner_id: &str,
    is_mixed: bool,
    partition: &Partition,
) -> anyhow::Result<Vec<StoredGroup>> {
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "UPDATE projects SET work_group_id = NULL
         WHERE work_group_id IN (
           SELECT id FROM work_groups WHERE subject_id = ? AND created_by = ?
         )",
        (subject_id, owner_id),
    )?;
    tx.execute(
        "DELETE FROM work_group_members
         WHERE work_group_id IN (
           SELECT id FROM work_groups WHERE subject_id = ? AND created_by = ?
         )",
        (subject_id, owner_id),
    )?;
    let removed = tx.execute(
        "DELETE FROM work_groups WHERE subject_id = ? AND created_by = ?",
        (subject_id, owner_id),
    )?;

    let created_at = now_timestamp();
    let mut stored = Vec::with_capacity(partition.len());
    {
        let mut insert_group = tx.prepare(
            "INSERT INTO work_groups(id, name, subject_id, created_by, created_at, is_mixed, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
        )?;
        let mut insert_member = tx.prepare(
            "INSERT INTO work_group_members(work_group_id, student_id) VALUES(?, ?)",
        )?;
        for (i, members) in partition.iter().enumerate() {
            let id = new_id();
            let name = format!("Group {} - {}", i + 1, subject_name);
            insert_group.execute((
                &id,
                &name,
                subject_id,
                owner_id,
                &created_at,
                is_mixed as i64,
                i as i64,
            ))?;
            for s in members {
                insert_member.execute((&id, &s.id))?;
            }
            stored.push(StoredGroup {
                id,
                name,
                student_ids: members.iter().map(|s| s.id.clone()).collect(),
            });
        }
    }
    tx.commit()?;

    tracing::debug!(subject_id, owner_id, removed, created = stored.len(), "work groups replaced");
    Ok(stored)
}
