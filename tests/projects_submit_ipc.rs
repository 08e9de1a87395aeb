use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: usize,
}

impl Sidecar {
    fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_classroomd");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn classroomd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value["error"]
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.request(method, params);
        assert_eq!(value["ok"], json!(false), "{} unexpectedly succeeded", method);
        value["error"]["code"].as_str().unwrap_or("").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v[key].as_str().unwrap_or_else(|| panic!("missing {}", key)).to_string()
}

#[test]
fn students_submit_resubmit_and_get_validated() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    sc.ok(
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let delegate = str_field(
        &sc.ok(
            "users.create",
            json!({ "username": "del", "firstName": "Awa", "lastName": "Diallo", "role": "delegate" }),
        ),
        "userId",
    );
    let subject = str_field(
        &sc.ok(
            "subjects.create",
            json!({ "name": "Databases", "code": "INF301", "teacher": "Dr. Kane", "teacherEmail": "k@example.org" }),
        ),
        "subjectId",
    );
    let mut students = Vec::new();
    for last in ["Ba", "Cisse", "Diop", "Gueye"] {
        let res = sc.ok(
            "students.create",
            json!({ "actorId": delegate, "firstName": "X", "lastName": last, "filiere": "informatique", "studentNo": last }),
        );
        students.push(str_field(&res, "studentId"));
    }
    let account = str_field(
        &sc.ok(
            "users.register",
            json!({ "username": "ba", "firstName": "X", "lastName": "Ba" }),
        ),
        "userId",
    );
    sc.ok(
        "students.linkUser",
        json!({ "actorId": delegate, "studentId": students[0], "userId": account }),
    );

    let groups = sc.ok(
        "groups.create",
        json!({ "actorId": delegate, "subjectId": subject, "groupSize": 2, "seed": 3 }),
    );
    let groups = groups["groups"].as_array().expect("groups").clone();
    assert_eq!(groups.len(), 2);
    let contains_me = |g: &serde_json::Value| {
        g["studentIds"]
            .as_array()
            .map(|ids| ids.iter().any(|v| v.as_str() == Some(students[0].as_str())))
            .unwrap_or(false)
    };
    let my_group = groups.iter().find(|g| contains_me(*g)).expect("own group");
    let other_group = groups.iter().find(|g| !contains_me(*g)).expect("other group");

    let solo = str_field(
        &sc.ok(
            "projects.create",
            json!({
                "actorId": delegate, "title": "Schema design", "description": "ER diagram",
                "subjectId": subject, "projectType": "individual", "dueAt": "2024-04-01T18:00",
            }),
        ),
        "projectId",
    );
    let ours = str_field(
        &sc.ok(
            "projects.create",
            json!({
                "actorId": delegate, "title": "Mini app", "description": "CRUD app",
                "subjectId": subject, "projectType": "group", "dueAt": "2024-04-15 12:00",
                "workGroupId": my_group["id"],
            }),
        ),
        "projectId",
    );
    let theirs = str_field(
        &sc.ok(
            "projects.create",
            json!({
                "actorId": delegate, "title": "Mini app", "description": "CRUD app",
                "subjectId": subject, "projectType": "group", "dueAt": "2024-04-15T12:00:00",
                "workGroupId": other_group["id"],
            }),
        ),
        "projectId",
    );
    assert_eq!(
        sc.err_code(
            "projects.create",
            json!({
                "actorId": delegate, "title": "T", "description": "D",
                "subjectId": subject, "projectType": "group", "dueAt": "2024-04-15T12:00",
            }),
        ),
        "bad_params"
    );

    let upload = workspace.path().join("report.pdf");
    std::fs::write(&upload, b"first draft").expect("write upload");
    let first = sc.ok(
        "projects.submit",
        json!({ "actorId": account, "projectId": solo, "sourcePath": upload.to_string_lossy() }),
    );
    assert_eq!(first["action"], json!("submitted"));
    let stored = workspace.path().join(str_field(&first, "filePath"));
    assert_eq!(std::fs::read(&stored).expect("stored copy"), b"first draft");

    std::fs::write(&upload, b"final version").expect("rewrite upload");
    let second = sc.ok(
        "projects.submit",
        json!({ "actorId": account, "projectId": solo, "sourcePath": upload.to_string_lossy(), "notes": "fixed typos" }),
    );
    assert_eq!(second["action"], json!("updated"));
    assert_eq!(second["submissionId"], first["submissionId"]);
    assert_ne!(second["filePath"], first["filePath"]);
    assert!(!stored.exists(), "replaced upload should be removed");
    let stored = workspace.path().join(str_field(&second, "filePath"));
    assert_eq!(std::fs::read(&stored).expect("stored copy"), b"final version");

    sc.ok(
        "projects.submit",
        json!({ "actorId": account, "projectId": ours, "sourcePath": upload.to_string_lossy() }),
    );
    assert_eq!(
        sc.err_code(
            "projects.submit",
            json!({ "actorId": account, "projectId": theirs, "sourcePath": upload.to_string_lossy() }),
        ),
        "forbidden"
    );
    assert_eq!(
        sc.err_code(
            "projects.submit",
            json!({ "actorId": account, "projectId": solo, "sourcePath": workspace.path().join("gone.pdf").to_string_lossy() }),
        ),
        "bad_params"
    );

    let listed = sc.ok(
        "projects.submissions.list",
        json!({ "actorId": delegate, "projectId": solo }),
    );
    let subs = listed["submissions"].as_array().expect("submissions");
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0]["originalName"], json!("report.pdf"));
    assert_eq!(subs[0]["notes"], json!("fixed typos"));
    assert_eq!(subs[0]["isValidated"], json!(false));

    sc.ok(
        "projects.submissions.validate",
        json!({ "actorId": delegate, "submissionId": subs[0]["id"] }),
    );
    assert_eq!(
        sc.err_code(
            "projects.submissions.validate",
            json!({ "actorId": delegate, "submissionId": "missing" }),
        ),
        "not_found"
    );

    let mine = sc.ok("projects.mine", json!({ "actorId": account }));
    let projects = mine["projects"].as_array().expect("projects");
    assert_eq!(projects.len(), 2);
    let solo_view = projects
        .iter()
        .find(|p| p["id"] == json!(solo))
        .expect("individual project");
    assert_eq!(solo_view["submission"]["isValidated"], json!(true));
    assert_eq!(solo_view["dueAt"], json!("2024-04-01T18:00"));

    let dash = sc.ok("dashboard.get", json!({ "actorId": account }));
    assert_eq!(dash["user"]["role"], json!("student"));
    assert_eq!(dash["student"]["id"], json!(students[0]));
    assert_eq!(dash["myGroups"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(dash["myProjects"].as_array().map(|a| a.len()), Some(2));
}

#[test]
fn failed_resubmission_keeps_the_previous_upload() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    sc.ok(
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let delegate = str_field(
        &sc.ok(
            "users.create",
            json!({ "username": "del", "firstName": "Awa", "lastName": "Diallo", "role": "delegate" }),
        ),
        "userId",
    );
    let subject = str_field(
        &sc.ok(
            "subjects.create",
            json!({ "name": "Databases", "code": "INF301", "teacher": "Dr. Kane", "teacherEmail": "k@example.org" }),
        ),
        "subjectId",
    );
    let student = str_field(
        &sc.ok(
            "students.create",
            json!({ "actorId": delegate, "firstName": "Omar", "lastName": "Ba", "filiere": "informatique", "studentNo": "E001" }),
        ),
        "studentId",
    );
    let account = str_field(
        &sc.ok(
            "users.register",
            json!({ "username": "ba", "firstName": "Omar", "lastName": "Ba" }),
        ),
        "userId",
    );
    sc.ok(
        "students.linkUser",
        json!({ "actorId": delegate, "studentId": student, "userId": account }),
    );
    let project = str_field(
        &sc.ok(
            "projects.create",
            json!({
                "actorId": delegate, "title": "Schema design", "description": "ER diagram",
                "subjectId": subject, "projectType": "individual", "dueAt": "2024-04-01T18:00",
            }),
        ),
        "projectId",
    );

    let upload = workspace.path().join("report.pdf");
    std::fs::write(&upload, b"first draft").expect("write upload");
    let first = sc.ok(
        "projects.submit",
        json!({ "actorId": account, "projectId": project, "sourcePath": upload.to_string_lossy() }),
    );
    let stored = workspace.path().join(str_field(&first, "filePath"));

    // Make every update of the submission row fail.
    let db = rusqlite::Connection::open(workspace.path().join("classroom.sqlite3")).expect("open db");
    db.execute_batch(
        "CREATE TRIGGER block_resubmit BEFORE UPDATE ON project_submissions
         BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
    )
    .expect("create trigger");

    std::fs::write(&upload, b"second draft").expect("rewrite upload");
    let failed = sc.request(
        "projects.submit",
        json!({ "actorId": account, "projectId": project, "sourcePath": upload.to_string_lossy() }),
    );
    assert_eq!(failed["ok"], json!(false));
    assert_eq!(std::fs::read(&stored).expect("previous upload kept"), b"first draft");

    let listed = sc.ok(
        "projects.submissions.list",
        json!({ "actorId": delegate, "projectId": project }),
    );
    assert_eq!(listed["submissions"][0]["filePath"], first["filePath"]);
    let leftover: Vec<_> = std::fs::read_dir(workspace.path().join("submissions"))
        .expect("submissions dir")
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(leftover.len(), 1, "the rejected copy should be cleaned up");
}

#[test]
fn unlinked_students_get_a_warning_instead_of_projects() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    sc.ok(
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let account = str_field(
        &sc.ok(
            "users.register",
            json!({ "username": "solo", "firstName": "Solo", "lastName": "User" }),
        ),
        "userId",
    );
    let dash = sc.ok("dashboard.get", json!({ "actorId": account }));
    assert!(dash["warning"].is_string());
    assert!(dash.get("myProjects").is_none());
    assert_eq!(
        sc.err_code("projects.mine", json!({ "actorId": account })),
        "not_found"
    );
    assert_eq!(
        sc.err_code(
            "projects.submissions.list",
            json!({ "actorId": account, "projectId": "x" }),
        ),
        "forbidden"
    );
}
