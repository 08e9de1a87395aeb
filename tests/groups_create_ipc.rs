use serde_json::json;
use std::collections::HashSet;
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

fn user(sc: &mut Sidecar, username: &str, role: &str) -> String {
    sc.ok(
        "users.create",
        json!({ "username": username, "firstName": username, "lastName": "Test", "role": role }),
    )["userId"]
        .as_str()
        .expect("userId")
        .to_string()
}

fn seed_roster(sc: &mut Sidecar, delegate: &str, fields: &[(&str, usize)]) -> Vec<String> {
    let mut ids = Vec::new();
    for (field, count) in fields {
        for i in 0..*count {
            let res = sc.ok(
                "students.create",
                json!({
                    "actorId": delegate,
                    "firstName": format!("F{}", i),
                    "lastName": format!("{}{:02}", field, i),
                    "filiere": field,
                    "studentNo": format!("{}-{}", field, i),
                }),
            );
            ids.push(res["studentId"].as_str().expect("studentId").to_string());
        }
    }
    ids
}

fn setup() -> (tempfile::TempDir, Sidecar, String, String) {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    sc.ok(
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let delegate = user(&mut sc, "delegate", "delegate");
    let subject = sc.ok(
        "subjects.create",
        json!({ "name": "Algebra", "code": "MAT101", "teacher": "Dr. Ndiaye", "teacherEmail": "ndiaye@example.org" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();
    (workspace, sc, delegate, subject)
}

fn group_sizes(result: &serde_json::Value) -> Vec<usize> {
    result["groups"]
        .as_array()
        .expect("groups")
        .iter()
        .map(|g| g["studentIds"].as_array().map(|a| a.len()).unwrap_or(0))
        .collect()
}

#[test]
fn plain_groups_slice_roster_and_replace_previous_groups() {
    let (_ws, mut sc, delegate, subject) = setup();
    let students = seed_roster(&mut sc, &delegate, &[("informatique", 10)]);

    let first = sc.ok(
        "groups.create",
        json!({ "actorId": delegate, "subjectId": subject, "groupSize": 4, "seed": 1 }),
    );
    assert_eq!(group_sizes(&first), vec![4, 4, 2]);
    assert_eq!(first["groups"][0]["name"], json!("Group 1 - Algebra"));
    assert_eq!(first["groups"][2]["name"], json!("Group 3 - Algebra"));

    let assigned: HashSet<String> = first["groups"]
        .as_array()
        .expect("groups")
        .iter()
        .flat_map(|g| g["studentIds"].as_array().cloned().unwrap_or_default())
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    assert_eq!(assigned, students.iter().cloned().collect::<HashSet<_>>());

    // Re-running for the same subject and owner leaves only the new groups.
    let second = sc.ok(
        "groups.create",
        json!({ "actorId": delegate, "subjectId": subject, "groupSize": 5, "seed": 2 }),
    );
    assert_eq!(group_sizes(&second), vec![5, 5]);
    let listed = sc.ok("groups.list", json!({ "actorId": delegate }));
    let listed = listed["groups"].as_array().expect("groups");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["students"].as_array().map(|a| a.len()), Some(5));
    assert_eq!(listed[0]["subject"]["code"], json!("MAT101"));
}

#[test]
fn same_seed_reproduces_the_same_groups() {
    let (_ws, mut sc, delegate, subject) = setup();
    seed_roster(&mut sc, &delegate, &[("physique", 7), ("chimie", 5)]);

    let params = json!({ "actorId": delegate, "subjectId": subject, "groupSize": 3, "isMixed": true, "seed": 77 });
    let a = sc.ok("groups.create", params.clone());
    let b = sc.ok("groups.create", params);
    let members = |r: &serde_json::Value| -> Vec<serde_json::Value> {
        r["groups"]
            .as_array()
            .expect("groups")
            .iter()
            .map(|g| g["studentIds"].clone())
            .collect()
    };
    assert_eq!(members(&a), members(&b));
}

#[test]
fn mixed_groups_spread_each_field_round_robin() {
    let (_ws, mut sc, delegate, subject) = setup();
    seed_roster(&mut sc, &delegate, &[("informatique", 5), ("mathematiques", 4)]);

    let created = sc.ok(
        "groups.create",
        json!({ "actorId": delegate, "subjectId": subject, "groupSize": 3, "isMixed": true, "seed": 9 }),
    );
    assert_eq!(group_sizes(&created), vec![4, 3, 2]);

    let listed = sc.ok("groups.list", json!({ "actorId": delegate }));
    let counts: Vec<(u64, u64)> = listed["groups"]
        .as_array()
        .expect("groups")
        .iter()
        .map(|g| {
            (
                g["filiereCounts"]["informatique"].as_u64().unwrap_or(0),
                g["filiereCounts"]["mathematiques"].as_u64().unwrap_or(0),
            )
        })
        .collect();
    assert_eq!(counts, vec![(2, 2), (2, 1), (1, 1)]);
    assert_eq!(listed["groups"][0]["isMixed"], json!(true));
}

#[test]
fn group_creation_rejects_bad_sizes_empty_roster_and_wrong_roles() {
    let (_ws, mut sc, delegate, subject) = setup();

    assert_eq!(
        sc.err_code(
            "groups.create",
            json!({ "actorId": delegate, "subjectId": subject, "groupSize": 3 }),
        ),
        "empty_roster"
    );

    seed_roster(&mut sc, &delegate, &[("gestion", 4)]);
    assert_eq!(
        sc.err_code(
            "groups.create",
            json!({ "actorId": delegate, "subjectId": subject, "groupSize": 1 }),
        ),
        "invalid_group_size"
    );
    let negative = sc.request(
        "groups.create",
        json!({ "actorId": delegate, "subjectId": subject, "groupSize": -3 }),
    );
    assert_eq!(negative["error"]["code"], json!("invalid_group_size"));
    assert!(
        negative["error"]["message"]
            .as_str()
            .unwrap_or("")
            .contains("-3"),
        "message should echo the requested size: {}",
        negative["error"]["message"]
    );
    assert_eq!(
        sc.err_code(
            "groups.create",
            json!({ "actorId": delegate, "subjectId": subject, "groupSize": 11 }),
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "groups.create",
            json!({ "actorId": delegate, "subjectId": "nope", "groupSize": 2 }),
        ),
        "not_found"
    );

    let student_user = user(&mut sc, "learner", "student");
    assert_eq!(
        sc.err_code(
            "groups.create",
            json!({ "actorId": student_user, "subjectId": subject }),
        ),
        "forbidden"
    );

    // No groupSize falls back to the configured default.
    sc.ok("settings.set", json!({ "key": "groups.defaultSize", "value": 2 }));
    let created = sc.ok(
        "groups.create",
        json!({ "actorId": delegate, "subjectId": subject }),
    );
    assert_eq!(group_sizes(&created), vec![2, 2]);
}

#[test]
fn students_see_only_their_own_groups() {
    let (_ws, mut sc, delegate, subject) = setup();
    let students = seed_roster(&mut sc, &delegate, &[("biologie", 6)]);
    let account = sc.ok(
        "users.register",
        json!({ "username": "awa", "firstName": "Awa", "lastName": "Diallo" }),
    )["userId"]
        .as_str()
        .expect("userId")
        .to_string();

    assert_eq!(
        sc.err_code("groups.mine", json!({ "actorId": account })),
        "not_found"
    );
    sc.ok(
        "students.linkUser",
        json!({ "actorId": delegate, "studentId": students[0], "userId": account }),
    );
    sc.ok(
        "groups.create",
        json!({ "actorId": delegate, "subjectId": subject, "groupSize": 2, "seed": 4 }),
    );

    let mine = sc.ok("groups.mine", json!({ "actorId": account }));
    let groups = mine["groups"].as_array().expect("groups");
    assert_eq!(groups.len(), 1);
    let member_ids: Vec<&str> = groups[0]["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["id"].as_str())
        .collect();
    assert!(member_ids.contains(&students[0].as_str()));
    assert_eq!(member_ids.len(), 2);
}
