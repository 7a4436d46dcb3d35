use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .env_remove("SCHOOLD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    token: Option<&str>,
    params: serde_json::Value,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(t) = token {
        payload["token"] = json!(t);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn error_code(resp: &serde_json::Value) -> &str {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn expect_ok(resp: serde_json::Value) -> serde_json::Value {
    assert_eq!(resp["ok"], json!(true), "unexpected failure: {}", resp);
    resp["result"].clone()
}

fn select_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) {
    expect_ok(request(
        stdin,
        reader,
        "ws",
        "workspace.select",
        None,
        json!({ "path": workspace.to_string_lossy() }),
    ));
}

fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    email: &str,
) -> String {
    let result = expect_ok(request(
        stdin,
        reader,
        "login",
        "auth.login",
        None,
        json!({ "email": email, "password": "password123" }),
    ));
    result["token"].as_str().expect("token").to_string()
}

/// Bootstraps the first admin and returns their session token.
fn admin_session(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    expect_ok(request(
        stdin,
        reader,
        "boot",
        "auth.bootstrap",
        None,
        json!({ "name": "Head Teacher", "email": "admin@school.test", "password": "password123" }),
    ));
    login(stdin, reader, "admin@school.test")
}

fn create_user(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    name: &str,
    email: &str,
    role: &str,
) -> String {
    let result = expect_ok(request(
        stdin,
        reader,
        "user",
        "users.create",
        Some(admin),
        json!({ "name": name, "email": email, "password": "password123", "role": role }),
    ));
    result["userId"].as_str().expect("userId").to_string()
}

fn create_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    name: &str,
) -> String {
    let result = expect_ok(request(
        stdin,
        reader,
        "class",
        "classes.create",
        Some(admin),
        json!({ "name": name, "formLevel": "Form 4" }),
    ));
    result["classId"].as_str().expect("classId").to_string()
}

fn create_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    name: &str,
) -> String {
    let result = expect_ok(request(
        stdin,
        reader,
        "subject",
        "subjects.create",
        Some(admin),
        json!({ "name": name, "group": "Sciences", "compulsory": true }),
    ));
    result["subjectId"].as_str().expect("subjectId").to_string()
}

#[test]
fn settings_patch_and_validation() {
    let workspace = temp_dir("schoold-settings");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let admin = admin_session(&mut stdin, &mut reader);
    create_user(&mut stdin, &mut reader, &admin, "Jane Wanjiru", "jane@school.test", "teacher");

    let empty = expect_ok(request(&mut stdin, &mut reader, "g1", "settings.get", Some(&admin), json!({})));
    assert!(empty["settings"]["schoolName"].is_null());

    let updated = expect_ok(request(
        &mut stdin,
        &mut reader,
        "u1",
        "settings.update",
        Some(&admin),
        json!({ "patch": { "schoolName": "Kilimani High", "currentTerm": "Term 2", "currentYear": 2024 } }),
    ));
    assert_eq!(updated["settings"]["currentYear"], json!(2024));

    expect_ok(request(
        &mut stdin,
        &mut reader,
        "u2",
        "settings.update",
        Some(&admin),
        json!({ "patch": { "currentTerm": null } }),
    ));

    let teacher = login(&mut stdin, &mut reader, "jane@school.test");
    let seen = expect_ok(request(&mut stdin, &mut reader, "g2", "settings.get", Some(&teacher), json!({})));
    assert_eq!(seen["settings"]["schoolName"], json!("Kilimani High"));
    assert!(seen["settings"]["currentTerm"].is_null());

    let denied = request(
        &mut stdin,
        &mut reader,
        "u3",
        "settings.update",
        Some(&teacher),
        json!({ "patch": { "schoolName": "Mine" } }),
    );
    assert_eq!(error_code(&denied), "forbidden");

    for (i, patch) in [
        json!({ "motto": "x" }),
        json!({ "currentYear": "2024" }),
        json!({ "schoolName": 5 }),
    ]
    .iter()
    .enumerate()
    {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "settings.update",
            Some(&admin),
            json!({ "patch": patch }),
        );
        assert_eq!(error_code(&resp), "bad_params", "patch {}", patch);
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn backup_export_and_import_over_ipc() {
    let workspace = temp_dir("schoold-backup-ipc");
    let out_dir = temp_dir("schoold-backup-ipc-out");
    let bundle = out_dir.join("school-backup.zip");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let admin = admin_session(&mut stdin, &mut reader);
    create_class(&mut stdin, &mut reader, &admin, "4A");

    let exported = expect_ok(request(
        &mut stdin,
        &mut reader,
        "exp",
        "backup.exportWorkspaceBundle",
        Some(&admin),
        json!({ "outPath": bundle.to_string_lossy() }),
    ));
    assert_eq!(exported["bundleFormat"], json!("schoold-workspace-v1"));
    assert_eq!(exported["dbSha256"].as_str().expect("digest").len(), 64);
    assert!(bundle.is_file());

    create_class(&mut stdin, &mut reader, &admin, "3B");
    let before = expect_ok(request(&mut stdin, &mut reader, "l1", "classes.list", Some(&admin), json!({})));
    assert_eq!(before["classes"].as_array().expect("classes").len(), 2);

    let imported = expect_ok(request(
        &mut stdin,
        &mut reader,
        "imp",
        "backup.importWorkspaceBundle",
        Some(&admin),
        json!({ "inPath": bundle.to_string_lossy() }),
    ));
    assert_eq!(imported["bundleFormatDetected"], json!("schoold-workspace-v1"));
    assert_eq!(imported["dbSha256"], exported["dbSha256"]);

    // The restored file predates "3B" but still holds the admin session.
    let after = expect_ok(request(&mut stdin, &mut reader, "l2", "classes.list", Some(&admin), json!({})));
    let classes = after["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["name"], json!("4A"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "imp2",
        "backup.importWorkspaceBundle",
        Some(&admin),
        json!({ "inPath": out_dir.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn importing_a_non_database_file_keeps_the_workspace() {
    let workspace = temp_dir("schoold-backup-garbage-ipc");
    let out_dir = temp_dir("schoold-backup-garbage-ipc-out");
    let notes = out_dir.join("notes.txt");
    std::fs::write(&notes, "this is not a database, only meeting notes").expect("write notes");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let admin = admin_session(&mut stdin, &mut reader);
    create_class(&mut stdin, &mut reader, &admin, "4A");

    let rejected = request(
        &mut stdin,
        &mut reader,
        "imp",
        "backup.importWorkspaceBundle",
        Some(&admin),
        json!({ "inPath": notes.to_string_lossy() }),
    );
    assert_eq!(rejected["ok"], json!(false));
    assert_eq!(error_code(&rejected), "io_failed");

    let listed = expect_ok(request(&mut stdin, &mut reader, "l", "classes.list", Some(&admin), json!({})));
    let classes = listed["classes"].as_array().expect("classes");
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["name"], json!("4A"));

    let header = std::fs::read(workspace.join("school.sqlite3")).expect("read live db");
    assert!(header.starts_with(b"SQLite format 3\0"));
    assert!(!workspace.join("school.sqlite3.importing").exists());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}
