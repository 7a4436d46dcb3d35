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

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    admission: &str,
    first: &str,
    last: &str,
    class_id: &str,
) -> String {
    let result = expect_ok(request(
        stdin,
        reader,
        "student",
        "students.create",
        Some(admin),
        json!({
            "admissionNumber": admission,
            "firstName": first,
            "lastName": last,
            "classId": class_id,
        }),
    ));
    result["studentId"].as_str().expect("studentId").to_string()
}

fn add_grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    teacher: &str,
    student_id: &str,
    subject_id: &str,
    score: f64,
    term: &str,
) -> serde_json::Value {
    request(
        stdin,
        reader,
        "grade",
        "grades.add",
        Some(teacher),
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "score": score,
            "exam": "End of term",
            "term": term,
            "year": 2024,
        }),
    )
}

#[test]
fn teachers_only_change_their_own_grades() {
    let workspace = temp_dir("schoold-grades-ownership");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let admin = admin_session(&mut stdin, &mut reader);
    let jane_id = create_user(&mut stdin, &mut reader, &admin, "Jane Wanjiru", "jane@school.test", "teacher");
    let otieno_id = create_user(&mut stdin, &mut reader, &admin, "Otieno Ouma", "otieno@school.test", "teacher");
    let class_id = create_class(&mut stdin, &mut reader, &admin, "4A");
    let maths = create_subject(&mut stdin, &mut reader, &admin, "Mathematics");
    let english = create_subject(&mut stdin, &mut reader, &admin, "English");
    for (subject, teacher) in [(&maths, &jane_id), (&english, &otieno_id)] {
        expect_ok(request(
            &mut stdin,
            &mut reader,
            "assign",
            "assignments.save",
            Some(&admin),
            json!({ "classId": class_id, "subjectId": subject, "teacherId": teacher }),
        ));
    }
    let assignments = expect_ok(request(
        &mut stdin,
        &mut reader,
        "assignments",
        "assignments.listForClass",
        Some(&admin),
        json!({ "classId": class_id }),
    ));
    assert_eq!(assignments["assignments"].as_array().expect("assignments").len(), 2);
    assert_eq!(assignments["assignments"][0]["teacher"], json!("Otieno Ouma"));

    let amina = create_student(&mut stdin, &mut reader, &admin, "ADM1", "Amina", "Hassan", &class_id);
    let jane = login(&mut stdin, &mut reader, "jane@school.test");
    let otieno = login(&mut stdin, &mut reader, "otieno@school.test");

    let added = expect_ok(add_grade(&mut stdin, &mut reader, &jane, &amina, &maths, 79.99, "Term 1"));
    assert_eq!(added["grade"], json!("A-"));
    assert_eq!(added["classId"], json!(class_id));
    let grade_id = added["gradeId"].as_str().expect("gradeId").to_string();

    let unassigned = add_grade(&mut stdin, &mut reader, &otieno, &amina, &maths, 50.0, "Term 1");
    assert_eq!(error_code(&unassigned), "forbidden");

    let admin_add = add_grade(&mut stdin, &mut reader, &admin, &amina, &maths, 50.0, "Term 1");
    assert_eq!(error_code(&admin_add), "forbidden");

    for (i, score) in [json!(100.5), json!(-1), json!("eighty")].iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "grades.add",
            Some(&jane),
            json!({ "studentId": amina, "subjectId": maths, "score": score }),
        );
        assert_eq!(error_code(&resp), "bad_params", "score {}", score);
    }

    let steal = request(
        &mut stdin,
        &mut reader,
        "steal",
        "grades.update",
        Some(&otieno),
        json!({ "gradeId": grade_id, "score": 10 }),
    );
    assert_eq!(error_code(&steal), "forbidden");
    assert_eq!(steal["error"]["message"], json!("access denied"));

    let steal_delete = request(
        &mut stdin,
        &mut reader,
        "steal-del",
        "grades.delete",
        Some(&otieno),
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(error_code(&steal_delete), "forbidden");

    let updated = expect_ok(request(
        &mut stdin,
        &mut reader,
        "upd",
        "grades.update",
        Some(&jane),
        json!({ "gradeId": grade_id, "score": 80, "exam": "Mock" }),
    ));
    assert_eq!(updated["updated"], json!(["score", "exam"]));

    let noop = request(
        &mut stdin,
        &mut reader,
        "noop",
        "grades.update",
        Some(&jane),
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(error_code(&noop), "bad_params");

    let history = expect_ok(request(
        &mut stdin,
        &mut reader,
        "hist",
        "grades.forStudent",
        Some(&otieno),
        json!({ "studentId": amina }),
    ));
    let grades = history["grades"].as_array().expect("grades");
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0]["score"], json!(80.0));
    assert_eq!(grades[0]["exam"], json!("Mock"));
    assert_eq!(grades[0]["teacher"], json!("Jane Wanjiru"));

    expect_ok(request(
        &mut stdin,
        &mut reader,
        "admin-del",
        "grades.delete",
        Some(&admin),
        json!({ "gradeId": grade_id }),
    ));
    let again = request(
        &mut stdin,
        &mut reader,
        "admin-del2",
        "grades.delete",
        Some(&admin),
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(error_code(&again), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_and_parents_see_only_linked_records() {
    let workspace = temp_dir("schoold-grades-visibility");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let admin = admin_session(&mut stdin, &mut reader);
    let jane_id = create_user(&mut stdin, &mut reader, &admin, "Jane Wanjiru", "jane@school.test", "teacher");
    let student_user = create_user(&mut stdin, &mut reader, &admin, "Amina Hassan", "amina@school.test", "student");
    let parent_user = create_user(&mut stdin, &mut reader, &admin, "Zawadi Hassan", "zawadi@school.test", "parent");
    let class_id = create_class(&mut stdin, &mut reader, &admin, "4A");
    let maths = create_subject(&mut stdin, &mut reader, &admin, "Mathematics");
    expect_ok(request(
        &mut stdin,
        &mut reader,
        "assign",
        "assignments.save",
        Some(&admin),
        json!({ "classId": class_id, "subjectId": maths, "teacherId": jane_id }),
    ));

    let wrong_link = request(
        &mut stdin,
        &mut reader,
        "wrong-link",
        "students.create",
        Some(&admin),
        json!({
            "admissionNumber": "ADM9",
            "firstName": "X",
            "lastName": "Y",
            "userId": jane_id,
        }),
    );
    assert_eq!(error_code(&wrong_link), "bad_params");

    let amina = expect_ok(request(
        &mut stdin,
        &mut reader,
        "amina",
        "students.create",
        Some(&admin),
        json!({
            "admissionNumber": "ADM1",
            "firstName": "Amina",
            "lastName": "Hassan",
            "classId": class_id,
            "userId": student_user,
            "parentUserId": parent_user,
            "dateOfBirth": "2008-03-14",
        }),
    ))["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let brian = create_student(&mut stdin, &mut reader, &admin, "ADM2", "Brian", "Kamau", &class_id);

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "dup",
        "students.create",
        Some(&admin),
        json!({ "admissionNumber": "ADM2", "firstName": "B", "lastName": "K" }),
    );
    assert_eq!(error_code(&duplicate), "conflict");

    let unenrolled = expect_ok(request(
        &mut stdin,
        &mut reader,
        "unenrolled",
        "students.create",
        Some(&admin),
        json!({ "admissionNumber": "ADM3", "firstName": "Chebet", "lastName": "Rono" }),
    ))["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    let jane = login(&mut stdin, &mut reader, "jane@school.test");
    expect_ok(add_grade(&mut stdin, &mut reader, &jane, &amina, &maths, 66.0, "Term 1"));
    expect_ok(add_grade(&mut stdin, &mut reader, &jane, &brian, &maths, 58.0, "Term 1"));
    let no_class = add_grade(&mut stdin, &mut reader, &jane, &unenrolled, &maths, 58.0, "Term 1");
    assert_eq!(error_code(&no_class), "bad_params");

    let student = login(&mut stdin, &mut reader, "amina@school.test");
    let own = expect_ok(request(
        &mut stdin,
        &mut reader,
        "own",
        "reports.student",
        Some(&student),
        json!({ "studentId": amina }),
    ));
    assert_eq!(own["grade"], json!("B"));
    assert_eq!(own["position"], json!(1));

    let other = request(
        &mut stdin,
        &mut reader,
        "other",
        "reports.student",
        Some(&student),
        json!({ "studentId": brian }),
    );
    assert_eq!(error_code(&other), "forbidden");

    let roster = request(&mut stdin, &mut reader, "roster", "students.list", Some(&student), json!({}));
    assert_eq!(error_code(&roster), "forbidden");

    let parent = login(&mut stdin, &mut reader, "zawadi@school.test");
    let child_grades = expect_ok(request(
        &mut stdin,
        &mut reader,
        "child",
        "grades.forStudent",
        Some(&parent),
        json!({ "studentId": amina }),
    ));
    assert_eq!(child_grades["grades"].as_array().expect("grades").len(), 1);
    let not_child = request(
        &mut stdin,
        &mut reader,
        "not-child",
        "grades.forStudent",
        Some(&parent),
        json!({ "studentId": brian }),
    );
    assert_eq!(error_code(&not_child), "forbidden");

    let listed = expect_ok(request(
        &mut stdin,
        &mut reader,
        "list",
        "students.list",
        Some(&jane),
        json!({ "classId": class_id }),
    ));
    let names: Vec<&str> = listed["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| s["displayName"].as_str().expect("name"))
        .collect();
    assert_eq!(names, vec!["Amina Hassan", "Brian Kamau"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
