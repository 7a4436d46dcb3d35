use crate::ipc::helpers::{
    db_conn, ensure_exists, ensure_user_role, is_unique_violation, optional_str,
    patch_nullable_str, patch_object, patch_required_str, require, required_str, respond,
    HandlerErr, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{Action, Role};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn students_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewStudents)?;
    let class_id = optional_str(&req.params, "classId")?;

    let mut sql = String::from(
        "SELECT s.id, s.admission_number, s.first_name, s.last_name, s.gender,
                s.date_of_birth, s.class_id, c.name, s.user_id, s.parent_user_id
         FROM students s
         LEFT JOIN classrooms c ON c.id = s.class_id",
    );
    let mut binds: Vec<SqlValue> = Vec::new();
    if let Some(class_id) = class_id.as_deref() {
        ensure_exists(conn, "classrooms", class_id, "class")?;
        sql.push_str(" WHERE s.class_id = ?");
        binds.push(SqlValue::Text(class_id.to_string()));
    }
    sql.push_str(" ORDER BY s.last_name, s.first_name, s.admission_number");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map(params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let admission_number: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let last_name: String = row.get(3)?;
            let gender: Option<String> = row.get(4)?;
            let date_of_birth: Option<String> = row.get(5)?;
            let class_id: Option<String> = row.get(6)?;
            let class_name: Option<String> = row.get(7)?;
            let user_id: Option<String> = row.get(8)?;
            let parent_user_id: Option<String> = row.get(9)?;
            Ok(json!({
                "id": id,
                "admissionNumber": admission_number,
                "firstName": first_name,
                "lastName": last_name,
                "displayName": format!("{} {}", first_name, last_name),
                "gender": gender,
                "dateOfBirth": date_of_birth,
                "classId": class_id,
                "className": class_name,
                "userId": user_id,
                "parentUserId": parent_user_id,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn check_date_of_birth(dob: &str) -> Result<(), HandlerErr> {
    chrono::NaiveDate::parse_from_str(dob, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| HandlerErr::bad_params("dateOfBirth must be YYYY-MM-DD"))
}

fn students_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageStudents)?;

    let p = &req.params;
    let admission_number = required_str(p, "admissionNumber")?;
    let first_name = required_str(p, "firstName")?;
    let last_name = required_str(p, "lastName")?;
    let gender = optional_str(p, "gender")?;
    let date_of_birth = optional_str(p, "dateOfBirth")?;
    if let Some(dob) = date_of_birth.as_deref() {
        check_date_of_birth(dob)?;
    }
    let class_id = optional_str(p, "classId")?;
    if let Some(class_id) = class_id.as_deref() {
        ensure_exists(conn, "classrooms", class_id, "class")?;
    }
    let user_id = optional_str(p, "userId")?;
    if let Some(user_id) = user_id.as_deref() {
        ensure_user_role(conn, user_id, Role::Student, "userId")?;
    }
    let parent_user_id = optional_str(p, "parentUserId")?;
    if let Some(parent_id) = parent_user_id.as_deref() {
        ensure_user_role(conn, parent_id, Role::Parent, "parentUserId")?;
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
            id, admission_number, first_name, last_name, gender, date_of_birth,
            class_id, user_id, parent_user_id
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &admission_number,
            &first_name,
            &last_name,
            &gender,
            &date_of_birth,
            &class_id,
            &user_id,
            &parent_user_id,
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::new(
                "conflict",
                "admission number or student login is already in use",
            )
            .with_details(json!({ "admissionNumber": admission_number }))
        } else {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" }))
        }
    })?;

    Ok(json!({ "studentId": student_id, "admissionNumber": admission_number }))
}

/// Moving a student leaves their earlier grades tagged with the class they
/// were recorded in; rankings follow the student to the new class.
fn students_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageStudents)?;
    let student_id = required_str(&req.params, "studentId")?;
    let patch = patch_object(&req.params)?;

    let previous_class: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(previous_class) = previous_class else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };

    let mut update = SqlPatch::default();
    for (key, column) in [
        ("admissionNumber", "admission_number"),
        ("firstName", "first_name"),
        ("lastName", "last_name"),
    ] {
        if let Some(v) = patch_required_str(patch, key)? {
            update.set_text(key, column, Some(v));
        }
    }
    if let Some(gender) = patch_nullable_str(patch, "gender")? {
        update.set_text("gender", "gender", gender);
    }
    if let Some(dob) = patch_nullable_str(patch, "dateOfBirth")? {
        if let Some(d) = dob.as_deref() {
            check_date_of_birth(d)?;
        }
        update.set_text("dateOfBirth", "date_of_birth", dob);
    }
    let new_class = patch_nullable_str(patch, "classId")?;
    if let Some(class_id) = new_class.clone() {
        if let Some(id) = class_id.as_deref() {
            ensure_exists(conn, "classrooms", id, "class")?;
        }
        update.set_text("classId", "class_id", class_id);
    }
    if let Some(user_id) = patch_nullable_str(patch, "userId")? {
        if let Some(id) = user_id.as_deref() {
            ensure_user_role(conn, id, Role::Student, "userId")?;
        }
        update.set_text("userId", "user_id", user_id);
    }
    if let Some(parent_id) = patch_nullable_str(patch, "parentUserId")? {
        if let Some(id) = parent_id.as_deref() {
            ensure_user_role(conn, id, Role::Parent, "parentUserId")?;
        }
        update.set_text("parentUserId", "parent_user_id", parent_id);
    }
    if update.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }

    update.execute(conn, "students", &student_id).map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::new(
                "conflict",
                "admission number or student login is already in use",
            )
        } else {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "students" }))
        }
    })?;

    let class_id = new_class.unwrap_or(previous_class.clone());
    if class_id != previous_class {
        tracing::info!(
            student_id = %student_id,
            from = previous_class.as_deref().unwrap_or("-"),
            to = class_id.as_deref().unwrap_or("-"),
            "student moved"
        );
    }
    Ok(json!({
        "studentId": student_id,
        "classId": class_id,
        "updated": update.fields(),
    }))
}

/// Removes the student together with their grades.
fn students_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageStudents)?;
    let student_id = required_str(&req.params, "studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let grades = tx
        .execute("DELETE FROM grades WHERE student_id = ?", [&student_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "grades" })))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "students" }))
        })?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    Ok(json!({ "ok": true, "gradesRemoved": grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.create" => students_create(state, req),
        "students.update" => students_update(state, req),
        "students.delete" => students_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
