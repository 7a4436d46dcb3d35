use crate::ipc::helpers::{
    db_conn, ensure_exists, ensure_user_role, is_foreign_key_violation, is_unique_violation,
    optional_str, patch_nullable_str, patch_object, patch_required_str, require, required_str,
    respond, HandlerErr, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{Action, Role};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn classes_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewDirectory)?;

    // Correlated subquery keeps the count independent of other joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.form_level,
               c.class_teacher_id,
               u.name,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
             FROM classrooms c
             LEFT JOIN users u ON u.id = c.class_teacher_id
             ORDER BY c.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let classes = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let form_level: Option<String> = row.get(2)?;
            let class_teacher_id: Option<String> = row.get(3)?;
            let class_teacher: Option<String> = row.get(4)?;
            let student_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "formLevel": form_level,
                "classTeacherId": class_teacher_id,
                "classTeacher": class_teacher,
                "studentCount": student_count,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageClasses)?;

    let name = required_str(&req.params, "name")?;
    let form_level = optional_str(&req.params, "formLevel")?;
    let class_teacher_id = optional_str(&req.params, "classTeacherId")?;
    if let Some(teacher_id) = class_teacher_id.as_deref() {
        ensure_user_role(conn, teacher_id, Role::Teacher, "classTeacherId")?;
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classrooms(id, name, form_level, class_teacher_id) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &form_level, &class_teacher_id),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::new("conflict", "a class with that name already exists")
                .with_details(json!({ "name": name }))
        } else {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "classrooms" }))
        }
    })?;

    Ok(json!({ "classId": class_id, "name": name, "formLevel": form_level }))
}

fn classes_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageClasses)?;
    let class_id = required_str(&req.params, "classId")?;
    let patch = patch_object(&req.params)?;
    ensure_exists(conn, "classrooms", &class_id, "class")?;

    let mut update = SqlPatch::default();
    if let Some(name) = patch_required_str(patch, "name")? {
        update.set_text("name", "name", Some(name));
    }
    if let Some(form_level) = patch_nullable_str(patch, "formLevel")? {
        update.set_text("formLevel", "form_level", form_level);
    }
    if let Some(teacher_id) = patch_nullable_str(patch, "classTeacherId")? {
        if let Some(id) = teacher_id.as_deref() {
            ensure_user_role(conn, id, Role::Teacher, "classTeacherId")?;
        }
        update.set_text("classTeacherId", "class_teacher_id", teacher_id);
    }
    if update.is_empty() {
        return Err(HandlerErr::bad_params(
            "patch must include name, formLevel or classTeacherId",
        ));
    }

    update.execute(conn, "classrooms", &class_id).map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::new("conflict", "a class with that name already exists")
        } else {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "classrooms" }))
        }
    })?;
    Ok(json!({ "classId": class_id, "updated": update.fields() }))
}

fn count_where(conn: &Connection, table: &str, column: &str, id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE {} = ?", table, column),
        [id],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

/// Timetable entries and assignments go with the class. Enrolled students
/// and recorded grades block the delete.
fn classes_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageClasses)?;
    let class_id = required_str(&req.params, "classId")?;
    ensure_exists(conn, "classrooms", &class_id, "class")?;

    let enrolled = count_where(conn, "students", "class_id", &class_id)?;
    if enrolled > 0 {
        return Err(
            HandlerErr::new("conflict", "move or remove the class's students first")
                .with_details(json!({ "classId": class_id, "studentCount": enrolled })),
        );
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let slots = tx
        .execute("DELETE FROM timetable_entries WHERE class_id = ?", [&class_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "timetable_entries" }))
        })?;
    let assignments = tx
        .execute("DELETE FROM class_assignments WHERE class_id = ?", [&class_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "class_assignments" }))
        })?;
    tx.execute("DELETE FROM classrooms WHERE id = ?", [&class_id])
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                HandlerErr::new("conflict", "class has recorded grades")
                    .with_details(json!({ "classId": class_id }))
            } else {
                HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "classrooms" }))
            }
        })?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    tracing::info!(class_id = %class_id, slots, assignments, "class deleted");
    Ok(json!({
        "ok": true,
        "timetableEntriesRemoved": slots,
        "assignmentsRemoved": assignments,
    }))
}

fn subjects_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewDirectory)?;

    let mut stmt = conn
        .prepare("SELECT id, name, subject_group, compulsory FROM subjects ORDER BY name")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let subjects = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let group: Option<String> = row.get(2)?;
            let compulsory: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "group": group,
                "compulsory": compulsory != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageSubjects)?;

    let name = required_str(&req.params, "name")?;
    let group = optional_str(&req.params, "group")?;
    let compulsory = match req.params.get("compulsory") {
        None => false,
        Some(v) if v.is_null() => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("compulsory must be a boolean"))?,
    };

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, subject_group, compulsory) VALUES(?, ?, ?, ?)",
        (&subject_id, &name, &group, compulsory as i64),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::new("conflict", "a subject with that name already exists")
                .with_details(json!({ "name": name }))
        } else {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "subjects" }))
        }
    })?;

    Ok(json!({ "subjectId": subject_id, "name": name }))
}

fn subjects_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageSubjects)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let patch = patch_object(&req.params)?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let mut update = SqlPatch::default();
    if let Some(name) = patch_required_str(patch, "name")? {
        update.set_text("name", "name", Some(name));
    }
    if let Some(group) = patch_nullable_str(patch, "group")? {
        update.set_text("group", "subject_group", group);
    }
    if let Some(v) = patch.get("compulsory") {
        let compulsory = v
            .as_bool()
            .ok_or_else(|| HandlerErr::bad_params("patch.compulsory must be a boolean"))?;
        update.set("compulsory", "compulsory", SqlValue::Integer(compulsory as i64));
    }
    if update.is_empty() {
        return Err(HandlerErr::bad_params(
            "patch must include name, group or compulsory",
        ));
    }

    update.execute(conn, "subjects", &subject_id).map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::new("conflict", "a subject with that name already exists")
        } else {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "subjects" }))
        }
    })?;
    Ok(json!({ "subjectId": subject_id, "updated": update.fields() }))
}

/// Same rule as classes: schedule and assignments go, grades block.
fn subjects_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageSubjects)?;
    let subject_id = required_str(&req.params, "subjectId")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let slots = tx
        .execute("DELETE FROM timetable_entries WHERE subject_id = ?", [&subject_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "timetable_entries" }))
        })?;
    let assignments = tx
        .execute("DELETE FROM class_assignments WHERE subject_id = ?", [&subject_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "class_assignments" }))
        })?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                HandlerErr::new("conflict", "subject has recorded grades")
                    .with_details(json!({ "subjectId": subject_id }))
            } else {
                HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "subjects" }))
            }
        })?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    Ok(json!({
        "ok": true,
        "timetableEntriesRemoved": slots,
        "assignmentsRemoved": assignments,
    }))
}

/// One teacher per class and subject; saving again replaces the teacher.
fn assignments_save(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageAssignments)?;

    let class_id = required_str(&req.params, "classId")?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let teacher_id = required_str(&req.params, "teacherId")?;
    ensure_exists(conn, "classrooms", &class_id, "class")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    ensure_user_role(conn, &teacher_id, Role::Teacher, "teacherId")?;

    conn.execute(
        "INSERT INTO class_assignments(id, class_id, subject_id, teacher_id) VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, subject_id) DO UPDATE SET teacher_id = excluded.teacher_id",
        (
            Uuid::new_v4().to_string(),
            &class_id,
            &subject_id,
            &teacher_id,
        ),
    )
    .map_err(|e| {
        HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "class_assignments" }))
    })?;

    let assignment_id: String = conn
        .query_row(
            "SELECT id FROM class_assignments WHERE class_id = ? AND subject_id = ?",
            (&class_id, &subject_id),
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({
        "assignmentId": assignment_id,
        "classId": class_id,
        "subjectId": subject_id,
        "teacherId": teacher_id,
    }))
}

fn assignments_list_for_class(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewDirectory)?;
    let class_id = required_str(&req.params, "classId")?;
    ensure_exists(conn, "classrooms", &class_id, "class")?;

    let mut stmt = conn
        .prepare(
            "SELECT ca.id, ca.subject_id, sub.name, ca.teacher_id, u.name
             FROM class_assignments ca
             JOIN subjects sub ON sub.id = ca.subject_id
             JOIN users u ON u.id = ca.teacher_id
             WHERE ca.class_id = ?
             ORDER BY sub.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let assignments = stmt
        .query_map([&class_id], |row| {
            let id: String = row.get(0)?;
            let subject_id: String = row.get(1)?;
            let subject: String = row.get(2)?;
            let teacher_id: String = row.get(3)?;
            let teacher: String = row.get(4)?;
            Ok(json!({
                "id": id,
                "subjectId": subject_id,
                "subject": subject,
                "teacherId": teacher_id,
                "teacher": teacher,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "classId": class_id, "assignments": assignments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.list" => classes_list(state, req),
        "classes.create" => classes_create(state, req),
        "classes.update" => classes_update(state, req),
        "classes.delete" => classes_delete(state, req),
        "subjects.list" => subjects_list(state, req),
        "subjects.create" => subjects_create(state, req),
        "subjects.update" => subjects_update(state, req),
        "subjects.delete" => subjects_delete(state, req),
        "assignments.save" => assignments_save(state, req),
        "assignments.listForClass" => assignments_list_for_class(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
