use crate::auth::{self, CurrentUser};
use crate::ipc::helpers::{
    db_conn, ensure_can_view_student, ensure_exists, optional_i64, optional_str, require,
    required_str, respond, score_param, teacher_is_assigned, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{self, Action, AuthError};
use crate::reports::{self, parse_report_filters};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Without `EditAnyGrade` a caller may only touch grades they recorded.
fn ensure_grade_owner(
    conn: &Connection,
    user: &CurrentUser,
    grade_id: &str,
) -> Result<(), HandlerErr> {
    let teacher_id: Option<String> = conn
        .query_row(
            "SELECT teacher_id FROM grades WHERE id = ?",
            [grade_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(teacher_id) = teacher_id else {
        return Err(HandlerErr::new("not_found", "grade not found"));
    };
    if teacher_id != user.user_id && !policy::permits(user.role, Action::EditAnyGrade) {
        return Err(AuthError::NotOwner.into());
    }
    Ok(())
}

fn grades_add(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require(conn, req, Action::RecordGrades)?;

    let p = &req.params;
    let student_id = required_str(p, "studentId")?;
    let subject_id = required_str(p, "subjectId")?;
    let score = score_param(p, "score")?;
    let exam = optional_str(p, "exam")?;
    let term = optional_str(p, "term")?;
    let year = optional_i64(p, "year")?;

    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    let class_id: Option<Option<String>> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(class_id) = class_id else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    let Some(class_id) = class_id else {
        return Err(HandlerErr::bad_params("student is not enrolled in a class"));
    };
    if !teacher_is_assigned(conn, &user.user_id, &class_id, &subject_id)? {
        return Err(HandlerErr::new(
            "forbidden",
            "you are not assigned to teach this subject in the student's class",
        )
        .with_details(json!({ "classId": class_id, "subjectId": subject_id })));
    }

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(
            id, student_id, class_id, subject_id, teacher_id, exam, term, year, score, recorded_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            &class_id,
            &subject_id,
            &user.user_id,
            &exam,
            &term,
            year,
            score,
            auth::now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "grades" })))?;

    Ok(json!({
        "gradeId": grade_id,
        "classId": class_id,
        "score": score,
        "grade": crate::grading::kcse_grade(score),
    }))
}

fn grades_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require(conn, req, Action::RecordGrades)?;
    let grade_id = required_str(&req.params, "gradeId")?;
    ensure_grade_owner(conn, &user, &grade_id)?;

    let p = &req.params;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut changed = Vec::new();
    if p.get("score").is_some() {
        let score = score_param(p, "score")?;
        tx.execute("UPDATE grades SET score = ? WHERE id = ?", (score, &grade_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        changed.push("score");
    }
    for (key, column) in [("exam", "exam"), ("term", "term")] {
        if p.get(key).is_some() {
            let value = optional_str(p, key)?;
            tx.execute(
                &format!("UPDATE grades SET {} = ? WHERE id = ?", column),
                (&value, &grade_id),
            )
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
            changed.push(key);
        }
    }
    if p.get("year").is_some() {
        let year = optional_i64(p, "year")?;
        tx.execute("UPDATE grades SET year = ? WHERE id = ?", (year, &grade_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        changed.push("year");
    }
    if changed.is_empty() {
        return Err(HandlerErr::bad_params(
            "nothing to update; pass score, exam, term or year",
        ));
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    Ok(json!({ "gradeId": grade_id, "updated": changed }))
}

fn grades_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require(conn, req, Action::DeleteGrades)?;
    let grade_id = required_str(&req.params, "gradeId")?;
    ensure_grade_owner(conn, &user, &grade_id)?;

    conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn grades_for_student(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require(conn, req, Action::ViewStudentGrades)?;
    let student_id = required_str(&req.params, "studentId")?;
    ensure_can_view_student(conn, &user, &student_id)?;
    let filters = parse_report_filters(&req.params)?;

    let report = reports::compute_student_report(conn, &student_id, &filters)?;
    Ok(json!({
        "student": report.student,
        "filters": report.filters,
        "grades": report.grades,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.add" => grades_add(state, req),
        "grades.update" => grades_update(state, req),
        "grades.delete" => grades_delete(state, req),
        "grades.forStudent" => grades_for_student(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
