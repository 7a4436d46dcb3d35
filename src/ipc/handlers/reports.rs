use crate::ipc::helpers::{
    db_conn, ensure_can_view_student, require, required_str, respond, teacher_is_assigned,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{self, Action};
use crate::reports::{self, parse_report_filters};
use serde_json::json;

fn to_json<T: serde::Serialize>(model: &T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(model).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn reports_student(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require(conn, req, Action::ViewStudentGrades)?;
    let student_id = required_str(&req.params, "studentId")?;
    ensure_can_view_student(conn, &user, &student_id)?;
    let filters = parse_report_filters(&req.params)?;

    to_json(&reports::compute_student_report(conn, &student_id, &filters)?)
}

fn reports_class(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewClassReports)?;
    let class_id = required_str(&req.params, "classId")?;
    let filters = parse_report_filters(&req.params)?;

    to_json(&reports::compute_class_report(conn, &class_id, &filters)?)
}

fn reports_class_ranking(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewClassReports)?;
    let class_id = required_str(&req.params, "classId")?;
    let filters = parse_report_filters(&req.params)?;

    let ranking = reports::compute_class_ranking(conn, &class_id, &filters)?;
    tracing::debug!(
        class_id = %class_id,
        ranked = ranking.rows.len(),
        students = ranking.student_count,
        "class ranking computed"
    );
    to_json(&ranking)
}

fn reports_teacher_grades(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require(conn, req, Action::ViewTeacherReports)?;
    let class_id = required_str(&req.params, "classId")?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let filters = parse_report_filters(&req.params)?;

    if !policy::permits(user.role, Action::ViewAnyTeacherReport)
        && !teacher_is_assigned(conn, &user.user_id, &class_id, &subject_id)?
    {
        return Err(HandlerErr::new(
            "forbidden",
            "you are not assigned to this class and subject",
        )
        .with_details(json!({ "classId": class_id, "subjectId": subject_id })));
    }

    to_json(&reports::compute_teacher_grades(
        conn,
        &class_id,
        &subject_id,
        &filters,
    )?)
}

fn reports_performance_summary(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewPerformanceSummary)?;
    let filters = parse_report_filters(&req.params)?;

    to_json(&reports::compute_performance_summary(conn, &filters)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.student" => reports_student(state, req),
        "reports.class" => reports_class(state, req),
        "reports.classRanking" => reports_class_ranking(state, req),
        "reports.teacherGrades" => reports_teacher_grades(state, req),
        "reports.performanceSummary" => reports_performance_summary(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
