use crate::db;
use crate::ipc::helpers::{db_conn, require, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::policy::{Action, Role};
use serde_json::json;

fn dashboard_stats(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewDashboard)?;
    let count =
        |table: &str| db::count_rows(conn, table).map_err(|e| HandlerErr::db("db_query_failed", e));

    let mut stmt = conn
        .prepare("SELECT role, COUNT(*) FROM users GROUP BY role")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let role_counts: Vec<(String, i64)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let mut by_role = serde_json::Map::new();
    for role in [Role::Admin, Role::Teacher, Role::Parent, Role::Student] {
        let n = role_counts
            .iter()
            .find(|(raw, _)| Role::parse(raw) == Some(role))
            .map_or(0, |(_, n)| *n);
        by_role.insert(role.as_str().to_string(), json!(n));
    }

    let teachers = by_role.get("teacher").cloned().unwrap_or_else(|| json!(0));

    Ok(json!({
        "users": count("users")?,
        "usersByRole": by_role,
        "teachers": teachers,
        "students": count("students")?,
        "classes": count("classrooms")?,
        "subjects": count("subjects")?,
        "grades": count("grades")?,
        "timetableEntries": count("timetable_entries")?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "dashboard.stats" => dashboard_stats(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
