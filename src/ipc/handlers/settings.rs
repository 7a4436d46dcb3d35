use crate::db;
use crate::ipc::helpers::{db_conn, require, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::policy::Action;
use serde_json::json;

const SCHOOL_SETTINGS_KEY: &str = "school";

fn load_school_settings(conn: &rusqlite::Connection) -> Result<serde_json::Value, HandlerErr> {
    let stored = db::settings_get_json(conn, SCHOOL_SETTINGS_KEY)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?
        .unwrap_or_else(|| json!({}));
    Ok(json!({
        "schoolName": stored.get("schoolName").cloned().unwrap_or(serde_json::Value::Null),
        "currentTerm": stored.get("currentTerm").cloned().unwrap_or(serde_json::Value::Null),
        "currentYear": stored.get("currentYear").cloned().unwrap_or(serde_json::Value::Null),
    }))
}

fn settings_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ViewDirectory)?;
    Ok(json!({ "settings": load_school_settings(conn)? }))
}

/// Applies a partial update; keys set to null are cleared.
fn settings_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageSettings)?;

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch object"));
    };

    let mut current = load_school_settings(conn)?;
    for (key, value) in patch {
        let valid = match key.as_str() {
            "schoolName" | "currentTerm" => value.is_null() || value.is_string(),
            "currentYear" => {
                value.is_null() || value.as_i64().map(|y| (1900..=2999).contains(&y)).unwrap_or(false)
            }
            _ => {
                return Err(HandlerErr::bad_params(format!("unknown setting: {}", key))
                    .with_details(json!({ "key": key })));
            }
        };
        if !valid {
            return Err(HandlerErr::bad_params(format!("invalid value for {}", key))
                .with_details(json!({ "key": key, "value": value })));
        }
        current[key.as_str()] = value.clone();
    }

    db::settings_set_json(conn, SCHOOL_SETTINGS_KEY, &current)
        .map_err(|e| HandlerErr::new("db_update_failed", format!("{e:#}")))?;
    Ok(json!({ "settings": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "settings.get" => settings_get(state, req),
        "settings.update" => settings_update(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
