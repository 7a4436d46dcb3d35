use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Handler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[Handler] = &[
    handlers::core::try_handle,
    handlers::auth::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
    handlers::grades::try_handle,
    handlers::reports::try_handle,
    handlers::timetable::try_handle,
    handlers::settings::try_handle,
    handlers::dashboard::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");

    let resp = HANDLERS
        .iter()
        .find_map(|handle| handle(state, &req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });

    if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let error = resp.get("error");
        tracing::warn!(
            id = %req.id,
            method = %req.method,
            code = error.and_then(|e| e.get("code")).and_then(|v| v.as_str()).unwrap_or(""),
            message = error.and_then(|e| e.get("message")).and_then(|v| v.as_str()).unwrap_or(""),
            "request failed"
        );
    }
    resp
}
