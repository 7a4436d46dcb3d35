use crate::backup;
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{db_conn, require, required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::policy::Action;
use serde_json::json;
use std::path::PathBuf;

fn workspace_path(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn export_bundle(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require(conn, req, Action::ManageBackups)?;
    let out_path = PathBuf::from(required_str(&req.params, "outPath")?);
    let workspace = workspace_path(state)?;

    let summary = backup::export_workspace_bundle(&workspace, &out_path)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;
    tracing::info!(
        user_id = %user.user_id,
        out = %out_path.display(),
        sha256 = %summary.db_sha256,
        "workspace bundle exported"
    );
    Ok(json!({
        "outPath": out_path.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "entryCount": summary.entry_count,
        "dbSha256": summary.db_sha256,
    }))
}

/// Replaces the open database, then reopens the workspace. Sessions come
/// from the restored file, so the caller may need to log in again.
fn import_bundle(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = require(conn, req, Action::ManageBackups)?;
    let in_path = PathBuf::from(required_str(&req.params, "inPath")?);
    if !in_path.is_file() {
        return Err(HandlerErr::new("not_found", "backup file not found")
            .with_details(json!({ "inPath": in_path.to_string_lossy() })));
    }
    let workspace = workspace_path(state)?;

    state.db = None;
    let imported = backup::import_workspace_bundle(&in_path, &workspace)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")));
    // Reopen either way so a failed import leaves the old database usable.
    open_workspace(state, workspace.clone())?;
    let summary = imported?;

    tracing::info!(
        user_id = %user.user_id,
        source = %in_path.display(),
        format = %summary.bundle_format_detected,
        "workspace bundle imported"
    );
    Ok(json!({
        "workspacePath": workspace.to_string_lossy(),
        "bundleFormatDetected": summary.bundle_format_detected,
        "dbSha256": summary.db_sha256,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => export_bundle(state, req),
        "backup.importWorkspaceBundle" => import_bundle(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
