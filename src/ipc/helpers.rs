use crate::auth::{self, CurrentUser};
pub use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::policy::{self, Action, AuthError, Role, StudentLink};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

/// Absent, null and blank all read as `None`.
pub fn optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!("{} must be a string", key)));
            };
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn patch_object(
    params: &serde_json::Value,
) -> Result<&serde_json::Map<String, serde_json::Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing/invalid patch"))
}

/// `None` when the key is absent. A present key must be a non-blank string.
pub fn patch_required_str(
    patch: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    let Some(v) = patch.get(key) else {
        return Ok(None);
    };
    let s = v
        .as_str()
        .map(str::trim)
        .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be a string", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(Some(s.to_string()))
}

/// `None` when absent, `Some(None)` when cleared with null or a blank string.
pub fn patch_nullable_str(
    patch: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<Option<String>>, HandlerErr> {
    match patch.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(Some(None)),
        Some(v) => {
            let s = v.as_str().map(str::trim).ok_or_else(|| {
                HandlerErr::bad_params(format!("patch.{} must be a string or null", key))
            })?;
            Ok(Some(if s.is_empty() { None } else { Some(s.to_string()) }))
        }
    }
}

/// `column = ?` fragments for a partial UPDATE, in the order they were set.
#[derive(Default)]
pub struct SqlPatch {
    set_parts: Vec<String>,
    binds: Vec<SqlValue>,
    fields: Vec<&'static str>,
}

impl SqlPatch {
    pub fn set(&mut self, field: &'static str, column: &str, value: SqlValue) {
        self.set_parts.push(format!("{} = ?", column));
        self.binds.push(value);
        self.fields.push(field);
    }

    pub fn set_text(&mut self, field: &'static str, column: &str, value: Option<String>) {
        self.set(field, column, value.map_or(SqlValue::Null, SqlValue::Text));
    }

    pub fn is_empty(&self) -> bool {
        self.set_parts.is_empty()
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    /// Returns the number of rows changed (0 when `id` does not exist).
    pub fn execute(&self, conn: &Connection, table: &str, id: &str) -> rusqlite::Result<usize> {
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            table,
            self.set_parts.join(", ")
        );
        let mut binds = self.binds.clone();
        binds.push(SqlValue::Text(id.to_string()));
        conn.execute(&sql, params_from_iter(binds))
    }
}

pub fn score_param(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    let score = params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be between 0 and 100",
            key
        ))
        .with_details(serde_json::json!({ "score": score })));
    }
    Ok(score)
}

pub fn current_user(conn: &Connection, req: &Request) -> Result<CurrentUser, HandlerErr> {
    let token = req
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;
    Ok(auth::resolve_session(conn, token)?)
}

/// Resolves the caller and applies the role policy for `action`.
pub fn require(
    conn: &Connection,
    req: &Request,
    action: Action,
) -> Result<CurrentUser, HandlerErr> {
    let user = current_user(conn, req)?;
    policy::authorize(user.role, action)?;
    Ok(user)
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?", table),
        [id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

pub fn ensure_exists(
    conn: &Connection,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::new("not_found", format!("{} not found", what)))
    }
}

pub fn user_role(conn: &Connection, user_id: &str) -> Result<Option<Role>, HandlerErr> {
    let raw: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(raw.as_deref().and_then(Role::parse))
}

/// A referenced user must exist and hold `role`.
pub fn ensure_user_role(
    conn: &Connection,
    user_id: &str,
    role: Role,
    key: &str,
) -> Result<(), HandlerErr> {
    match user_role(conn, user_id)? {
        None => Err(HandlerErr::new("not_found", format!("{} not found", key))),
        Some(r) if r == role => Ok(()),
        Some(r) => Err(HandlerErr::bad_params(format!(
            "{} must reference a {} account",
            key,
            role.as_str()
        ))
        .with_details(serde_json::json!({ "role": r.as_str() }))),
    }
}

/// Students and parents only see the student records linked to their login.
pub fn ensure_can_view_student(
    conn: &Connection,
    user: &CurrentUser,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let links: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT user_id, parent_user_id FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((student_user, parent_user)) = links else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    if policy::permits(user.role, Action::ViewAnyStudent) {
        return Ok(());
    }
    let linked = match policy::student_link(user.role) {
        Some(StudentLink::OwnLogin) => student_user,
        Some(StudentLink::Guardian) => parent_user,
        None => None,
    };
    if linked.as_deref() == Some(user.user_id.as_str()) {
        Ok(())
    } else {
        Err(AuthError::NotOwner.into())
    }
}

pub fn teacher_is_assigned(
    conn: &Connection,
    teacher_id: &str,
    class_id: &str,
    subject_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM class_assignments WHERE class_id = ? AND subject_id = ? AND teacher_id = ?",
        (class_id, subject_id, teacher_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

pub fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
