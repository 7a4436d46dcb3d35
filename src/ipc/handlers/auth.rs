use crate::auth::{self, CurrentUser};
use crate::db;
use crate::ipc::helpers::{
    current_user, db_conn, is_foreign_key_violation, is_unique_violation, patch_object,
    patch_required_str, require, required_str, respond, user_role, HandlerErr, SqlPatch,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{Action, Role};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 8;

struct NewUser {
    name: String,
    email: String,
    password: String,
}

fn check_email(email: &str) -> Result<(), HandlerErr> {
    if email.contains('@') {
        Ok(())
    } else {
        Err(HandlerErr::bad_params("email is not valid"))
    }
}

fn check_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("role must be one of admin, teacher, parent, student")
            .with_details(json!({ "role": raw }))
    })
}

fn parse_new_user(params: &serde_json::Value) -> Result<NewUser, HandlerErr> {
    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?;
    check_email(&email)?;
    // Not trimmed: whitespace is part of the password.
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    check_password(&password)?;
    Ok(NewUser {
        name,
        email,
        password,
    })
}

fn insert_user(conn: &Connection, user: &NewUser, role: Role) -> Result<CurrentUser, HandlerErr> {
    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, name, email, password_hash, role, created_at) VALUES(?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &user.name,
            &user.email,
            auth::hash_password(&user.password),
            role.as_str(),
            auth::now_timestamp(),
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::new("conflict", "email already registered")
                .with_details(json!({ "email": user.email }))
        } else {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "users" }))
        }
    })?;
    Ok(CurrentUser {
        user_id,
        name: user.name.clone(),
        email: user.email.clone(),
        role,
    })
}

fn bootstrap(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let new_user = parse_new_user(&req.params)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let existing = db::count_rows(&tx, "users").map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if existing > 0 {
        return Err(HandlerErr::new(
            "conflict",
            "workspace already has accounts; sign in as an admin",
        ));
    }
    let user = insert_user(&tx, &new_user, Role::Admin)?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    tracing::info!(user_id = %user.user_id, "bootstrap admin created");
    Ok(json!({ "user": user }))
}

fn login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let email = required_str(&req.params, "email")?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let user = auth::check_credentials(conn, &email, password)?;
    let session = auth::issue_session(conn, &user.user_id, state.session_ttl)?;
    tracing::info!(user_id = %user.user_id, role = user.role.as_str(), "login");

    Ok(json!({
        "token": session.token,
        "expiresAt": session.expires_at,
        "user": user,
    }))
}

fn logout(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = current_user(conn, req)?;
    let token = req.token.as_deref().unwrap_or_default().trim();
    let removed = auth::revoke_session(conn, token)
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tracing::info!(user_id = %user.user_id, "logout");
    Ok(json!({ "revoked": removed > 0 }))
}

fn whoami(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let user = current_user(conn, req)?;
    Ok(json!({ "user": user }))
}

fn users_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageUsers)?;

    let mut stmt = conn
        .prepare("SELECT id, name, email, role, created_at FROM users ORDER BY name, email")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let users = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let email: String = r.get(2)?;
            let role: String = r.get(3)?;
            let created_at: String = r.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "email": email,
                "role": role,
                "createdAt": created_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "users": users }))
}

fn users_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    require(conn, req, Action::ManageUsers)?;

    let role = parse_role(&required_str(&req.params, "role")?)?;
    let new_user = parse_new_user(&req.params)?;
    let user = insert_user(conn, &new_user, role)?;
    Ok(json!({ "userId": user.user_id, "user": user }))
}

/// Rows that depend on a user's current role.
fn role_references(conn: &Connection, user_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM class_assignments WHERE teacher_id = ?1)
         + (SELECT COUNT(*) FROM classrooms WHERE class_teacher_id = ?1)
         + (SELECT COUNT(*) FROM timetable_entries WHERE teacher_id = ?1)
         + (SELECT COUNT(*) FROM grades WHERE teacher_id = ?1)
         + (SELECT COUNT(*) FROM students WHERE user_id = ?1 OR parent_user_id = ?1)",
        [user_id],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn users_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let caller = require(conn, req, Action::ManageUsers)?;
    let user_id = required_str(&req.params, "userId")?;
    let patch = patch_object(&req.params)?;
    let Some(current_role) = user_role(conn, &user_id)? else {
        return Err(HandlerErr::new("not_found", "user not found"));
    };

    let mut update = SqlPatch::default();
    if let Some(name) = patch_required_str(patch, "name")? {
        update.set_text("name", "name", Some(name));
    }
    if let Some(email) = patch_required_str(patch, "email")? {
        check_email(&email)?;
        update.set_text("email", "email", Some(email));
    }
    if let Some(raw) = patch_required_str(patch, "role")? {
        let role = parse_role(&raw)?;
        if role != current_role {
            if user_id == caller.user_id {
                return Err(HandlerErr::new("conflict", "cannot change your own role"));
            }
            let references = role_references(conn, &user_id)?;
            if references > 0 {
                return Err(HandlerErr::new(
                    "conflict",
                    "user is still linked to school records in their current role",
                )
                .with_details(json!({ "userId": user_id, "references": references })));
            }
        }
        update.set_text("role", "role", Some(role.as_str().to_string()));
    }
    let password_changed = match patch.get("password") {
        None => false,
        Some(v) => {
            let password = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params("patch.password must be a string"))?;
            check_password(password)?;
            update.set_text("password", "password_hash", Some(auth::hash_password(password)));
            true
        }
    };
    if update.is_empty() {
        return Err(HandlerErr::bad_params(
            "patch must include name, email, role or password",
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    update.execute(&tx, "users", &user_id).map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::new("conflict", "email already registered")
        } else {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "users" }))
        }
    })?;
    let sessions_revoked = if password_changed && user_id != caller.user_id {
        auth::revoke_user_sessions(&tx, &user_id)
            .map_err(|e| HandlerErr::db("db_delete_failed", e))?
    } else {
        0
    };
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    tracing::info!(user_id = %user_id, fields = ?update.fields(), "user updated");
    Ok(json!({
        "userId": user_id,
        "updated": update.fields(),
        "sessionsRevoked": sessions_revoked,
    }))
}

fn users_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let caller = require(conn, req, Action::ManageUsers)?;
    let user_id = required_str(&req.params, "userId")?;
    if user_id == caller.user_id {
        return Err(HandlerErr::new("conflict", "cannot delete your own account"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    auth::revoke_user_sessions(&tx, &user_id).map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    let removed = tx
        .execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                HandlerErr::new("conflict", "user is still referenced by school records")
                    .with_details(json!({ "userId": user_id }))
            } else {
                HandlerErr::db("db_delete_failed", e)
            }
        })?;
    if removed == 0 {
        return Err(HandlerErr::new("not_found", "user not found"));
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.bootstrap" => bootstrap(state, req),
        "auth.login" => login(state, req),
        "auth.logout" => logout(state, req),
        "auth.whoami" => whoami(state, req),
        "users.list" => users_list(state, req),
        "users.create" => users_create(state, req),
        "users.update" => users_update(state, req),
        "users.delete" => users_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
