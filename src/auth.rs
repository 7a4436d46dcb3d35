use crate::policy::{AuthError, Role};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

const HASH_SCHEME: &str = "sha256";
const HASH_ITERATIONS: u32 = 100_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
}

fn stretch(password: &str, salt: &str, iterations: u32) -> Vec<u8> {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..iterations {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(password.as_bytes())
            .finalize();
    }
    digest.to_vec()
}

/// `sha256$<iterations>$<salt>$<hex digest>`
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = stretch(password, &salt, HASH_ITERATIONS);
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        HASH_ITERATIONS,
        salt,
        hex::encode(digest)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(expected_hex), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != HASH_SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    if iterations == 0 {
        return false;
    }
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let actual = stretch(password, salt, iterations);
    actual.as_slice().ct_eq(expected.as_slice()).into()
}

/// Sessions are stored by digest so the database never holds a usable token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

fn row_to_user(
    user_id: String,
    name: String,
    email: String,
    role_raw: String,
) -> Result<CurrentUser, AuthError> {
    let role = Role::parse(&role_raw).ok_or(AuthError::InvalidToken)?;
    Ok(CurrentUser {
        user_id,
        name,
        email,
        role,
    })
}

pub fn check_credentials(
    conn: &Connection,
    email: &str,
    password: &str,
) -> Result<CurrentUser, AuthError> {
    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT id, name, email, role, password_hash FROM users WHERE email = ? COLLATE NOCASE",
            [email.trim()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((id, name, email, role, password_hash)) = row else {
        return Err(AuthError::BadCredentials);
    };
    if !verify_password(password, &password_hash) {
        return Err(AuthError::BadCredentials);
    }
    row_to_user(id, name, email, role).map_err(|_| AuthError::BadCredentials)
}

pub struct IssuedSession {
    pub token: String,
    pub expires_at: String,
}

pub fn issue_session(
    conn: &Connection,
    user_id: &str,
    ttl: ChronoDuration,
) -> Result<IssuedSession, AuthError> {
    let now = Utc::now();
    let expires_at = timestamp(now + ttl);
    let token = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );

    conn.execute(
        "DELETE FROM sessions WHERE expires_at <= ?",
        [timestamp(now)],
    )?;
    conn.execute(
        "INSERT INTO sessions(token_digest, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (token_digest(&token), user_id, timestamp(now), &expires_at),
    )?;

    Ok(IssuedSession { token, expires_at })
}

pub fn resolve_session(conn: &Connection, token: &str) -> Result<CurrentUser, AuthError> {
    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT u.id, u.name, u.email, u.role, s.expires_at
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_digest = ?",
            [token_digest(token)],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((id, name, email, role, expires_at)) = row else {
        return Err(AuthError::InvalidToken);
    };

    let expires_at = DateTime::parse_from_rfc3339(&expires_at)
        .map_err(|_| AuthError::InvalidToken)?
        .with_timezone(&Utc);
    if expires_at <= Utc::now() {
        return Err(AuthError::InvalidToken);
    }

    row_to_user(id, name, email, role)
}

pub fn revoke_session(conn: &Connection, token: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM sessions WHERE token_digest = ?",
        [token_digest(token)],
    )
}

/// Drops every session a user holds, e.g. after a password reset.
pub fn revoke_user_sessions(conn: &Connection, user_id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM sessions WHERE user_id = ?", [user_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_roundtrip() {
        let stored = hash_password("correct horse");
        assert!(stored.starts_with("sha256$100000$"));
        assert!(verify_password("correct horse", &stored));
        assert!(!verify_password("correct horse ", &stored));
        assert!(!verify_password("", &stored));
    }

    #[test]
    fn hashes_are_salted() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn malformed_hashes_never_verify() {
        assert!(!verify_password("pw", ""));
        assert!(!verify_password("pw", "pw"));
        assert!(!verify_password("pw", "md5$1$salt$abcd"));
        assert!(!verify_password("pw", "sha256$0$salt$abcd"));
        assert!(!verify_password("pw", "sha256$x$salt$abcd"));
        assert!(!verify_password("pw", "sha256$1$salt$not-hex"));
        assert!(!verify_password("pw", "sha256$1$salt$abcd$extra"));
    }

    #[test]
    fn low_iteration_hash_still_verifies() {
        let digest = hex::encode(stretch("pw", "salt", 3));
        assert!(verify_password("pw", &format!("sha256$3$salt${}", digest)));
    }

    #[test]
    fn token_digest_is_stable_hex() {
        let d = token_digest("abc");
        assert_eq!(d.len(), 64);
        assert_eq!(d, token_digest("abc"));
        assert_ne!(d, token_digest("abd"));
    }
}
