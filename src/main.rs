mod auth;
mod backup;
mod config;
mod db;
mod grading;
mod ipc;
mod logging;
mod policy;
mod reports;
mod timetable;

use clap::Parser;
use serde_json::json;
use std::io::{self, BufRead, Write};

fn main() -> anyhow::Result<()> {
    let config = config::Config::parse();
    logging::init_logging(&config.log_directive())?;

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        session_ttl: config.session_ttl(),
    };

    if let Some(path) = config.workspace.clone() {
        // A bad startup workspace is reported but the sidecar still serves
        // requests; the host can select another one.
        match db::open_db(&path) {
            Ok(conn) => {
                tracing::info!(workspace = %path.display(), "workspace opened");
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => {
                let error = format!("{e:#}");
                tracing::error!(workspace = %path.display(), %error, "failed to open workspace");
            }
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        session_ttl_minutes = config.session_ttl_minutes,
        "schoold ready"
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                // No id to echo back.
                tracing::warn!(error = %e, "unparseable request line");
                json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() },
                })
            }
        };

        writeln!(stdout, "{}", resp)?;
        stdout.flush()?;
    }

    Ok(())
}
