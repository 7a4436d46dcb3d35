use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_LOG_DIRECTIVE: &str = "schoold=info";
const VERBOSE_LOG_DIRECTIVE: &str = "schoold=debug";

/// Startup options. Requests arrive as JSON lines on stdin; responses go to
/// stdout and logs to stderr.
#[derive(Debug, Clone, Parser)]
#[command(name = "schoold")]
#[command(version)]
#[command(about = "School records sidecar: KCSE grading, class ranking and timetables")]
pub struct Config {
    /// Workspace directory to open at startup (holds school.sqlite3).
    #[arg(long, env = "SCHOOLD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Lifetime of a login session.
    #[arg(
        long,
        env = "SCHOOLD_SESSION_TTL_MINUTES",
        default_value_t = 120,
        value_parser = clap::value_parser!(u32).range(1..=10_080)
    )]
    pub session_ttl_minutes: u32,

    /// tracing EnvFilter directive, e.g. "schoold=debug".
    #[arg(long, env = "SCHOOLD_LOG")]
    pub log_filter: Option<String>,

    #[arg(short, long, help = "Log at debug level")]
    pub verbose: bool,
}

impl Config {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.session_ttl_minutes))
    }

    pub fn log_directive(&self) -> String {
        if self.verbose {
            return VERBOSE_LOG_DIRECTIVE.to_string();
        }
        self.log_filter
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_DIRECTIVE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flags() {
        let cfg = Config::try_parse_from([
            "schoold",
            "--workspace",
            "/tmp/school",
            "--session-ttl-minutes",
            "30",
            "--log-filter",
            "schoold=trace",
        ])
        .expect("parse");
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/school")));
        assert_eq!(cfg.session_ttl(), chrono::Duration::minutes(30));
        assert_eq!(cfg.log_directive(), "schoold=trace");
    }

    #[test]
    fn verbose_overrides_filter() {
        let cfg = Config::try_parse_from(["schoold", "-v", "--log-filter", "warn"]).expect("parse");
        assert_eq!(cfg.log_directive(), "schoold=debug");
    }

    #[test]
    fn ttl_out_of_range_is_rejected() {
        assert!(Config::try_parse_from(["schoold", "--session-ttl-minutes", "0"]).is_err());
        assert!(Config::try_parse_from(["schoold", "--session-ttl-minutes", "99999"]).is_err());
    }
}
