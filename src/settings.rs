//! State directory layout rooted at `$HOME`.
//!
//! Every persistent artifact lives under the home directory: run history in
//! `$HOME/history`, per-step log files in `$HOME/logs`, and the scheduler's
//! DAG catalog in `$HOME/dags`. Paths are resolved on each call so tests can
//! re-root the whole tree by pointing `HOME` at a temp directory.

use std::path::PathBuf;

/// Root directory for all dagflow state.
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Directory holding per-DAG run history.
pub fn history_dir() -> PathBuf {
    home_dir().join("history")
}

/// Directory holding per-run step logs.
pub fn log_dir() -> PathBuf {
    home_dir().join("logs")
}

/// Default DAG catalog directory scanned by the cron runner.
pub fn dags_dir() -> PathBuf {
    home_dir().join("dags")
}
