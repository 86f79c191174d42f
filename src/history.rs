//! Crash-persistent run history: append-only JSONL files.
//!
//! Each run owns one file under
//! `<root>/<dag-dir>/<YYYYMMDD>/<name>.<timestamp>.<reqid8>.dat`, where
//! `<dag-dir>` is derived from the DAG's file location so same-named DAGs
//! never collide. Every line is a full status snapshot; readers treat the
//! last non-empty line as authoritative.

use crate::dag::{location_hash, sanitize_name};
use crate::error::{Error, Result};
use crate::settings;
use crate::status::{Status, StatusFile};
use chrono::{DateTime, Duration, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct HistoryStore {
    root: PathBuf,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    /// Store rooted at `$HOME/history`.
    pub fn new() -> Self {
        Self {
            root: settings::history_dir(),
        }
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Per-DAG directory: sanitized file stem plus a location hash.
    fn dir_for(&self, location: &Path) -> PathBuf {
        let stem = location
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        self.root
            .join(format!("{}-{}", sanitize_name(&stem), location_hash(location)))
    }

    /// Open the JSONL writer for a new run.
    pub fn open_writer(
        &self,
        location: &Path,
        name: &str,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<HistoryWriter> {
        let dir = self.dir_for(location).join(now.format("%Y%m%d").to_string());
        std::fs::create_dir_all(&dir)?;
        let prefix = &request_id[..request_id.len().min(8)];
        let path = dir.join(format!(
            "{}.{}.{}.dat",
            sanitize_name(name),
            now.format("%Y%m%d.%H%M%S.%3f"),
            prefix
        ));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(HistoryWriter {
            path,
            file: Mutex::new(file),
        })
    }

    /// Latest status recorded today, with the correct-running rule applied.
    pub fn read_status_today(&self, location: &Path) -> Result<Status> {
        let dir = self
            .dir_for(location)
            .join(Utc::now().format("%Y%m%d").to_string());
        let files = list_status_files(&dir);
        let latest = files.last().ok_or(Error::NoStatusDataToday)?;
        let mut status = read_status_file(latest)?;
        status.correct_running_status();
        Ok(status)
    }

    /// The `n` most recent statuses, newest first.
    pub fn read_status_hist(&self, location: &Path, n: usize) -> Vec<StatusFile> {
        let mut out = Vec::new();
        for file in self.all_files_newest_first(location) {
            if out.len() >= n {
                break;
            }
            match read_status_file(&file) {
                Ok(mut status) => {
                    status.correct_running_status();
                    out.push(StatusFile { file, status });
                }
                Err(e) => warn!("skipping unreadable history file {:?}: {}", file, e),
            }
        }
        out
    }

    /// Find the run with the given request id.
    pub fn find_by_request_id(&self, location: &Path, request_id: &str) -> Result<StatusFile> {
        for file in self.all_files_newest_first(location) {
            if let Ok(mut status) = read_status_file(&file) {
                if status.request_id == request_id {
                    status.correct_running_status();
                    return Ok(StatusFile { file, status });
                }
            }
        }
        Err(Error::RequestIdNotFound(request_id.to_string()))
    }

    /// Rename the DAG's history directory after its file moved. A plain
    /// rename where possible, copy+delete across filesystems.
    pub fn move_data(&self, old_location: &Path, new_location: &Path) -> Result<()> {
        let old_dir = self.dir_for(old_location);
        if !old_dir.exists() {
            return Ok(());
        }
        let new_dir = self.dir_for(new_location);
        if std::fs::rename(&old_dir, &new_dir).is_ok() {
            return Ok(());
        }
        copy_dir_recursive(&old_dir, &new_dir)?;
        std::fs::remove_dir_all(&old_dir)?;
        Ok(())
    }

    /// Drop all history for a DAG.
    pub fn remove_all(&self, location: &Path) -> Result<()> {
        let dir = self.dir_for(location);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Purge files older than the retention window. Zero retention deletes
    /// every prior run; the active run's file (`current`) is never purged.
    pub fn remove_old(
        &self,
        location: &Path,
        retention_days: u32,
        current: Option<&Path>,
    ) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        for file in self.all_files_newest_first(location) {
            if current.map(|c| c == file).unwrap_or(false) {
                continue;
            }
            let Ok(meta) = std::fs::metadata(&file) else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let modified: DateTime<Utc> = modified.into();
            if modified < cutoff {
                if let Err(e) = std::fs::remove_file(&file) {
                    warn!("failed to purge history file {:?}: {}", file, e);
                }
            }
        }
        Ok(())
    }

    /// Every status file for a DAG across all date directories, sorted
    /// newest first (timestamps embedded in the names sort correctly).
    fn all_files_newest_first(&self, location: &Path) -> Vec<PathBuf> {
        let dag_dir = self.dir_for(location);
        let Ok(dates) = std::fs::read_dir(&dag_dir) else {
            return Vec::new();
        };
        let mut date_dirs: Vec<PathBuf> = dates
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        date_dirs.sort();
        date_dirs.reverse();

        let mut out = Vec::new();
        for dir in date_dirs {
            let mut files = list_status_files(&dir);
            files.reverse();
            out.extend(files);
        }
        out
    }
}

/// Single writer per run; flushed after every line so readers and crash
/// recovery always see complete snapshots.
pub struct HistoryWriter {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl HistoryWriter {
    pub fn write(&self, status: &Status) -> Result<()> {
        let line = status.to_json()?;
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn list_status_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "dat")
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// Last non-empty line wins; empty files are "no data", not corruption.
fn read_status_file(path: &Path) -> Result<Status> {
    let content = std::fs::read_to_string(path)?;
    let line = content
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or(Error::NoStatusData)?;
    Status::from_json(line)
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)?.flatten() {
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir_recursive(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}
