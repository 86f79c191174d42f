//! Scheduled job over one DAG, plus the catalog entry reader.

use super::{Entry, EntryKind, EntryReader, Job};
use crate::controller::DagController;
use crate::dag::{builder, Dag, Schedule};
use crate::error::{Error, Result};
use crate::status::RunStatus;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// A cron-fired action against one DAG. `start` spawns the agent binary as
/// a child in its own process group; `stop` goes through the control
/// socket; `restart` delegates to the binary's restart command.
pub struct DagJob {
    pub dag: Arc<Dag>,
    pub bin: String,
    /// The fire time this job was materialized for.
    pub next: DateTime<Utc>,
}

impl fmt::Display for DagJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dag.name)
    }
}

#[async_trait]
impl Job for DagJob {
    async fn start(&self) -> Result<()> {
        let controller = DagController::new(self.dag.clone());
        let status = controller.get_last_status().await?;
        match status.status {
            RunStatus::Running => return Err(Error::JobRunning),
            RunStatus::None => {}
            _ => {
                // a run that started at or after this fire time already
                // covered it
                if let Some(started) = status.started_at {
                    let started = started
                        .with_second(0)
                        .and_then(|t| t.with_nanosecond(0))
                        .expect("zeroing seconds is always valid");
                    if started >= self.next {
                        return Err(Error::JobFinished);
                    }
                }
            }
        }
        controller.start(&self.bin, "").await
    }

    async fn stop(&self) -> Result<()> {
        let controller = DagController::new(self.dag.clone());
        let status = controller.get_last_status().await?;
        if status.status != RunStatus::Running {
            debug!("'{}' is not running, nothing to stop", self.dag.name);
            return Ok(());
        }
        controller.stop().await
    }

    async fn restart(&self) -> Result<()> {
        DagController::new(self.dag.clone())
            .restart(&self.bin)
            .await
    }
}

/// Reads the DAG catalog directory and materializes one entry per schedule
/// set, with `next` the earliest future fire time.
pub struct CatalogEntryReader {
    pub dags_dir: PathBuf,
    pub bin: String,
}

impl CatalogEntryReader {
    pub fn new(dags_dir: PathBuf, bin: String) -> Self {
        Self { dags_dir, bin }
    }
}

#[async_trait]
impl EntryReader for CatalogEntryReader {
    async fn read(&self, now: DateTime<Utc>) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let dir = match std::fs::read_dir(&self.dags_dir) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("cannot read catalog {:?}: {}", self.dags_dir, e);
                return Ok(entries);
            }
        };

        for file in dir.flatten() {
            let path = file.path();
            let is_dag = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| builder::EXTENSIONS.contains(&e))
                .unwrap_or(false);
            if !is_dag {
                continue;
            }
            let dag = match builder::load_dag_head_only(&path) {
                Ok(dag) => Arc::new(dag),
                Err(e) => {
                    warn!("skipping {:?}: {}", path, e);
                    continue;
                }
            };
            if !dag.has_schedule() {
                continue;
            }
            for (kind, schedules) in [
                (EntryKind::Start, &dag.schedule),
                (EntryKind::Stop, &dag.stop_schedule),
                (EntryKind::Restart, &dag.restart_schedule),
            ] {
                if let Some(next) = earliest_fire(schedules, now) {
                    entries.push(Entry {
                        kind,
                        next,
                        job: Arc::new(DagJob {
                            dag: dag.clone(),
                            bin: self.bin.clone(),
                            next,
                        }),
                    });
                }
            }
        }
        Ok(entries)
    }
}

fn earliest_fire(schedules: &[Schedule], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedules.iter().filter_map(|s| s.next_after(now)).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_earliest_fire() {
        let schedules = vec![
            Schedule::parse("30 * * * *").unwrap(),
            Schedule::parse("10 * * * *").unwrap(),
        ];
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            earliest_fire(&schedules, now).unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 10, 0).unwrap()
        );
        assert!(earliest_fire(&[], now).is_none());
    }

    #[tokio::test]
    async fn test_catalog_reader_materializes_entries() {
        let _guard = crate::dag::env::test_support::lock_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("scheduled.yaml"),
            "name: scheduled\nschedule:\n  start: \"* * * * *\"\n  stop: \"30 2 * * *\"\nsteps:\n  - name: a\n    command: \"true\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("unscheduled.yaml"),
            "name: unscheduled\nsteps:\n  - name: a\n    command: \"true\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let reader =
            CatalogEntryReader::new(dir.path().to_path_buf(), "dagflow".to_string());
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 30).unwrap();
        let entries = reader.read(now).await.unwrap();

        assert_eq!(entries.len(), 2);
        let start = entries
            .iter()
            .find(|e| e.kind == EntryKind::Start)
            .unwrap();
        assert_eq!(
            start.next,
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap()
        );
        assert!(entries.iter().any(|e| e.kind == EntryKind::Stop));
    }

    #[tokio::test]
    async fn test_catalog_reader_missing_dir_is_empty() {
        let reader = CatalogEntryReader::new(
            PathBuf::from("/definitely/missing/catalog"),
            "dagflow".to_string(),
        );
        let entries = reader.read(Utc::now()).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_job_start_guards_against_running() {
        let _guard = crate::dag::env::test_support::lock_env();
        let home = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", home.path());
        let path = home.path().join("job.yaml");
        std::fs::write(&path, "steps:\n  - name: a\n    command: \"true\"\n").unwrap();
        let dag = Arc::new(crate::dag::load_dag(&path, "").unwrap());

        // no server, no history: a fresh DAG starts (spawning `true` here)
        let job = DagJob {
            dag: dag.clone(),
            bin: "true".to_string(),
            next: Utc.with_ymd_and_hms(2020, 1, 1, 1, 0, 0).unwrap(),
        };
        assert!(job.start().await.is_ok());

        // stop on a non-running DAG is a quiet no-op
        assert!(job.stop().await.is_ok());
    }
}
