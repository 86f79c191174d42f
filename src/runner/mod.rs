//! Cron runner: the long-lived dispatcher that fires start/stop/restart
//! jobs on whole-minute ticks.
//!
//! The runner re-reads the catalog on every tick, so edits to DAG files
//! take effect on the next minute without a restart. The entry list is
//! walked single-threaded; each fired job runs on its own task.

pub mod job;

pub use job::DagJob;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What firing an entry means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Start,
    Stop,
    Restart,
}

/// One scheduled action: fire `job` (as `kind`) at `next`.
pub struct Entry {
    pub kind: EntryKind,
    pub next: DateTime<Utc>,
    pub job: Arc<dyn Job>,
}

/// A dispatchable unit of scheduling work.
#[async_trait]
pub trait Job: Send + Sync + fmt::Display {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
}

/// Source of entries, re-read on every tick.
#[async_trait]
pub trait EntryReader: Send + Sync {
    async fn read(&self, now: DateTime<Utc>) -> Result<Vec<Entry>>;
}

pub struct Runner {
    reader: Box<dyn EntryReader>,
    stop_tx: watch::Sender<bool>,
}

impl Runner {
    pub fn new(reader: Box<dyn EntryReader>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self { reader, stop_tx }
    }

    /// Run until `stop`: fire due entries, sleep to the next whole minute.
    pub async fn start(&self) {
        info!("runner started");
        let mut tick = truncate_minute(Utc::now());
        loop {
            self.run_at(tick).await;
            tick = next_tick(tick);
            if self.wait_until(tick).await {
                break;
            }
        }
        info!("runner stopped");
    }

    /// One tick: read entries as of just before `now` and fire everything
    /// due. Jobs run on their own tasks; in-flight jobs are never awaited.
    pub async fn run_at(&self, now: DateTime<Utc>) {
        let entries = match self.reader.read(now - Duration::seconds(1)).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to read entries: {e}");
                return;
            }
        };
        for entry in entries {
            if entry.next > now {
                continue;
            }
            let job = entry.job.clone();
            let kind = entry.kind;
            tokio::spawn(async move {
                debug!("invoking {} ({:?})", job, kind);
                let result = match kind {
                    EntryKind::Start => job.start().await,
                    EntryKind::Stop => job.stop().await,
                    EntryKind::Restart => job.restart().await,
                };
                if let Err(e) = result {
                    warn!("job {} failed: {e}", job);
                }
            });
        }
    }

    /// Break out of the wait; in-flight jobs are left alone.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Sleep until `deadline`; true when stopped first.
    async fn wait_until(&self, deadline: DateTime<Utc>) -> bool {
        let mut stopped = self.stop_tx.subscribe();
        if *stopped.borrow() {
            return true;
        }
        let wait = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(wait) => false,
            _ = stopped.changed() => true,
        }
    }
}

/// The smallest whole minute strictly greater than `now`.
pub fn next_tick(now: DateTime<Utc>) -> DateTime<Utc> {
    truncate_minute(now) + Duration::minutes(1)
}

fn truncate_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing seconds is always valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockJob {
        starts: AtomicUsize,
        stops: AtomicUsize,
        restarts: AtomicUsize,
    }

    impl fmt::Display for MockJob {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("mock")
        }
    }

    #[async_trait]
    impl Job for MockJob {
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockReader {
        entries: Vec<(EntryKind, DateTime<Utc>, Arc<MockJob>)>,
    }

    #[async_trait]
    impl EntryReader for MockReader {
        async fn read(&self, _now: DateTime<Utc>) -> Result<Vec<Entry>> {
            Ok(self
                .entries
                .iter()
                .map(|(kind, next, job)| Entry {
                    kind: *kind,
                    next: *next,
                    job: job.clone(),
                })
                .collect())
        }
    }

    #[test]
    fn test_next_tick() {
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 1, 0, 50).unwrap();
        assert_eq!(
            next_tick(t),
            Utc.with_ymd_and_hms(2020, 1, 1, 1, 1, 0).unwrap()
        );
        // already on the boundary still advances strictly
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 1, 0, 0).unwrap();
        assert_eq!(
            next_tick(t),
            Utc.with_ymd_and_hms(2020, 1, 1, 1, 1, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_at_fires_due_entries_only() {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let due = Arc::new(MockJob::default());
        let later = Arc::new(MockJob::default());
        let runner = Runner::new(Box::new(MockReader {
            entries: vec![
                (EntryKind::Start, now, due.clone()),
                (EntryKind::Start, now + Duration::minutes(1), later.clone()),
            ],
        }));

        runner.run_at(now).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(due.starts.load(Ordering::SeqCst), 1);
        assert_eq!(later.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_at_dispatches_by_kind() {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let job = Arc::new(MockJob::default());
        let runner = Runner::new(Box::new(MockReader {
            entries: vec![
                (EntryKind::Stop, now, job.clone()),
                (EntryKind::Restart, now, job.clone()),
            ],
        }));

        runner.run_at(now).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(job.starts.load(Ordering::SeqCst), 0);
        assert_eq!(job.stops.load(Ordering::SeqCst), 1);
        assert_eq!(job.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_breaks_the_wait() {
        let runner = Arc::new(Runner::new(Box::new(MockReader { entries: vec![] })));
        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.start().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        runner.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("runner did not stop")
            .unwrap();
    }
}
