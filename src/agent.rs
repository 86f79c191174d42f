//! Agent: owns one DAG run end to end.
//!
//! Generates the request id, refuses to double-run (via the control
//! socket), opens the history writer, serves `/status` and `/stop`, drives
//! the scheduler, snapshots status on every transition, and cleans up
//! socket and expired history on the way out.

use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::history::HistoryStore;
use crate::scheduler::{ExecutionGraph, HandlerKind, ProgressHook, Scheduler, SchedulerConfig};
use crate::settings;
use crate::sock::{Client, Response, Server};
use crate::status::{RunStatus, Status};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Prior-run state used to seed a retry.
pub struct RetryConfig {
    pub status: Status,
}

pub struct Agent {
    dag: Arc<Dag>,
    dry: bool,
    retry: Option<RetryConfig>,
    context: Mutex<Option<Arc<RunContext>>>,
}

struct RunContext {
    dag: Arc<Dag>,
    graph: Arc<ExecutionGraph>,
    scheduler: Arc<Scheduler>,
    request_id: String,
    started_at: DateTime<Utc>,
    log_dir: PathBuf,
    finished: Arc<Mutex<Option<(RunStatus, DateTime<Utc>)>>>,
}

impl RunContext {
    /// One atomic copy of the in-memory status.
    fn snapshot(&self) -> Status {
        let finished = *self.finished.lock().unwrap();
        let (run_status, finished_at) = match finished {
            Some((status, at)) => (status, Some(at)),
            None => (RunStatus::Running, None),
        };
        let mut status = Status::initial(&self.dag);
        status.request_id = self.request_id.clone();
        status.set_status(run_status);
        status.pid = Some(std::process::id() as i32);
        status.started_at = Some(self.started_at);
        status.finished_at = finished_at;
        status.log = self.log_dir.to_string_lossy().to_string();
        status.nodes = self.graph.nodes().iter().map(|n| n.report()).collect();
        status.on_exit = self.scheduler.handler_report(HandlerKind::Exit);
        status.on_success = self.scheduler.handler_report(HandlerKind::Success);
        status.on_failure = self.scheduler.handler_report(HandlerKind::Failure);
        status.on_cancel = self.scheduler.handler_report(HandlerKind::Cancel);
        status
    }

    fn mark_finished(&self, status: RunStatus) {
        *self.finished.lock().unwrap() = Some((status, Utc::now()));
    }

    /// Signal the run, arming the `max_cleanup_time` hard-kill backstop.
    fn cancel_with_cleanup(&self, sig: i32) {
        self.scheduler.signal(&self.graph, sig, true);

        let cleanup = self.scheduler.max_cleanup_time();
        let scheduler = self.scheduler.clone();
        let graph = self.graph.clone();
        let finished = self.finished.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cleanup).await;
            if finished.lock().unwrap().is_none() {
                warn!("cleanup timeout exceeded, hard-killing remaining steps");
                scheduler.hard_cancel(&graph);
            }
        });
    }
}

impl Agent {
    pub fn new(dag: Arc<Dag>, dry: bool) -> Self {
        Self {
            dag,
            dry,
            retry: None,
            context: Mutex::new(None),
        }
    }

    /// Retry mode: re-run with commands seeded from a prior run's nodes.
    pub fn with_retry(dag: Arc<Dag>, retry: RetryConfig) -> Self {
        Self {
            dag,
            dry: false,
            retry: Some(retry),
            context: Mutex::new(None),
        }
    }

    /// Current status snapshot; an untouched initial status before `run`.
    pub fn status(&self) -> Status {
        let context = self.context.lock().unwrap().clone();
        match context {
            Some(ctx) => ctx.snapshot(),
            None => Status::initial(&self.dag),
        }
    }

    /// Run the DAG to completion and return the final status.
    pub async fn run(&self) -> Result<RunStatus> {
        let request_id = Uuid::new_v4().to_string();

        let steps = self.steps_for_run()?;
        let graph = Arc::new(ExecutionGraph::new(&steps)?);

        self.check_is_running().await?;

        let log_dir = match &self.dag.log_dir {
            Some(dir) => PathBuf::from(dir),
            None => settings::log_dir(),
        }
        .join(self.dag.safe_name());

        let config = SchedulerConfig::from_dag(&self.dag, log_dir.clone(), &request_id, self.dry);
        let scheduler = Arc::new(Scheduler::new(config, &graph));

        let context = Arc::new(RunContext {
            dag: self.dag.clone(),
            graph: graph.clone(),
            scheduler: scheduler.clone(),
            request_id: request_id.clone(),
            started_at: Utc::now(),
            log_dir,
            finished: Arc::new(Mutex::new(None)),
        });
        *self.context.lock().unwrap() = Some(context.clone());

        info!(
            "starting run of '{}' (request id {})",
            self.dag.name, request_id
        );

        if self.dry {
            // nothing external observes a dry run
            let status = scheduler.run(&graph, None).await;
            context.mark_finished(status);
            return Ok(status);
        }

        let store = HistoryStore::new();
        let writer = Arc::new(store.open_writer(
            &self.dag.location,
            &self.dag.name,
            &request_id,
            context.started_at,
        )?);

        let server = Server::bind(&self.dag.sock_addr()).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serve_task = tokio::spawn(server.serve(
            socket_handler(context.clone()),
            shutdown_rx,
        ));

        let progress: ProgressHook = {
            let context = context.clone();
            let writer = writer.clone();
            Arc::new(move || {
                if let Err(e) = writer.write(&context.snapshot()) {
                    warn!("status write failed: {e}");
                }
            })
        };

        writer.write(&context.snapshot())?;
        let status = scheduler.run(&graph, Some(progress)).await;
        context.mark_finished(status);
        writer.write(&context.snapshot())?;

        let _ = shutdown_tx.send(true);
        let _ = serve_task.await;

        if let Err(e) = store.remove_old(
            &self.dag.location,
            self.dag.hist_retention_days,
            Some(writer.path()),
        ) {
            warn!("history purge failed: {e}");
        }

        info!("run of '{}' finished: {}", self.dag.name, status);
        Ok(status)
    }

    /// Forward a signal to the run. SIGTERM/SIGINT cancel; per-step
    /// `signal_on_stop` overrides apply. After `max_cleanup_time`, anything
    /// still running is hard-killed.
    pub fn signal(&self, sig: i32) {
        let context = self.context.lock().unwrap().clone();
        if let Some(ctx) = context {
            ctx.cancel_with_cleanup(sig);
        }
    }

    /// Steps for this run, with retry-mode command overrides applied.
    fn steps_for_run(&self) -> Result<Vec<crate::dag::Step>> {
        let mut steps = self.dag.steps.clone();
        if let Some(retry) = &self.retry {
            for step in &mut steps {
                let Some(prior) = retry
                    .status
                    .nodes
                    .iter()
                    .find(|n| n.step.name == step.name)
                else {
                    continue;
                };
                if prior.step.cmd_with_args != step.cmd_with_args {
                    step.cmd_with_args = prior.step.cmd_with_args.clone();
                    let words = shell_words::split(&step.cmd_with_args)
                        .map_err(|e| Error::Other(format!("invalid retry command: {e}")))?;
                    let mut words = words.into_iter();
                    step.command = words.next().ok_or(Error::StepCommandRequired)?;
                    step.args = words.collect();
                }
            }
        }
        Ok(steps)
    }

    /// The already-running guard: ask our own socket before binding it.
    async fn check_is_running(&self) -> Result<()> {
        match Client::new(&self.dag.sock_addr())
            .request("GET", "/status")
            .await
        {
            Ok((200, body)) => {
                let status = Status::from_json(&body)?;
                if status.status == RunStatus::Running {
                    return Err(Error::AlreadyRunning(self.dag.name.clone()));
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(Error::SocketRefused) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn socket_handler(context: Arc<RunContext>) -> crate::sock::Handler {
    Arc::new(move |method: &str, path: &str| match (method, path) {
        ("GET", "/status") => match context.snapshot().to_json() {
            Ok(json) => Response::ok_json(json),
            Err(e) => Response {
                status: 500,
                body: e.to_string(),
                content_type: "text/plain",
            },
        },
        ("POST", "/stop") => {
            context.cancel_with_cleanup(crate::process::SIGTERM);
            Response::ok_text("OK")
        }
        _ => Response::not_found(),
    })
}

/// Exit code for the agent process: 0 success, 1 error, 130 cancel.
pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success | RunStatus::None => 0,
        RunStatus::Cancel => 130,
        _ => 1,
    }
}
