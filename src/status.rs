//! Run status snapshots: the unit persisted to history and served over the
//! control socket. JSON round-trips are identity.

use crate::dag::{Dag, Step};
use crate::process;
use crate::scheduler::node::NodeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduler-level status of one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    None,
    Running,
    Error,
    Cancel,
    Success,
}

impl RunStatus {
    pub fn text(&self) -> &'static str {
        match self {
            RunStatus::None => "not started",
            RunStatus::Running => "running",
            RunStatus::Error => "failed",
            RunStatus::Cancel => "canceled",
            RunStatus::Success => "finished",
        }
    }

    /// Whether the run reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::None | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Recorded state of one step within a run snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub step: Step,
    pub status: NodeStatus,
    pub status_text: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub done_count: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log: String,
}

impl StepState {
    pub fn from_step(step: &Step) -> Self {
        Self {
            step: step.clone(),
            status: NodeStatus::None,
            status_text: NodeStatus::None.text().to_string(),
            started_at: None,
            finished_at: None,
            retry_count: 0,
            done_count: 0,
            error: None,
            log: String::new(),
        }
    }
}

/// A full snapshot of one run: what the agent serves over `/status` and what
/// every history line contains.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub request_id: String,
    pub name: String,
    pub status: RunStatus,
    pub status_text: String,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub params: String,
    pub nodes: Vec<StepState>,
    #[serde(default)]
    pub on_exit: Option<StepState>,
    #[serde(default)]
    pub on_success: Option<StepState>,
    #[serde(default)]
    pub on_failure: Option<StepState>,
    #[serde(default)]
    pub on_cancel: Option<StepState>,
}

impl Status {
    /// A fresh snapshot for a DAG with nothing run yet.
    pub fn initial(dag: &Dag) -> Self {
        Self {
            request_id: String::new(),
            name: dag.name.clone(),
            status: RunStatus::None,
            status_text: RunStatus::None.text().to_string(),
            pid: None,
            started_at: None,
            finished_at: None,
            log: String::new(),
            params: dag.params.join(" "),
            nodes: dag.steps.iter().map(StepState::from_step).collect(),
            on_exit: dag.handler_on.exit.as_ref().map(StepState::from_step),
            on_success: dag.handler_on.success.as_ref().map(StepState::from_step),
            on_failure: dag.handler_on.failure.as_ref().map(StepState::from_step),
            on_cancel: dag.handler_on.cancel.as_ref().map(StepState::from_step),
        }
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.status_text = status.text().to_string();
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// A snapshot claiming `Running` is only believable while its writer is
    /// alive. Readers call this to rewrite orphaned `Running` to `Error`.
    pub fn correct_running_status(&mut self) {
        if self.status != RunStatus::Running {
            return;
        }
        let alive = self.pid.map(process::process_exists).unwrap_or(false);
        if !alive {
            self.set_status(RunStatus::Error);
        }
    }
}

/// A status together with the history file it was read from.
#[derive(Debug, Clone)]
pub struct StatusFile {
    pub file: std::path::PathBuf,
    pub status: Status,
}
