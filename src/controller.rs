//! Façade over the control socket and history store for external callers
//! (CLI, cron runner). Also the home of DAG catalog operations.

use crate::dag::{builder, Dag};
use crate::error::{Error, Result};
use crate::history::HistoryStore;
use crate::sock::Client;
use crate::status::{Status, StatusFile};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub struct DagController {
    dag: Arc<Dag>,
}

impl DagController {
    pub fn new(dag: Arc<Dag>) -> Self {
        Self { dag }
    }

    /// Ask the running agent to cancel.
    pub async fn stop(&self) -> Result<()> {
        let (code, body) = Client::new(&self.dag.sock_addr())
            .request("POST", "/stop")
            .await?;
        if code != 200 {
            return Err(Error::Other(format!("stop failed: {code} {body}")));
        }
        Ok(())
    }

    /// Spawn the agent binary for this DAG and wait for it.
    pub async fn start(&self, bin: &str, params: &str) -> Result<()> {
        let mut args = vec!["start".to_string()];
        if !params.is_empty() {
            args.push(format!("--params={params}"));
        }
        args.push(self.dag.location.to_string_lossy().to_string());
        self.spawn_and_wait(bin, &args).await
    }

    /// Fire-and-forget variant of `start`.
    pub fn start_detached(&self, bin: &str, params: &str) {
        let controller = Self {
            dag: self.dag.clone(),
        };
        let bin = bin.to_string();
        let params = params.to_string();
        tokio::spawn(async move {
            if let Err(e) = controller.start(&bin, &params).await {
                warn!("detached start of '{}' failed: {}", controller.dag.name, e);
            }
        });
    }

    /// Spawn `restart` for this DAG; that command handles stop-wait-start.
    pub async fn restart(&self, bin: &str) -> Result<()> {
        let args = vec![
            "restart".to_string(),
            self.dag.location.to_string_lossy().to_string(),
        ];
        self.spawn_and_wait(bin, &args).await
    }

    /// Spawn a retry of a recorded run.
    pub async fn retry(&self, bin: &str, request_id: &str) -> Result<()> {
        let args = vec![
            "retry".to_string(),
            format!("--req={request_id}"),
            self.dag.location.to_string_lossy().to_string(),
        ];
        self.spawn_and_wait(bin, &args).await
    }

    async fn spawn_and_wait(&self, bin: &str, args: &[String]) -> Result<()> {
        let mut cmd = std::process::Command::new(bin);
        cmd.args(args);
        // children lead their own process group so signals fan out
        cmd.process_group(0);
        let mut cmd = tokio::process::Command::from(cmd);
        let status = cmd.spawn()?.wait().await?;
        if !status.success() {
            return Err(Error::Other(format!(
                "'{bin} {}' exited with {}",
                args.join(" "),
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }

    /// Live status from the socket; a default snapshot when no agent is
    /// listening. Timeouts are surfaced, never treated as "not running".
    pub async fn get_status(&self) -> Result<Status> {
        match Client::new(&self.dag.sock_addr())
            .request("GET", "/status")
            .await
        {
            Ok((200, body)) => Status::from_json(&body),
            Ok((code, body)) => Err(Error::Other(format!("status failed: {code} {body}"))),
            Err(Error::SocketRefused) => Ok(Status::initial(&self.dag)),
            Err(e) => Err(e),
        }
    }

    /// Live status, falling back to today's history, falling back to a
    /// default snapshot. The correct-running rule applies to history reads.
    pub async fn get_last_status(&self) -> Result<Status> {
        match Client::new(&self.dag.sock_addr())
            .request("GET", "/status")
            .await
        {
            Ok((200, body)) => Status::from_json(&body),
            Ok(_) | Err(Error::SocketRefused) => {
                match HistoryStore::new().read_status_today(&self.dag.location) {
                    Ok(status) => Ok(status),
                    Err(Error::NoStatusData) | Err(Error::NoStatusDataToday) => {
                        Ok(Status::initial(&self.dag))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Recorded status for one request id.
    pub async fn get_status_by_request_id(&self, request_id: &str) -> Result<Status> {
        let found = HistoryStore::new().find_by_request_id(&self.dag.location, request_id)?;
        Ok(found.status)
    }

    /// The `n` most recent runs, newest first.
    pub fn get_recent_statuses(&self, n: usize) -> Vec<StatusFile> {
        HistoryStore::new().read_status_hist(&self.dag.location, n)
    }
}

const DAG_TEMPLATE: &str = "steps:\n  - name: step1\n    command: echo hello\n";

/// Create a new DAG file from the starter template.
pub fn create_dag(file: &Path) -> Result<()> {
    validate_location(file)?;
    if file.exists() {
        return Err(Error::Other(format!(
            "the DAG file {} already exists",
            file.display()
        )));
    }
    std::fs::write(file, DAG_TEMPLATE)?;
    Ok(())
}

/// Move a DAG file and carry its history along.
pub fn move_dag(old_path: &Path, new_path: &Path) -> Result<()> {
    validate_location(new_path)?;
    std::fs::rename(old_path, new_path)?;
    HistoryStore::new().move_data(old_path, new_path)
}

/// Delete a DAG file and all of its history.
pub fn delete_dag(location: &Path) -> Result<()> {
    HistoryStore::new().remove_all(location)?;
    std::fs::remove_file(location)?;
    Ok(())
}

/// Replace a DAG file's contents after validating them.
pub fn update_dag_spec(location: &Path, value: &str) -> Result<()> {
    builder::validate_dag_yaml(value, location)?;
    if !location.exists() {
        return Err(Error::Other(format!(
            "the DAG file {} does not exist",
            location.display()
        )));
    }
    std::fs::write(location, value)?;
    Ok(())
}

/// Read a DAG file's raw contents.
pub fn read_spec(location: &Path) -> Result<String> {
    Ok(std::fs::read_to_string(location)?)
}

fn validate_location(location: &Path) -> Result<()> {
    let ok = location
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false);
    if !ok {
        return Err(Error::Other(
            "the DAG file must have a .yaml or .yml extension".to_string(),
        ));
    }
    Ok(())
}
