//! CLI interface for dagflow

use crate::agent::{exit_code, Agent, RetryConfig};
use crate::controller::DagController;
use crate::dag::{load_dag, load_dag_head_only};
use crate::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use crate::runner::job::CatalogEntryReader;
use crate::runner::Runner;
use crate::settings;
use crate::status::RunStatus;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

/// dagflow - cron-scheduled DAG workflow engine for shell commands
#[derive(Parser, Debug)]
#[command(name = "dagflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cron-scheduled DAG workflow engine for shell commands", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a DAG to completion
    Start {
        /// Parameters passed to the DAG (overrides its defaults)
        #[arg(long, default_value = "")]
        params: String,

        /// Path to the DAG file
        dag: PathBuf,
    },

    /// Run a DAG without executing any commands
    Dry {
        #[arg(long, default_value = "")]
        params: String,

        dag: PathBuf,
    },

    /// Stop a running DAG
    Stop {
        dag: PathBuf,
    },

    /// Stop a running DAG, then start it again with its last parameters
    Restart {
        dag: PathBuf,
    },

    /// Re-run a recorded execution with the same commands
    Retry {
        /// Request id of the run to retry
        #[arg(long)]
        req: String,

        dag: PathBuf,
    },

    /// Show the current (or last) status of a DAG
    Status {
        dag: PathBuf,
    },

    /// Run the cron scheduler over a DAG catalog directory
    Scheduler {
        /// Catalog directory (default: $HOME/dags)
        #[arg(long)]
        dags: Option<PathBuf>,
    },
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let level: LogLevel = self.log_level.as_str().into();
        let format = match self.log_format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        init_logging(&LogConfig { level, format })
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Start { params, dag } => self.start(dag, params, false).await,
            Commands::Dry { params, dag } => self.start(dag, params, true).await,
            Commands::Stop { dag } => self.stop(dag).await,
            Commands::Restart { dag } => self.restart(dag).await,
            Commands::Retry { req, dag } => self.retry(dag, req).await,
            Commands::Status { dag } => self.show_status(dag).await,
            Commands::Scheduler { dags } => self.scheduler(dags.clone()).await,
        }
    }

    async fn start(&self, path: &PathBuf, params: &str, dry: bool) -> anyhow::Result<()> {
        let dag = Arc::new(load_dag(path, params)?);
        let agent = Arc::new(Agent::new(dag, dry));
        run_agent(agent).await
    }

    async fn stop(&self, path: &PathBuf) -> anyhow::Result<()> {
        let dag = Arc::new(load_dag_head_only(path)?);
        info!("stopping '{}'", dag.name);
        DagController::new(dag).stop().await?;
        Ok(())
    }

    async fn restart(&self, path: &PathBuf) -> anyhow::Result<()> {
        let dag = Arc::new(load_dag(path, "")?);
        let controller = DagController::new(dag.clone());

        let status = controller.get_last_status().await?;
        let params = status.params.clone();
        if status.status == RunStatus::Running {
            info!("stopping '{}' before restart", dag.name);
            controller.stop().await?;
            while controller.get_last_status().await?.status == RunStatus::Running {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if !dag.restart_wait.is_zero() {
            info!("waiting {:?} before restart", dag.restart_wait);
            tokio::time::sleep(dag.restart_wait).await;
        }

        let dag = Arc::new(load_dag(path, &params)?);
        let agent = Arc::new(Agent::new(dag, false));
        run_agent(agent).await
    }

    async fn retry(&self, path: &PathBuf, request_id: &str) -> anyhow::Result<()> {
        let dag = Arc::new(load_dag_head_only(path)?);
        let prior = DagController::new(dag)
            .get_status_by_request_id(request_id)
            .await?;

        let dag = Arc::new(load_dag(path, &prior.params)?);
        let agent = Arc::new(Agent::with_retry(dag, RetryConfig { status: prior }));
        run_agent(agent).await
    }

    async fn show_status(&self, path: &PathBuf) -> anyhow::Result<()> {
        let dag = Arc::new(load_dag_head_only(path)?);
        let status = DagController::new(dag).get_last_status().await?;

        println!("Name: {}", status.name);
        println!("Status: {}", status.status_text);
        if !status.request_id.is_empty() {
            println!("Request ID: {}", status.request_id);
        }
        if let Some(started) = status.started_at {
            println!("Started: {started}");
        }
        if let Some(finished) = status.finished_at {
            println!("Finished: {finished}");
        }
        if !status.nodes.is_empty() {
            println!("Steps:");
            for node in &status.nodes {
                println!("  - {} [{}]", node.step.name, node.status_text);
            }
        }
        Ok(())
    }

    async fn scheduler(&self, dags: Option<PathBuf>) -> anyhow::Result<()> {
        let dags_dir = dags.unwrap_or_else(settings::dags_dir);
        let bin = std::env::current_exe()?.to_string_lossy().to_string();
        info!("scheduling DAGs in {:?}", dags_dir);

        let runner = Arc::new(Runner::new(Box::new(CatalogEntryReader::new(
            dags_dir, bin,
        ))));

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        {
            let runner = runner.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
                info!("shutdown signal received");
                runner.stop();
            });
        }

        runner.start().await;
        Ok(())
    }
}

/// Run an agent with signal forwarding; the process exits with the run's
/// code (0 success, 1 error, 130 cancel).
async fn run_agent(agent: Arc<Agent>) -> anyhow::Result<()> {
    {
        let agent = agent.clone();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            let sig = tokio::select! {
                _ = sigterm.recv() => libc::SIGTERM,
                _ = sigint.recv() => libc::SIGINT,
            };
            info!("signal received, cancelling run");
            agent.signal(sig);
        });
    }

    let status = agent.run().await?;
    let code = exit_code(status);
    if code != 0 {
        error!("run finished with status '{}'", status);
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_start() {
        let cli = Cli::parse_from(["dagflow", "start", "workflow.yaml"]);
        assert!(matches!(cli.command, Commands::Start { .. }));
    }

    #[test]
    fn test_cli_parse_start_with_params() {
        let cli = Cli::parse_from(["dagflow", "start", "--params", "FOO=bar", "wf.yaml"]);
        match cli.command {
            Commands::Start { params, dag } => {
                assert_eq!(params, "FOO=bar");
                assert_eq!(dag, PathBuf::from("wf.yaml"));
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_cli_parse_retry() {
        let cli = Cli::parse_from(["dagflow", "retry", "--req", "abc123", "wf.yaml"]);
        match cli.command {
            Commands::Retry { req, .. } => assert_eq!(req, "abc123"),
            _ => panic!("expected retry"),
        }
    }

    #[test]
    fn test_cli_parse_scheduler() {
        let cli = Cli::parse_from(["dagflow", "scheduler", "--dags", "/etc/dags"]);
        match cli.command {
            Commands::Scheduler { dags } => {
                assert_eq!(dags, Some(PathBuf::from("/etc/dags")));
            }
            _ => panic!("expected scheduler"),
        }
    }

    #[test]
    fn test_cli_global_log_flags() {
        let cli = Cli::parse_from([
            "dagflow",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "status",
            "wf.yaml",
        ]);
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_format, "json");
    }
}
