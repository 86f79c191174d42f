//! Graph scheduler: drives the execution graph to a terminal state.
//!
//! One supervisor loop owns the pending/ready/running/done sets; each
//! started node runs on its own task and reports back over a channel. The
//! loop enforces dependency gating, the concurrency cap, per-step
//! preconditions, cancel propagation, and the lifecycle handler sequence.

pub mod graph;
pub mod node;

pub use graph::ExecutionGraph;
pub use node::{Node, NodeStatus, OutputVariables, ProgressHook};

use crate::dag::step::evaluate_conditions;
use crate::dag::{Condition, Dag, Step};
use crate::process;
use crate::status::RunStatus;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Everything the scheduler needs from the DAG for one run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub log_dir: PathBuf,
    pub request_id: String,
    /// Concurrency cap; zero or negative means unbounded.
    pub max_active_runs: i32,
    pub delay: Duration,
    pub dry: bool,
    pub preconditions: Vec<Condition>,
    pub max_cleanup_time: Duration,
    pub on_exit: Option<Step>,
    pub on_success: Option<Step>,
    pub on_failure: Option<Step>,
    pub on_cancel: Option<Step>,
}

impl SchedulerConfig {
    pub fn from_dag(dag: &Dag, log_dir: PathBuf, request_id: &str, dry: bool) -> Self {
        Self {
            log_dir,
            request_id: request_id.to_string(),
            max_active_runs: dag.max_active_runs,
            delay: dag.delay,
            dry,
            preconditions: dag.preconditions.clone(),
            max_cleanup_time: dag.max_cleanup_time,
            on_exit: dag.handler_on.exit.clone(),
            on_success: dag.handler_on.success.clone(),
            on_failure: dag.handler_on.failure.clone(),
            on_cancel: dag.handler_on.cancel.clone(),
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    cancel_tx: watch::Sender<bool>,
    on_exit: Option<Arc<Node>>,
    on_success: Option<Arc<Node>>,
    on_failure: Option<Arc<Node>>,
    on_cancel: Option<Arc<Node>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, graph: &ExecutionGraph) -> Self {
        let outputs = graph.output_variables();
        let mut next_id = graph.len();
        let mut handler = |step: &Option<Step>| {
            step.as_ref().map(|s| {
                let node = Arc::new(Node::new(next_id, s.clone(), outputs.clone()));
                next_id += 1;
                node
            })
        };
        let on_exit = handler(&config.on_exit);
        let on_success = handler(&config.on_success);
        let on_failure = handler(&config.on_failure);
        let on_cancel = handler(&config.on_cancel);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            cancel_tx,
            on_exit,
            on_success,
            on_failure,
            on_cancel,
        }
    }

    /// Run the graph to completion and return the aggregate status.
    pub async fn run(&self, graph: &ExecutionGraph, progress: Option<ProgressHook>) -> RunStatus {
        // DAG-level preconditions gate the whole run.
        if !self.config.preconditions.is_empty() {
            let unmet = match evaluate_conditions(&self.config.preconditions) {
                Ok(None) => None,
                Ok(Some(cond)) => Some(format!(
                    "precondition not met: '{}' != '{}'",
                    cond.condition, cond.expected
                )),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = unmet {
                info!("run canceled: {reason}");
                let _ = self.cancel_tx.send(true);
                if let Some(handler) = &self.on_cancel {
                    self.run_handler(handler, &progress).await;
                }
                notify(&progress);
                return RunStatus::Cancel;
            }
        }

        if !self.config.delay.is_zero() {
            let mut cancel = self.cancel_tx.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(self.config.delay) => {}
                _ = cancel.changed() => {}
            }
        }

        self.run_main_set(graph, &progress).await;

        let status = self.aggregate_status(graph);
        let terminal_handler = match status {
            RunStatus::Success => self.on_success.as_ref(),
            RunStatus::Error => self.on_failure.as_ref(),
            RunStatus::Cancel => self.on_cancel.as_ref(),
            _ => None,
        };
        if let Some(handler) = terminal_handler {
            self.run_handler(handler, &progress).await;
        }
        if let Some(handler) = &self.on_exit {
            self.run_handler(handler, &progress).await;
        }
        notify(&progress);
        status
    }

    async fn run_main_set(&self, graph: &ExecutionGraph, progress: &Option<ProgressHook>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<usize>();

        let mut pending: HashSet<usize> = HashSet::new();
        let mut ready: VecDeque<usize> = VecDeque::new();
        let mut running: HashSet<usize> = HashSet::new();
        let mut done: HashSet<usize> = HashSet::new();

        // FIFO over insertion order equals DAG step order
        for (id, _) in graph.nodes().iter().enumerate() {
            if graph.deps_of(id).is_empty() {
                ready.push_back(id);
            } else {
                pending.insert(id);
            }
        }

        while done.len() < graph.len() {
            while self.has_capacity(running.len()) && !self.is_canceled() {
                let Some(id) = ready.pop_front() else { break };
                let node = graph.node(id).clone();

                if !node.step.preconditions.is_empty() {
                    let met = matches!(evaluate_conditions(&node.step.preconditions), Ok(None));
                    if !met {
                        debug!("step '{}' skipped: precondition not met", node.step.name);
                        node.set_status(NodeStatus::Skipped);
                        done.insert(id);
                        notify(progress);
                        self.resolve_dependents(graph, id, &mut pending, &mut ready, &mut done, progress);
                        continue;
                    }
                }

                if node
                    .setup(&self.config.log_dir, &self.config.request_id)
                    .is_err()
                {
                    done.insert(id);
                    notify(progress);
                    self.resolve_dependents(graph, id, &mut pending, &mut ready, &mut done, progress);
                    continue;
                }

                running.insert(id);
                let cancel_rx = self.cancel_tx.subscribe();
                let dry = self.config.dry;
                let tx = done_tx.clone();
                let hook = progress.clone();
                tokio::spawn(async move {
                    node.run(cancel_rx, dry, hook.as_ref()).await;
                    if let Err(e) = node.teardown() {
                        warn!("teardown failed: {e}");
                    }
                    let _ = tx.send(node.id);
                });
            }

            if running.is_empty() {
                // nothing in flight: either cancelled, or the remaining
                // pending nodes were resolved by propagation
                break;
            }

            let Some(id) = done_rx.recv().await else { break };
            running.remove(&id);
            done.insert(id);
            self.resolve_dependents(graph, id, &mut pending, &mut ready, &mut done, progress);
        }
    }

    /// After `finished` turned terminal, move each unblocked dependent to
    /// the ready queue, or propagate Cancel through nodes whose
    /// dependencies failed without a continue-on allowance.
    fn resolve_dependents(
        &self,
        graph: &ExecutionGraph,
        finished: usize,
        pending: &mut HashSet<usize>,
        ready: &mut VecDeque<usize>,
        done: &mut HashSet<usize>,
        progress: &Option<ProgressHook>,
    ) {
        let mut stack = vec![finished];
        while let Some(current) = stack.pop() {
            for &dep_id in graph.dependents_of(current) {
                if !pending.contains(&dep_id) {
                    continue;
                }
                let mut all_terminal = true;
                let mut satisfied = true;
                let mut blocked_by_failure = false;
                for &up in graph.deps_of(dep_id) {
                    let status = graph.node(up).status();
                    if !status.is_terminal() {
                        all_terminal = false;
                        break;
                    }
                    match status {
                        NodeStatus::Success | NodeStatus::Skipped => {}
                        NodeStatus::Error if graph.node(up).step.continue_on.failure => {}
                        NodeStatus::Error | NodeStatus::Cancel => {
                            satisfied = false;
                            blocked_by_failure = true;
                        }
                        _ => satisfied = false,
                    }
                }
                if blocked_by_failure {
                    // non-continued Error/Cancel upstream: cancel this node now
                    pending.remove(&dep_id);
                    graph.node(dep_id).set_status(NodeStatus::Cancel);
                    done.insert(dep_id);
                    notify(progress);
                    stack.push(dep_id);
                } else if all_terminal && satisfied {
                    pending.remove(&dep_id);
                    ready.push_back(dep_id);
                }
            }
        }
    }

    async fn run_handler(&self, node: &Arc<Node>, progress: &Option<ProgressHook>) {
        if node
            .setup(&self.config.log_dir, &self.config.request_id)
            .is_err()
        {
            notify(progress);
            return;
        }
        // handlers run after cancel, so they get their own cancel channel
        let (_tx, rx) = watch::channel(false);
        node.run(rx, self.config.dry, progress.as_ref()).await;
        if let Err(e) = node.teardown() {
            warn!("handler teardown failed: {e}");
        }
    }

    /// `Success` iff every non-skipped node is `Success`; `Cancel` if any
    /// node is `Cancel` (or the cancel flag fired) and none is `Error`;
    /// otherwise `Error`.
    fn aggregate_status(&self, graph: &ExecutionGraph) -> RunStatus {
        let statuses: Vec<NodeStatus> = graph.nodes().iter().map(|n| n.status()).collect();
        let all_ok = statuses
            .iter()
            .all(|s| matches!(s, NodeStatus::Success | NodeStatus::Skipped));
        if self.is_canceled() && !all_ok {
            return RunStatus::Cancel;
        }
        if all_ok {
            return RunStatus::Success;
        }
        let any_error = statuses.iter().any(|s| *s == NodeStatus::Error);
        let any_cancel = statuses.iter().any(|s| *s == NodeStatus::Cancel);
        if any_cancel && !any_error {
            return RunStatus::Cancel;
        }
        RunStatus::Error
    }

    /// Request cancellation: flip the flag and signal every running node.
    /// Idempotent; a no-op on a finished run.
    pub fn cancel(&self, graph: &ExecutionGraph) {
        self.signal(graph, process::SIGTERM, true);
    }

    /// Signal running nodes. With `allow_override`, a step's
    /// `signal_on_stop` takes precedence over `sig`.
    pub fn signal(&self, graph: &ExecutionGraph, sig: i32, allow_override: bool) {
        let _ = self.cancel_tx.send(true);
        for node in graph.nodes() {
            if node.status() == NodeStatus::Running {
                node.signal(sig, allow_override);
            }
        }
        for handler in [&self.on_exit, &self.on_success, &self.on_failure, &self.on_cancel]
            .into_iter()
            .flatten()
        {
            if handler.status() == NodeStatus::Running {
                handler.signal(sig, allow_override);
            }
        }
    }

    /// SIGKILL everything still running; the `max_cleanup_time` backstop.
    pub fn hard_cancel(&self, graph: &ExecutionGraph) {
        let _ = self.cancel_tx.send(true);
        for node in graph.nodes() {
            if node.status() == NodeStatus::Running {
                node.hard_kill();
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn max_cleanup_time(&self) -> Duration {
        self.config.max_cleanup_time
    }

    fn has_capacity(&self, running: usize) -> bool {
        self.config.max_active_runs <= 0 || running < self.config.max_active_runs as usize
    }

    pub fn handler_report(&self, which: HandlerKind) -> Option<crate::status::StepState> {
        let node = match which {
            HandlerKind::Exit => &self.on_exit,
            HandlerKind::Success => &self.on_success,
            HandlerKind::Failure => &self.on_failure,
            HandlerKind::Cancel => &self.on_cancel,
        };
        node.as_ref().map(|n| n.report())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum HandlerKind {
    Exit,
    Success,
    Failure,
    Cancel,
}

fn notify(progress: &Option<ProgressHook>) {
    if let Some(hook) = progress {
        hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::env::test_support::lock_env;
    use crate::dag::step::RetryPolicy;
    use std::time::Duration;

    fn step(name: &str, cmd: &str, depends: &[&str]) -> Step {
        let words = shell_words::split(cmd).unwrap();
        Step {
            name: name.to_string(),
            command: words[0].clone(),
            args: words[1..].to_vec(),
            cmd_with_args: cmd.to_string(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn config(dir: &tempfile::TempDir) -> SchedulerConfig {
        SchedulerConfig {
            log_dir: dir.path().to_path_buf(),
            request_id: "sched-test-req".to_string(),
            max_active_runs: 0,
            delay: Duration::ZERO,
            dry: false,
            preconditions: Vec::new(),
            max_cleanup_time: Duration::from_secs(60),
            on_exit: None,
            on_success: None,
            on_failure: None,
            on_cancel: None,
        }
    }

    async fn run_steps(steps: Vec<Step>, cfg: SchedulerConfig) -> (RunStatus, ExecutionGraph) {
        let graph = ExecutionGraph::new(&steps).unwrap();
        let scheduler = Scheduler::new(cfg, &graph);
        let status = scheduler.run(&graph, None).await;
        (status, graph)
    }

    #[tokio::test]
    async fn test_sequential_success() {
        let dir = tempfile::tempdir().unwrap();
        let (status, graph) = run_steps(
            vec![step("a", "true", &[]), step("b", "true", &["a"])],
            config(&dir),
        )
        .await;
        assert_eq!(status, RunStatus::Success);
        assert!(graph
            .nodes()
            .iter()
            .all(|n| n.status() == NodeStatus::Success));

        // a node never starts before its dependencies finished
        let a = graph.node_by_name("a").unwrap().state();
        let b = graph.node_by_name("b").unwrap().state();
        assert!(b.started_at.unwrap() >= a.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_failure_propagates_as_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (status, graph) = run_steps(
            vec![
                step("a", "false", &[]),
                step("b", "true", &["a"]),
                step("c", "true", &["b"]),
            ],
            config(&dir),
        )
        .await;
        assert_eq!(status, RunStatus::Error);
        assert_eq!(graph.node_by_name("a").unwrap().status(), NodeStatus::Error);
        assert_eq!(graph.node_by_name("b").unwrap().status(), NodeStatus::Cancel);
        assert_eq!(graph.node_by_name("c").unwrap().status(), NodeStatus::Cancel);
    }

    #[tokio::test]
    async fn test_continue_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut failing = step("a", "false", &[]);
        failing.continue_on.failure = true;
        let (status, graph) = run_steps(
            vec![failing, step("b", "true", &["a"])],
            config(&dir),
        )
        .await;
        // downstream ran, but the failure still decides the aggregate
        assert_eq!(status, RunStatus::Error);
        assert_eq!(graph.node_by_name("b").unwrap().status(), NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_step_precondition_skips_but_does_not_block() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().unwrap();
        let mut gated = step("a", "true", &[]);
        gated.preconditions = vec![Condition {
            condition: "`echo 1`".to_string(),
            expected: "0".to_string(),
        }];
        let (status, graph) = run_steps(
            vec![gated, step("b", "true", &["a"])],
            config(&dir),
        )
        .await;
        assert_eq!(status, RunStatus::Success);
        assert_eq!(graph.node_by_name("a").unwrap().status(), NodeStatus::Skipped);
        assert_eq!(graph.node_by_name("b").unwrap().status(), NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_dag_precondition_cancels_with_nodes_untouched() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.preconditions = vec![Condition {
            condition: "`echo 1`".to_string(),
            expected: "0".to_string(),
        }];
        let (status, graph) = run_steps(
            vec![step("a", "true", &[]), step("b", "true", &["a"])],
            cfg,
        )
        .await;
        assert_eq!(status, RunStatus::Cancel);
        assert!(graph.nodes().iter().all(|n| n.status() == NodeStatus::None));
    }

    #[tokio::test]
    async fn test_dag_precondition_met_runs_everything() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.preconditions = vec![Condition {
            condition: "`echo 1`".to_string(),
            expected: "1".to_string(),
        }];
        let (status, graph) = run_steps(
            vec![step("a", "true", &[]), step("b", "true", &["a"])],
            cfg,
        )
        .await;
        assert_eq!(status, RunStatus::Success);
        assert!(graph
            .nodes()
            .iter()
            .all(|n| n.status() == NodeStatus::Success));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let graph = Arc::new(ExecutionGraph::new(&[step("slow", "sleep 100", &[])]).unwrap());
        let scheduler = Arc::new(Scheduler::new(config(&dir), &graph));

        let runner = {
            let graph = graph.clone();
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(&graph, None).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.cancel(&graph);
        let status = tokio::time::timeout(Duration::from_millis(500), runner)
            .await
            .expect("scheduler did not drain in time")
            .unwrap();

        assert_eq!(status, RunStatus::Cancel);
        assert_eq!(graph.node(0).status(), NodeStatus::Cancel);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_safe_when_finished() {
        let dir = tempfile::tempdir().unwrap();
        let (status, graph) = run_steps(vec![step("a", "true", &[])], config(&dir)).await;
        assert_eq!(status, RunStatus::Success);
        let scheduler = Scheduler::new(config(&dir), &graph);
        scheduler.cancel(&graph);
        scheduler.cancel(&graph);
        assert_eq!(graph.node(0).status(), NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_max_active_runs_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.max_active_runs = 1;
        let (status, graph) = run_steps(
            vec![
                step("a", "sleep 0.1", &[]),
                step("b", "sleep 0.1", &[]),
            ],
            cfg,
        )
        .await;
        assert_eq!(status, RunStatus::Success);
        let a = graph.node_by_name("a").unwrap().state();
        let b = graph.node_by_name("b").unwrap().state();
        assert!(b.started_at.unwrap() >= a.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_output_variable_flows_downstream() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().unwrap();
        let mut producer = step("a", "echo fortytwo", &[]);
        producer.output = Some("SCHED_OUTPUT_FLOW".to_string());
        let mut consumer = step("b", "sh -c", &["a"]);
        consumer.args.push("echo $SCHED_OUTPUT_FLOW".to_string());
        consumer.output = Some("SCHED_OUTPUT_FLOW2".to_string());

        let (status, graph) = run_steps(vec![producer, consumer], config(&dir)).await;
        assert_eq!(status, RunStatus::Success);
        let outputs = graph.output_variables();
        let outputs = outputs.lock().unwrap();
        assert_eq!(
            outputs.get("SCHED_OUTPUT_FLOW2").unwrap(),
            "SCHED_OUTPUT_FLOW2=fortytwo"
        );
    }

    #[tokio::test]
    async fn test_on_exit_always_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.on_exit = Some(step("onExit", "echo done", &[]));
        let graph = ExecutionGraph::new(&[step("a", "true", &[])]).unwrap();
        let scheduler = Scheduler::new(cfg, &graph);
        let status = scheduler.run(&graph, None).await;
        assert_eq!(status, RunStatus::Success);
        let report = scheduler.handler_report(HandlerKind::Exit).unwrap();
        assert_eq!(report.status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_on_failure_then_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.on_failure = Some(step("onFailure", "true", &[]));
        cfg.on_exit = Some(step("onExit", "true", &[]));
        cfg.on_success = Some(step("onSuccess", "true", &[]));
        let graph = ExecutionGraph::new(&[step("a", "false", &[])]).unwrap();
        let scheduler = Scheduler::new(cfg, &graph);
        let status = scheduler.run(&graph, None).await;
        assert_eq!(status, RunStatus::Error);
        assert_eq!(
            scheduler.handler_report(HandlerKind::Failure).unwrap().status,
            NodeStatus::Success
        );
        assert_eq!(
            scheduler.handler_report(HandlerKind::Exit).unwrap().status,
            NodeStatus::Success
        );
        // the success handler never fired
        assert_eq!(
            scheduler.handler_report(HandlerKind::Success).unwrap().status,
            NodeStatus::None
        );
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_scheduler_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.on_exit = Some(step("onExit", "false", &[]));
        let graph = ExecutionGraph::new(&[step("a", "true", &[])]).unwrap();
        let scheduler = Scheduler::new(cfg, &graph);
        let status = scheduler.run(&graph, None).await;
        assert_eq!(status, RunStatus::Success);
        assert_eq!(
            scheduler.handler_report(HandlerKind::Exit).unwrap().status,
            NodeStatus::Error
        );
    }

    #[tokio::test]
    async fn test_retry_observed_from_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let mut failing = step("a", "false", &[]);
        failing.retry_policy = Some(RetryPolicy {
            limit: 2,
            interval: Duration::from_millis(10),
        });
        let (status, graph) = run_steps(vec![failing], config(&dir)).await;
        assert_eq!(status, RunStatus::Error);
        assert_eq!(graph.node(0).retry_count(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.dry = true;
        let marker = dir.path().join("must-not-exist");
        let (status, graph) = run_steps(
            vec![step("a", &format!("touch {}", marker.display()), &[])],
            cfg,
        )
        .await;
        assert_eq!(status, RunStatus::Success);
        assert_eq!(graph.node(0).status(), NodeStatus::Success);
        assert!(!marker.exists());
    }
}
