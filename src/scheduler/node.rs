//! Node: the runtime instance of a Step within one run.
//!
//! A node owns a single child process at a time. It is spawned as a process
//! group leader so stop signals reach shells and their descendants, its
//! stdout/stderr are tee'd into the per-run log file (plus any user-declared
//! stdout/stderr paths), and on a clean exit the captured stdout can be
//! published as an output variable for downstream steps.

use crate::dag::{env, sanitize_name, Step};
use crate::error::{Error, Result};
use crate::process;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

/// Output variables shared across one run: `name -> "name=value"`.
pub type OutputVariables = Arc<Mutex<HashMap<String, String>>>;

/// Hook invoked after every observable node transition.
pub type ProgressHook = Arc<dyn Fn() + Send + Sync>;

/// Per-node status within a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    None,
    Running,
    Error,
    Cancel,
    Success,
    Skipped,
}

impl NodeStatus {
    pub fn text(&self) -> &'static str {
        match self {
            NodeStatus::None => "not started",
            NodeStatus::Running => "running",
            NodeStatus::Error => "failed",
            NodeStatus::Cancel => "canceled",
            NodeStatus::Success => "finished",
            NodeStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::None | NodeStatus::Running)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Mutable runtime state of a node, owned by its worker.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub done_count: u32,
    pub error: Option<String>,
    pub log_file: Option<PathBuf>,
}

/// Outcome of one execution attempt.
enum ExecOutcome {
    Success,
    Failure(String),
    Cancelled,
}

pub struct Node {
    pub id: usize,
    pub step: Step,
    state: Mutex<NodeState>,
    output_variables: OutputVariables,
    pid: AtomicI32,
    signalled: AtomicBool,
    done: AtomicBool,
    script_file: Mutex<Option<PathBuf>>,
}

impl Node {
    pub fn new(id: usize, step: Step, output_variables: OutputVariables) -> Self {
        Self {
            id,
            step,
            state: Mutex::new(NodeState::default()),
            output_variables,
            pid: AtomicI32::new(0),
            signalled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            script_file: Mutex::new(None),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state.lock().unwrap().clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.state.lock().unwrap().status
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.state.lock().unwrap().status = status;
    }

    /// Snapshot for status persistence.
    pub fn report(&self) -> crate::status::StepState {
        let state = self.state();
        crate::status::StepState {
            step: self.step.clone(),
            status: state.status,
            status_text: state.status.text().to_string(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            retry_count: state.retry_count,
            done_count: state.done_count,
            error: state.error,
            log: state
                .log_file
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }

    /// Prepare the per-run log file and, for script steps, the executable
    /// temp file. Failures here fail the node before any process starts.
    pub fn setup(&self, log_dir: &Path, request_id: &str) -> Result<()> {
        let result = self.setup_inner(log_dir, request_id);
        if let Err(e) = &result {
            let mut state = self.state.lock().unwrap();
            state.status = NodeStatus::Error;
            state.error = Some(e.to_string());
            self.done.store(true, Ordering::SeqCst);
        }
        result
    }

    fn setup_inner(&self, log_dir: &Path, request_id: &str) -> Result<()> {
        std::fs::create_dir_all(log_dir)?;
        let prefix = &request_id[..request_id.len().min(8)];
        let timestamp = Utc::now().format("%Y%m%d.%H%M%S.%3f");
        let log_file = log_dir.join(format!(
            "{}.{}.{}.log",
            sanitize_name(&self.step.name),
            timestamp,
            prefix
        ));
        std::fs::File::create(&log_file)?;
        self.state.lock().unwrap().log_file = Some(log_file);

        if let Some(script) = &self.step.script {
            let path = log_dir.join(format!(
                "{}.{}.{}.sh",
                sanitize_name(&self.step.name),
                timestamp,
                prefix
            ));
            std::fs::write(&path, script)?;
            let mut perms = std::fs::metadata(&path)?.permissions();
            std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
            std::fs::set_permissions(&path, perms)?;
            *self.script_file.lock().unwrap() = Some(path);
        }
        Ok(())
    }

    /// Drive the node to a terminal state: execute, honoring the retry and
    /// repeat policies, until it finishes or the run is cancelled.
    pub async fn run(
        &self,
        mut cancel: watch::Receiver<bool>,
        dry: bool,
        progress: Option<&ProgressHook>,
    ) {
        self.start_running();
        notify(progress);

        loop {
            if dry {
                self.finish(NodeStatus::Success, None);
                break;
            }

            let outcome = match self.execute_once().await {
                Ok(outcome) => outcome,
                Err(e) => ExecOutcome::Failure(e.to_string()),
            };

            match outcome {
                ExecOutcome::Success => {
                    self.inc_done_count();
                    let repeat = self.step.repeat_policy;
                    if repeat.repeat && !self.cancel_seen(&cancel) {
                        notify(progress);
                        if self.sleep_interruptible(repeat.interval, &mut cancel).await {
                            self.finish(NodeStatus::Cancel, None);
                            break;
                        }
                        continue;
                    }
                    self.finish(NodeStatus::Success, None);
                    break;
                }
                ExecOutcome::Cancelled => {
                    self.finish(NodeStatus::Cancel, None);
                    break;
                }
                ExecOutcome::Failure(message) => {
                    let retry = self.step.retry_policy;
                    let can_retry = retry
                        .map(|r| r.limit > 0 && self.retry_count() < r.limit)
                        .unwrap_or(false);
                    if can_retry && !self.cancel_seen(&cancel) {
                        self.inc_retry_count();
                        notify(progress);
                        let interval = retry.unwrap().interval;
                        if self.sleep_interruptible(interval, &mut cancel).await {
                            self.finish(NodeStatus::Cancel, Some(message));
                            break;
                        }
                        continue;
                    }
                    self.finish(NodeStatus::Error, Some(message));
                    break;
                }
            }
        }

        self.done.store(true, Ordering::SeqCst);
        notify(progress);
    }

    /// One execution attempt: spawn the process, tee the output, wait.
    async fn execute_once(&self) -> Result<ExecOutcome> {
        let script_file = self.script_file.lock().unwrap().clone();

        let mut cmd = std::process::Command::new(&self.step.command);
        cmd.args(&self.step.args);
        if let Some(script) = &script_file {
            cmd.arg(script);
        }
        if let Some(dir) = &self.step.dir {
            cmd.current_dir(dir);
        }
        for pair in &self.step.variables {
            if let Some((k, v)) = pair.split_once('=') {
                cmd.env(k, v);
            }
        }
        {
            // snapshot of outputs published by upstream steps
            let outputs = self.output_variables.lock().unwrap();
            for pair in outputs.values() {
                if let Some((k, v)) = pair.split_once('=') {
                    cmd.env(k, v);
                }
            }
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // own process group, so signals reach the whole tree
        cmd.process_group(0);

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        self.pid.store(child.id().map(|p| p as i32).unwrap_or(0), Ordering::SeqCst);

        let capture = self
            .step
            .output
            .as_ref()
            .map(|_| Arc::new(Mutex::new(Vec::new())));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(pump(
            stdout,
            self.stdout_sinks(capture.clone()).await?,
        ));
        let stderr_task = tokio::spawn(pump(stderr, self.stderr_sinks().await?));

        let exit = child.wait().await;
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        self.pid.store(0, Ordering::SeqCst);

        let exit = exit?;
        if self.signalled.load(Ordering::SeqCst) || exit.signal().is_some() {
            return Ok(ExecOutcome::Cancelled);
        }
        if !exit.success() {
            return Ok(ExecOutcome::Failure(format!(
                "step '{}' exited with code {}",
                self.step.name,
                exit.code().unwrap_or(-1)
            )));
        }

        if let (Some(name), Some(buffer)) = (&self.step.output, capture) {
            let raw = buffer.lock().unwrap().clone();
            let value = String::from_utf8_lossy(&raw).trim().to_string();
            env::set_var(name, &value);
            self.output_variables
                .lock()
                .unwrap()
                .insert(name.clone(), format!("{name}={value}"));
        }
        Ok(ExecOutcome::Success)
    }

    async fn stdout_sinks(&self, capture: Option<Arc<Mutex<Vec<u8>>>>) -> Result<Vec<OutSink>> {
        let mut sinks = Vec::new();
        if let Some(log) = self.log_file_path() {
            sinks.push(OutSink::File(open_append(&log).await?));
        }
        if let Some(path) = &self.step.stdout {
            sinks.push(OutSink::File(open_append(&self.resolve_path(path)).await?));
        }
        if let Some(buffer) = capture {
            sinks.push(OutSink::Capture(buffer));
        }
        Ok(sinks)
    }

    async fn stderr_sinks(&self) -> Result<Vec<OutSink>> {
        let mut sinks = Vec::new();
        if let Some(log) = self.log_file_path() {
            sinks.push(OutSink::File(open_append(&log).await?));
        }
        if let Some(path) = &self.step.stderr {
            sinks.push(OutSink::File(open_append(&self.resolve_path(path)).await?));
        }
        Ok(sinks)
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            return p;
        }
        match &self.step.dir {
            Some(dir) => Path::new(dir).join(p),
            None => p,
        }
    }

    /// Remove the script temp file and verify the node actually finished.
    pub fn teardown(&self) -> Result<()> {
        if let Some(path) = self.script_file.lock().unwrap().take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("failed to remove script file {:?}: {}", path, e);
            }
        }
        if !self.done.load(Ordering::SeqCst) {
            let message = format!("step '{}' never finished", self.step.name);
            self.state.lock().unwrap().error = Some(message.clone());
            return Err(Error::Other(message));
        }
        Ok(())
    }

    /// Signal the node's process group. When `allow_override` is set and the
    /// step declares `signal_on_stop`, that signal is sent instead.
    pub fn signal(&self, sig: i32, allow_override: bool) {
        let sig = if allow_override {
            self.step
                .signal_on_stop
                .as_deref()
                .and_then(|name| process::signal_from_name(name).ok())
                .unwrap_or(sig)
        } else {
            sig
        };
        self.signalled.store(true, Ordering::SeqCst);
        process::kill_process_group(self.pid.load(Ordering::SeqCst), sig);
    }

    /// Last-resort SIGKILL to the process group.
    pub fn hard_kill(&self) {
        self.signalled.store(true, Ordering::SeqCst);
        process::kill_process_group(self.pid.load(Ordering::SeqCst), process::SIGKILL);
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().unwrap().retry_count
    }

    pub fn done_count(&self) -> u32 {
        self.state.lock().unwrap().done_count
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().log_file.clone()
    }

    fn start_running(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = NodeStatus::Running;
        state.started_at = Some(Utc::now());
    }

    fn finish(&self, status: NodeStatus, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.finished_at = Some(Utc::now());
        if error.is_some() {
            state.error = error;
        }
    }

    fn inc_retry_count(&self) {
        self.state.lock().unwrap().retry_count += 1;
    }

    fn inc_done_count(&self) {
        self.state.lock().unwrap().done_count += 1;
    }

    fn cancel_seen(&self, cancel: &watch::Receiver<bool>) -> bool {
        self.signalled.load(Ordering::SeqCst) || *cancel.borrow()
    }

    /// Sleep for `interval`, returning true if the run was cancelled first.
    async fn sleep_interruptible(
        &self,
        interval: std::time::Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            changed = cancel.changed() => changed.map(|_| *cancel.borrow()).unwrap_or(true),
        }
    }
}

enum OutSink {
    File(tokio::fs::File),
    Capture(Arc<Mutex<Vec<u8>>>),
}

async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    Ok(tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Copy everything from `reader` into every sink.
async fn pump<R>(reader: Option<R>, mut sinks: Vec<OutSink>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for sink in &mut sinks {
            match sink {
                OutSink::File(f) => f.write_all(&buf[..n]).await?,
                OutSink::Capture(c) => c.lock().unwrap().extend_from_slice(&buf[..n]),
            }
        }
    }
    for sink in &mut sinks {
        if let OutSink::File(f) = sink {
            f.flush().await?;
        }
    }
    Ok(())
}

fn notify(progress: Option<&ProgressHook>) {
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

    fn outputs() -> OutputVariables {
        Arc::new(Mutex::new(HashMap::new()))
    }

    fn cancel_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn step(cmd_with_args: &str) -> Step {
        let words = shell_words::split(cmd_with_args).unwrap();
        Step {
            name: "test".to_string(),
            command: words[0].clone(),
            args: words[1..].to_vec(),
            cmd_with_args: cmd_with_args.to_string(),
            ..Default::default()
        }
    }

    async fn run_node(node: &Node) {
        let dir = tempfile::tempdir().unwrap();
        node.setup(dir.path(), "test-request-id").unwrap();
        let (_tx, rx) = cancel_channel();
        node.run(rx, false, None).await;
        node.teardown().unwrap();
    }

    #[tokio::test]
    async fn test_execute_success() {
        let node = Node::new(0, step("true"), outputs());
        run_node(&node).await;
        assert_eq!(node.status(), NodeStatus::Success);
        assert!(node.state().error.is_none());
    }

    #[tokio::test]
    async fn test_execute_failure() {
        let node = Node::new(0, step("false"), outputs());
        run_node(&node).await;
        assert_eq!(node.status(), NodeStatus::Error);
        assert!(node.state().error.is_some());
    }

    #[tokio::test]
    async fn test_log_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(0, step("echo done"), outputs());
        node.setup(dir.path(), "req-log-test").unwrap();
        let (_tx, rx) = cancel_channel();
        node.run(rx, false, None).await;
        node.teardown().unwrap();

        let log = node.log_file_path().unwrap();
        let data = std::fs::read_to_string(log).unwrap();
        assert_eq!(data, "done\n");
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = step("sh");
        s.script = Some("echo out-message >&1\necho err-message >&2\n".to_string());
        s.dir = Some(dir.path().to_string_lossy().to_string());
        s.stdout = Some("stdout.log".to_string());
        s.stderr = Some("stderr.log".to_string());
        let node = Node::new(0, s, outputs());
        node.setup(dir.path(), "req-stdio").unwrap();
        let (_tx, rx) = cancel_channel();
        node.run(rx, false, None).await;
        node.teardown().unwrap();

        let out = std::fs::read_to_string(dir.path().join("stdout.log")).unwrap();
        let err = std::fs::read_to_string(dir.path().join("stderr.log")).unwrap();
        assert_eq!(out, "out-message\n");
        assert_eq!(err, "err-message\n");
    }

    #[tokio::test]
    async fn test_output_capture() {
        let _guard = lock_env();
        let shared = outputs();
        let mut s = step("echo hello");
        s.output = Some("NODE_OUTPUT_TEST".to_string());
        let node = Node::new(0, s, shared.clone());
        run_node(&node).await;

        assert_eq!(node.status(), NodeStatus::Success);
        assert_eq!(std::env::var("NODE_OUTPUT_TEST").unwrap(), "hello");
        assert_eq!(
            shared.lock().unwrap().get("NODE_OUTPUT_TEST").unwrap(),
            "NODE_OUTPUT_TEST=hello"
        );
    }

    #[tokio::test]
    async fn test_output_preserves_json() {
        let _guard = lock_env();
        let shared = outputs();
        let mut s = step(r#"echo {\"key\":\"value\"}"#);
        s.output = Some("NODE_JSON_TEST".to_string());
        assert_eq!(s.args.len(), 1);
        let node = Node::new(0, s, shared.clone());
        run_node(&node).await;

        assert_eq!(
            shared.lock().unwrap().get("NODE_JSON_TEST").unwrap(),
            r#"NODE_JSON_TEST={"key":"value"}"#
        );
    }

    #[tokio::test]
    async fn test_output_visible_to_downstream_node() {
        let _guard = lock_env();
        let shared = outputs();
        let mut first = step("echo chained");
        first.output = Some("NODE_CHAIN_TEST".to_string());
        let node = Node::new(0, first, shared.clone());
        run_node(&node).await;

        let mut second = step("sh -c");
        second.args.push("echo $NODE_CHAIN_TEST".to_string());
        second.output = Some("NODE_CHAIN_TEST2".to_string());
        let node2 = Node::new(1, second, shared.clone());
        run_node(&node2).await;

        assert_eq!(
            shared.lock().unwrap().get("NODE_CHAIN_TEST2").unwrap(),
            "NODE_CHAIN_TEST2=chained"
        );
    }

    #[tokio::test]
    async fn test_script_execution() {
        let _guard = lock_env();
        let shared = outputs();
        let mut s = step("sh");
        s.script = Some("echo from-script\n".to_string());
        s.output = Some("NODE_SCRIPT_TEST".to_string());
        let node = Node::new(0, s, shared.clone());

        let dir = tempfile::tempdir().unwrap();
        node.setup(dir.path(), "req-script").unwrap();
        let script = node.script_file.lock().unwrap().clone().unwrap();
        assert_eq!(
            std::fs::read_to_string(&script).unwrap(),
            "echo from-script\n"
        );

        let (_tx, rx) = cancel_channel();
        node.run(rx, false, None).await;
        node.teardown().unwrap();

        assert_eq!(node.status(), NodeStatus::Success);
        assert_eq!(std::env::var("NODE_SCRIPT_TEST").unwrap(), "from-script");
        assert!(!script.exists());
    }

    #[tokio::test]
    async fn test_retry_then_error() {
        let mut s = step("false");
        s.retry_policy = Some(RetryPolicy {
            limit: 2,
            interval: Duration::from_millis(10),
        });
        let node = Node::new(0, s, outputs());
        run_node(&node).await;

        assert_eq!(node.status(), NodeStatus::Error);
        assert_eq!(node.retry_count(), 2);
    }

    #[tokio::test]
    async fn test_signal_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(Node::new(0, step("sleep 100"), outputs()));
        node.setup(dir.path(), "req-signal").unwrap();

        let handle = {
            let node = node.clone();
            let (_tx, rx) = cancel_channel();
            tokio::spawn(async move {
                node.run(rx, false, None).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        node.signal(process::SIGTERM, false);
        handle.await.unwrap();

        assert_eq!(node.status(), NodeStatus::Cancel);
        node.teardown().unwrap();
    }

    #[tokio::test]
    async fn test_signal_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = step("sleep 100");
        s.signal_on_stop = Some("SIGINT".to_string());
        let node = Arc::new(Node::new(0, s, outputs()));
        node.setup(dir.path(), "req-signal-override").unwrap();

        let handle = {
            let node = node.clone();
            let (_tx, rx) = cancel_channel();
            tokio::spawn(async move {
                node.run(rx, false, None).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        node.signal(process::SIGTERM, true);
        handle.await.unwrap();

        assert_eq!(node.status(), NodeStatus::Cancel);
        node.teardown().unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(0, step("false"), outputs());
        node.setup(dir.path(), "req-dry").unwrap();
        let (_tx, rx) = cancel_channel();
        node.run(rx, true, None).await;
        node.teardown().unwrap();

        // a dry run succeeds even though the command would have failed
        assert_eq!(node.status(), NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_teardown_without_done_fails() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(0, step("true"), outputs());
        node.setup(dir.path(), "req-teardown").unwrap();
        assert!(node.teardown().is_err());
    }

    #[tokio::test]
    async fn test_setup_failure_marks_error() {
        let node = Node::new(0, step("true"), outputs());
        // an unwritable log dir fails the node before any process starts
        let err = node.setup(Path::new("/proc/definitely/not/writable"), "req-x");
        assert!(err.is_err());
        assert_eq!(node.status(), NodeStatus::Error);
    }
}
