//! YAML loader for DAG definitions.
//!
//! The on-disk shapes are permissive (`schedule` may be a string, a list, or
//! a start/stop/restart map; `env` a map or a list of maps), so raw
//! definitions are read into `serde_yaml::Value` fields first and classified
//! by type before anything is built.

use super::env;
use super::step::{Condition, ContinueOn, ExecutorConfig, RepeatPolicy, RetryPolicy, Step};
use super::{
    Dag, HandlerOn, MailConfig, MailOn, Schedule, SmtpConfig, ON_CANCEL, ON_EXIT, ON_FAILURE,
    ON_SUCCESS,
};
use crate::error::{Error, Result};
use crate::process;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Options controlling how a definition is turned into a `Dag`.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Parse only name/group/tags/schedule, for catalog scans.
    pub head_only: bool,
    /// Override for `params`; empty means use the file's defaults.
    pub parameters: String,
    /// Skip `${VAR}`/backtick evaluation (used by validation-only loads).
    pub no_eval: bool,
    /// Skip exporting env/params into the process environment.
    pub no_setenv: bool,
}

/// Load a DAG file, applying `params` over its default parameters.
pub fn load_dag(path: &Path, params: &str) -> Result<Dag> {
    let content = std::fs::read_to_string(path)?;
    let opts = BuildOptions {
        parameters: params.to_string(),
        ..Default::default()
    };
    build_from_source(&content, path, &opts)
}

/// Load only the headline fields (name, group, tags, schedules).
pub fn load_dag_head_only(path: &Path) -> Result<Dag> {
    let content = std::fs::read_to_string(path)?;
    let opts = BuildOptions {
        head_only: true,
        no_setenv: true,
        ..Default::default()
    };
    build_from_source(&content, path, &opts)
}

/// Build a DAG from in-memory YAML, recording `location` as its path.
pub fn load_dag_yaml(content: &str, location: &Path, params: &str) -> Result<Dag> {
    let opts = BuildOptions {
        parameters: params.to_string(),
        ..Default::default()
    };
    build_from_source(content, location, &opts)
}

/// Validate YAML without touching the process environment.
pub fn validate_dag_yaml(content: &str, location: &Path) -> Result<Dag> {
    let opts = BuildOptions {
        no_eval: true,
        no_setenv: true,
        ..Default::default()
    };
    build_from_source(content, location, &opts)
}

fn build_from_source(content: &str, location: &Path, opts: &BuildOptions) -> Result<Dag> {
    let def: DagDef = serde_yaml::from_str(content)?;
    build(&def, location, opts)
}

/// Serialize a DAG back into a definition document. Loading the output
/// produces a structurally equal DAG.
pub fn dag_to_yaml(dag: &Dag) -> Result<String> {
    Ok(serde_yaml::to_string(&to_definition(dag))?)
}

// ---------------------------------------------------------------------------
// raw definition shapes

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DagDef {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    group: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    tags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule: Option<Value>,
    #[serde(skip_serializing_if = "is_zero")]
    delay_sec: u64,
    #[serde(skip_serializing_if = "is_zero")]
    restart_wait_sec: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    hist_retention_days: Option<u32>,
    #[serde(skip_serializing_if = "is_zero_i32")]
    max_active_runs: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_clean_up_time_sec: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    params: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    preconditions: Vec<ConditionDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    steps: Vec<StepDef>,
    #[serde(skip_serializing_if = "HandlerOnDef::is_empty")]
    handler_on: HandlerOnDef,
    #[serde(skip_serializing_if = "Option::is_none")]
    smtp: Option<SmtpConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_mail: Option<MailConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    info_mail: Option<MailConfig>,
    #[serde(skip_serializing_if = "is_default_mail_on")]
    mail_on: MailOn,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal_on_stop: Option<String>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_default_mail_on(v: &MailOn) -> bool {
    !v.failure && !v.success
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StepDef {
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    executor: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    continue_on: Option<ContinueOnDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_policy: Option<RetryPolicyDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_policy: Option<RepeatPolicyDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signal_on_stop: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    mail_on_error: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    preconditions: Vec<ConditionDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ContinueOnDef {
    failure: bool,
    skipped: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RetryPolicyDef {
    limit: u32,
    interval_sec: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RepeatPolicyDef {
    repeat: bool,
    interval_sec: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConditionDef {
    condition: String,
    expected: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct HandlerOnDef {
    #[serde(skip_serializing_if = "Option::is_none")]
    exit: Option<StepDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<StepDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<StepDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancel: Option<StepDef>,
}

impl HandlerOnDef {
    fn is_empty(&self) -> bool {
        self.exit.is_none()
            && self.success.is_none()
            && self.failure.is_none()
            && self.cancel.is_none()
    }
}

// ---------------------------------------------------------------------------
// building

fn build(def: &DagDef, location: &Path, opts: &BuildOptions) -> Result<Dag> {
    let mut dag = Dag {
        location: location.to_path_buf(),
        ..Default::default()
    };

    dag.name = match &def.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => location
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    dag.group = def.group.clone();
    dag.description = def.description.clone();
    dag.tags = parse_tags(&def.tags);

    build_schedules(def, &mut dag)?;

    if opts.head_only {
        return Ok(dag);
    }

    dag.delay = Duration::from_secs(def.delay_sec);
    dag.restart_wait = Duration::from_secs(def.restart_wait_sec);
    if let Some(days) = def.hist_retention_days {
        dag.hist_retention_days = days;
    }
    dag.max_active_runs = def.max_active_runs;
    if let Some(secs) = def.max_clean_up_time_sec {
        dag.max_cleanup_time = Duration::from_secs(secs);
    }
    if let Some(sig) = &def.signal_on_stop {
        process::signal_from_name(sig)?;
        dag.signal_on_stop = Some(sig.clone());
    }

    build_env(def, &mut dag, opts)?;
    dag.log_dir = match &def.log_dir {
        Some(dir) if !opts.no_eval => Some(env::expand_env(dir)),
        Some(dir) => Some(dir.clone()),
        None => None,
    };
    build_params(def, &mut dag, opts)?;

    for step_def in &def.steps {
        let step = build_step(step_def, &dag.env, opts)?;
        dag.steps.push(step);
    }
    assert_step_names(&dag.steps)?;
    assert_acyclic(&dag.steps)?;

    // DAG-level stop signal is the default for steps without their own
    if let Some(sig) = &dag.signal_on_stop {
        for step in &mut dag.steps {
            if step.signal_on_stop.is_none() {
                step.signal_on_stop = Some(sig.clone());
            }
        }
    }

    dag.handler_on = HandlerOn {
        exit: build_handler(&def.handler_on.exit, ON_EXIT, &dag.env, opts)?,
        success: build_handler(&def.handler_on.success, ON_SUCCESS, &dag.env, opts)?,
        failure: build_handler(&def.handler_on.failure, ON_FAILURE, &dag.env, opts)?,
        cancel: build_handler(&def.handler_on.cancel, ON_CANCEL, &dag.env, opts)?,
    };

    dag.preconditions = build_conditions(&def.preconditions);
    dag.smtp = def.smtp.clone();
    dag.error_mail = def.error_mail.clone();
    dag.info_mail = def.info_mail.clone();
    dag.mail_on = def.mail_on;

    Ok(dag)
}

const SCHEDULE_START: &str = "start";
const SCHEDULE_STOP: &str = "stop";
const SCHEDULE_RESTART: &str = "restart";

/// `schedule` is a tagged union over the YAML value type: a bare string, a
/// list of strings, or a map from start/stop/restart to either.
fn build_schedules(def: &DagDef, dag: &mut Dag) -> Result<()> {
    let mut starts = Vec::new();
    let mut stops = Vec::new();
    let mut restarts = Vec::new();

    match &def.schedule {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => starts.push(s.clone()),
        Some(Value::Sequence(seq)) => collect_expressions(seq, &mut starts)?,
        Some(Value::Mapping(map)) => {
            for (key, value) in map {
                let key = key.as_str().ok_or(Error::InvalidScheduleShape)?;
                let bucket = match key {
                    SCHEDULE_START => &mut starts,
                    SCHEDULE_STOP => &mut stops,
                    SCHEDULE_RESTART => &mut restarts,
                    other => return Err(Error::UnknownScheduleKey(other.to_string())),
                };
                match value {
                    Value::String(s) => bucket.push(s.clone()),
                    Value::Sequence(seq) => collect_expressions(seq, bucket)?,
                    _ => return Err(Error::InvalidScheduleShape),
                }
            }
        }
        Some(_) => return Err(Error::InvalidScheduleShape),
    }

    dag.schedule = parse_schedules(&starts)?;
    dag.stop_schedule = parse_schedules(&stops)?;
    dag.restart_schedule = parse_schedules(&restarts)?;
    Ok(())
}

fn collect_expressions(seq: &[Value], out: &mut Vec<String>) -> Result<()> {
    for v in seq {
        match v {
            Value::String(s) => out.push(s.clone()),
            _ => return Err(Error::InvalidScheduleShape),
        }
    }
    Ok(())
}

fn parse_schedules(expressions: &[String]) -> Result<Vec<Schedule>> {
    expressions.iter().map(|e| Schedule::parse(e)).collect()
}

/// `env` is a map or a list of maps; later entries may reference earlier
/// ones through `${VAR}`, so each value is exported as soon as it is built.
fn build_env(def: &DagDef, dag: &mut Dag, opts: &BuildOptions) -> Result<()> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    match &def.env {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(map)) => collect_env_pairs(map, &mut pairs)?,
        Some(Value::Sequence(seq)) => {
            for item in seq {
                match item {
                    Value::Mapping(map) => collect_env_pairs(map, &mut pairs)?,
                    _ => return Err(Error::Other("env must be a map or a list of maps".into())),
                }
            }
        }
        Some(_) => return Err(Error::Other("env must be a map or a list of maps".into())),
    }

    for (key, value) in pairs {
        let value = if opts.no_eval {
            value
        } else {
            env::eval_value(&value)?
        };
        if !opts.no_setenv {
            env::set_var(&key, &value);
        }
        dag.env.push(format!("{key}={value}"));
    }
    Ok(())
}

fn collect_env_pairs(
    map: &serde_yaml::Mapping,
    out: &mut Vec<(String, String)>,
) -> Result<()> {
    for (k, v) in map {
        let key = k
            .as_str()
            .ok_or_else(|| Error::Other("env keys must be strings".into()))?;
        let value = v
            .as_str()
            .ok_or_else(|| Error::Other(format!("invalid value for env {key}")))?;
        out.push((key.to_string(), value.to_string()));
    }
    Ok(())
}

/// Parameters are split shell-style; `K=V` entries are exported by name and
/// every entry is exported positionally as `$1..$N`.
fn build_params(def: &DagDef, dag: &mut Dag, opts: &BuildOptions) -> Result<()> {
    dag.default_params = def.params.clone();
    let raw = if opts.parameters.is_empty() {
        dag.default_params.clone()
    } else {
        opts.parameters.clone()
    };
    if raw.is_empty() {
        return Ok(());
    }

    let words =
        shell_words::split(&raw).map_err(|e| Error::InvalidParams(e.to_string()))?;
    for (i, word) in words.into_iter().enumerate() {
        let value = if opts.no_eval {
            word
        } else {
            env::eval_value(&word)?
        };
        if !opts.no_setenv {
            if let Some((key, val)) = value.split_once('=') {
                env::set_var(key, val);
                dag.env.push(value.clone());
            }
            env::set_var(&(i + 1).to_string(), &value);
        }
        dag.params.push(value);
    }
    Ok(())
}

fn build_handler(
    def: &Option<StepDef>,
    name: &str,
    variables: &[String],
    opts: &BuildOptions,
) -> Result<Option<Step>> {
    match def {
        Some(step_def) => {
            let mut step_def = step_def.clone();
            step_def.name = name.to_string();
            Ok(Some(build_step(&step_def, variables, opts)?))
        }
        None => Ok(None),
    }
}

fn build_step(def: &StepDef, variables: &[String], opts: &BuildOptions) -> Result<Step> {
    if def.name.is_empty() {
        return Err(Error::StepNameRequired);
    }
    if def.command.is_empty() && def.script.is_none() {
        return Err(Error::StepCommandRequired);
    }

    let mut step = Step {
        name: def.name.clone(),
        description: def.description.clone(),
        cmd_with_args: def.command.clone(),
        ..Default::default()
    };

    if def.command.is_empty() {
        // script-only step: run it under the default shell
        step.command = "sh".to_string();
    } else {
        let words = shell_words::split(&def.command)
            .map_err(|e| Error::Other(format!("invalid command for step '{}': {e}", def.name)))?;
        let mut words = words.into_iter();
        step.command = words.next().ok_or(Error::StepCommandRequired)?;
        step.args = words.collect();
    }

    step.script = def.script.clone();
    step.stdout = def.stdout.as_ref().map(|s| expand_opt(s, opts));
    step.stderr = def.stderr.as_ref().map(|s| expand_opt(s, opts));
    step.output = def.output.clone();
    step.dir = def.dir.as_ref().map(|s| expand_opt(s, opts));
    step.variables = variables.to_vec();
    step.depends = def.depends.clone();

    if let Some(executor) = &def.executor {
        step.executor = build_executor(executor, &def.name)?;
    }
    if let Some(c) = &def.continue_on {
        step.continue_on = ContinueOn {
            failure: c.failure,
            skipped: c.skipped,
        };
    }
    if let Some(r) = &def.retry_policy {
        step.retry_policy = Some(RetryPolicy {
            limit: r.limit,
            interval: Duration::from_secs(r.interval_sec),
        });
    }
    if let Some(r) = &def.repeat_policy {
        step.repeat_policy = RepeatPolicy {
            repeat: r.repeat,
            interval: Duration::from_secs(r.interval_sec),
        };
    }
    if let Some(sig) = &def.signal_on_stop {
        process::signal_from_name(sig)?;
        step.signal_on_stop = Some(sig.clone());
    }
    step.mail_on_error = def.mail_on_error;
    step.preconditions = build_conditions(&def.preconditions);
    Ok(step)
}

fn expand_opt(value: &str, opts: &BuildOptions) -> String {
    if opts.no_eval {
        value.to_string()
    } else {
        env::expand_env(value)
    }
}

fn build_executor(value: &Value, step_name: &str) -> Result<ExecutorConfig> {
    match value {
        Value::String(t) => Ok(ExecutorConfig {
            executor_type: t.clone(),
            config: Default::default(),
        }),
        Value::Mapping(map) => {
            let mut executor = ExecutorConfig::default();
            for (k, v) in map {
                let key = k
                    .as_str()
                    .ok_or_else(|| Error::InvalidExecutorConfig(step_name.to_string()))?;
                if key == "type" {
                    executor.executor_type = v
                        .as_str()
                        .ok_or_else(|| Error::InvalidExecutorConfig(step_name.to_string()))?
                        .to_string();
                } else {
                    let json = serde_json::to_value(v)
                        .map_err(|_| Error::InvalidExecutorConfig(step_name.to_string()))?;
                    executor.config.insert(key.to_string(), json);
                }
            }
            Ok(executor)
        }
        _ => Err(Error::InvalidExecutorConfig(step_name.to_string())),
    }
}

fn build_conditions(defs: &[ConditionDef]) -> Vec<Condition> {
    defs.iter()
        .map(|d| Condition {
            condition: d.condition.clone(),
            expected: d.expected.clone(),
        })
        .collect()
}

fn assert_step_names(steps: &[Step]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for step in steps {
        if !seen.insert(step.name.as_str()) {
            return Err(Error::DuplicateStepName(step.name.clone()));
        }
    }
    for step in steps {
        for dep in &step.depends {
            if !seen.contains(dep.as_str()) {
                return Err(Error::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Cyclic `depends` are configuration errors; a cyclic file is rejected
/// before it can be persisted or scheduled. Must run after
/// `assert_step_names` so every dependency name resolves.
fn assert_acyclic(steps: &[Step]) -> Result<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();
    for step in steps {
        let idx = graph.add_node(step.name.as_str());
        indices.insert(step.name.as_str(), idx);
    }
    for step in steps {
        for dep in &step.depends {
            graph.add_edge(indices[dep.as_str()], indices[step.name.as_str()], ());
        }
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| Error::CycleDetected(graph[cycle.node_id()].to_string()))
}

fn parse_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// serialization back to a definition

fn to_definition(dag: &Dag) -> DagDef {
    let mut schedule_map = serde_yaml::Mapping::new();
    for (key, schedules) in [
        (SCHEDULE_START, &dag.schedule),
        (SCHEDULE_STOP, &dag.stop_schedule),
        (SCHEDULE_RESTART, &dag.restart_schedule),
    ] {
        if !schedules.is_empty() {
            let exprs: Vec<Value> = schedules
                .iter()
                .map(|s| Value::String(s.expression.clone()))
                .collect();
            schedule_map.insert(Value::String(key.to_string()), Value::Sequence(exprs));
        }
    }

    let env_seq: Vec<Value> = dag
        .env
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            let mut m = serde_yaml::Mapping::new();
            m.insert(Value::String(k.to_string()), Value::String(v.to_string()));
            Value::Mapping(m)
        })
        .collect();

    DagDef {
        name: Some(dag.name.clone()),
        group: dag.group.clone(),
        description: dag.description.clone(),
        tags: dag.tags.join(","),
        env: (!env_seq.is_empty()).then(|| Value::Sequence(env_seq)),
        log_dir: dag.log_dir.clone(),
        schedule: (!schedule_map.is_empty()).then(|| Value::Mapping(schedule_map)),
        delay_sec: dag.delay.as_secs(),
        restart_wait_sec: dag.restart_wait.as_secs(),
        hist_retention_days: Some(dag.hist_retention_days),
        max_active_runs: dag.max_active_runs,
        max_clean_up_time_sec: Some(dag.max_cleanup_time.as_secs()),
        params: dag.default_params.clone(),
        preconditions: conditions_to_defs(&dag.preconditions),
        steps: dag.steps.iter().map(step_to_def).collect(),
        handler_on: HandlerOnDef {
            exit: dag.handler_on.exit.as_ref().map(step_to_def_ref),
            success: dag.handler_on.success.as_ref().map(step_to_def_ref),
            failure: dag.handler_on.failure.as_ref().map(step_to_def_ref),
            cancel: dag.handler_on.cancel.as_ref().map(step_to_def_ref),
        },
        smtp: dag.smtp.clone(),
        error_mail: dag.error_mail.clone(),
        info_mail: dag.info_mail.clone(),
        mail_on: dag.mail_on,
        signal_on_stop: dag.signal_on_stop.clone(),
    }
}

fn step_to_def(step: &Step) -> StepDef {
    StepDef {
        name: step.name.clone(),
        description: step.description.clone(),
        command: step.cmd_with_args.clone(),
        script: step.script.clone(),
        stdout: step.stdout.clone(),
        stderr: step.stderr.clone(),
        output: step.output.clone(),
        dir: step.dir.clone(),
        executor: executor_to_value(&step.executor),
        depends: step.depends.clone(),
        continue_on: (step.continue_on.failure || step.continue_on.skipped).then(|| {
            ContinueOnDef {
                failure: step.continue_on.failure,
                skipped: step.continue_on.skipped,
            }
        }),
        retry_policy: step.retry_policy.map(|r| RetryPolicyDef {
            limit: r.limit,
            interval_sec: r.interval.as_secs(),
        }),
        repeat_policy: step.repeat_policy.repeat.then(|| RepeatPolicyDef {
            repeat: true,
            interval_sec: step.repeat_policy.interval.as_secs(),
        }),
        signal_on_stop: step.signal_on_stop.clone(),
        mail_on_error: step.mail_on_error,
        preconditions: conditions_to_defs(&step.preconditions),
    }
}

fn step_to_def_ref(step: &Step) -> StepDef {
    step_to_def(step)
}

fn executor_to_value(executor: &ExecutorConfig) -> Option<Value> {
    if executor.executor_type.is_empty() && executor.config.is_empty() {
        return None;
    }
    if executor.config.is_empty() {
        return Some(Value::String(executor.executor_type.clone()));
    }
    let mut map = serde_yaml::Mapping::new();
    map.insert(
        Value::String("type".to_string()),
        Value::String(executor.executor_type.clone()),
    );
    for (k, v) in &executor.config {
        if let Ok(yaml) = serde_yaml::to_value(v) {
            map.insert(Value::String(k.clone()), yaml);
        }
    }
    Some(Value::Mapping(map))
}

fn conditions_to_defs(conditions: &[Condition]) -> Vec<ConditionDef> {
    conditions
        .iter()
        .map(|c| ConditionDef {
            condition: c.condition.clone(),
            expected: c.expected.clone(),
        })
        .collect()
}
