//! DAG model: the user's workflow definition, immutable for the duration of
//! one run.

pub mod builder;
pub mod env;
pub mod step;

pub use builder::{load_dag, load_dag_head_only, load_dag_yaml};
pub use step::{Condition, ContinueOn, ExecutorConfig, RepeatPolicy, RetryPolicy, Step};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// A parsed cron expression together with its source text.
///
/// Expressions are standard 5-field cron (minute hour day-of-month month
/// day-of-week); seconds are pinned to zero.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub expression: String,
    parsed: cron::Schedule,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(Error::InvalidSchedule {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, got {fields}"),
            });
        }
        // the cron crate wants a seconds field in front
        let with_seconds = format!("0 {expression}");
        let parsed =
            cron::Schedule::from_str(&with_seconds).map_err(|e| Error::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            parsed,
        })
    }

    /// Earliest fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.parsed.after(&after).next()
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let expr = String::deserialize(deserializer)?;
        Schedule::parse(&expr).map_err(D::Error::custom)
    }
}

/// Lifecycle handler steps, each optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HandlerOn {
    pub exit: Option<Step>,
    pub success: Option<Step>,
    pub failure: Option<Step>,
    pub cancel: Option<Step>,
}

/// Mail triggers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailConfig {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub prefix: String,
}

/// Canonical handler step names.
pub const ON_EXIT: &str = "onExit";
pub const ON_SUCCESS: &str = "onSuccess";
pub const ON_FAILURE: &str = "onFailure";
pub const ON_CANCEL: &str = "onCancel";

/// The workflow definition: steps, dependencies, schedules, handlers and
/// run-level policies. Built once from YAML, owned by a single run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dag {
    pub name: String,
    pub location: PathBuf,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Ordered `K=V` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub default_params: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub handler_on: HandlerOn,
    #[serde(default)]
    pub preconditions: Vec<Condition>,
    #[serde(default)]
    pub schedule: Vec<Schedule>,
    #[serde(default)]
    pub stop_schedule: Vec<Schedule>,
    #[serde(default)]
    pub restart_schedule: Vec<Schedule>,
    #[serde(default)]
    pub delay: Duration,
    #[serde(default)]
    pub restart_wait: Duration,
    pub hist_retention_days: u32,
    /// Concurrency cap for running steps; zero means unbounded.
    #[serde(default)]
    pub max_active_runs: i32,
    /// Bound on the cancel drain before running steps are hard-killed.
    pub max_cleanup_time: Duration,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub error_mail: Option<MailConfig>,
    #[serde(default)]
    pub info_mail: Option<MailConfig>,
    #[serde(default)]
    pub mail_on: MailOn,
    /// Default stop signal for steps without their own `signal_on_stop`.
    #[serde(default)]
    pub signal_on_stop: Option<String>,
}

impl Default for Dag {
    fn default() -> Self {
        Self {
            name: String::new(),
            location: PathBuf::new(),
            group: String::new(),
            description: String::new(),
            log_dir: None,
            env: Vec::new(),
            default_params: String::new(),
            params: Vec::new(),
            steps: Vec::new(),
            handler_on: HandlerOn::default(),
            preconditions: Vec::new(),
            schedule: Vec::new(),
            stop_schedule: Vec::new(),
            restart_schedule: Vec::new(),
            delay: Duration::ZERO,
            restart_wait: Duration::ZERO,
            hist_retention_days: 30,
            max_active_runs: 0,
            max_cleanup_time: Duration::from_secs(60),
            tags: Vec::new(),
            smtp: None,
            error_mail: None,
            info_mail: None,
            mail_on: MailOn::default(),
            signal_on_stop: None,
        }
    }
}

impl Dag {
    /// Filesystem-safe rendition of the DAG name.
    pub fn safe_name(&self) -> String {
        sanitize_name(&self.name)
    }

    /// The per-DAG control socket path. The md5 suffix keys the socket to
    /// the absolute file location so same-named DAGs never collide.
    pub fn sock_addr(&self) -> PathBuf {
        let mut name = self.safe_name();
        name.truncate(50);
        PathBuf::from(format!(
            "/tmp/@dagflow-{}-{}.sock",
            name,
            location_hash(&self.location)
        ))
    }

    /// Step lookup by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Whether any schedule (start, stop or restart) is configured.
    pub fn has_schedule(&self) -> bool {
        !self.schedule.is_empty()
            || !self.stop_schedule.is_empty()
            || !self.restart_schedule.is_empty()
    }
}

impl fmt::Display for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "Description: {}", self.description)?;
        writeln!(f, "Params: {}", self.params.join(" "))?;
        for (i, s) in self.steps.iter().enumerate() {
            writeln!(f, "  Step{i}: {s}")?;
        }
        Ok(())
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// First 16 hex chars of the md5 of the absolute location path.
pub fn location_hash(location: &Path) -> String {
    let abs = location
        .canonicalize()
        .unwrap_or_else(|_| location.to_path_buf());
    let digest = Md5::digest(abs.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}
