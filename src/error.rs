//! Error types for dagflow

use thiserror::Error;

/// dagflow error types
#[derive(Error, Debug)]
pub enum Error {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A step definition without a name
    #[error("step name must be specified")]
    StepNameRequired,

    /// A step definition without a command or script
    #[error("step command must be specified")]
    StepCommandRequired,

    /// Duplicate step names within one DAG
    #[error("duplicate step name '{0}'")]
    DuplicateStepName(String),

    /// A dependency on a step that does not exist
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// Cycle in the dependency graph
    #[error("cycle detected in step dependencies: {0}")]
    CycleDetected(String),

    /// Bad cron expression
    #[error("invalid schedule expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// Schedule value with an unexpected YAML shape
    #[error("schedule must be a string, an array of strings, or a map")]
    InvalidScheduleShape,

    /// Schedule map with a key other than start/stop/restart
    #[error("schedule key must be start, stop, or restart, got '{0}'")]
    UnknownScheduleKey(String),

    /// Bad executor value in a step definition
    #[error("invalid executor config for step '{0}'")]
    InvalidExecutorConfig(String),

    /// Unknown signal name
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    /// Invalid parameter string
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// A second agent attempted to run the same DAG
    #[error("{0} is already running")]
    AlreadyRunning(String),

    /// The control socket exists but did not answer within the deadline
    #[error("control socket request timed out")]
    SocketTimeout,

    /// No server is listening on the control socket
    #[error("control socket connection refused")]
    SocketRefused,

    /// No history recorded for the DAG at all
    #[error("no status data")]
    NoStatusData,

    /// No history recorded for the DAG today
    #[error("no status data today")]
    NoStatusDataToday,

    /// Request id lookup miss
    #[error("request id not found: {0}")]
    RequestIdNotFound(String),

    /// A scheduled job is still running
    #[error("job is already running")]
    JobRunning,

    /// A scheduled job already ran for this fire time
    #[error("job is already finished")]
    JobFinished,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias using dagflow's Error
pub type Result<T> = std::result::Result<T, Error>;
