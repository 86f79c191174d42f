//! Step model: one unit of shell work declared in a DAG.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// One step of a DAG: the command to run plus the policies that govern it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Executable name, split out of `cmd_with_args`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// The unsplit `command` string as written in the DAG file.
    #[serde(default)]
    pub cmd_with_args: String,
    /// Inline shell text, materialized to a temp file at setup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Environment variable name to capture trimmed stdout into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Environment snapshot (`K=V`) inherited from the DAG.
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub continue_on: ContinueOn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub repeat_policy: RepeatPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_on_stop: Option<String>,
    #[serde(default)]
    pub mail_on_error: bool,
    #[serde(default)]
    pub preconditions: Vec<Condition>,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.cmd_with_args)
    }
}

/// Executor selection for a step. Only the shell executor is built in; the
/// type and config map are carried so DAG files round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    #[serde(rename = "type", default)]
    pub executor_type: String,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// Policy preventing this step's Error/Skipped outcome from cancelling
/// downstream steps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContinueOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub skipped: bool,
}

/// Re-execution policy for non-zero exits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: u32,
    pub interval: Duration,
}

/// Re-execution policy for successful exits.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepeatPolicy {
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub interval: Duration,
}

/// A shell condition whose trimmed output must equal `expected` for
/// execution to proceed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub condition: String,
    pub expected: String,
}

impl Condition {
    /// Evaluate the condition: expand `${VAR}` references and backtick
    /// substitutions, then compare the trimmed result against `expected`.
    pub fn evaluate(&self) -> crate::error::Result<bool> {
        let actual = super::env::eval_value(&self.condition)?;
        Ok(actual.trim() == self.expected)
    }
}

/// Evaluate a list of conditions, short-circuiting on the first miss.
/// Returns the failing condition when one does not hold.
pub fn evaluate_conditions(conditions: &[Condition]) -> crate::error::Result<Option<Condition>> {
    for c in conditions {
        if !c.evaluate()? {
            return Ok(Some(c.clone()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::env::test_support::lock_env;

    #[test]
    fn test_condition_met() {
        let _guard = lock_env();
        let c = Condition {
            condition: "`echo 1`".to_string(),
            expected: "1".to_string(),
        };
        assert!(c.evaluate().unwrap());
    }

    #[test]
    fn test_condition_not_met() {
        let _guard = lock_env();
        let c = Condition {
            condition: "`echo 1`".to_string(),
            expected: "0".to_string(),
        };
        assert!(!c.evaluate().unwrap());
    }

    #[test]
    fn test_condition_env_expansion() {
        let _guard = lock_env();
        crate::dag::env::set_var("DAGFLOW_TEST_COND", "ok");
        let c = Condition {
            condition: "${DAGFLOW_TEST_COND}".to_string(),
            expected: "ok".to_string(),
        };
        assert!(c.evaluate().unwrap());
    }

    #[test]
    fn test_evaluate_conditions_reports_failing() {
        let _guard = lock_env();
        let conds = vec![
            Condition {
                condition: "`echo a`".to_string(),
                expected: "a".to_string(),
            },
            Condition {
                condition: "`echo b`".to_string(),
                expected: "c".to_string(),
            },
        ];
        let failed = evaluate_conditions(&conds).unwrap().unwrap();
        assert_eq!(failed.expected, "c");
    }

    #[test]
    fn test_step_json_roundtrip() {
        let step = Step {
            name: "build".to_string(),
            command: "make".to_string(),
            args: vec!["all".to_string()],
            cmd_with_args: "make all".to_string(),
            retry_policy: Some(RetryPolicy {
                limit: 2,
                interval: Duration::from_secs(1),
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&step).unwrap();
        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(step, back);
    }
}
