//! Per-call execution flags.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{ConfigError, ExecError};

/// Independent flags chosen at call time.
///
/// At most one of `redirect_stderr_to_stdout` and `redirect_stderr_to_null`
/// may be set; with neither, stderr is captured on its own pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Inherit the parent environment and apply overrides on top of it.
    pub merge_environment: bool,
    /// Strip trailing whitespace from captured output.
    pub trim_output: bool,
    pub redirect_stderr_to_stdout: bool,
    pub redirect_stderr_to_null: bool,
    pub throw_on_nonzero_exit: bool,
    pub throw_on_signal: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            merge_environment: true,
            trim_output: true,
            redirect_stderr_to_stdout: false,
            redirect_stderr_to_null: false,
            throw_on_nonzero_exit: false,
            throw_on_signal: false,
        }
    }
}

impl ExecutionOptions {
    /// Resolve the stderr flags into the single active policy.
    ///
    /// Requesting both redirects is rejected rather than silently picking one.
    pub fn stderr_policy(&self) -> Result<StderrPolicy, ExecError> {
        match (self.redirect_stderr_to_stdout, self.redirect_stderr_to_null) {
            (true, true) => Err(ExecError::ConflictingStderrPolicy),
            (true, false) => Ok(StderrPolicy::Stdout),
            (false, true) => Ok(StderrPolicy::Null),
            (false, false) => Ok(StderrPolicy::Capture),
        }
    }

    /// Set the redirect flags from a policy, clearing the other one.
    pub fn with_stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.redirect_stderr_to_stdout = policy == StderrPolicy::Stdout;
        self.redirect_stderr_to_null = policy == StderrPolicy::Null;
        self
    }
}

/// Where the child's stderr goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrPolicy {
    /// Dedicated pipe, delivered separately from stdout.
    #[default]
    Capture,
    /// Shares the stdout pipe.
    Stdout,
    /// Discarded via the null device.
    Null,
}

impl fmt::Display for StderrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StderrPolicy::Capture => "capture",
            StderrPolicy::Stdout => "stdout",
            StderrPolicy::Null => "null",
        })
    }
}

impl FromStr for StderrPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capture" => Ok(StderrPolicy::Capture),
            "stdout" => Ok(StderrPolicy::Stdout),
            "null" => Ok(StderrPolicy::Null),
            other => Err(ConfigError::InvalidStderrMode {
                value: other.to_owned(),
            }),
        }
    }
}
