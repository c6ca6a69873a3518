use std::io;
use std::time::Duration;

use crate::pipe::PipeRole;

/// Exit code reported for a program that could not be located.
pub const NOT_FOUND_EXIT_CODE: i32 = 127;

/// Failures surfaced by [`crate::execute::execute`].
///
/// Nonzero exits and signal terminations only show up here when the caller
/// opted in through [`crate::options::ExecutionOptions`]; otherwise they are
/// folded into an [`crate::execute::ExecutionResult`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("{program} was not found on the search path.")]
    NotFound { program: String },

    #[error("failed to fork child process for {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to {what}: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{stream} pipe I/O failed: {source}")]
    Io {
        stream: PipeRole,
        #[source]
        source: io::Error,
    },

    #[error("waiting for child output failed: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },

    #[error("command timed out after {timeout_sec} seconds.")]
    Timeout {
        pid: i32,
        timeout_sec: u64,
        elapsed: Duration,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("child process returned non-zero exit status ({code}).")]
    NonZeroExit {
        code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("child process was terminated by signal ({signal}).")]
    Signaled {
        signal: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("stderr cannot be redirected to stdout and to the null device at the same time")]
    ConflictingStderrPolicy,

    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },
}

impl ExecError {
    /// The exit status this failure corresponds to, when there is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::NotFound { .. } => Some(NOT_FOUND_EXIT_CODE),
            ExecError::NonZeroExit { code, .. } => Some(*code),
            ExecError::Signaled { signal, .. } => Some(*signal),
            _ => None,
        }
    }

    /// Output captured before the failure, as `(stdout, stderr)`.
    pub fn captured_output(&self) -> Option<(&[u8], &[u8])> {
        match self {
            ExecError::Timeout { stdout, stderr, .. }
            | ExecError::NonZeroExit { stdout, stderr, .. }
            | ExecError::Signaled { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

/// Errors raised while resolving the command-line configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{var}': {detail}")]
    EnvParse { var: String, detail: String },

    #[error("Invalid stderr mode '{value}' (expected \"capture\", \"stdout\", or \"null\")")]
    InvalidStderrMode { value: String },

    #[error("Invalid environment override '{value}' (expected KEY=VALUE)")]
    InvalidEnvOverride { value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_127() {
        let err = ExecError::NotFound {
            program: "nope".to_owned(),
        };
        assert_eq!(err.exit_code(), Some(NOT_FOUND_EXIT_CODE));
        assert!(err.captured_output().is_none());
    }

    #[test]
    fn non_zero_exit_carries_output() {
        let err = ExecError::NonZeroExit {
            code: 3,
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
        };
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(
            err.captured_output(),
            Some((&b"out"[..], &b"err"[..]))
        );
        assert_eq!(
            err.to_string(),
            "child process returned non-zero exit status (3)."
        );
    }

    #[test]
    fn timeout_message_names_duration() {
        let err = ExecError::Timeout {
            pid: 42,
            timeout_sec: 2,
            elapsed: Duration::from_millis(2100),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        assert_eq!(err.to_string(), "command timed out after 2 seconds.");
        assert_eq!(err.exit_code(), None);
    }

    #[test]
    fn io_error_names_stream() {
        let err = ExecError::Io {
            stream: PipeRole::Stderr,
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert!(err.to_string().starts_with("stderr pipe I/O failed"));
    }
}
