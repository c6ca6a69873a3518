//! Execution report: build and write a JSON record of one `childline run`.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ExecError;
use crate::execute::{ExecRequest, ExecutionResult};

/// What happened to one child, written when a report path is configured.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Program name as given on the command line.
    pub program: String,
    pub args: Vec<String>,
    pub success: bool,
    /// Exit status, or the signal number when `signaled`. Absent on timeout
    /// and on failures that happened before the child ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub signaled: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// RFC 3339 timestamp taken just before the child was started.
    pub started_at: String,
    /// RFC 3339 timestamp taken after the child was reaped.
    pub completed_at: String,
    /// Error message when the execution ended in an error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build an ExecutionReport from the request and how it ended.
pub fn build_report(
    request: &ExecRequest,
    outcome: &Result<ExecutionResult, ExecError>,
    started_at: DateTime<Utc>,
) -> ExecutionReport {
    let completed_at = Utc::now();
    let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;

    let (success, exit_code, signaled, timed_out, error) = match outcome {
        Ok(result) => (
            result.success,
            Some(result.exit_code),
            result.signaled,
            false,
            None,
        ),
        Err(err) => (
            false,
            err.exit_code(),
            matches!(err, ExecError::Signaled { .. }),
            matches!(err, ExecError::Timeout { .. }),
            Some(err.to_string()),
        ),
    };

    ExecutionReport {
        program: request.program.clone(),
        args: request.args.clone(),
        success,
        exit_code,
        signaled,
        timed_out,
        duration_ms,
        started_at: started_at.to_rfc3339(),
        completed_at: completed_at.to_rfc3339(),
        error,
    }
}

/// Write report to the given path. Creates parent dirs if needed; writes atomically (temp then rename).
/// Best-effort: on failure logs a warning and does not change the exit code.
pub fn write_report(report: &ExecutionReport, path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            tracing::warn!(
                path = %path.display(),
                err = %e,
                "failed to create parent directory for execution report"
            );
            return;
        }
    }

    let json = match serde_json::to_string_pretty(report) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                err = %e,
                "failed to serialize execution report"
            );
            return;
        }
    };

    let tmp_path = path.with_extension("json.tmp");
    if let Err(e) = (|| -> std::io::Result<()> {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        Ok(())
    })() {
        tracing::warn!(
            path = %path.display(),
            err = %e,
            "failed to write execution report (temp file)"
        );
        let _ = fs::remove_file(&tmp_path);
        return;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        tracing::warn!(
            path = %path.display(),
            err = %e,
            "failed to move execution report into place"
        );
        let _ = fs::remove_file(&tmp_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> ExecRequest {
        ExecRequest::new("sh").args(["-c", "exit 3"])
    }

    fn finished(exit_code: i32, signaled: bool) -> ExecutionResult {
        ExecutionResult {
            success: exit_code == 0 && !signaled,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code,
            signaled,
        }
    }

    #[test]
    fn report_from_completed_run() {
        let started = Utc::now() - chrono::Duration::milliseconds(50);
        let report = build_report(&request(), &Ok(finished(3, false)), started);

        assert_eq!(report.program, "sh");
        assert_eq!(report.args, vec!["-c", "exit 3"]);
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(3));
        assert!(!report.signaled);
        assert!(!report.timed_out);
        assert!(report.duration_ms >= 50);
        assert!(report.error.is_none());
        assert!(DateTime::parse_from_rfc3339(&report.started_at).is_ok());
        assert!(DateTime::parse_from_rfc3339(&report.completed_at).is_ok());
    }

    #[test]
    fn report_from_timeout() {
        let err = ExecError::Timeout {
            pid: 7,
            timeout_sec: 1,
            elapsed: Duration::from_secs(1),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let report = build_report(&request(), &Err(err), Utc::now());

        assert!(!report.success);
        assert!(report.timed_out);
        assert_eq!(report.exit_code, None);
        assert_eq!(report.error.as_deref(), Some("command timed out after 1 seconds."));
    }

    #[test]
    fn report_from_signal_error() {
        let err = ExecError::Signaled {
            signal: libc::SIGKILL,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let report = build_report(&request(), &Err(err), Utc::now());

        assert!(report.signaled);
        assert_eq!(report.exit_code, Some(libc::SIGKILL));
    }

    #[test]
    fn write_report_creates_parents_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");
        let report = build_report(&request(), &Ok(finished(0, false)), Utc::now());

        write_report(&report, &path);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["program"], "sh");
        assert_eq!(json["success"], true);
        assert_eq!(json["exit_code"], 0);
        assert!(json.get("error").is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn write_report_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let report = build_report(&request(), &Ok(finished(0, false)), Utc::now());

        // Parent is a regular file; nothing is written and nothing panics.
        write_report(&report, &blocker.join("report.json"));
        assert!(!blocker.join("report.json").exists());
    }
}
