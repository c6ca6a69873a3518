//! Synchronous subprocess execution (exec-style, no shell).
//!
//! [`execute`] resolves the program, wires pipes according to the stderr
//! policy, forks the child into its own process group, streams its output
//! under an optional timeout, and always reaps it before returning.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::environment::build_environment;
use crate::error::{ExecError, NOT_FOUND_EXIT_CODE};
use crate::launcher::{self, ExecImage};
use crate::multiplex::{self, Completion, StdinFeed, StreamState};
use crate::options::ExecutionOptions;
use crate::pipe::{ParentEnds, PipeRole, PipeSet};
use crate::reaper::{ExitStatus, Reaper};
use crate::streams::{LineSplitter, OutputCollector, StreamSink};
use crate::timeout;
use crate::which::{which, which_on_path};

const COMMAND_SHELL: &str = "sh";
const COMMAND_SHELL_ARG: &str = "-c";

/// Everything needed to run one program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Bare name (searched) or path. Also passed to the child as argv[0].
    pub program: String,
    pub args: Vec<String>,
    /// Bytes written to the child's stdin; `None` closes stdin immediately.
    pub input: Option<Vec<u8>>,
    /// Variables applied on top of (or instead of) the parent environment.
    pub environment: Option<BTreeMap<String, String>>,
    pub options: ExecutionOptions,
    /// Wall-clock limit in seconds; 0 disables the timeout.
    pub timeout_sec: u64,
    /// Directories searched for a bare program name; `None` uses `PATH`.
    pub search_path: Option<Vec<PathBuf>>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeout_sec(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }

    pub fn search_path(mut self, directories: Vec<PathBuf>) -> Self {
        self.search_path = Some(directories);
        self
    }
}

/// Outcome of a child that ran to completion (or was stopped early).
///
/// `exit_code` is the exit status, or the signal number when `signaled`.
/// A stream that had a callback is delivered there and left empty here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub signaled: bool,
}

impl ExecutionResult {
    fn not_found() -> Self {
        Self {
            success: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: NOT_FOUND_EXIT_CODE,
            signaled: false,
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Incremental output consumer: receives each chunk as it is read and
/// returns `false` to end the execution early.
pub type OutputCallback<'a> = &'a mut dyn FnMut(&[u8]) -> bool;

/// Run `request`, capturing stdout and stderr into the result.
pub fn run(request: &ExecRequest) -> Result<ExecutionResult, ExecError> {
    execute(request, None, None)
}

/// Run `request`, delivering output to the given callbacks as it arrives.
///
/// Returning `false` from a callback stops reading; the child is then
/// waited for without being killed (it will usually die of `SIGPIPE`). When
/// a timeout is configured that wait is still bounded by it.
pub fn execute(
    request: &ExecRequest,
    stdout_callback: Option<OutputCallback<'_>>,
    stderr_callback: Option<OutputCallback<'_>>,
) -> Result<ExecutionResult, ExecError> {
    let options = request.options;
    let policy = options.stderr_policy()?;

    let resolved = match &request.search_path {
        Some(directories) => which(&request.program, directories),
        None => which_on_path(&request.program),
    };
    debug!(
        program = %request.program,
        executable = ?resolved,
        args = ?request.args,
        "executing command"
    );
    let Some(executable) = resolved else {
        debug!(program = %request.program, "program was not found on the search path");
        if options.throw_on_nonzero_exit {
            return Err(ExecError::NotFound {
                program: request.program.clone(),
            });
        }
        return Ok(ExecutionResult::not_found());
    };

    // Allocate everything the child needs before forking.
    let mut argv: Vec<&str> = Vec::with_capacity(request.args.len() + 1);
    argv.push(&request.program);
    argv.extend(request.args.iter().map(String::as_str));
    let envp: Vec<OsString> = build_environment(request.environment.as_ref(), options.merge_environment);
    let image = ExecImage::new(&executable, &argv, &envp)?;

    let pipes = PipeSet::allocate(policy)?;
    let pid = launcher::spawn(&image, pipes.child_fds()).map_err(|source| {
        error!(program = %request.program, err = %source, "failed to fork child process");
        ExecError::Spawn {
            program: request.program.clone(),
            source,
        }
    })?;
    let reaper = Reaper::new(pid);
    let ParentEnds {
        stdin,
        stdout,
        stderr,
    } = pipes.into_parent_ends();
    debug!(pid, program = %request.program, "spawned child process");

    let input = match request.input.as_deref() {
        Some(payload) => StdinFeed::new(stdin, payload)?,
        None => {
            drop(stdin);
            StdinFeed::closed()
        }
    };

    let timer = timeout::arm(request.timeout_sec)?;
    // After arming, so waiting for another run's timer is not counted.
    let started = Instant::now();
    let mut stdout_sink = OutputCollector::new(PipeRole::Stdout, stdout_callback);
    let mut stderr_sink = OutputCollector::new(PipeRole::Stderr, stderr_callback);

    let completion = {
        let mut streams = Vec::with_capacity(2);
        streams.push(StreamState::new(stdout, &mut stdout_sink));
        if let Some(stderr) = stderr {
            streams.push(StreamState::new(stderr, &mut stderr_sink));
        }
        multiplex::run(pid, &mut streams, input, request.timeout_sec)?
        // Read ends close here, before the child is waited for.
    };

    let status = match completion {
        Completion::TimedOut { pid } => {
            let status = reaper.reap(true);
            drop(timer);
            return Err(timed_out(request, pid, started, status, stdout_sink, stderr_sink));
        }
        Completion::Stopped if timer.is_some() => {
            let status = reaper.reap_under_timeout();
            if timeout::timed_out() {
                drop(timer);
                return Err(timed_out(request, pid, started, status, stdout_sink, stderr_sink));
            }
            status
        }
        Completion::Drained | Completion::Stopped => reaper.reap(false),
    };
    drop(timer);

    let trim = options.trim_output;
    let stdout = stdout_sink.finish(trim);
    let stderr = stderr_sink.finish(trim);

    match status {
        ExitStatus::Signaled(signal) => {
            debug!(pid, signal, "process was signaled with signal {signal}")
        }
        ExitStatus::Exited(code) => debug!(pid, exit_code = code, "process exited with status code {code}"),
        ExitStatus::Unknown => debug!(pid, "process exit status is unknown"),
    }

    match status {
        ExitStatus::Exited(code) if code != 0 && options.throw_on_nonzero_exit => {
            return Err(ExecError::NonZeroExit {
                code,
                stdout,
                stderr,
            });
        }
        ExitStatus::Signaled(signal) if options.throw_on_signal => {
            return Err(ExecError::Signaled {
                signal,
                stdout,
                stderr,
            });
        }
        _ => {}
    }

    Ok(ExecutionResult {
        success: status.success(),
        stdout,
        stderr,
        exit_code: status.code(),
        signaled: status.signaled(),
    })
}

fn timed_out(
    request: &ExecRequest,
    pid: i32,
    started: Instant,
    status: ExitStatus,
    stdout_sink: OutputCollector<'_>,
    stderr_sink: OutputCollector<'_>,
) -> ExecError {
    let elapsed = started.elapsed();
    warn!(
        pid,
        program = %request.program,
        timeout_sec = request.timeout_sec,
        duration_ms = elapsed.as_millis() as u64,
        ?status,
        "command timed out; process group killed"
    );
    let trim = request.options.trim_output;
    ExecError::Timeout {
        pid,
        timeout_sec: request.timeout_sec,
        elapsed,
        stdout: stdout_sink.finish(trim),
        stderr: stderr_sink.finish(trim),
    }
}

/// Run `command_line` through `sh -c`.
pub fn execute_shell(
    command_line: &str,
    options: ExecutionOptions,
    timeout_sec: u64,
) -> Result<ExecutionResult, ExecError> {
    let request = ExecRequest::new(COMMAND_SHELL)
        .args([COMMAND_SHELL_ARG, command_line])
        .options(options)
        .timeout_sec(timeout_sec);
    run(&request)
}

/// Run `request`, calling `callback` for every line of stdout.
///
/// Line terminators are stripped and the final unterminated line is
/// delivered last, unless the run failed. Returning `false` stops the
/// execution early.
pub fn each_line<F>(request: &ExecRequest, callback: F) -> Result<ExecutionResult, ExecError>
where
    F: FnMut(&str) -> bool,
{
    let mut splitter = LineSplitter::new(callback);
    let mut stopped = false;
    let result = {
        let mut on_stdout = |data: &[u8]| {
            let keep_going = splitter.accept(data);
            stopped |= !keep_going;
            keep_going
        };
        execute(request, Some(&mut on_stdout), None)
    };
    if !stopped && result.is_ok() {
        splitter.finish();
    }
    result
}
