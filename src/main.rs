use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use childline::cli::{Cli, Commands, RunArgs, WhichArgs};
use childline::config::ChildlineConfig;
use childline::error::ExecError;
use childline::execute::{self, ExecRequest, ExecutionResult};
use childline::report;
use childline::which::which_on_path;

/// Shell convention for a command killed by the timeout.
const TIMEOUT_EXIT_CODE: u8 = 124;
/// Offset added to a signal number to form the exit code.
const SIGNAL_EXIT_BASE: u8 = 128;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("childline: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Run(args) => run_command(&args),
        Commands::Which(args) => Ok(which_command(&args)),
    }
}

fn run_command(args: &RunArgs) -> anyhow::Result<u8> {
    let config = ChildlineConfig::load(args)?;

    childline::logging::init(config.log_level.as_deref(), config.log_file.as_deref())?;

    let request = build_request(args, &config)?;
    info!(
        program = %request.program,
        timeout_sec = request.timeout_sec,
        stderr = %config.stderr,
        merge_environment = config.merge_environment,
        "config loaded"
    );

    let started_at = Utc::now();
    let outcome = if config.trim_output {
        // Trimming needs the whole output, so capture first and print after.
        execute::run(&request).inspect(print_captured)
    } else {
        stream(&request)
    };

    if let Some(path) = &config.report_path {
        let report = report::build_report(&request, &outcome, started_at);
        report::write_report(&report, path);
    }

    match outcome {
        Ok(result) => Ok(exit_code_for_result(&result)),
        Err(err) => {
            if let Some((stdout, stderr)) = err.captured_output() {
                if config.trim_output {
                    write_best_effort(&mut io::stdout(), stdout);
                    write_best_effort(&mut io::stderr(), stderr);
                }
            }
            match exit_code_for_error(&err) {
                Some(code) => {
                    error!("{err}");
                    Ok(code)
                }
                None => Err(err.into()),
            }
        }
    }
}

fn build_request(args: &RunArgs, config: &ChildlineConfig) -> anyhow::Result<ExecRequest> {
    let Some((program, rest)) = args.command.split_first() else {
        anyhow::bail!("no program given after `--`");
    };

    let mut request = ExecRequest::new(program.as_str())
        .args(rest.iter().cloned())
        .options(config.to_options())
        .timeout_sec(config.timeout_sec);
    if let Some(directories) = &config.search_path {
        request = request.search_path(directories.clone());
    }
    if !args.env.is_empty() {
        let overrides: BTreeMap<String, String> = args.env.iter().cloned().collect();
        request.environment = Some(overrides);
    }
    if let Some(path) = &args.input_file {
        let input = fs::read(path)
            .map_err(|e| anyhow::anyhow!("failed to read input file {}: {e}", path.display()))?;
        request = request.input(input);
    }
    Ok(request)
}

/// Forward the child's output to ours as it arrives. A failed write (for
/// example a closed pipe downstream) stops the execution early.
fn stream(request: &ExecRequest) -> Result<ExecutionResult, ExecError> {
    let stdout = io::stdout();
    let stderr = io::stderr();
    let mut on_stdout = |data: &[u8]| {
        let mut out = stdout.lock();
        out.write_all(data).and_then(|()| out.flush()).is_ok()
    };
    let mut on_stderr = |data: &[u8]| {
        let mut err = stderr.lock();
        err.write_all(data).and_then(|()| err.flush()).is_ok()
    };
    execute::execute(request, Some(&mut on_stdout), Some(&mut on_stderr))
}

fn print_captured(result: &ExecutionResult) {
    write_best_effort(&mut io::stdout(), &result.stdout);
    write_best_effort(&mut io::stderr(), &result.stderr);
}

fn write_best_effort(writer: &mut dyn Write, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let _ = writer
        .write_all(data)
        .and_then(|()| writer.write_all(b"\n"))
        .and_then(|()| writer.flush());
}

fn exit_code_for_result(result: &ExecutionResult) -> u8 {
    if result.signaled {
        signal_exit_code(result.exit_code)
    } else {
        u8::try_from(result.exit_code).unwrap_or(1)
    }
}

/// Exit code for failures that still describe the child; `None` for
/// failures of childline itself.
fn exit_code_for_error(err: &ExecError) -> Option<u8> {
    match err {
        ExecError::NotFound { .. } => Some(childline::error::NOT_FOUND_EXIT_CODE as u8),
        ExecError::Timeout { .. } => Some(TIMEOUT_EXIT_CODE),
        ExecError::NonZeroExit { code, .. } => Some(u8::try_from(*code).unwrap_or(1)),
        ExecError::Signaled { signal, .. } => Some(signal_exit_code(*signal)),
        _ => None,
    }
}

fn signal_exit_code(signal: i32) -> u8 {
    u8::try_from(signal)
        .ok()
        .and_then(|s| SIGNAL_EXIT_BASE.checked_add(s))
        .unwrap_or(SIGNAL_EXIT_BASE)
}

fn which_command(args: &WhichArgs) -> u8 {
    match which_on_path(&args.name) {
        Some(path) => {
            println!("{}", path.display());
            0
        }
        None => {
            eprintln!("{} not found", args.name);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn run_returns_child_exit_code() {
        let code = run(parse(&["childline", "run", "--", "sh", "-c", "exit 7"])).unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn run_returns_zero_on_success() {
        let code = run(parse(&["childline", "run", "--trim", "--", "true"])).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn run_maps_signal_to_128_plus_signal() {
        let code = run(parse(&["childline", "run", "--", "sh", "-c", "kill -KILL $$"])).unwrap();
        assert_eq!(code, 128 + libc::SIGKILL as u8);
    }

    #[test]
    fn run_maps_missing_program_to_127() {
        let code = run(parse(&[
            "childline",
            "run",
            "--",
            "childline-nonexistent-binary-xyz-999",
        ]))
        .unwrap();
        assert_eq!(code, 127);

        let code = run(parse(&[
            "childline",
            "run",
            "--fail-on-nonzero",
            "--",
            "childline-nonexistent-binary-xyz-999",
        ]))
        .unwrap();
        assert_eq!(code, 127);
    }

    #[test]
    fn run_maps_timeout_to_124() {
        let code = run(parse(&[
            "childline",
            "run",
            "--timeout-sec",
            "1",
            "--",
            "sleep",
            "30",
        ]))
        .unwrap();
        assert_eq!(code, TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn run_writes_report_with_env_and_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "from file").unwrap();
        let report_path = dir.path().join("out").join("report.json");

        let code = run(parse(&[
            "childline",
            "run",
            "--env",
            "CHILDLINE_TEST_VALUE=seven",
            "--input-file",
            input.to_str().unwrap(),
            "--report",
            report_path.to_str().unwrap(),
            "--",
            "sh",
            "-c",
            "read line; test \"$line\" = 'from file' && test \"$CHILDLINE_TEST_VALUE\" = seven",
        ]))
        .unwrap();
        assert_eq!(code, 0);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(json["program"], "sh");
        assert_eq!(json["success"], true);
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["timed_out"], false);
    }

    #[test]
    fn run_fails_when_input_file_missing() {
        let err = run(parse(&[
            "childline",
            "run",
            "--input-file",
            "/nonexistent/input.txt",
            "--",
            "cat",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("failed to read input file"), "got: {err}");
    }

    #[test]
    fn run_fails_with_invalid_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("childline.toml");
        fs::write(&cfg, "not_a_key = 1\n").unwrap();

        let err = run(parse(&[
            "childline",
            "run",
            "--config",
            cfg.to_str().unwrap(),
            "--",
            "true",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"), "got: {err}");
    }

    #[test]
    fn which_reports_found_and_missing() {
        assert_eq!(run(parse(&["childline", "which", "sh"])).unwrap(), 0);
        assert_eq!(
            run(parse(&["childline", "which", "childline-nonexistent-binary-xyz-999"])).unwrap(),
            1
        );
    }

    #[test]
    fn signal_exit_code_saturates_on_bad_values() {
        assert_eq!(signal_exit_code(libc::SIGTERM), 143);
        assert_eq!(signal_exit_code(-1), SIGNAL_EXIT_BASE);
        assert_eq!(signal_exit_code(500), SIGNAL_EXIT_BASE);
    }
}
