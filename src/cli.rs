use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::ConfigError;
use crate::options::StderrPolicy;

/// childline: run a program with captured output, timeouts, and
/// guaranteed cleanup of its whole process group.
#[derive(Debug, Parser)]
#[command(name = "childline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a program, streaming its output, and exit with its status.
    Run(RunArgs),

    /// Print the executable a program name resolves to.
    Which(WhichArgs),
}

/// Arguments for the `which` subcommand.
#[derive(Debug, Clone, clap::Args)]
pub struct WhichArgs {
    /// Program name or path to resolve against `PATH`.
    pub name: String,
}

/// Arguments for the `run` subcommand.
///
/// Most settings can also come from a config file or env vars
/// (`CHILDLINE_TIMEOUT_SEC`, `CHILDLINE_STDERR`, ...). Precedence: CLI > env > file.
#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Kill the program's process group after this many seconds (0 = never).
    #[arg(long)]
    pub timeout_sec: Option<u64>,

    /// Where the program's stderr goes: "capture" (default), "stdout", or "null".
    #[arg(long)]
    pub stderr: Option<StderrPolicy>,

    /// Start from an empty environment instead of inheriting ours.
    #[arg(long, default_value_t = false)]
    pub no_merge_env: bool,

    /// Capture output, strip trailing whitespace, and print it once the
    /// program has exited instead of streaming it.
    #[arg(long, default_value_t = false)]
    pub trim: bool,

    /// Set a variable in the program's environment. Repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_override)]
    pub env: Vec<(String, String)>,

    /// Feed this file to the program's stdin. Without it stdin is closed.
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Report a nonzero exit as an error.
    #[arg(long, default_value_t = false)]
    pub fail_on_nonzero: bool,

    /// Report termination by a signal as an error.
    #[arg(long, default_value_t = false)]
    pub fail_on_signal: bool,

    /// Write a JSON execution report to this path.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Log level filter (default: "warn"). Supports tracing directives
    /// (e.g. "debug", "childline::output=trace"). Overridden by CHILDLINE_LOG;
    /// an invalid filter is an error.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to a log file. When set, structured JSON logs are appended here
    /// in addition to the stderr output.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Program followed by its arguments, after `--`.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Parse a `KEY=VALUE` pair. The value may be empty or contain `=`.
pub fn parse_env_override(value: &str) -> Result<(String, String), ConfigError> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_owned(), val.to_owned())),
        _ => Err(ConfigError::InvalidEnvOverride {
            value: value.to_owned(),
        }),
    }
}
