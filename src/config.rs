use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::RunArgs;
use crate::error::ConfigError;
use crate::options::{ExecutionOptions, StderrPolicy};
use crate::which::search_directories;

// Precedence: CLI > env > file > defaults.

const DEFAULT_TIMEOUT_SEC: u64 = 0;
const DEFAULT_MERGE_ENVIRONMENT: bool = true;
const DEFAULT_TRIM_OUTPUT: bool = false;

const ENV_PREFIX: &str = "CHILDLINE_";

/// Resolved configuration for `childline run`.
///
/// Built from three layers with precedence CLI > env > file > defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildlineConfig {
    /// Wall-clock limit for the child; 0 disables it.
    pub timeout_sec: u64,
    pub merge_environment: bool,
    /// Off by default for the binary so streamed output is passed through untouched.
    pub trim_output: bool,
    pub stderr: StderrPolicy,
    pub throw_on_nonzero_exit: bool,
    pub throw_on_signal: bool,
    /// Directories searched for a bare program name. `None` means `PATH`.
    pub search_path: Option<Vec<PathBuf>>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    /// Where the JSON execution report is written. `None` skips it.
    pub report_path: Option<PathBuf>,
}

/// TOML-deserializable config file representation. All fields optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    timeout_sec: Option<u64>,
    merge_environment: Option<bool>,
    trim_output: Option<bool>,
    stderr: Option<StderrPolicy>,
    throw_on_nonzero_exit: Option<bool>,
    throw_on_signal: Option<bool>,
    search_path: Option<Vec<PathBuf>>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    report_path: Option<PathBuf>,
}

/// Intermediate layer where every field is optional, used to merge sources.
#[derive(Debug, Default)]
struct ConfigLayer {
    timeout_sec: Option<u64>,
    merge_environment: Option<bool>,
    trim_output: Option<bool>,
    stderr: Option<StderrPolicy>,
    throw_on_nonzero_exit: Option<bool>,
    throw_on_signal: Option<bool>,
    search_path: Option<Vec<PathBuf>>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    report_path: Option<PathBuf>,
}

impl ChildlineConfig {
    /// Load configuration with precedence: CLI > env > file > defaults.
    ///
    /// `cli_args.config` optionally names a TOML config file.
    pub fn load(cli_args: &RunArgs) -> anyhow::Result<Self> {
        Self::load_with_env(cli_args.config.as_deref(), cli_args, real_env_var)
    }

    /// Internal constructor that accepts an env-var lookup function,
    /// enabling deterministic testing without process-global mutation.
    fn load_with_env(
        config_path: Option<&Path>,
        cli_args: &RunArgs,
        env_fn: fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let file_layer = match config_path {
            Some(path) => load_file_layer(path)?,
            None => ConfigLayer::default(),
        };
        let env_layer = load_env_layer(env_fn)?;
        let cli_layer = cli_layer_from(cli_args);

        let merged = merge_layers(file_layer, env_layer, cli_layer);

        Ok(ChildlineConfig {
            timeout_sec: merged.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC),
            merge_environment: merged
                .merge_environment
                .unwrap_or(DEFAULT_MERGE_ENVIRONMENT),
            trim_output: merged.trim_output.unwrap_or(DEFAULT_TRIM_OUTPUT),
            stderr: merged.stderr.unwrap_or_default(),
            throw_on_nonzero_exit: merged.throw_on_nonzero_exit.unwrap_or(false),
            throw_on_signal: merged.throw_on_signal.unwrap_or(false),
            search_path: merged.search_path,
            log_level: merged.log_level,
            log_file: merged.log_file,
            report_path: merged.report_path,
        })
    }

    /// The per-call flags this configuration selects.
    pub fn to_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            merge_environment: self.merge_environment,
            trim_output: self.trim_output,
            throw_on_nonzero_exit: self.throw_on_nonzero_exit,
            throw_on_signal: self.throw_on_signal,
            ..ExecutionOptions::default()
        }
        .with_stderr_policy(self.stderr)
    }
}

fn load_file_layer(path: &Path) -> anyhow::Result<ConfigLayer> {
    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let fc: FileConfig = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok(ConfigLayer {
        timeout_sec: fc.timeout_sec,
        merge_environment: fc.merge_environment,
        trim_output: fc.trim_output,
        stderr: fc.stderr,
        throw_on_nonzero_exit: fc.throw_on_nonzero_exit,
        throw_on_signal: fc.throw_on_signal,
        search_path: fc.search_path,
        log_level: fc.log_level,
        log_file: fc.log_file,
        report_path: fc.report_path,
    })
}

fn real_env_var(suffix: &str) -> Option<String> {
    let key = format!("{ENV_PREFIX}{suffix}");
    env::var(&key).ok().filter(|v| !v.is_empty())
}

fn load_env_layer(env_fn: fn(&str) -> Option<String>) -> Result<ConfigLayer, ConfigError> {
    Ok(ConfigLayer {
        timeout_sec: parse_env_u64(env_fn, "TIMEOUT_SEC")?,
        merge_environment: parse_env_bool(env_fn, "MERGE_ENVIRONMENT")?,
        trim_output: parse_env_bool(env_fn, "TRIM_OUTPUT")?,
        stderr: env_fn("STDERR").map(|s| s.parse()).transpose()?,
        throw_on_nonzero_exit: parse_env_bool(env_fn, "THROW_ON_NONZERO_EXIT")?,
        throw_on_signal: parse_env_bool(env_fn, "THROW_ON_SIGNAL")?,
        search_path: env_fn("SEARCH_PATH").map(|s| search_directories(Some(s.into()))),
        log_level: env_fn("LOG_LEVEL"),
        log_file: env_fn("LOG_FILE").map(PathBuf::from),
        report_path: env_fn("REPORT_PATH").map(PathBuf::from),
    })
}

fn parse_env_u64(
    env_fn: fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<Option<u64>, ConfigError> {
    match env_fn(suffix) {
        Some(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::EnvParse {
                var: format!("{ENV_PREFIX}{suffix}"),
                detail: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn parse_env_bool(
    env_fn: fn(&str) -> Option<String>,
    suffix: &str,
) -> Result<Option<bool>, ConfigError> {
    match env_fn(suffix) {
        Some(s) => s
            .parse::<bool>()
            .map(Some)
            .map_err(|e| ConfigError::EnvParse {
                var: format!("{ENV_PREFIX}{suffix}"),
                detail: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn cli_layer_from(args: &RunArgs) -> ConfigLayer {
    ConfigLayer {
        timeout_sec: args.timeout_sec,
        merge_environment: if args.no_merge_env { Some(false) } else { None },
        trim_output: if args.trim { Some(true) } else { None },
        stderr: args.stderr,
        throw_on_nonzero_exit: if args.fail_on_nonzero { Some(true) } else { None },
        throw_on_signal: if args.fail_on_signal { Some(true) } else { None },
        search_path: None,
        log_level: args.log_level.clone(),
        log_file: args.log_file.clone(),
        report_path: args.report.clone(),
    }
}

/// Merge three layers. For each field, pick CLI first, then env, then file.
fn merge_layers(file: ConfigLayer, env: ConfigLayer, cli: ConfigLayer) -> ConfigLayer {
    ConfigLayer {
        timeout_sec: cli.timeout_sec.or(env.timeout_sec).or(file.timeout_sec),
        merge_environment: cli
            .merge_environment
            .or(env.merge_environment)
            .or(file.merge_environment),
        trim_output: cli.trim_output.or(env.trim_output).or(file.trim_output),
        stderr: cli.stderr.or(env.stderr).or(file.stderr),
        throw_on_nonzero_exit: cli
            .throw_on_nonzero_exit
            .or(env.throw_on_nonzero_exit)
            .or(file.throw_on_nonzero_exit),
        throw_on_signal: cli
            .throw_on_signal
            .or(env.throw_on_signal)
            .or(file.throw_on_signal),
        search_path: cli.search_path.or(env.search_path).or(file.search_path),
        log_level: cli.log_level.or(env.log_level).or(file.log_level),
        log_file: cli.log_file.or(env.log_file).or(file.log_file),
        report_path: cli.report_path.or(env.report_path).or(file.report_path),
    }
}
