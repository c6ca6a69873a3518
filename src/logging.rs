use std::fs::File;
use std::path::Path;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Target of the per-chunk child output events.
pub const OUTPUT_TARGET: &str = "childline::output";

const DEFAULT_LOG_LEVEL: &str = "warn";
const ENV_VAR_NAME: &str = "CHILDLINE_LOG";

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber.
///
/// Diagnostics go to stderr, which the child's output shares, so the default
/// level is `warn`. When `log_file` is provided, JSON records are also
/// appended to that file. Filter precedence: `CHILDLINE_LOG` > `log_level` >
/// `warn`. Child output is only logged when [`OUTPUT_TARGET`] is enabled at
/// `trace` (see [`output_directive`]).
pub fn init(log_level: Option<&str>, log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut init_err: Option<anyhow::Error> = None;

    INIT.call_once(|| {
        let env_value = std::env::var(ENV_VAR_NAME).ok();
        if let Err(e) = try_init(env_value.as_deref(), log_level, log_file) {
            init_err = Some(e);
        }
    });

    match init_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Directive that mirrors child output chunks into the log.
pub fn output_directive() -> String {
    format!("{OUTPUT_TARGET}=trace")
}

fn try_init(
    env_value: Option<&str>,
    log_level: Option<&str>,
    log_file: Option<&Path>,
) -> anyhow::Result<()> {
    let directives = resolve_directives(env_value, log_level);
    let filter = parse_filter(directives)?;
    let file_layer = match log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            Some(json_layer(file).with_filter(parse_filter(directives)?))
        }
        None => None,
    };

    // Target names stay on so `childline::output` lines stand out from the
    // child's own stderr; no ANSI since that stream may be a pipe.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))
}

fn json_layer<S>(file: File) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(file.with_max_level(Level::TRACE))
        .with_target(true)
        .with_ansi(false)
        .json()
}

/// Pick the filter directives. A blank env value counts as unset.
fn resolve_directives<'a>(env_value: Option<&'a str>, log_level: Option<&'a str>) -> &'a str {
    env_value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or(log_level)
        .unwrap_or(DEFAULT_LOG_LEVEL)
}

fn parse_filter(directives: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| anyhow::anyhow!("invalid log filter {directives:?}: {e}"))
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "failed to create log file directory {}: {e}",
                    parent.display()
                )
            })?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", path.display()))
}
