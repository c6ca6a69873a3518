#[cfg(not(unix))]
compile_error!("childline only supports Unix targets");

pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod execute;
pub mod launcher;
pub mod logging;
pub mod multiplex;
pub mod options;
pub mod pipe;
pub mod reaper;
pub mod report;
pub mod streams;
#[cfg(test)]
mod test_support;
pub mod timeout;
pub mod which;

pub use error::{ConfigError, ExecError};
pub use execute::{
    each_line, execute, execute_shell, run, ExecRequest, ExecutionResult, OutputCallback,
};
pub use options::{ExecutionOptions, StderrPolicy};
