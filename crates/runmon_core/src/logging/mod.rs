//! Process-wide `tracing` setup.
//!
//! `RUNMON_LOG` (then `RUST_LOG`) overrides the configured level with any
//! `EnvFilter` directive, e.g. `RUNMON_LOG=runmon::metrics=off,debug`.

mod types;

use std::path::Path;

pub use types::LogLevel;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Env var checked before `RUST_LOG`.
pub const LOG_ENV: &str = "RUNMON_LOG";

/// Install the global subscriber: stderr, plus a daily `runmon.log.<date>`
/// under `log_dir` when given.
///
/// Call once at startup and hold the returned guard until exit, otherwise
/// buffered file lines are lost.
pub fn init_tracing(default_level: LogLevel, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(stderr_layer);

    let Some(dir) = log_dir else {
        registry.init();
        return None;
    };
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "runmon.log"));
    registry
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Some(guard)
}

fn env_filter(default_level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_directive()))
}
