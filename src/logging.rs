//! Tracing subscriber setup.
//!
//! Events go to stderr (pretty or JSON) so command output on stdout stays
//! machine-readable. `RUST_LOG` wins over the default `phasegraph=info`
//! directive. With `[logging] file = true` a daily-rolling JSON log is also
//! written under `.phasegraph/logs`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::engine_config::LogFormat;

pub const LOG_FILE_PREFIX: &str = "phasegraph.log";

/// Build the filter: `RUST_LOG` if set, else `phasegraph=info` (or `debug`
/// when verbose).
pub fn env_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    let directive = format!("phasegraph={}", level)
        .parse()
        .context("Invalid log directive")?;
    Ok(EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy())
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init(format: LogFormat, log_dir: Option<&Path>, verbose: bool) -> Result<Option<WorkerGuard>> {
    let stderr = match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(verbose)?)
        .with(stderr)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
