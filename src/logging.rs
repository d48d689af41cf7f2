//! Tracing setup: a compact stdout sink, plus an optional rotating JSON
//! file sink controlled by the engine configuration. Targets follow the
//! module tree (`jobs::manager`, `api::sse`, `gate`, `upstream::retry`,
//! ...) so `RUST_LOG` can dial single components up or down.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Logging settings, normally derived from `EngineConfig::log_config`.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for the rotating log files.
    pub log_dir: PathBuf,
    pub file_prefix: String,
    /// Daily rotation keeps at most this many files.
    pub max_files: usize,
    /// Mirror logs into JSON files alongside stdout.
    pub log_to_file: bool,
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `api=debug,jobs=info,gate=trace`.
    pub default_directive: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        let log_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chunkscribe")
            .join("logs");
        Self {
            log_dir,
            file_prefix: "chunkscribe".to_string(),
            max_files: 5,
            log_to_file: true,
            default_directive: "info".to_string(),
        }
    }
}

/// `RUST_LOG` wins over the configured directive. Filters are not
/// cloneable, so each sink builds its own from the same directive.
fn sink_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Initializes the global subscriber. The returned guard must live for
/// the whole process so the non-blocking file writer flushes on exit.
pub fn init_logging(config: LogConfig) -> Result<LogGuard> {
    let stdout_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_line_number(true)
        .with_filter(sink_filter(&config.default_directive));
    let registry = tracing_subscriber::registry().with(stdout_layer);

    let worker_guard = if config.log_to_file {
        std::fs::create_dir_all(&config.log_dir).context("failed to create log directory")?;
        let appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .max_log_files(config.max_files.max(1))
            .build(&config.log_dir)
            .context("failed to create file appender")?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_filter(sink_filter(&config.default_directive));
        registry.with(file_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    tracing::info!(
        target: "main",
        log_to_file = config.log_to_file,
        log_dir = %config.log_dir.display(),
        directive = %config.default_directive,
        "Logging initialized"
    );

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}

/// Keeps the non-blocking file writer alive; dropping it flushes any
/// buffered log lines.
pub struct LogGuard {
    _worker_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_chunkscribe_home() {
        let config = LogConfig::default();
        assert_eq!(config.file_prefix, "chunkscribe");
        assert_eq!(config.max_files, 5);
        assert!(config.log_to_file);
        assert_eq!(config.default_directive, "info");
        assert!(config.log_dir.ends_with(".chunkscribe/logs"));
    }
}
