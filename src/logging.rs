//! Tracing subscriber setup for the command line tool.
//!
//! Logs go to stderr by default so `inspect` output on stdout stays
//! machine readable. Every writer is non-blocking; keep the returned guard
//! alive until exit or buffered lines are lost.

use anyhow::{Context, Result};
use std::env;
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const DEFAULT_DIRECTIVE: &str = "info,umya_spreadsheet=warn";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub target: LogTarget,
    /// Used when `target` is [`LogTarget::File`].
    pub log_dir: PathBuf,
    pub rotate_daily: bool,
    /// Filter applied when `RUST_LOG` is unset.
    pub directive: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
    File,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            target: LogTarget::Stderr,
            log_dir: PathBuf::from("logs"),
            rotate_daily: true,
            directive: DEFAULT_DIRECTIVE.to_string(),
        }
    }
}

impl LoggingConfig {
    /// Reads `XLSX_TEMPLATE_LOG_FORMAT`, `XLSX_TEMPLATE_LOG_TARGET`,
    /// `XLSX_TEMPLATE_LOG_DIR` and `XLSX_TEMPLATE_LOG_ROTATION`.
    /// Unrecognised values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(format) = lookup("XLSX_TEMPLATE_LOG_FORMAT").as_deref().and_then(parse_format) {
            config.format = format;
        }
        if let Some(target) = lookup("XLSX_TEMPLATE_LOG_TARGET").as_deref().and_then(parse_target) {
            config.target = target;
        }
        if let Some(dir) = lookup("XLSX_TEMPLATE_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(rotation) = lookup("XLSX_TEMPLATE_LOG_ROTATION") {
            config.rotate_daily = !rotation.eq_ignore_ascii_case("never");
        }
        config
    }
}

fn parse_format(raw: &str) -> Option<LogFormat> {
    match raw.to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        "compact" | "text" => Some(LogFormat::Compact),
        _ => None,
    }
}

fn parse_target(raw: &str) -> Option<LogTarget> {
    match raw.to_ascii_lowercase().as_str() {
        "stdout" => Some(LogTarget::Stdout),
        "stderr" => Some(LogTarget::Stderr),
        "file" => Some(LogTarget::File),
        _ => None,
    }
}

fn writer(config: &LoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    Ok(match config.target {
        LogTarget::Stdout => tracing_appender::non_blocking(io::stdout()),
        LogTarget::Stderr => tracing_appender::non_blocking(io::stderr()),
        LogTarget::File => {
            std::fs::create_dir_all(&config.log_dir).with_context(|| {
                format!("failed to create log directory {}", config.log_dir.display())
            })?;
            let appender = if config.rotate_daily {
                tracing_appender::rolling::daily(&config.log_dir, "xlsx-template.log")
            } else {
                tracing_appender::rolling::never(&config.log_dir, "xlsx-template.log")
            };
            tracing_appender::non_blocking(appender)
        }
    })
}

fn format_layer(
    format: LogFormat,
    ansi: bool,
    writer: NonBlocking,
) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);
    match format {
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Pretty => base.pretty().with_ansi(ansi).boxed(),
        LogFormat::Compact => base.compact().with_ansi(ansi).boxed(),
    }
}

/// Install the global subscriber.
pub fn init_logging(config: LoggingConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.directive))
        .context("invalid log filter")?;
    let (writer, guard) = writer(&config)?;
    let ansi = config.target != LogTarget::File;

    tracing_subscriber::registry()
        .with(format_layer(config.format, ansi, writer))
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        format = ?config.format,
        target = ?config.target,
        "logging initialized"
    );
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_log_compact_text_to_stderr() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.target, LogTarget::Stderr);
        assert!(config.rotate_daily);
    }

    #[test]
    fn environment_overrides_known_values_only() {
        let vars: HashMap<&str, &str> = [
            ("XLSX_TEMPLATE_LOG_FORMAT", "JSON"),
            ("XLSX_TEMPLATE_LOG_TARGET", "syslog"),
            ("XLSX_TEMPLATE_LOG_ROTATION", "never"),
        ]
        .into_iter()
        .collect();
        let config = LoggingConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.target, LogTarget::Stderr);
        assert!(!config.rotate_daily);
    }
}
