//! Logging bootstrap: tracing subscriber with json/pretty output and
//! optional rolling file logs.

use anyhow::{anyhow, Result};
use std::io;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::config::{LogConfig, LogFormat};

/// Keeps the non-blocking file writer alive for the process lifetime.
pub struct LoggerGuard {
    _guard: Option<WorkerGuard>,
}

/// Initialize the global subscriber from config.
///
/// Re-initialization (e.g. in tests) is tolerated: the existing
/// subscriber stays and no error is raised.
pub fn init(config: &LogConfig) -> Result<LoggerGuard> {
    let level = parse_level(&config.level)?;
    let make_filter = || {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy()
    };

    let guard = if let Some(log_dir) = &config.log_dir {
        let appender = rolling::daily(log_dir, "overlord.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // File output is always JSON for structured post-processing.
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_filter(make_filter());

        if config.enable_stdout {
            match config.format {
                LogFormat::Json => {
                    let stdout_layer = tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stdout)
                        .with_target(true)
                        .with_filter(make_filter());
                    let _ = tracing_subscriber::registry()
                        .with(file_layer)
                        .with(stdout_layer)
                        .try_init();
                }
                LogFormat::Pretty => {
                    let stdout_layer = tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(io::stdout)
                        .with_target(true)
                        .with_filter(make_filter());
                    let _ = tracing_subscriber::registry()
                        .with(file_layer)
                        .with(stdout_layer)
                        .try_init();
                }
            }
        } else {
            let _ = tracing_subscriber::registry().with(file_layer).try_init();
        }
        Some(guard)
    } else {
        match config.format {
            LogFormat::Json => {
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stdout)
                    .with_target(true)
                    .with_filter(make_filter());
                let _ = tracing_subscriber::registry().with(layer).try_init();
            }
            LogFormat::Pretty => {
                let layer = tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(io::stdout)
                    .with_target(true)
                    .with_filter(make_filter());
                let _ = tracing_subscriber::registry().with(layer).try_init();
            }
        }
        None
    };

    Ok(LoggerGuard { _guard: guard })
}

fn parse_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(anyhow!("unknown log level '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_init_is_reentrant() {
        let config = LogConfig::default();
        assert!(init(&config).is_ok());
        // A second call must not fail even though a subscriber exists.
        assert!(init(&config).is_ok());
    }

    #[test]
    fn test_init_with_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            log_dir: Some(dir.path().to_path_buf()),
            enable_stdout: false,
            ..Default::default()
        };
        let _guard = init(&config).unwrap();
        tracing::info!("file logging smoke test");
    }
}
