//! Structured logging and tracing for Gridstat
//!
//! Console and daily-rolling file output built on the tracing ecosystem, plus
//! component loggers that carry account / service-point context.

use crate::config::LoggingConfig;
use crate::error::{GridstatError, Result};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Once;
use tracing::{Level, Subscriber, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod level;
mod structured;

pub use level::parse_log_level;
pub use structured::{LogContext, StructuredLogger, get_logger, get_logger_with_context};

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

/// Console and file thresholds after applying the per-output overrides
#[derive(Debug, Clone, Copy)]
struct Levels {
    console: Level,
    file: Level,
}

impl Levels {
    fn resolve(config: &LoggingConfig) -> Result<Self> {
        let base = parse_log_level(&config.level)?;
        let or_base = |over: &Option<String>| {
            over.as_deref()
                .and_then(|s| parse_log_level(s).ok())
                .unwrap_or(base)
        };
        Ok(Self {
            console: or_base(&config.console_level),
            file: or_base(&config.file_level),
        })
    }

    fn most_verbose(self) -> Level {
        level::min_level(self.console, self.file)
    }
}

/// Initialize logging system based on configuration
///
/// Only the first call installs a subscriber; later calls report the outcome
/// of that first attempt.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT_ONCE.call_once(|| {
        if let Err(e) = install(config) {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    match INIT_ERROR.get() {
        Some(err) => Err(GridstatError::config(err.clone())),
        None => Ok(()),
    }
}

fn install(config: &LoggingConfig) -> Result<()> {
    let levels = Levels::resolve(config)?;
    let registry = tracing_subscriber::registry().with(env_filter(levels.most_verbose()));

    if console_only() {
        // try_init: tests may race on the global subscriber
        let _ = registry
            .with(output_layer(std::io::stdout, config.json_format, levels.console))
            .try_init();
        info!(console_level = ?levels.console, "Logging initialized (console only)");
        return Ok(());
    }

    let appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("gridstat")
        .filename_suffix("log")
        .max_log_files(config.backup_count as usize)
        .build(log_directory(&config.file))
        .map_err(|e| GridstatError::io(format!("Failed to create log file appender: {}", e)))?;
    let (writer, guard) = non_blocking(appender);
    let _ = LOG_GUARD.set(guard);

    let file_layer = output_layer(writer, config.json_format, levels.file);
    let console_layer = config
        .console_output
        .then(|| output_layer(std::io::stdout, config.json_format, levels.console));

    registry.with(file_layer).with(console_layer).init();

    info!(
        console_level = ?levels.console,
        file_level = ?levels.file,
        file = %config.file,
        "Logging initialized"
    );
    Ok(())
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gridstat={},reqwest=warn,hyper=warn", level).into())
}

fn console_only() -> bool {
    cfg!(test) || std::env::var_os("GRIDSTAT_DISABLE_FILE_LOG").is_some()
}

/// `file` may name either the log file or the directory holding it
fn log_directory(file: &str) -> &Path {
    let path = Path::new(file);
    match path.extension() {
        Some(_) => path.parent().unwrap_or(path),
        None => path,
    }
}

fn output_layer<S, W>(writer: W, json: bool, level: Level) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);
    let threshold = LevelFilter::from_level(level);
    if json {
        layer.json().with_filter(threshold).boxed()
    } else {
        layer.with_filter(threshold).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_log_directory() {
        let dir = Path::new("/var/log/gridstat");
        assert_eq!(log_directory("/var/log/gridstat/gridstat.log"), dir);
        assert_eq!(log_directory("/var/log/gridstat"), dir);
    }

    #[test]
    fn test_level_overrides() {
        let config = LoggingConfig {
            level: "INFO".into(),
            console_level: Some("warn".into()),
            file_level: Some("bogus".into()),
            ..LoggingConfig::default()
        };
        let levels = Levels::resolve(&config).unwrap();
        assert_eq!(levels.console, Level::WARN);
        assert_eq!(levels.file, Level::INFO);
        assert_eq!(levels.most_verbose(), Level::INFO);
    }

    #[test]
    fn test_structured_logger() {
        init_logging(&LoggingConfig::default()).ok();

        let logger = get_logger_with_context(
            LogContext::new("test_component").with_service_point("SP1".to_string()),
        );
        logger.info("Test info message");
        logger.debug("Test debug message");
        logger.warn("Test warning message");
        logger.error("Test error message");
    }
}
