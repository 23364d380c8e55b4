//! Structured logging for Zerofeed
//!
//! Console output (plain or JSON) plus an optional daily-rotating log file,
//! built on `tracing-subscriber` and `tracing-appender`. Components log through
//! [`StructuredLogger`] so every line carries `component=` context.

use crate::config::LoggingConfig;
use crate::error::{Result, ZeroFeedError};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Once;
use tracing::{Level, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod level;
mod structured;

pub use level::{default_directive, parse_log_level};
pub use structured::{LogContext, StructuredLogger, get_logger, get_logger_with_context};

// Keep the non-blocking worker guard alive for the entire process lifetime
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT_ONCE: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

/// Initialize the global subscriber. Later calls are no-ops that report the
/// outcome of the first one.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT_ONCE.call_once(|| {
        let init_result = (|| -> Result<()> {
            let level = parse_log_level(&config.level)?;
            let filter = build_env_filter(level);

            if should_use_console_only(config) {
                init_console_only_logging(filter, config.json_format);
                info!("Logging initialized - level: {:?}, console-only", level);
                return Ok(());
            }

            init_file_logging(config, filter)?;
            info!(
                "Logging initialized - level: {:?}, file: {}",
                level, config.file
            );
            Ok(())
        })();

        if let Err(e) = init_result {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    if let Some(err) = INIT_ERROR.get() {
        return Err(ZeroFeedError::config(err.clone()));
    }
    Ok(())
}

fn build_env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(level).into())
}

fn should_use_console_only(config: &LoggingConfig) -> bool {
    config.file.is_empty()
        || cfg!(test)
        || std::env::var_os("ZEROFEED_DISABLE_FILE_LOG").is_some()
}

fn console_layer<S>(json_format: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let base = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);
    if json_format {
        base.json().boxed()
    } else {
        base.boxed()
    }
}

fn init_console_only_logging(filter: EnvFilter, json_format: bool) {
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(json_format))
        .try_init();
}

/// Directory that receives rotated files: the parent of a file path, or the
/// configured path itself when it has no extension.
fn log_directory(file: &str) -> &Path {
    let p = Path::new(file);
    if p.extension().is_some() {
        p.parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    } else {
        p
    }
}

fn init_file_logging(config: &LoggingConfig, filter: EnvFilter) -> Result<()> {
    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("zerofeed")
        .filename_suffix("log")
        .max_log_files(config.backup_count.max(1) as usize)
        .build(log_directory(&config.file))
        .map_err(|e| ZeroFeedError::io(format!("Failed to create log file appender: {}", e)))?;

    let (non_blocking_appender, guard) = non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let file_layer = {
        let base = fmt::layer()
            .with_writer(non_blocking_appender)
            .with_ansi(false)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false);
        if config.json_format {
            base.json().boxed()
        } else {
            base.boxed()
        }
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(file_layer);
    let result = if config.console_output {
        subscriber.with(console_layer(config.json_format)).try_init()
    } else {
        subscriber.try_init()
    };
    result.map_err(|e| ZeroFeedError::config(format!("Failed to install subscriber: {}", e)))
}
