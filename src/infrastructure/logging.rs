//! Logging system configuration and initialization
//!
//! Console logging through `tracing` with `RUST_LOG`-style filtering, plus
//! an optional non-blocking file layer. The file writer guard is parked in
//! a global so the background writer stays alive for the process lifetime.

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_appender::non_blocking;
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use super::config::LoggingConfig;

lazy_static::lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

static INIT: OnceCell<()> = OnceCell::new();

/// Log directory relative to the executable location.
#[must_use]
pub fn get_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    exe_dir.join("logs")
}

/// Initializes logging with default configuration.
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initializes the global subscriber. Safe to call more than once; only the
/// first call installs anything.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let mut result = Ok(());
    INIT.get_or_init(|| {
        result = install_subscriber(config);
    });
    result
}

fn install_subscriber(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("waveload={0},waveload_lib={0}", config.level)));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false);

    if config.file_output {
        let log_dir = get_log_directory();
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::never(&log_dir, &config.file_name);
        let (writer, guard) = non_blocking(appender);
        if let Ok(mut guards) = LOG_GUARDS.lock() {
            guards.push(guard);
        }

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);

        Registry::default()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        Registry::default()
            .with(filter)
            .with(console_layer)
            .try_init()?;
    }

    tracing::info!("📊 Logging initialized (level: {})", config.level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        assert!(init_logging().is_ok());
        assert!(init_logging().is_ok());
    }
}
