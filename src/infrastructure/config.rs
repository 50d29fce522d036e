//! Configuration infrastructure
//!
//! Loading and management of the orchestrator configuration, organized as:
//! 1. Load-shape settings (total sessions, concurrency, context mode)
//! 2. Resilience settings (retry, backoff, queue-wait ceilings)
//! 3. Observability settings (monitor flush, logging)
//!
//! Configuration lives in a JSON file under the user config directory and
//! is created with defaults on first run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

use super::engine::{ContextOptions, LaunchOptions};

/// How execution contexts are handed to sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// One execution context per session, destroyed with the session
    Isolated,
    /// One shared context per instance, a fresh page/tab per session
    Shared,
}

/// What counts as fallback when no "available" workflow target exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPolicy {
    /// Fail the session when no target is marked available
    RequireAvailable,
    /// Take the first target regardless of its availability flag
    FirstRegardless,
}

/// Exit-status semantics for batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPolicy {
    /// The run counts as successful only if every session succeeded
    All,
    /// The run counts as successful if at least one session succeeded
    Any,
}

/// Engine resource pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Max sessions assigned to one engine instance
    pub sessions_per_instance: usize,
    /// Context hand-out mode, fixed for the lifetime of the pool
    pub context_mode: ContextMode,
    /// Engine launch options
    pub launch: LaunchOptions,
    /// Execution context options
    pub context: ContextOptions,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            sessions_per_instance: 5,
            context_mode: ContextMode::Isolated,
            launch: LaunchOptions::default(),
            context: ContextOptions::default(),
        }
    }
}

/// Wave scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Pause between waves, giving resources time to settle
    pub wave_cooldown_ms: u64,
    /// Exit-status semantics for a finished run
    pub success_policy: SuccessPolicy,
    /// Fallback policy when no available workflow target is found
    pub target_policy: TargetPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            wave_cooldown_ms: 1_000,
            success_policy: SuccessPolicy::Any,
            target_policy: TargetPolicy::RequireAvailable,
        }
    }
}

/// Retry and backoff settings for network-sensitive operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Default retry budget per operation
    pub max_retries: u32,
    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
    /// Exponential multiplier per attempt
    pub backoff_multiplier: f64,
    /// Randomize delays to avoid thundering herds
    pub enable_jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            enable_jitter: false,
        }
    }
}

/// Waiting-room ride-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueWaitSettings {
    /// Hard ceiling on total waiting time, in seconds
    pub max_wait_secs: u64,
    /// Poll interval when the server gives no estimate, in seconds
    pub default_poll_secs: u64,
    /// Upper bound on the poll interval even with a server estimate
    pub max_poll_secs: u64,
    /// URL signatures marking a waiting-room page (regex)
    pub url_signatures: Vec<String>,
    /// Content signatures marking a waiting-room page (regex)
    pub content_signatures: Vec<String>,
}

impl Default for QueueWaitSettings {
    fn default() -> Self {
        Self {
            max_wait_secs: 300,
            default_poll_secs: 5,
            max_poll_secs: 30,
            url_signatures: vec![
                r"(?i)/waiting[-_]?room".to_string(),
                r"(?i)[?&]waiting=true".to_string(),
            ],
            content_signatures: vec![
                r"(?i)you are (now )?in (a|the) (virtual )?queue".to_string(),
                r"(?i)estimated wait".to_string(),
            ],
        }
    }
}

/// Live monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Snapshot flush interval in seconds
    pub flush_interval_secs: u64,
    /// How many recent events to keep for status polling
    pub recent_events_capacity: usize,
    /// Snapshot file path; data dir default when absent
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            flush_interval_secs: 5,
            recent_events_capacity: 100,
            snapshot_path: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Also write logs to a rolling file next to the executable
    pub file_output: bool,
    /// Log file name when file output is enabled
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_output: false,
            file_name: "waveload.log".to_string(),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolSettings,
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub queue_wait: QueueWaitSettings,
    pub monitor: MonitorSettings,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Applies `WAVELOAD_*` environment overrides to the loaded config.
    pub fn apply_env_overrides(&mut self) {
        if let Some(capacity) = env_parse::<usize>("WAVELOAD_SESSIONS_PER_INSTANCE") {
            self.pool.sessions_per_instance = capacity.max(1);
        }
        if let Some(cooldown) = env_parse::<u64>("WAVELOAD_WAVE_COOLDOWN_MS") {
            self.scheduler.wave_cooldown_ms = cooldown;
        }
        if let Some(retries) = env_parse::<u32>("WAVELOAD_MAX_RETRIES") {
            self.retry.max_retries = retries;
        }
        if let Some(max_wait) = env_parse::<u64>("WAVELOAD_MAX_WAIT_SECS") {
            self.queue_wait.max_wait_secs = max_wait.max(1);
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Owns the on-disk location of the configuration file.
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Application configuration directory.
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("waveload");
        Ok(config_dir)
    }

    /// Application data directory (snapshots, diagnostic captures).
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join("waveload");
        Ok(data_dir)
    }

    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        let config_path = config_dir.join("waveload_config.json");
        Ok(Self { config_path })
    }

    /// Points the manager at an explicit file (tests, sanity runner).
    #[must_use]
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Initializes the configuration system on first run.
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        let config_dir = self
            .config_path
            .parent()
            .context("Failed to get config directory")?;

        if !config_dir.exists() {
            fs::create_dir_all(config_dir)
                .await
                .context("Failed to create config directory")?;
            info!("✅ Created configuration directory: {:?}", config_dir);
        }

        if !self.config_path.exists() {
            info!("🎉 First run detected - initializing default configuration");
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            self.create_data_directories().await?;
            Ok(default_config)
        } else {
            self.load_config().await
        }
    }

    async fn create_data_directories(&self) -> Result<()> {
        let app_data_dir = Self::get_app_data_dir()?;
        let directories = [
            app_data_dir.join("snapshots"),
            app_data_dir.join("captures"),
            app_data_dir.join("logs"),
        ];
        for dir in &directories {
            if !dir.exists() {
                fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create directory: {:?}", dir))?;
                info!("📁 Created directory: {:?}", dir);
            }
        }
        Ok(())
    }

    /// Loads configuration from file, creating defaults if absent.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(mut config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                config.apply_env_overrides();
                Ok(config)
            }
            Err(parse_error) => {
                tracing::warn!("⚠️  Configuration file unreadable: {}", parse_error);
                tracing::warn!("⚠️  Resetting to default configuration");
                let default_config = AppConfig::default();
                self.save_config(&default_config).await?;
                Ok(default_config)
            }
        }
    }

    /// Saves configuration to file with pretty formatting.
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }
        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn first_run_creates_default_config_file() {
        let dir = tempdir().expect("tempdir");
        let manager = ConfigManager::with_path(dir.path().join("waveload_config.json"));

        let config = manager.load_config().await.expect("load");
        assert_eq!(config.pool.sessions_per_instance, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert!(manager.config_path.exists());
    }

    #[tokio::test]
    async fn saved_config_round_trips() {
        let dir = tempdir().expect("tempdir");
        let manager = ConfigManager::with_path(dir.path().join("waveload_config.json"));

        let mut config = AppConfig::default();
        config.pool.sessions_per_instance = 8;
        config.pool.context_mode = ContextMode::Shared;
        config.scheduler.success_policy = SuccessPolicy::All;
        manager.save_config(&config).await.expect("save");

        let loaded = manager.load_config().await.expect("load");
        assert_eq!(loaded.pool.sessions_per_instance, 8);
        assert_eq!(loaded.pool.context_mode, ContextMode::Shared);
        assert_eq!(loaded.scheduler.success_policy, SuccessPolicy::All);
    }

    #[tokio::test]
    async fn corrupt_config_resets_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("waveload_config.json");
        tokio::fs::write(&path, "{not json").await.expect("write");

        let manager = ConfigManager::with_path(path);
        let config = manager.load_config().await.expect("load");
        assert_eq!(config.queue_wait.max_wait_secs, 300);
    }
}
