//! Engine configuration management
//!
//! These settings tune how jobs run (timeouts, backoff, memory ceilings). They are
//! independent from the per-job [`DownloadConfig`](super::models::DownloadConfig)
//! and persist in the platform configuration directory.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error_handling::RetryPolicy;
use super::models::FailurePolicy;
use crate::utils::network::{get_user_agent, DEFAULT_TIMEOUT};

/// Main engine configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkSettings,
    pub retry: RetrySettings,
    pub engine: EngineSettings,
}

/// HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkSettings {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// Segments larger than this are rejected
    pub max_segment_bytes: u64,
}

/// Backoff between segment attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

/// Scheduler and progress settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Minimum spacing between progress events
    pub progress_interval_ms: u64,
    /// Completed segments buffered ahead of the assembler, per worker
    pub completion_queue_per_worker: usize,
    /// Policy used when a submitted job does not name one
    pub default_failure_policy: FailurePolicy,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            connect_timeout_secs: 10,
            user_agent: get_user_agent().to_string(),
            max_segment_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            progress_interval_ms: 250,
            completion_queue_per_worker: 2,
            default_failure_policy: FailurePolicy::FailFast,
        }
    }
}

impl RetrySettings {
    /// Retry policy for a job allowing `retry_count` extra attempts
    pub fn policy(&self, retry_count: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries: retry_count,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_enabled: self.jitter,
            ..RetryPolicy::default()
        }
    }
}

impl EngineSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from file, creating default if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let config: AppConfig =
                serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

            tracing::info!("Loaded configuration from: {:?}", config_path);
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load, validate and fall back to defaults on any problem
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(cfg) => match cfg.validate() {
                Ok(()) => cfg,
                Err(err) => {
                    tracing::warn!(
                        "Invalid configuration detected ({}), falling back to defaults",
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                tracing::warn!(
                    "Failed to load configuration from disk: {}. Using defaults",
                    err
                );
                Self::default()
            }
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("com", "videodownloader", "m3u8-downloader-pro")
            .context("Unable to determine configuration directory")?;
        Ok(dirs.config_dir().join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }
        if self.network.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than 0");
        }
        if self.network.max_segment_bytes == 0 {
            bail!("max_segment_bytes must be greater than 0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            bail!("max_delay_ms must not be smaller than base_delay_ms");
        }
        if self.engine.completion_queue_per_worker == 0 {
            bail!("completion_queue_per_worker must be greater than 0");
        }
        Ok(())
    }
}
