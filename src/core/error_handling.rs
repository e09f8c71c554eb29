//! Error taxonomy and retry policy for the download pipeline
//!
//! Every fallible core operation returns [`AppResult`]. Segment-level errors carry
//! enough information for the fetcher to decide whether another attempt is worth
//! making; job-level errors end up in [`crate::core::models::JobResult::Failure`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default base delay for exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay cap for exponential backoff
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(10);

/// Download pipeline errors
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DownloadError {
    #[error("Playlist format error: {message}")]
    PlaylistFormat { message: String },

    #[error("Key resolution failed for {uri}: {message}")]
    KeyResolution {
        uri: String,
        message: String,
        is_retryable: bool,
    },

    #[error("Decryption error: {message}")]
    Decryption { message: String },

    #[error("Fetch failed for {url}: {message}")]
    SegmentFetch {
        url: String,
        status: Option<u16>,
        message: String,
        is_retryable: bool,
    },

    #[error("Segment {url} exceeds the {limit} byte ceiling")]
    SegmentTooLarge { url: String, limit: u64 },

    #[error("Output write error ({path}): {message}")]
    OutputWrite { path: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn playlist(message: impl Into<String>) -> Self {
        Self::PlaylistFormat {
            message: message.into(),
        }
    }

    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn output(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::OutputWrite {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SegmentFetch { is_retryable, .. } => *is_retryable,
            Self::KeyResolution { is_retryable, .. } => *is_retryable,
            Self::PlaylistFormat { .. }
            | Self::Decryption { .. }
            | Self::SegmentTooLarge { .. }
            | Self::OutputWrite { .. }
            | Self::Config { .. }
            | Self::Cancelled => false,
        }
    }

    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlaylistFormat { .. } => "PlaylistFormatError",
            Self::KeyResolution { .. } => "KeyResolutionError",
            Self::Decryption { .. } => "DecryptionError",
            Self::SegmentFetch { .. } => "SegmentFetchError",
            Self::SegmentTooLarge { .. } => "SegmentTooLargeError",
            Self::OutputWrite { .. } => "OutputWriteError",
            Self::Config { .. } => "ConfigError",
            Self::Cancelled => "Cancelled",
        }
    }
}

pub type AppResult<T> = Result<T, DownloadError>;

/// Capped exponential backoff between fetch attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Add random jitter to prevent thundering herd
    pub jitter_enabled: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter_enabled && self.jitter_factor > 0.0 {
            let spread = capped * self.jitter_factor;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).clamp(0.0, self.max_delay.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}
