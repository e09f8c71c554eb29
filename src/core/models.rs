//! Core data models for the M3U8 downloader

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

use super::error_handling::{AppResult, DownloadError};
use crate::utils::validation::validate_output_filename;

/// Suffix marking an output file that has not been committed yet
pub const PARTIAL_SUFFIX: &str = ".part";

/// Cipher mode applied to encrypted segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionMode {
    #[default]
    #[serde(rename = "CBC")]
    Cbc,
    #[serde(rename = "ECB")]
    Ecb,
    /// No explicit override; playlist-declared keys are used with CBC
    #[serde(rename = "NONE")]
    None,
}

/// How segment failures that survive all retries affect the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    #[default]
    FailFast,
    BestEffort,
}

/// Where the playlist text comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaylistSource {
    Remote(Url),
    Local(PathBuf),
}

impl PlaylistSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Remote(url) => url.to_string(),
            Self::Local(path) => path.display().to_string(),
        }
    }
}

/// Half-open playback window `[start, end)` in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TimeRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TimeRange {
    pub fn new(start: Option<f64>, end: Option<f64>) -> AppResult<Self> {
        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                return Err(DownloadError::config(format!(
                    "time range end ({end}s) must be after start ({start}s)"
                )));
            }
        }
        if start.is_some_and(|s| s < 0.0) || end.is_some_and(|e| e < 0.0) {
            return Err(DownloadError::config("time range offsets must be positive"));
        }
        Ok(Self { start, end })
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Whether a segment covering `[offset, offset + duration)` intersects the window
    pub fn overlaps(&self, offset: f64, duration: f64) -> bool {
        let start = self.start.unwrap_or(0.0);
        let segment_end = offset + duration.max(0.0);
        let before_end = self.end.map_or(true, |end| offset < end);
        // zero-length segments count when their instant falls inside the window
        let after_start = if duration > 0.0 {
            segment_end > start
        } else {
            offset >= start
        };
        before_end && after_start
    }
}

/// Immutable description of a single download job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadConfig {
    pub source: PlaylistSource,
    pub work_dir: PathBuf,
    pub output_filename: String,
    pub encryption_mode: EncryptionMode,
    /// Explicit AES-128 key overriding any playlist declaration
    pub key: Option<[u8; 16]>,
    pub iv: Option<[u8; 16]>,
    pub base_url: Option<Url>,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<Url>,
    pub time_range: Option<TimeRange>,
    pub max_threads: usize,
    pub retry_count: u32,
    pub failure_policy: FailurePolicy,
}

impl DownloadConfig {
    pub const DEFAULT_MAX_THREADS: usize = 64;
    pub const DEFAULT_RETRY_COUNT: u32 = 3;

    pub fn new(
        source: PlaylistSource,
        work_dir: impl Into<PathBuf>,
        output_filename: impl Into<String>,
    ) -> AppResult<Self> {
        let output_filename = output_filename.into();
        validate_output_filename(&output_filename)?;

        Ok(Self {
            source,
            work_dir: work_dir.into(),
            output_filename,
            encryption_mode: EncryptionMode::default(),
            key: None,
            iv: None,
            base_url: None,
            headers: BTreeMap::new(),
            proxy: None,
            time_range: None,
            max_threads: Self::DEFAULT_MAX_THREADS,
            retry_count: Self::DEFAULT_RETRY_COUNT,
            failure_policy: FailurePolicy::default(),
        })
    }

    pub fn with_encryption(
        mut self,
        mode: EncryptionMode,
        key: Option<[u8; 16]>,
        iv: Option<[u8; 16]>,
    ) -> Self {
        self.encryption_mode = mode;
        self.key = key;
        self.iv = iv;
        self
    }

    pub fn with_base_url(mut self, base_url: Option<Url>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<Url>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_time_range(mut self, time_range: Option<TimeRange>) -> Self {
        self.time_range = time_range.filter(|range| !range.is_unbounded());
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Defensive checks performed once when a job is started
    pub fn validate(&self) -> AppResult<()> {
        validate_output_filename(&self.output_filename)?;
        if self.key.is_some() && self.encryption_mode == EncryptionMode::None {
            return Err(DownloadError::config(
                "an explicit key requires encryption mode CBC or ECB",
            ));
        }
        Ok(())
    }

    /// Worker count after the `>= 1` bound is applied
    pub fn effective_threads(&self) -> usize {
        if self.max_threads == 0 {
            tracing::warn!("maxThread was 0, running with a single worker");
        }
        self.max_threads.max(1)
    }

    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(&self.output_filename)
    }

    /// Path written while the job is running
    pub fn partial_output_path(&self) -> PathBuf {
        partial_path_for(&self.output_path())
    }
}

pub fn partial_path_for(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Per-segment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Pending,
    Fetching,
    Decrypting,
    Ready,
    Written,
    Skipped,
    Failed,
}

/// Scheduler-level lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// A segment that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSegment {
    pub index: usize,
    pub sequence: u64,
    pub uri: String,
    pub error: DownloadError,
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum JobResult {
    Success {
        output_path: PathBuf,
    },
    PartialSuccess {
        output_path: PathBuf,
        failed_segments: Vec<FailedSegment>,
    },
    Failure {
        reason: DownloadError,
        /// Uncommitted output kept for diagnostics
        partial_path: Option<PathBuf>,
    },
    Cancelled {
        partial_path: Option<PathBuf>,
        segments_written: usize,
    },
}

impl JobResult {
    pub fn job_state(&self) -> JobState {
        match self {
            Self::Success { .. } | Self::PartialSuccess { .. } => JobState::Completed,
            Self::Failure { .. } => JobState::Failed,
            Self::Cancelled { .. } => JobState::Cancelled,
        }
    }

    pub fn output_path(&self) -> Option<&Path> {
        match self {
            Self::Success { output_path } | Self::PartialSuccess { output_path, .. } => {
                Some(output_path)
            }
            _ => None,
        }
    }
}
