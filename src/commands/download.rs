//! Download form payload
//!
//! [`DownloadRequest`] mirrors the submission form field for field. All text is
//! validated here, at the boundary, and turned into a [`DownloadConfig`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::error_handling::{AppResult, DownloadError};
use crate::core::models::{
    DownloadConfig, EncryptionMode, FailurePolicy, PlaylistSource, TimeRange,
};
use crate::utils::network::parse_header_block;
use crate::utils::validation::{
    parse_iv_text, parse_key_text, parse_time_offset, validate_proxy_url, validate_url,
};

/// Form payload as submitted by the UI; empty strings mean "not set"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadRequest {
    pub m3u8_url: String,
    pub local_m3u8_file: String,
    pub work_dir: String,
    pub output_filename: String,
    pub encryption_mode: String,
    pub key: String,
    pub iv: String,
    pub base_url: String,
    pub headers: String,
    pub proxy: String,
    pub time_range_start: String,
    pub time_range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_thread: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

pub fn parse_encryption_mode(value: &str) -> AppResult<EncryptionMode> {
    match non_empty(value).map(str::to_ascii_uppercase).as_deref() {
        None | Some("CBC") => Ok(EncryptionMode::Cbc),
        Some("ECB") => Ok(EncryptionMode::Ecb),
        Some("NONE") => Ok(EncryptionMode::None),
        Some(other) => Err(DownloadError::config(format!(
            "unknown encryption mode '{other}', expected CBC, ECB or NONE"
        ))),
    }
}

impl DownloadRequest {
    /// Validate every field and build the job configuration.
    ///
    /// `default_policy` applies when the form does not name a failure policy.
    pub fn into_config(&self, default_policy: FailurePolicy) -> AppResult<DownloadConfig> {
        let source = match (non_empty(&self.local_m3u8_file), non_empty(&self.m3u8_url)) {
            (Some(path), _) => PlaylistSource::Local(PathBuf::from(path)),
            (None, Some(url)) => PlaylistSource::Remote(validate_url(url)?),
            (None, None) => {
                return Err(DownloadError::config(
                    "either m3u8Url or localM3u8File is required",
                ))
            }
        };

        let work_dir = non_empty(&self.work_dir)
            .ok_or_else(|| DownloadError::config("workDir is required"))?;
        let output_filename = non_empty(&self.output_filename)
            .ok_or_else(|| DownloadError::config("outputFilename is required"))?;

        let mode = parse_encryption_mode(&self.encryption_mode)?;
        let key = non_empty(&self.key).map(parse_key_text).transpose()?;
        let iv = non_empty(&self.iv).map(parse_iv_text).transpose()?;

        let base_url = non_empty(&self.base_url).map(validate_url).transpose()?;
        let proxy = non_empty(&self.proxy).map(validate_proxy_url).transpose()?;
        let headers = match non_empty(&self.headers) {
            Some(text) => parse_header_block(text)?,
            None => Default::default(),
        };

        let start = non_empty(&self.time_range_start)
            .map(parse_time_offset)
            .transpose()?;
        let end = non_empty(&self.time_range_end)
            .map(parse_time_offset)
            .transpose()?;
        let time_range = match (start, end) {
            (None, None) => None,
            _ => Some(TimeRange::new(start, end)?),
        };

        let config = DownloadConfig::new(source, work_dir, output_filename)?
            .with_encryption(mode, key, iv)
            .with_base_url(base_url)
            .with_headers(headers)
            .with_proxy(proxy)
            .with_time_range(time_range)
            .with_max_threads(self.max_thread.unwrap_or(DownloadConfig::DEFAULT_MAX_THREADS))
            .with_retry_count(self.retry_count.unwrap_or(DownloadConfig::DEFAULT_RETRY_COUNT))
            .with_failure_policy(self.failure_policy.unwrap_or(default_policy));

        config.validate()?;
        Ok(config)
    }
}
