//! URL and input validation utilities

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use url::Url;

use crate::core::error_handling::{AppResult, DownloadError};

/// Container extensions accepted for the output file
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "ts"];

/// Parse an absolute http(s) URL
pub fn validate_url(url: &str) -> AppResult<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| DownloadError::config(format!("Invalid URL format '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DownloadError::config(format!(
            "Unsupported URL scheme '{}' in {}",
            other, url
        ))),
    }
}

/// Proxy URLs may additionally use the socks5 schemes
pub fn validate_proxy_url(url: &str) -> AppResult<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| DownloadError::config(format!("Invalid proxy URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" | "socks5" | "socks5h" => Ok(parsed),
        other => Err(DownloadError::config(format!(
            "Unsupported proxy scheme '{}'",
            other
        ))),
    }
}

/// Output filenames must be bare names ending in a known container extension
pub fn validate_output_filename(filename: &str) -> AppResult<()> {
    if filename.trim().is_empty() {
        return Err(DownloadError::config("output filename is empty"));
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(DownloadError::config(format!(
            "output filename '{}' must not contain path separators",
            filename
        )));
    }

    let extension = crate::utils::file_utils::get_file_extension(filename)
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if !VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        return Err(DownloadError::config(format!(
            "output filename '{}' must end with one of: {}",
            filename,
            VIDEO_EXTENSIONS.join(", ")
        )));
    }
    Ok(())
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// Decode a 16-byte hex value, `0x` prefix optional
pub fn parse_hex_block(value: &str) -> Option<[u8; 16]> {
    let decoded = hex::decode(strip_hex_prefix(value.trim())).ok()?;
    decoded.try_into().ok()
}

/// Parse an AES-128 key given as hex, 16 raw characters or base64
pub fn parse_key_text(value: &str) -> AppResult<[u8; 16]> {
    let trimmed = value.trim();
    if let Some(key) = parse_hex_block(trimmed) {
        return Ok(key);
    }
    if trimmed.len() == 16 {
        let mut key = [0u8; 16];
        key.copy_from_slice(trimmed.as_bytes());
        return Ok(key);
    }
    if let Ok(decoded) = BASE64.decode(trimmed) {
        if let Ok(key) = <[u8; 16]>::try_from(decoded) {
            return Ok(key);
        }
    }
    Err(DownloadError::config(
        "key must be 32 hex digits, 16 characters or base64 of 16 bytes",
    ))
}

pub fn parse_iv_text(value: &str) -> AppResult<[u8; 16]> {
    parse_hex_block(value).ok_or_else(|| DownloadError::config("IV must be 32 hex digits"))
}

/// Parse `90`, `12.5`, `MM:SS` or `HH:MM:SS(.fff)` into seconds
pub fn parse_time_offset(value: &str) -> AppResult<f64> {
    let trimmed = value.trim();
    let invalid = || DownloadError::config(format!("invalid time offset '{}'", value));

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() > 3 || parts.iter().any(|part| part.is_empty()) {
        return Err(invalid());
    }

    let mut seconds = 0.0;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        let number: f64 = part.parse().map_err(|_| invalid())?;
        if !number.is_finite() || number < 0.0 {
            return Err(invalid());
        }
        if i != last && number.fract() != 0.0 {
            return Err(invalid());
        }
        if i != 0 && number >= 60.0 {
            return Err(invalid());
        }
        seconds = seconds * 60.0 + number;
    }
    Ok(seconds)
}
