//! Network utilities and helpers

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy};
use url::Url;

use crate::core::config::NetworkSettings;
use crate::core::error_handling::{AppResult, DownloadError};

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Get user agent string
pub fn get_user_agent() -> &'static str {
    "M3U8DownloaderPro/1.0.0"
}

/// Parse the multi-line `Name: value` header block supplied with a job
pub fn parse_header_block(text: &str) -> AppResult<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();
    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            DownloadError::config(format!(
                "header line {} is not 'Name: value': {}",
                line_no + 1,
                line
            ))
        })?;
        let name = name.trim();
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            DownloadError::config(format!("invalid header name on line {}", line_no + 1))
        })?;
        headers.insert(name.to_string(), value.trim().to_string());
    }
    Ok(headers)
}

fn to_header_map(headers: &BTreeMap<String, String>) -> AppResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DownloadError::config(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DownloadError::config(format!("invalid value for {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Build the HTTP client shared by playlist, key and segment requests of one job
pub fn build_client(
    settings: &NetworkSettings,
    headers: &BTreeMap<String, String>,
    proxy: Option<&Url>,
) -> AppResult<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .user_agent(settings.user_agent.as_str())
        .default_headers(to_header_map(headers)?);

    if let Some(proxy_url) = proxy {
        let proxy = Proxy::all(proxy_url.as_str())
            .map_err(|e| DownloadError::config(format!("invalid proxy {proxy_url}: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| DownloadError::config(format!("failed to build HTTP client: {e}")))
}
