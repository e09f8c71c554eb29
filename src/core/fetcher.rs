//! Segment fetching
//!
//! [`HttpTransport`] performs one GET; [`SegmentFetcher`] layers the retry policy,
//! the size ceiling and cancellation on top of it. Playlist and key downloads go
//! through the same fetcher so they share headers, proxy and retry behaviour.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error_handling::{AppResult, DownloadError, RetryPolicy};
use crate::parsers::SegmentRef;

/// Failure of a single transport attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Non-success HTTP status
    Status(u16),
    Timeout,
    Connect(String),
    /// Body interrupted mid-transfer
    Body(String),
    /// Body larger than the allowed ceiling
    TooLarge,
}

impl TransportError {
    /// Timeouts, connection problems and 5xx responses are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status(code) => *code >= 500,
            Self::Timeout | Self::Connect(_) | Self::Body(_) => true,
            Self::TooLarge => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Status(code) => match StatusCode::from_u16(*code) {
                Ok(status) => format!("HTTP {}", status),
                Err(_) => format!("HTTP {}", code),
            },
            Self::Timeout => "request timed out".to_string(),
            Self::Connect(msg) => format!("connection failed: {}", msg),
            Self::Body(msg) => format!("transfer interrupted: {}", msg),
            Self::TooLarge => "response too large".to_string(),
        }
    }
}

/// One GET request, optionally restricted to an inclusive byte range
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        max_bytes: u64,
    ) -> Result<Bytes, TransportError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if let Some(status) = err.status() {
        TransportError::Status(status.as_u16())
    } else {
        TransportError::Body(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        max_bytes: u64,
    ) -> Result<Bytes, TransportError> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            request = request.header(header::RANGE, format!("bytes={}-{}", start, end));
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(TransportError::TooLarge);
        }

        let mut buffer = BytesMut::with_capacity(
            response.content_length().unwrap_or(0).min(max_bytes) as usize,
        );
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            if (buffer.len() + chunk.len()) as u64 > max_bytes {
                return Err(TransportError::TooLarge);
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

/// Retrieves segment bytes with retry, size ceiling and cancellation
pub struct SegmentFetcher {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    max_segment_bytes: u64,
}

impl SegmentFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy, max_segment_bytes: u64) -> Self {
        Self {
            transport,
            policy,
            max_segment_bytes,
        }
    }

    pub async fn fetch(&self, segment: &SegmentRef, cancel: &CancellationToken) -> AppResult<Bytes> {
        self.fetch_bytes(
            &segment.uri,
            segment.byte_range,
            self.max_segment_bytes,
            cancel,
        )
        .await
    }

    /// GET `url` with up to `max_retries` extra attempts on transient failures.
    ///
    /// 4xx responses and oversized bodies fail immediately. Cancellation is
    /// observed during the request and during the backoff wait.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        limit: u64,
        cancel: &CancellationToken,
    ) -> AppResult<Bytes> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                outcome = self.transport.get(url, range, limit) => outcome,
            };

            let err = match outcome {
                Ok(bytes) => {
                    debug!("Fetched {} ({} bytes, attempt {})", url, bytes.len(), attempt);
                    return Ok(bytes);
                }
                Err(err) => err,
            };

            if err == TransportError::TooLarge {
                return Err(DownloadError::SegmentTooLarge {
                    url: url.to_string(),
                    limit,
                });
            }

            let retryable = err.is_transient();
            let status = match err {
                TransportError::Status(code) => Some(code),
                _ => None,
            };
            let error = DownloadError::SegmentFetch {
                url: url.to_string(),
                status,
                message: err.describe(),
                is_retryable: retryable,
            };

            if !retryable || attempt >= max_attempts {
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                "Fetch attempt {}/{} failed for {}: {} (retrying in {:?})",
                attempt,
                max_attempts,
                url,
                err.describe(),
                delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{FakeTransport, Reply};
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_enabled: false,
            ..RetryPolicy::default()
        }
    }

    const URL: &str = "https://example.com/seg.ts";

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let transport = Arc::new(FakeTransport::new());
        transport.script(
            URL,
            vec![Reply::Status(503), Reply::Timeout, Reply::body(b"payload")],
        );
        let fetcher = SegmentFetcher::new(transport.clone(), fast_policy(2), 1024);

        let bytes = fetcher
            .fetch_bytes(URL, None, 1024, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"payload");
        assert_eq!(transport.calls(URL), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_budget() {
        let transport = Arc::new(FakeTransport::new());
        transport.always(URL, Reply::Status(500));
        let fetcher = SegmentFetcher::new(transport.clone(), fast_policy(2), 1024);

        let err = fetcher
            .fetch_bytes(URL, None, 1024, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::SegmentFetch {
                status: Some(500),
                ..
            }
        ));
        assert_eq!(transport.calls(URL), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let transport = Arc::new(FakeTransport::new());
        transport.always(URL, Reply::Status(404));
        let fetcher = SegmentFetcher::new(transport.clone(), fast_policy(5), 1024);

        let err = fetcher
            .fetch_bytes(URL, None, 1024, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(transport.calls(URL), 1);
    }

    #[tokio::test]
    async fn test_oversized_segment_rejected() {
        let transport = Arc::new(FakeTransport::new());
        transport.always(URL, Reply::body(&[0u8; 64]));
        let fetcher = SegmentFetcher::new(transport.clone(), fast_policy(3), 16);

        let segment = SegmentRef {
            index: 0,
            sequence: 0,
            uri: URL.to_string(),
            duration: 4.0,
            byte_range: None,
            key: None,
            discontinuity: false,
        };
        let err = fetcher
            .fetch(&segment, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SegmentTooLargeError");
        assert_eq!(transport.calls(URL), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let transport = Arc::new(FakeTransport::new());
        transport.always(URL, Reply::Status(502));
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            jitter_enabled: false,
            ..RetryPolicy::default()
        };
        let fetcher = SegmentFetcher::new(transport.clone(), policy, 1024);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = fetcher.fetch_bytes(URL, None, 1024, &cancel).await.unwrap_err();
        assert_eq!(err, DownloadError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.calls(URL), 1);
    }
}
