//! In-memory transport and fixtures shared by the unit and scenario tests

use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyInit, KeyIvInit};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::fetcher::{HttpTransport, TransportError};

/// Scripted reply for one request
#[derive(Debug, Clone)]
pub enum Reply {
    Body(Bytes),
    Status(u16),
    Timeout,
    /// Wait before answering with the inner reply
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn body(data: &[u8]) -> Self {
        Self::Body(Bytes::copy_from_slice(data))
    }

    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Self::Delayed(delay, Box::new(reply))
    }
}

#[derive(Default)]
struct Route {
    script: VecDeque<Reply>,
    fallback: Option<Reply>,
    calls: usize,
}

/// Deterministic [`HttpTransport`] keyed by URL
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request for `url` with `reply`
    pub fn always(&self, url: &str, reply: Reply) {
        self.routes.lock().entry(url.to_string()).or_default().fallback = Some(reply);
    }

    /// Answer successive requests with `replies`; the last one repeats
    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        let mut routes = self.routes.lock();
        let route = routes.entry(url.to_string()).or_default();
        route.fallback = replies.last().cloned();
        route.script = replies.into();
    }

    pub fn calls(&self, url: &str) -> usize {
        self.routes.lock().get(url).map_or(0, |r| r.calls)
    }

    /// Highest number of simultaneous requests observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut routes = self.routes.lock();
        match routes.get_mut(url) {
            Some(route) => {
                route.calls += 1;
                route
                    .script
                    .pop_front()
                    .or_else(|| route.fallback.clone())
                    .unwrap_or(Reply::Status(404))
            }
            None => Reply::Status(404),
        }
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        max_bytes: u64,
    ) -> Result<Bytes, TransportError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let mut reply = self.next_reply(url);
        // keep the request "in flight" long enough for overlap to be observable
        tokio::time::sleep(Duration::from_millis(2)).await;
        while let Reply::Delayed(delay, inner) = reply {
            tokio::time::sleep(delay).await;
            reply = *inner;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match reply {
            Reply::Body(body) => {
                let body = match range {
                    Some((start, end)) => body.slice(start as usize..=end as usize),
                    None => body,
                };
                if body.len() as u64 > max_bytes {
                    Err(TransportError::TooLarge)
                } else {
                    Ok(body)
                }
            }
            Reply::Status(code) => Err(TransportError::Status(code)),
            Reply::Timeout => Err(TransportError::Timeout),
            Reply::Delayed(..) => unreachable!("delays are unwrapped above"),
        }
    }
}

pub fn encrypt_cbc(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn encrypt_ecb(plaintext: &[u8], key: &[u8; 16]) -> Vec<u8> {
    ecb::Encryptor::<Aes128>::new_from_slice(key)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Media playlist text listing `uris` with the given durations
pub fn media_playlist(entries: &[(&str, f64)], key_line: Option<&str>) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n");
    if let Some(line) = key_line {
        text.push_str(line);
        text.push('\n');
    }
    for (uri, duration) in entries {
        text.push_str(&format!("#EXTINF:{:.3},\n{}\n", duration, uri));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}
