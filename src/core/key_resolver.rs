//! AES key resolution and segment decryption
//!
//! An explicit job key overrides every playlist declaration. Otherwise keys are
//! fetched from the `#EXT-X-KEY` URI once per distinct URI; concurrent first
//! requests for the same URI share a single download.

use aes::Aes128;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyInit, KeyIvInit};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error_handling::{AppResult, DownloadError};
use super::fetcher::SegmentFetcher;
use super::models::{DownloadConfig, EncryptionMode};
use crate::parsers::{KeyMethod, SegmentRef};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Key responses larger than this are not AES-128 keys
const MAX_KEY_BYTES: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherMode {
    Cbc,
    Ecb,
}

/// Resolved key and IV for one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMaterial {
    pub mode: CipherMode,
    pub key: [u8; 16],
    /// Ignored in ECB mode
    pub iv: [u8; 16],
}

/// Default IV: the media sequence number as a big-endian 128-bit integer
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    iv
}

/// Decrypt one segment payload and strip its PKCS#7 padding
pub fn decrypt(ciphertext: &[u8], material: &KeyMaterial) -> AppResult<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(DownloadError::decryption(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }

    let plaintext = match material.mode {
        CipherMode::Cbc => cbc::Decryptor::<Aes128>::new_from_slices(&material.key, &material.iv)
            .map_err(|e| DownloadError::decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        CipherMode::Ecb => ecb::Decryptor::<Aes128>::new_from_slice(&material.key)
            .map_err(|e| DownloadError::decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
    };

    plaintext.map_err(|_| DownloadError::decryption("invalid PKCS#7 padding (wrong key or IV?)"))
}

#[derive(Debug, Clone, Copy)]
struct ExplicitKey {
    mode: CipherMode,
    key: [u8; 16],
    iv: Option<[u8; 16]>,
}

/// Resolves [`KeyMaterial`] per segment and caches fetched keys by URI
pub struct KeyResolver {
    fetcher: Arc<SegmentFetcher>,
    explicit: Option<ExplicitKey>,
    /// Mode applied to playlist-declared AES-128 keys
    playlist_mode: CipherMode,
    cache: DashMap<String, Arc<OnceCell<[u8; 16]>>>,
}

impl KeyResolver {
    pub fn new(fetcher: Arc<SegmentFetcher>, config: &DownloadConfig) -> Self {
        let mode = match config.encryption_mode {
            EncryptionMode::Ecb => CipherMode::Ecb,
            EncryptionMode::Cbc | EncryptionMode::None => CipherMode::Cbc,
        };
        let explicit = match (config.encryption_mode, config.key) {
            (EncryptionMode::None, _) | (_, None) => None,
            (_, Some(key)) => Some(ExplicitKey {
                mode,
                key,
                iv: config.iv,
            }),
        };

        Self {
            fetcher,
            explicit,
            playlist_mode: mode,
            cache: DashMap::new(),
        }
    }

    /// `None` when the segment is not encrypted
    pub async fn resolve(
        &self,
        segment: &SegmentRef,
        cancel: &CancellationToken,
    ) -> AppResult<Option<KeyMaterial>> {
        if let Some(explicit) = self.explicit {
            let iv = explicit
                .iv
                .or_else(|| segment.key.as_ref().and_then(|k| k.iv))
                .unwrap_or_else(|| sequence_iv(segment.sequence));
            return Ok(Some(KeyMaterial {
                mode: explicit.mode,
                key: explicit.key,
                iv,
            }));
        }

        let Some(key_ref) = segment.key.as_ref() else {
            return Ok(None);
        };
        let uri = key_ref.uri.clone().unwrap_or_default();

        if key_ref.method != KeyMethod::Aes128 {
            return Err(DownloadError::KeyResolution {
                uri,
                message: format!("unsupported encryption method {:?}", key_ref.method),
                is_retryable: false,
            });
        }

        let key = self.fetch_key(&uri, cancel).await?;
        Ok(Some(KeyMaterial {
            mode: self.playlist_mode,
            key,
            iv: key_ref.iv.unwrap_or_else(|| sequence_iv(segment.sequence)),
        }))
    }

    /// Number of distinct key URIs resolved successfully
    pub fn cached_keys(&self) -> usize {
        self.cache.iter().filter(|entry| entry.value().initialized()).count()
    }

    async fn fetch_key(&self, uri: &str, cancel: &CancellationToken) -> AppResult<[u8; 16]> {
        let cell = self
            .cache
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let key = cell
            .get_or_try_init(|| async {
                debug!("Fetching key {}", uri);
                let bytes = self
                    .fetcher
                    .fetch_bytes(uri, None, MAX_KEY_BYTES, cancel)
                    .await
                    .map_err(|err| match err {
                        DownloadError::Cancelled => DownloadError::Cancelled,
                        other => DownloadError::KeyResolution {
                            uri: uri.to_string(),
                            is_retryable: other.is_retryable(),
                            message: other.to_string(),
                        },
                    })?;
                <[u8; 16]>::try_from(bytes.as_ref()).map_err(|_| DownloadError::KeyResolution {
                    uri: uri.to_string(),
                    message: format!("expected a 16 byte key, got {} bytes", bytes.len()),
                    is_retryable: false,
                })
            })
            .await?;
        Ok(*key)
    }
}
