//! M3U8 Downloader Pro - Core Library
//!
//! This library provides the HLS download engine: playlist parsing, key
//! resolution and AES decryption, concurrent segment fetching with retries and
//! in-order assembly of the output file.

pub mod commands;
pub mod core;
pub mod parsers;
pub mod utils;

// Re-export commonly used types
pub use commands::DownloadRequest;
pub use core::{
    config::AppConfig,
    error_handling::{AppResult, DownloadError},
    manager::{DownloadManager, JobHandle},
    models::{DownloadConfig, EncryptionMode, FailurePolicy, JobResult, JobState, TimeRange},
    progress_tracker::ProgressSnapshot,
};
pub use parsers::{parse_playlist, Manifest, SegmentRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the library with default settings
pub fn init() -> anyhow::Result<()> {
    utils::logging::init_tracing();
    tracing::info!("{} v{} initialized", NAME, VERSION);
    Ok(())
}
