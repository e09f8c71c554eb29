//! Core download engine
//!
//! Domain models, the fetch/decrypt/assemble pipeline and the job manager that
//! drives it.

pub mod assembler;
pub mod config;
pub mod error_handling;
pub mod fetcher;
pub mod key_resolver;
pub mod manager;
pub mod models;
pub mod progress_tracker;
pub mod scheduler;

#[cfg(test)]
pub mod test_support;


// Re-export commonly used types
pub use config::AppConfig;
pub use manager::{DownloadManager, JobHandle};
