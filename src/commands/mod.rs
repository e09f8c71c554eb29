//! Intake surfaces
//!
//! The download form DTO and the HTTP routes that accept it.

pub mod download;
pub mod server;

pub use download::DownloadRequest;
pub use server::{build_router, serve, DEFAULT_PORT};
