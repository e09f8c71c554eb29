//! Playlist parsers
//!
//! Contains the HLS playlist parser that feeds the download pipeline.

pub mod m3u8_parser;

// Re-export commonly used parsers
pub use m3u8_parser::*;
