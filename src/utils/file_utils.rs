//! File system utilities

use std::path::Path;

use crate::core::error_handling::{AppResult, DownloadError};

/// Ensure directory exists
pub async fn ensure_dir_exists(path: &Path) -> AppResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| DownloadError::output(path, format!("failed to create directory: {e}")))?;
    }
    Ok(())
}

/// Get file extension
pub fn get_file_extension(filename: &str) -> Option<&str> {
    Path::new(filename).extension().and_then(|ext| ext.to_str())
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[tokio::test]
    async fn test_ensure_dir_creates_nested() {
        let temp = tempdir().unwrap();
        let nested = temp.path().join("a").join("b");
        ensure_dir_exists(&nested).await.unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_ensure_dir_existing_is_noop() {
        let temp = tempdir().unwrap();
        tokio_test::block_on(ensure_dir_exists(temp.path())).unwrap();
        assert!(temp.path().is_dir());
    }

    #[test]
    fn test_get_file_extension() {
        assert_eq!(get_file_extension("movie.final.mkv"), Some("mkv"));
        assert_eq!(get_file_extension("noext"), None);
    }
}
