// Filename generation and path management for recordings
//
// Each tap/recorder pair records into a fresh file named after the number of
// tapped processes and the local time it was created.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::info;

pub const RECORDING_EXTENSION: &str = "wav";

/// `<count>-<YYYYmmdd_HHMMSS_mmm>.wav`
pub fn recording_filename(process_count: usize, now: DateTime<Local>) -> String {
    format!(
        "{}-{}.{}",
        process_count,
        now.format("%Y%m%d_%H%M%S_%3f"),
        RECORDING_EXTENSION
    )
}

/// Path management utilities
pub struct PathManager;

impl PathManager {
    /// Ensure a directory exists, creating it if necessary
    pub fn ensure_directory_exists(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::create_dir_all(path)
                .with_context(|| format!("Failed to create directory: {}", path.display()))?;
            info!("Created recording directory: {}", path.display());
        } else if !path.is_dir() {
            return Err(anyhow::anyhow!(
                "Path exists but is not a directory: {}",
                path.display()
            ));
        }
        Ok(())
    }

    /// Generate a unique filename if the target already exists
    pub fn make_unique_filename(base_path: &Path) -> PathBuf {
        if !base_path.exists() {
            return base_path.to_path_buf();
        }

        let parent = base_path.parent().unwrap_or(Path::new("."));
        let stem = base_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("recording");
        let extension = base_path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or(RECORDING_EXTENSION);

        for i in 1..=9999 {
            let new_path = parent.join(format!("{}_{:03}.{}", stem, i, extension));
            if !new_path.exists() {
                return new_path;
            }
        }

        // Fallback with nanoseconds
        let nanos = Local::now().timestamp_subsec_nanos();
        parent.join(format!("{}_{}.{}", stem, nanos, extension))
    }

    /// Fresh destination for a recording of `process_count` processes,
    /// creating `output_directory` on demand
    pub fn destination_for(output_directory: &Path, process_count: usize) -> Result<PathBuf> {
        Self::ensure_directory_exists(output_directory)?;
        let path = output_directory.join(recording_filename(process_count, Local::now()));
        Ok(Self::make_unique_filename(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_recording_filename() {
        let now = Local.with_ymd_and_hms(2025, 2, 17, 9, 5, 3).unwrap();
        assert_eq!(recording_filename(2, now), "2-20250217_090503_000.wav");
    }

    #[test]
    fn test_unique_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1-take.wav");
        assert_eq!(PathManager::make_unique_filename(&path), path);

        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            PathManager::make_unique_filename(&path),
            dir.path().join("1-take_001.wav")
        );
    }

    #[test]
    fn test_destination_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested").join("recordings");

        let destination = PathManager::destination_for(&output, 3).unwrap();

        assert!(output.is_dir());
        assert_eq!(destination.parent(), Some(output.as_path()));
        let name = destination.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("3-"));
        assert!(name.ends_with(".wav"));
    }

    #[test]
    fn test_file_in_place_of_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("recordings");
        std::fs::write(&blocker, b"").unwrap();

        assert!(PathManager::ensure_directory_exists(&blocker).is_err());
    }
}
