// Capture configuration
//
// Loaded once by the host and handed to the orchestrator. Nothing here is
// persisted back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::recording::recorder::DEFAULT_RING_BUFFER_SECONDS;
use crate::audio::tap::bundle::DEFAULT_BUNDLE_SEARCH_DEPTH;

const APP_DIRECTORY: &str = "process-audio-tap";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Where recordings are written
    pub output_directory: PathBuf,
    /// Silence tapped processes on their normal output while tapped
    pub mute_source_when_tapped: bool,
    /// Start recording as soon as a new tap is created
    pub auto_record: bool,
    /// Seconds of audio buffered between the IO proc and the writer thread
    pub ring_buffer_seconds: f64,
    pub app_poll_interval_ms: u64,
    pub bundle_search_depth: usize,
    /// Used when `RUST_LOG` is not set
    pub log_filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory(),
            mute_source_when_tapped: false,
            auto_record: false,
            ring_buffer_seconds: DEFAULT_RING_BUFFER_SECONDS,
            app_poll_interval_ms: 1000,
            bundle_search_depth: DEFAULT_BUNDLE_SEARCH_DEPTH,
            log_filter: "info".to_string(),
        }
    }
}

impl CaptureConfig {
    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: CaptureConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.ring_buffer_seconds.is_finite() || self.ring_buffer_seconds <= 0.0 {
            anyhow::bail!("ring_buffer_seconds must be positive, got {}", self.ring_buffer_seconds);
        }
        if self.app_poll_interval_ms == 0 {
            anyhow::bail!("app_poll_interval_ms must be at least 1");
        }
        Ok(())
    }

    pub fn app_poll_interval(&self) -> Duration {
        Duration::from_millis(self.app_poll_interval_ms.max(1))
    }
}

fn default_output_directory() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIRECTORY)
}
