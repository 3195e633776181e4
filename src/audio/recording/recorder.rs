// Stream recorder - records one process tap into one file
//
// The recorder reaches its tap only through a `TapHandle`; once the tap is gone
// from the registry every operation reports `Unavailable`.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::filename_generation::PathManager;
use super::recording_writer::{RecordingStats, RecordingWriter};
use crate::audio::tap::tap_registry::TapHandle;
use crate::audio::tap::types::{CaptureError, IoCycle, Result};

pub const DEFAULT_RING_BUFFER_SECONDS: f64 = 2.0;

pub struct StreamRecorder {
    destination: PathBuf,
    tap: TapHandle,
    ring_buffer_seconds: f64,
    writer: Option<RecordingWriter>,
    is_recording: bool,
    last_stats: Option<RecordingStats>,
}

impl StreamRecorder {
    pub fn new(destination: PathBuf, tap: TapHandle) -> Self {
        Self {
            destination,
            tap,
            ring_buffer_seconds: DEFAULT_RING_BUFFER_SECONDS,
            writer: None,
            is_recording: false,
            last_stats: None,
        }
    }

    pub fn with_ring_buffer_seconds(mut self, seconds: f64) -> Self {
        self.ring_buffer_seconds = seconds;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn tap(&self) -> &TapHandle {
        &self.tap
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    /// Counters from the most recent `stop`
    pub fn last_stats(&self) -> Option<RecordingStats> {
        self.last_stats
    }

    /// Open the destination in the tap's format and start the tap's device.
    /// Activates the tap first if needed; a tap that could not negotiate a
    /// format fails with `FormatUnavailable`. An existing file at the
    /// destination is never overwritten: the recording moves to a numbered
    /// sibling and `destination()` follows it.
    pub fn start(&mut self) -> Result<()> {
        debug!("StreamRecorder::start {}", self.destination.display());

        if self.is_recording {
            return Err(CaptureError::Busy);
        }

        let destination = PathManager::make_unique_filename(&self.destination);
        let ring_buffer_seconds = self.ring_buffer_seconds;

        let writer = self.tap.with_tap(|tap| -> Result<RecordingWriter> {
            if !tap.is_activated() {
                // The failure stays on the tap as `last_error`; without a format there is nothing to record
                if let Err(e) = tap.activate() {
                    warn!("{}: {}", tap.name(), e);
                }
            }

            let format = tap.stream_format().ok_or(CaptureError::FormatUnavailable)?;
            let (writer, mut sink) = RecordingWriter::create(&destination, &format, ring_buffer_seconds)?;

            let callback = Box::new(move |cycle: &IoCycle<'_>| {
                // Per-buffer failures are counted by the sink and reported by the writer thread
                let _ = sink.accept(cycle.input);
            });

            if let Err(e) = tap.run(callback) {
                writer.discard();
                return Err(e);
            }
            Ok(writer)
        })??;

        if destination != self.destination {
            debug!("{} exists, recording to {}", self.destination.display(), destination.display());
            self.destination = destination;
        }
        self.writer = Some(writer);
        self.is_recording = true;
        info!("Recording started: {}", self.destination.display());
        Ok(())
    }

    /// Finalize the file and invalidate the tap. No-op when not recording.
    pub fn stop(&mut self) -> Result<()> {
        debug!("StreamRecorder::stop {}", self.destination.display());

        if !self.is_recording {
            return Ok(());
        }

        let finished = self.writer.take().map(RecordingWriter::finish).transpose();
        self.is_recording = false;

        let invalidated = self.tap.with_tap(|tap| tap.invalidate());

        match finished {
            Ok(stats) => self.last_stats = stats,
            Err(e) => {
                warn!("Failed to finalize {}: {}", self.destination.display(), e);
                return Err(e);
            }
        }
        invalidated?;

        info!("Recording stopped: {}", self.destination.display());
        Ok(())
    }

    /// Reveal the destination file in Finder
    pub fn reveal(&self) -> Result<()> {
        if !self.destination.exists() {
            return Err(CaptureError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", self.destination.display()),
            )));
        }

        #[cfg(target_os = "macos")]
        {
            std::process::Command::new("open")
                .arg("-R")
                .arg(&self.destination)
                .spawn()?;
            Ok(())
        }

        #[cfg(not(target_os = "macos"))]
        {
            Err(CaptureError::UnsupportedSystem)
        }
    }
}

impl Drop for StreamRecorder {
    fn drop(&mut self) {
        if self.is_recording {
            if let Err(e) = self.stop() {
                warn!("Recorder for {} stopped with error: {}", self.destination.display(), e);
            }
        }
    }
}
