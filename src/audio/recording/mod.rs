// Audio recording module - writes tap output to disk
//
// This module provides destination naming, the real-time buffer sink and
// writer thread, and the recorder bound to a single process tap.

pub mod filename_generation;
pub mod recorder;
pub mod recording_writer;

// Re-export filename utilities
pub use filename_generation::{recording_filename, PathManager};

// Re-export main public API
pub use recorder::StreamRecorder;
pub use recording_writer::{BufferSink, RecordingStats, RecordingWriter};
