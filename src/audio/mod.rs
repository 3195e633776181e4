// Audio module - per-process capture for Process Audio Tap
//
// This module is broken down into logical components:
// - tap: process discovery, the OS hardware seam and the tap lifecycle
// - recording: streaming tapped buffers to WAV files
// - manager: the orchestrator that owns one tap + recorder pair at a time

pub mod manager;
pub mod recording;
pub mod tap;

// Re-export commonly used types for easier imports
pub use tap::{
    AudioBufferView, AudioHardware, CaptureError, FakeAudioHardware, ProcessGroup, ProcessId,
    ProcessIdentity, ProcessKind, ProcessRegistry, ProcessTap, StreamFormat, SystemWorkspace,
    TapHandle, TapRegistry, Workspace,
};

pub use recording::{PathManager, RecordingStats, RecordingWriter, StreamRecorder};

// Re-export high-level capture orchestrator
pub use manager::{CaptureEvent, CaptureHandle, CaptureOrchestrator, SessionStatus};
