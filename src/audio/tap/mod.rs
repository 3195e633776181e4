// Audio tap module - per-process audio capture through OS process taps
//
// This module provides process discovery and identity resolution, the OS
// hardware seam (Core Audio on macOS, an in-memory fake elsewhere), and the
// tap + aggregate device lifecycle that recorders attach to.
pub mod bundle;
pub mod fake_hardware;
pub mod hardware;
pub mod process;
pub mod process_discovery;
pub mod process_tap;
pub mod registry;
pub mod tap_registry;
pub mod types;

// Platform-specific modules
#[cfg(target_os = "macos")]
pub mod core_audio_hardware;

// FFI bindings for Core Audio Taps API
#[cfg(target_os = "macos")]
pub mod core_audio_bindings;

// Re-export commonly used types
pub use types::{
    AudioBufferView, AudioObjectId, AudioTimestamp, BufferError, CaptureError, IoCallback, IoCycle,
    ProcessId, Result, SampleEncoding, StreamFormat,
};

pub use fake_hardware::{FakeAudioHardware, FakeProcess, FakeStep, ObjectCounts};
pub use hardware::{
    default_hardware, AggregateDeviceDescription, AudioHardware, HardwareError, IoProcId, TapDescription,
    TapMuteBehavior,
};
pub use process::{ProcessGroup, ProcessIdentity, ProcessKind};
pub use process_discovery::{
    ApplicationWatcher, PosixProcessInfo, RunningApplication, SystemWorkspace, Workspace,
};
pub use process_tap::{ProcessTap, TapState};
pub use registry::ProcessRegistry;
pub use tap_registry::{TapHandle, TapKey, TapRegistry};

#[cfg(target_os = "macos")]
pub use core_audio_hardware::CoreAudioHardware;

