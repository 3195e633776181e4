// Audio hardware abstraction - the OS audio graph as seen by the tap pipeline
//
// `AudioHardware` is the seam between the capture pipeline and the operating
// system. The Core Audio backend lives in `core_audio_hardware`; the in-memory
// backend in `fake_hardware` drives the tests.

use std::sync::Arc;

use uuid::Uuid;

use super::types::{AudioObjectId, CaptureError, IoCallback, ProcessId, StreamFormat};

/// Handle of a registered IO proc
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoProcId(pub usize);

/// Whether tapped processes stay audible on their normal output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapMuteBehavior {
    Unmuted,
    MutedWhenTapped,
}

impl TapMuteBehavior {
    pub fn from_mute_flag(mute_when_tapped: bool) -> Self {
        if mute_when_tapped {
            TapMuteBehavior::MutedWhenTapped
        } else {
            TapMuteBehavior::Unmuted
        }
    }
}

/// Stereo mixdown tap over a set of process objects
#[derive(Debug, Clone, PartialEq)]
pub struct TapDescription {
    pub processes: Vec<AudioObjectId>,
    pub uuid: Uuid,
    pub mute_behavior: TapMuteBehavior,
}

/// Tap entry of an aggregate device's tap list
#[derive(Debug, Clone, PartialEq)]
pub struct SubTap {
    pub uid: String,
    pub drift_compensation: bool,
}

/// Description handed to `AudioHardwareCreateAggregateDevice`
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDeviceDescription {
    pub name: String,
    pub uid: String,
    pub main_sub_device: String,
    pub is_private: bool,
    pub is_stacked: bool,
    pub tap_auto_start: bool,
    pub sub_devices: Vec<String>,
    pub taps: Vec<SubTap>,
}

impl AggregateDeviceDescription {
    /// Private, non-stacked, auto-starting device that mixes `tap_uuid` into
    /// the system output identified by `output_uid`.
    pub fn for_tap(name: String, output_uid: &str, tap_uuid: &Uuid) -> Self {
        Self {
            name,
            uid: Uuid::new_v4().to_string(),
            main_sub_device: output_uid.to_string(),
            is_private: true,
            is_stacked: false,
            tap_auto_start: true,
            sub_devices: vec![output_uid.to_string()],
            taps: vec![SubTap {
                uid: tap_uuid.to_string().to_uppercase(),
                drift_compensation: true,
            }],
        }
    }
}

/// Operations the capture pipeline needs from the OS audio hardware layer.
///
/// Every method maps onto a single HAL call (or property read), so failures
/// carry the original `OSStatus`.
pub trait AudioHardware: Send + Sync {
    /// `kAudioHardwarePropertyProcessObjectList`
    fn process_objects(&self) -> HardwareResult<Vec<AudioObjectId>>;

    fn process_pid(&self, process: AudioObjectId) -> HardwareResult<ProcessId>;

    /// Bundle identifier reported by the HAL, `None` when absent or empty
    fn process_bundle_id(&self, process: AudioObjectId) -> HardwareResult<Option<String>>;

    /// Whether the process is currently doing audio I/O
    fn process_is_running(&self, process: AudioObjectId) -> HardwareResult<bool>;

    fn default_output_device(&self) -> HardwareResult<AudioObjectId>;

    fn device_uid(&self, device: AudioObjectId) -> HardwareResult<String>;

    fn create_process_tap(&self, description: &TapDescription) -> HardwareResult<AudioObjectId>;

    fn destroy_process_tap(&self, tap: AudioObjectId) -> HardwareResult<()>;

    /// `kAudioTapPropertyFormat`
    fn tap_stream_format(&self, tap: AudioObjectId) -> HardwareResult<StreamFormat>;

    fn create_aggregate_device(
        &self,
        description: &AggregateDeviceDescription,
    ) -> HardwareResult<AudioObjectId>;

    fn destroy_aggregate_device(&self, device: AudioObjectId) -> HardwareResult<()>;

    /// Register `callback` to run on every IO cycle of `device`
    fn create_io_proc(&self, device: AudioObjectId, callback: IoCallback) -> HardwareResult<IoProcId>;

    /// Unregister an IO proc. No invocation of its callback happens after
    /// this returns.
    fn destroy_io_proc(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()>;

    fn start_device(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()>;

    fn stop_device(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()>;
}

/// Failure reported by the OS audio layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HardwareError {
    #[error("{operation} failed: {}", format_osstatus_error(*status))]
    Status { operation: &'static str, status: i32 },

    #[error("{operation} returned no value")]
    MissingValue { operation: &'static str },

    #[error("unknown audio object #{0}")]
    UnknownObject(AudioObjectId),
}

impl HardwareError {
    pub fn status(operation: &'static str, status: i32) -> Self {
        HardwareError::Status { operation, status }
    }
}

pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

/// Turn an `OSStatus` into `Ok(())` or a `HardwareError` for `operation`
pub fn check_status(operation: &'static str, status: i32) -> HardwareResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(HardwareError::status(operation, status))
    }
}

/// Convert OSStatus error codes to human-readable messages
pub fn format_osstatus_error(status: i32) -> String {
    match status {
        0 => "No error".to_string(),
        -50 => "Parameter error".to_string(),
        -4 => "Unimplemented error".to_string(),
        _ => match four_char_code(status as u32) {
            Some(code) => match &code[..] {
                "stop" => "Audio hardware not running".to_string(),
                "what" => "Audio hardware unspecified error".to_string(),
                "who?" => "Audio hardware unknown property error".to_string(),
                "!siz" => "Audio hardware bad property size".to_string(),
                "nope" => "Audio hardware illegal operation".to_string(),
                "!obj" => "Audio hardware bad object".to_string(),
                "!dev" => "Audio hardware bad device".to_string(),
                "!hog" => "Audio device permissions error".to_string(),
                _ => format!("OSStatus {} ('{}')", status, code),
            },
            None => format!("OSStatus {}", status),
        },
    }
}

/// Printable four-char code for `value`, if every byte is printable ASCII
pub fn four_char_code(value: u32) -> Option<String> {
    let bytes = value.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        Some(bytes.iter().map(|&b| b as char).collect())
    } else {
        None
    }
}

/// Hardware backend for the current platform
pub fn default_hardware() -> std::result::Result<Arc<dyn AudioHardware>, CaptureError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(super::core_audio_hardware::CoreAudioHardware::new()))
    }

    #[cfg(not(target_os = "macos"))]
    {
        Err(CaptureError::UnsupportedSystem)
    }
}
