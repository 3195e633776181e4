// Audio tap type definitions and shared structures
//
// This module provides the stream format, the per-cycle buffer views handed to
// IO procs, and the error type shared by the capture pipeline.

use super::hardware::HardwareError;

/// Opaque handle of an object in the OS audio graph (process, tap, device)
pub type AudioObjectId = u32;

/// OS process identifier
pub type ProcessId = i32;

/// `kAudioObjectUnknown`
pub const UNKNOWN_AUDIO_OBJECT: AudioObjectId = 0;

pub const FORMAT_LINEAR_PCM: u32 = u32::from_be_bytes(*b"lpcm");

pub const FORMAT_FLAG_IS_FLOAT: u32 = 1 << 0;
pub const FORMAT_FLAG_IS_BIG_ENDIAN: u32 = 1 << 1;
pub const FORMAT_FLAG_IS_SIGNED_INTEGER: u32 = 1 << 2;
pub const FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;
pub const FORMAT_FLAG_IS_NON_INTERLEAVED: u32 = 1 << 5;

/// Stream format negotiated by a process tap.
///
/// Field for field the same as Core Audio's `AudioStreamBasicDescription`, so a
/// tap's format can be carried around without touching the OS bindings. For
/// non-interleaved formats `bytes_per_frame` describes a single channel.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub format_id: u32,
    pub format_flags: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
}

impl StreamFormat {
    /// Native-endian packed 32-bit float linear PCM
    pub fn float32(sample_rate: f64, channels: u32, interleaved: bool) -> Self {
        Self::linear_pcm(
            sample_rate,
            channels,
            32,
            FORMAT_FLAG_IS_FLOAT | FORMAT_FLAG_IS_PACKED,
            interleaved,
        )
    }

    /// Native-endian packed 16-bit signed integer linear PCM
    pub fn int16(sample_rate: f64, channels: u32, interleaved: bool) -> Self {
        Self::linear_pcm(
            sample_rate,
            channels,
            16,
            FORMAT_FLAG_IS_SIGNED_INTEGER | FORMAT_FLAG_IS_PACKED,
            interleaved,
        )
    }

    fn linear_pcm(sample_rate: f64, channels: u32, bits: u32, flags: u32, interleaved: bool) -> Self {
        let sample_bytes = bits / 8;
        let (flags, frame_bytes) = if interleaved {
            (flags, sample_bytes * channels)
        } else {
            (flags | FORMAT_FLAG_IS_NON_INTERLEAVED, sample_bytes)
        };

        Self {
            sample_rate,
            format_id: FORMAT_LINEAR_PCM,
            format_flags: flags,
            bytes_per_packet: frame_bytes,
            frames_per_packet: 1,
            bytes_per_frame: frame_bytes,
            channels_per_frame: channels,
            bits_per_channel: bits,
        }
    }

    pub fn is_float(&self) -> bool {
        self.format_flags & FORMAT_FLAG_IS_FLOAT != 0
    }

    pub fn is_interleaved(&self) -> bool {
        self.format_flags & FORMAT_FLAG_IS_NON_INTERLEAVED == 0
    }

    /// Sample encoding this crate can record without conversion, if any
    pub fn sample_encoding(&self) -> Option<SampleEncoding> {
        if self.format_id != FORMAT_LINEAR_PCM
            || self.format_flags & FORMAT_FLAG_IS_BIG_ENDIAN != 0
            || self.channels_per_frame == 0
        {
            return None;
        }

        if self.is_float() && self.bits_per_channel == 32 {
            Some(SampleEncoding::Float32)
        } else if self.format_flags & FORMAT_FLAG_IS_SIGNED_INTEGER != 0 && self.bits_per_channel == 16 {
            Some(SampleEncoding::Int16)
        } else {
            None
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit {}{}",
            self.sample_rate,
            self.channels_per_frame,
            self.bits_per_channel,
            if self.is_float() { "float" } else { "int" },
            if self.is_interleaved() { "" } else { ", non-interleaved" }
        )
    }
}

/// Linear PCM sample layouts the recorder writes as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    Float32,
    Int16,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Float32 => 4,
            SampleEncoding::Int16 => 2,
        }
    }
}

/// Timing half of an `AudioTimeStamp`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioTimestamp {
    pub sample_time: f64,
    pub host_time: u64,
}

/// One buffer of an `AudioBufferList`, borrowed from the OS for the duration
/// of a single IO cycle.
#[derive(Debug, Clone, Copy)]
pub struct AudioBufferView<'a> {
    pub channels: u32,
    pub data: &'a [u8],
}

impl<'a> AudioBufferView<'a> {
    pub const EMPTY: Self = AudioBufferView {
        channels: 0,
        data: &[],
    };
}

/// Per-cycle timing context and input buffers delivered to an IO proc
#[derive(Debug, Clone, Copy)]
pub struct IoCycle<'a> {
    pub now: AudioTimestamp,
    pub input_time: AudioTimestamp,
    pub input: &'a [AudioBufferView<'a>],
}

/// Buffer callback registered on an aggregate device.
///
/// Runs on the OS real-time audio thread: no blocking I/O, no locks held by
/// the controlling context, no unbounded allocation.
pub type IoCallback = Box<dyn FnMut(&IoCycle<'_>) + Send + 'static>;

/// Reasons a single delivered buffer was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("destination closed")]
    Closed,

    #[error("malformed buffer: {0}")]
    Malformed(&'static str),

    #[error("ring buffer full ({needed} samples needed, {available} free)")]
    Overflow { needed: usize, available: usize },
}

/// Errors that can occur during process capture operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Tap configuration failed: {0}")]
    Configuration(String),

    #[error("Process tap unavailable")]
    Unavailable,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Recorder is already recording")]
    Busy,

    #[error("Tap stream format not available")]
    FormatUnavailable,

    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    #[error("Buffer dropped: {0}")]
    Buffer(#[from] BufferError),

    #[error("Permission denied - system audio capture not authorized")]
    PermissionDenied,

    #[error("Unsupported system - process taps require macOS 14.4+")]
    UnsupportedSystem,

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("System error: {0}")]
    System(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float32_layouts() {
        let interleaved = StreamFormat::float32(48_000.0, 2, true);
        assert!(interleaved.is_float());
        assert!(interleaved.is_interleaved());
        assert_eq!(interleaved.bytes_per_frame, 8);
        assert_eq!(interleaved.sample_encoding(), Some(SampleEncoding::Float32));

        let planar = StreamFormat::float32(44_100.0, 2, false);
        assert!(!planar.is_interleaved());
        assert_eq!(planar.bytes_per_frame, 4);
    }

    #[test]
    fn test_unsupported_encodings() {
        let mut format = StreamFormat::int16(48_000.0, 2, true);
        assert_eq!(format.sample_encoding(), Some(SampleEncoding::Int16));

        format.bits_per_channel = 24;
        assert_eq!(format.sample_encoding(), None);

        let mut compressed = StreamFormat::float32(48_000.0, 2, true);
        compressed.format_id = u32::from_be_bytes(*b"aac ");
        assert_eq!(compressed.sample_encoding(), None);
    }

    #[test]
    fn test_format_display() {
        let format = StreamFormat::float32(48_000.0, 2, false);
        assert_eq!(format.to_string(), "48000 Hz, 2 ch, 32-bit float, non-interleaved");
    }
}
