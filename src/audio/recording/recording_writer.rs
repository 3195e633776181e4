// File writing for tap recordings
//
// The IO proc owns a `BufferSink` and pushes every delivered buffer into a
// lock-free ring. A dedicated writer thread drains the ring into a WAV file.
// The only state shared between the two is the ring and `SinkShared`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

use crate::audio::tap::types::{
    AudioBufferView, BufferError, CaptureError, Result, SampleEncoding, StreamFormat,
};

const MIN_RING_CAPACITY: usize = 4096;
/// Upper bound on buffered audio, whatever the configuration asks for
const MAX_RING_SECONDS: f64 = 30.0;
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);
/// Write failures logged individually before the writer only logs every Nth
const WRITE_ERROR_LOG_LIMIT: u64 = 5;
const WRITE_ERROR_LOG_EVERY: u64 = 1000;

/// Counters for one finished recording
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecordingStats {
    pub frames_written: u64,
    pub buffers_written: u64,
    pub buffers_dropped: u64,
}

#[derive(Default)]
struct SinkShared {
    open: AtomicBool,
    buffers_written: AtomicU64,
    buffers_dropped: AtomicU64,
}

/// Real-time side of a recording: validates delivered buffers and queues
/// their samples for the writer thread
pub struct BufferSink {
    producer: Producer<f32>,
    shared: Arc<SinkShared>,
    encoding: SampleEncoding,
    channels: usize,
    interleaved: bool,
}

impl BufferSink {
    /// Queue one IO cycle's worth of input. A rejected buffer is dropped as a
    /// whole and counted; nothing here blocks or allocates.
    pub fn accept(&mut self, input: &[AudioBufferView<'_>]) -> std::result::Result<usize, BufferError> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }

        let result = self.enqueue(input);
        match result {
            Ok(_) => self.shared.buffers_written.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.shared.buffers_dropped.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn enqueue(&mut self, input: &[AudioBufferView<'_>]) -> std::result::Result<usize, BufferError> {
        let sample_bytes = self.encoding.bytes_per_sample();

        if self.interleaved {
            let buffer = input.first().ok_or(BufferError::Malformed("no buffers"))?;
            if buffer.channels as usize != self.channels {
                return Err(BufferError::Malformed("channel count mismatch"));
            }
            let frame_bytes = sample_bytes * self.channels;
            if buffer.data.len() % frame_bytes != 0 {
                return Err(BufferError::Malformed("partial frame"));
            }

            let samples = buffer.data.len() / sample_bytes;
            self.reserve(samples)?;
            for chunk in buffer.data.chunks_exact(sample_bytes) {
                let _ = self.producer.push(decode(self.encoding, chunk));
            }
            Ok(samples / self.channels)
        } else {
            if input.len() < self.channels {
                return Err(BufferError::Malformed("missing channel buffers"));
            }
            let planes = &input[..self.channels];
            let plane_bytes = planes[0].data.len();
            if planes.iter().any(|plane| plane.channels != 1 || plane.data.len() != plane_bytes) {
                return Err(BufferError::Malformed("uneven channel buffers"));
            }
            if plane_bytes % sample_bytes != 0 {
                return Err(BufferError::Malformed("partial frame"));
            }

            let frames = plane_bytes / sample_bytes;
            self.reserve(frames * self.channels)?;
            for frame in 0..frames {
                let offset = frame * sample_bytes;
                for plane in planes {
                    let sample = decode(self.encoding, &plane.data[offset..offset + sample_bytes]);
                    let _ = self.producer.push(sample);
                }
            }
            Ok(frames)
        }
    }

    fn reserve(&self, needed: usize) -> std::result::Result<(), BufferError> {
        let available = self.producer.slots();
        if available < needed {
            return Err(BufferError::Overflow { needed, available });
        }
        Ok(())
    }
}

/// Native-endian sample bytes to f32. 16-bit samples keep their integer value.
fn decode(encoding: SampleEncoding, bytes: &[u8]) -> f32 {
    match encoding {
        SampleEncoding::Float32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        SampleEncoding::Int16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as f32,
    }
}

/// Controlling side of a recording: owns the writer thread and the file
pub struct RecordingWriter {
    path: PathBuf,
    channels: u16,
    shared: Arc<SinkShared>,
    thread: Option<JoinHandle<Result<u64>>>,
}

impl RecordingWriter {
    /// Create `path` as a WAV file mirroring `format` and start the writer
    /// thread. The returned sink is meant to be moved into the IO proc.
    pub fn create(path: &Path, format: &StreamFormat, ring_seconds: f64) -> Result<(Self, BufferSink)> {
        let encoding = format
            .sample_encoding()
            .ok_or_else(|| CaptureError::UnsupportedFormat(format.to_string()))?;
        let channels = u16::try_from(format.channels_per_frame)
            .map_err(|_| CaptureError::UnsupportedFormat(format.to_string()))?;

        let spec = WavSpec {
            channels,
            sample_rate: format.sample_rate.round() as u32,
            bits_per_sample: format.bits_per_channel as u16,
            sample_format: match encoding {
                SampleEncoding::Float32 => SampleFormat::Float,
                SampleEncoding::Int16 => SampleFormat::Int,
            },
        };
        let writer = WavWriter::create(path, spec)?;

        let capacity = ring_capacity(format.sample_rate, channels, ring_seconds);
        let (producer, consumer) = RingBuffer::<f32>::new(capacity);

        let shared = Arc::new(SinkShared::default());
        shared.open.store(true, Ordering::Release);

        let thread_shared = shared.clone();
        let thread_path = path.to_path_buf();
        let thread = thread::Builder::new()
            .name("tap-recorder-writer".to_string())
            .spawn(move || drain_loop(consumer, writer, thread_shared, encoding, channels, thread_path))?;

        info!(
            "Recording to {} ({}, ring {} samples)",
            path.display(),
            format,
            capacity
        );

        let sink = BufferSink {
            producer,
            shared: shared.clone(),
            encoding,
            channels: usize::from(channels),
            interleaved: format.is_interleaved(),
        };

        Ok((
            Self {
                path: path.to_path_buf(),
                channels,
                shared,
                thread: Some(thread),
            },
            sink,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the sink, flush what was queued and finalize the file
    pub fn finish(mut self) -> Result<RecordingStats> {
        let samples = self.close()?;
        let stats = RecordingStats {
            frames_written: samples / u64::from(self.channels.max(1)),
            buffers_written: self.shared.buffers_written.load(Ordering::Relaxed),
            buffers_dropped: self.shared.buffers_dropped.load(Ordering::Relaxed),
        };
        info!(
            "Finished recording {}: {} frames, {} buffers dropped",
            self.path.display(),
            stats.frames_written,
            stats.buffers_dropped
        );
        Ok(stats)
    }

    /// Close the sink and delete the file
    pub fn discard(mut self) {
        if let Err(e) = self.close() {
            debug!("Writer for {} closed with error: {}", self.path.display(), e);
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove discarded recording {}: {}", self.path.display(), e);
        }
    }

    fn close(&mut self) -> Result<u64> {
        self.shared.open.store(false, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return Ok(0);
        };
        thread.thread().unpark();
        thread
            .join()
            .map_err(|_| CaptureError::System(anyhow::anyhow!("recording writer thread panicked")))?
    }
}

impl Drop for RecordingWriter {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.close() {
                warn!("Writer for {} closed with error: {}", self.path.display(), e);
            }
        }
    }
}

/// Samples needed to hold `seconds` of audio, never less than
/// `MIN_RING_CAPACITY` or more than `MAX_RING_SECONDS` worth
fn ring_capacity(sample_rate: f64, channels: u16, seconds: f64) -> usize {
    let seconds = if seconds.is_finite() {
        seconds.clamp(0.0, MAX_RING_SECONDS)
    } else {
        MAX_RING_SECONDS
    };
    let sample_rate = if sample_rate.is_finite() { sample_rate.max(0.0) } else { 0.0 };
    ((sample_rate * f64::from(channels) * seconds) as usize).max(MIN_RING_CAPACITY)
}

fn drain_loop(
    mut consumer: Consumer<f32>,
    mut writer: WavWriter<BufWriter<File>>,
    shared: Arc<SinkShared>,
    encoding: SampleEncoding,
    channels: u16,
    path: PathBuf,
) -> Result<u64> {
    let mut samples_written: u64 = 0;
    let mut write_errors: u64 = 0;
    let mut reported_drops: u64 = 0;

    loop {
        let closing = !shared.open.load(Ordering::Acquire);

        let mut drained = 0usize;
        while let Ok(sample) = consumer.pop() {
            let written = match encoding {
                SampleEncoding::Float32 => writer.write_sample(sample),
                SampleEncoding::Int16 => writer.write_sample(sample as i16),
            };
            match written {
                Ok(()) => samples_written += 1,
                Err(e) => {
                    write_errors += 1;
                    if write_errors <= WRITE_ERROR_LOG_LIMIT || write_errors % WRITE_ERROR_LOG_EVERY == 0 {
                        warn!("Failed to write sample to {} ({} errors): {}", path.display(), write_errors, e);
                    }
                }
            }
            drained += 1;
        }

        let dropped = shared.buffers_dropped.load(Ordering::Relaxed);
        if dropped > reported_drops {
            warn!("Dropped {} buffer(s) for {}", dropped - reported_drops, path.display());
            reported_drops = dropped;
        }

        if drained > 0 {
            crate::buffer_trace!(
                "Wrote {} frames to {} ({} total)",
                drained / usize::from(channels.max(1)),
                path.display(),
                samples_written / u64::from(channels.max(1))
            );
        }

        if closing {
            break;
        }
        thread::park_timeout(DRAIN_INTERVAL);
    }

    writer.finalize()?;
    Ok(samples_written)
}
