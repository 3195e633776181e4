use process_audio_tap::audio::recording::{PathManager, StreamRecorder};
use process_audio_tap::audio::tap::{
    types, AudioObjectId, CaptureError, FakeAudioHardware, FakeStep, ObjectCounts, ProcessId,
    ProcessIdentity, ProcessKind, ProcessTap, StreamFormat, TapHandle, TapRegistry,
};
use std::sync::Arc;

fn identity(pid: ProcessId, object_id: AudioObjectId) -> ProcessIdentity {
    ProcessIdentity {
        id: pid,
        kind: ProcessKind::Process,
        name: format!("proc{}", pid),
        audio_active: true,
        bundle_id: None,
        bundle_path: None,
        object_id,
    }
}

fn registered_tap(hardware: &Arc<FakeAudioHardware>, registry: &Arc<TapRegistry>) -> TapHandle {
    registry.insert(ProcessTap::new(hardware.clone(), vec![identity(100, 10)], false))
}

fn aggregate_device(handle: &TapHandle) -> AudioObjectId {
    handle
        .with_tap(|tap| tap.aggregate_device_id())
        .unwrap()
        .expect("tap should be activated")
}

#[cfg(test)]
mod stream_recorder_tests {
    use super::*;

    /// Start activates the tap, delivered buffers reach the file, stop finalizes it
    #[test]
    fn test_records_delivered_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();
        let handle = registered_tap(&hardware, &registry);

        let destination = dir.path().join("take.wav");
        let mut recorder = StreamRecorder::new(destination.clone(), handle.clone());

        recorder.start().expect("start should succeed");
        assert!(recorder.is_recording());
        assert!(handle.with_tap(|tap| tap.is_running()).unwrap());

        let device = aggregate_device(&handle);
        let cycle: Vec<f32> = (0..256).map(|i| (i as f32 / 256.0) - 0.5).collect();
        for _ in 0..4 {
            assert_eq!(hardware.deliver_interleaved(device, 2, &cycle), 1);
        }

        recorder.stop().expect("stop should succeed");
        assert!(!recorder.is_recording());

        let stats = recorder.last_stats().expect("stats after stop");
        assert_eq!(stats.buffers_written, 4);
        assert_eq!(stats.buffers_dropped, 0);
        assert_eq!(stats.frames_written, 512);

        let reader = hound::WavReader::open(&destination).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.sample_format, hound::SampleFormat::Float);
        let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 1024);
        assert_eq!(&samples[..256], cycle.as_slice());

        // Stopping invalidates the tap
        assert_eq!(hardware.object_counts(), ObjectCounts::default());
    }

    #[test]
    fn test_start_while_recording_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();
        let mut recorder = StreamRecorder::new(dir.path().join("busy.wav"), registered_tap(&hardware, &registry));

        recorder.start().unwrap();
        assert!(matches!(recorder.start(), Err(CaptureError::Busy)));
        assert_eq!(hardware.object_counts().io_procs, 1, "Second start must not add an IO proc");
        recorder.stop().unwrap();
    }

    /// Stop is idempotent
    #[test]
    fn test_stop_twice() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();
        let mut recorder = StreamRecorder::new(dir.path().join("twice.wav"), registered_tap(&hardware, &registry));

        assert!(recorder.stop().is_ok(), "Stop before start is a no-op");
        recorder.start().unwrap();
        assert!(recorder.stop().is_ok());
        assert!(recorder.stop().is_ok());
        assert!(recorder.last_stats().is_some());
    }

    /// A stopped recorder can start again over a re-activated tap
    #[test]
    fn test_restart_reactivates_tap() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();
        let handle = registered_tap(&hardware, &registry);
        let mut recorder = StreamRecorder::new(dir.path().join("again.wav"), handle.clone());

        recorder.start().unwrap();
        recorder.stop().unwrap();
        assert!(!handle.with_tap(|tap| tap.is_activated()).unwrap());

        recorder.start().expect("restart should re-activate the tap");
        assert!(handle.with_tap(|tap| tap.is_running()).unwrap());
        recorder.stop().unwrap();
    }

    /// Restarting a stopped recorder keeps the finished take and writes a new file
    #[test]
    fn test_restart_keeps_finished_take() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();
        let handle = registered_tap(&hardware, &registry);
        let mut recorder = StreamRecorder::new(dir.path().join("take.wav"), handle.clone());

        recorder.start().unwrap();
        assert_eq!(hardware.deliver_interleaved(aggregate_device(&handle), 2, &[0.5; 960]), 1);
        recorder.stop().unwrap();
        let first = recorder.destination().to_path_buf();

        recorder.start().unwrap();
        assert_eq!(hardware.deliver_interleaved(aggregate_device(&handle), 2, &[0.25; 64]), 1);
        recorder.stop().unwrap();
        let second = recorder.destination().to_path_buf();

        assert_ne!(first, second);
        assert_eq!(second, dir.path().join("take_001.wav"));
        assert_eq!(hound::WavReader::open(&first).unwrap().len(), 960);
        assert_eq!(hound::WavReader::open(&second).unwrap().len(), 64);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    /// The recorder never keeps a released tap alive
    #[test]
    fn test_start_without_tap_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();
        let handle = registered_tap(&hardware, &registry);
        let destination = dir.path().join("gone.wav");
        let mut recorder = StreamRecorder::new(destination.clone(), handle.clone());

        drop(registry.remove(handle.key()));

        assert!(matches!(recorder.start(), Err(CaptureError::Unavailable)));
        assert!(!recorder.is_recording());
        assert!(!destination.exists());
    }

    /// Stopping after the tap was released still finalizes the file
    #[test]
    fn test_stop_after_tap_released() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        let registry = TapRegistry::new();
        let handle = registered_tap(&hardware, &registry);
        let destination = dir.path().join("released.wav");
        let mut recorder = StreamRecorder::new(destination.clone(), handle.clone());

        recorder.start().unwrap();
        drop(registry.remove(handle.key()));

        assert!(matches!(recorder.stop(), Err(CaptureError::Unavailable)));
        assert!(!recorder.is_recording());
        assert!(hound::WavReader::open(&destination).is_ok());
        assert_eq!(hardware.object_counts(), ObjectCounts::default());
    }

    /// A tap without a negotiated format cannot be recorded
    #[test]
    fn test_missing_format_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        hardware.set_tap_format(None);
        let registry = TapRegistry::new();
        let handle = registered_tap(&hardware, &registry);
        let destination = dir.path().join("silent.wav");
        let mut recorder = StreamRecorder::new(destination.clone(), handle.clone());

        assert!(matches!(recorder.start(), Err(CaptureError::FormatUnavailable)));
        assert!(!recorder.is_recording());
        assert!(!destination.exists());
        assert!(handle.with_tap(|tap| tap.last_error().is_some()).unwrap());
        assert_eq!(hardware.object_counts(), ObjectCounts::default());
    }

    /// Compressed or otherwise unsupported tap formats are rejected before any file is created
    #[test]
    fn test_unsupported_tap_format() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        let mut format = StreamFormat::float32(48_000.0, 2, true);
        format.bits_per_channel = 24;
        format.format_flags &= !types::FORMAT_FLAG_IS_FLOAT;
        hardware.set_tap_format(Some(format));

        let registry = TapRegistry::new();
        let destination = dir.path().join("packed.wav");
        let mut recorder = StreamRecorder::new(destination.clone(), registered_tap(&hardware, &registry));

        assert!(matches!(recorder.start(), Err(CaptureError::UnsupportedFormat(_))));
        assert!(!recorder.is_recording());
        assert!(!destination.exists());
        assert_eq!(hardware.object_counts().io_procs, 0);
    }

    /// A device that refuses to start discards the half-created file
    #[test]
    fn test_run_failure_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Arc::new(FakeAudioHardware::new());
        hardware.fail(FakeStep::StartDevice);
        let registry = TapRegistry::new();
        let destination = dir.path().join("stalled.wav");
        let mut recorder = StreamRecorder::new(destination.clone(), registered_tap(&hardware, &registry));

        assert!(recorder.start().is_err());
        assert!(!recorder.is_recording());
        assert!(!destination.exists());
    }

    #[test]
    fn test_destination_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let first = PathManager::destination_for(dir.path(), 2).unwrap();
        assert_eq!(first.extension().and_then(|e| e.to_str()), Some("wav"));
        assert!(first
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with("2-")));
    }
}
