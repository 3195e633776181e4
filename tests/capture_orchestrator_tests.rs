use mockall::mock;
use process_audio_tap::audio::tap::{
    CaptureError, FakeAudioHardware, FakeProcess, FakeStep, ObjectCounts, PosixProcessInfo, ProcessId,
    ProcessKind, RunningApplication, Workspace,
};
use process_audio_tap::permissions::{PermissionStatus, StaticPermissionProvider};
use process_audio_tap::{CaptureConfig, CaptureEvent, CaptureOrchestrator, SessionStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Apps {}

    impl Workspace for Apps {
        fn running_applications(&self) -> Vec<RunningApplication>;
        fn process_info(&self, pid: ProcessId) -> Option<PosixProcessInfo>;
    }
}

fn workspace() -> Arc<MockApps> {
    let mut workspace = MockApps::new();
    workspace.expect_process_info().returning(|_| None);
    workspace.expect_running_applications().returning(|| {
        vec![RunningApplication {
            pid: 100,
            localized_name: Some("Music".to_string()),
            bundle_id: Some("com.apple.Music".to_string()),
            bundle_path: Some(PathBuf::from("/System/Applications/Music.app")),
        }]
    });
    Arc::new(workspace)
}

fn hardware() -> Arc<FakeAudioHardware> {
    Arc::new(FakeAudioHardware::with_processes(vec![
        FakeProcess::new(10, 100).running(true),
        FakeProcess::new(11, 101).with_bundle_id("com.example.synth"),
        FakeProcess::new(12, 102).with_bundle_id("com.example.sampler"),
    ]))
}

fn config(dir: &Path) -> CaptureConfig {
    CaptureConfig {
        output_directory: dir.to_path_buf(),
        app_poll_interval_ms: 10,
        ..CaptureConfig::default()
    }
}

fn orchestrator(hardware: &Arc<FakeAudioHardware>, config: CaptureConfig) -> CaptureOrchestrator {
    let mut orchestrator = CaptureOrchestrator::new(
        hardware.clone(),
        Arc::new(StaticPermissionProvider::authorized()),
        workspace(),
        config,
    );
    orchestrator
        .handle_event(CaptureEvent::ApplicationsChanged(Vec::new()))
        .expect("initial refresh");
    orchestrator
}

#[cfg(test)]
mod capture_orchestrator_tests {
    use super::*;

    /// Changing the selection tears down the old pair before the new tap is created
    #[test]
    fn test_reselect_replaces_pair_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut orchestrator = orchestrator(&hardware, config(dir.path()));

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100])).unwrap();
        assert!(orchestrator.has_session());
        assert_eq!(orchestrator.live_taps(), 1);
        let first_destination = orchestrator.destination().unwrap().to_path_buf();

        hardware.clear_calls();
        orchestrator
            .handle_event(CaptureEvent::SelectProcesses(vec![101, 102]))
            .unwrap();

        let calls = hardware.calls();
        let destroyed = calls.iter().position(|c| *c == FakeStep::DestroyTap).expect("old tap destroyed");
        let created = calls.iter().position(|c| *c == FakeStep::CreateTap).expect("new tap created");
        assert!(destroyed < created, "Old tap must be gone before the new one exists: {:?}", calls);

        assert_eq!(orchestrator.live_taps(), 1);
        assert_eq!(hardware.object_counts().taps, 1);
        assert_eq!(hardware.object_counts().aggregate_devices, 1);

        let described = hardware.tap_descriptions();
        assert_eq!(described[0].processes, vec![11, 12]);

        let second_destination = orchestrator.destination().unwrap();
        assert_ne!(first_destination, second_destination);
        assert!(second_destination
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with("2-")));
    }

    /// The same selection again keeps the current pair
    #[test]
    fn test_identical_selection_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut orchestrator = orchestrator(&hardware, config(dir.path()));

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![101])).unwrap();
        hardware.clear_calls();
        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![101])).unwrap();

        assert!(hardware.calls().is_empty());
        assert!(orchestrator.has_session());
    }

    /// Clearing the selection releases every OS object
    #[test]
    fn test_clear_selection_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut orchestrator = orchestrator(&hardware, config(dir.path()));

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100, 101])).unwrap();
        orchestrator.handle_event(CaptureEvent::StartRecording).unwrap();
        assert!(orchestrator.is_recording());

        orchestrator.handle_event(CaptureEvent::ClearSelection).unwrap();

        assert!(!orchestrator.has_session());
        assert!(orchestrator.selection().is_empty());
        assert_eq!(orchestrator.live_taps(), 0);
        assert_eq!(hardware.object_counts(), ObjectCounts::default());
        assert!(orchestrator.status().last_stats.is_some());
    }

    /// Auto-record starts a recording for each new pair and finalizes it on replacement
    #[test]
    fn test_auto_record_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut config = config(dir.path());
        config.auto_record = true;
        let mut orchestrator = orchestrator(&hardware, config);

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100])).unwrap();
        assert!(orchestrator.is_recording());
        let destination = orchestrator.destination().unwrap().to_path_buf();

        let device = orchestrator.aggregate_device_id().expect("activated tap");
        assert_eq!(hardware.deliver_interleaved(device, 2, &[0.25; 480]), 1);

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![102])).unwrap();
        assert!(orchestrator.is_recording(), "New pair records too");

        let stats = orchestrator.status().last_stats.expect("stats from the finished recording");
        assert_eq!(stats.frames_written, 240);

        let reader = hound::WavReader::open(&destination).unwrap();
        assert_eq!(reader.len(), 480);

        orchestrator.shutdown();
        assert_eq!(hardware.object_counts(), ObjectCounts::default());
    }

    /// Activation failure leaves no pair and reports the error
    #[test]
    fn test_activation_failure_leaves_no_pair() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut orchestrator = orchestrator(&hardware, config(dir.path()));

        hardware.fail(FakeStep::CreateAggregate);
        let result = orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100]));

        assert!(matches!(result, Err(CaptureError::Configuration(_))));
        assert!(!orchestrator.has_session());
        assert_eq!(orchestrator.live_taps(), 0);
        assert!(orchestrator.status().last_error.is_some());
        assert_eq!(hardware.object_counts(), ObjectCounts::default());

        // Retrying after the device recovers builds the pair
        hardware.clear_failures();
        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100])).unwrap();
        assert!(orchestrator.has_session());
        assert!(orchestrator.status().last_error.is_none());
    }

    /// Stopping and starting again keeps the first take and records into a new file
    #[test]
    fn test_second_take_gets_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut orchestrator = orchestrator(&hardware, config(dir.path()));

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100])).unwrap();
        orchestrator.handle_event(CaptureEvent::StartRecording).unwrap();
        let device = orchestrator.aggregate_device_id().unwrap();
        assert_eq!(hardware.deliver_interleaved(device, 2, &[0.5; 960]), 1);
        orchestrator.handle_event(CaptureEvent::StopRecording).unwrap();
        let first = orchestrator.destination().unwrap().to_path_buf();

        orchestrator.handle_event(CaptureEvent::StartRecording).unwrap();
        assert!(orchestrator.is_recording());
        let second = orchestrator.destination().unwrap().to_path_buf();
        assert_ne!(first, second);
        assert_eq!(orchestrator.live_taps(), 1);

        let device = orchestrator.aggregate_device_id().unwrap();
        assert_eq!(hardware.deliver_interleaved(device, 2, &[0.25; 128]), 1);
        orchestrator.handle_event(CaptureEvent::StopRecording).unwrap();

        assert_eq!(hound::WavReader::open(&first).unwrap().len(), 960);
        assert_eq!(hound::WavReader::open(&second).unwrap().len(), 128);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        assert_eq!(orchestrator.status().last_stats.unwrap().frames_written, 64);
    }

    /// A refresh that only changes activity does not restart a live recording
    #[test]
    fn test_activity_change_keeps_recording() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut orchestrator = orchestrator(&hardware, config(dir.path()));

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100])).unwrap();
        orchestrator.handle_event(CaptureEvent::StartRecording).unwrap();
        assert!(orchestrator.selection()[0].audio_active);

        hardware.set_processes(vec![
            FakeProcess::new(10, 100).running(false),
            FakeProcess::new(11, 101).with_bundle_id("com.example.synth"),
            FakeProcess::new(12, 102).with_bundle_id("com.example.sampler"),
        ]);
        orchestrator.handle_event(CaptureEvent::ApplicationsChanged(Vec::new())).unwrap();
        assert!(!orchestrator.registry().process(100).unwrap().audio_active);

        hardware.clear_calls();
        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100])).unwrap();

        assert!(orchestrator.is_recording(), "Same pid must keep the live recording");
        assert!(hardware.calls().is_empty(), "{:?}", hardware.calls());
        assert!(!orchestrator.selection()[0].audio_active, "Selection picks up the refreshed identity");
        assert_eq!(orchestrator.live_taps(), 1);
    }

    /// One process, cleared, then a different single process: never more than one tap
    #[test]
    fn test_clear_then_select_other_process() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut orchestrator = orchestrator(&hardware, config(dir.path()));

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![100])).unwrap();
        assert_eq!(orchestrator.live_taps(), 1);
        assert_eq!(hardware.object_counts().taps, 1);

        orchestrator.handle_event(CaptureEvent::ClearSelection).unwrap();
        assert_eq!(orchestrator.live_taps(), 0);
        assert_eq!(hardware.object_counts(), ObjectCounts::default());

        orchestrator.handle_event(CaptureEvent::SelectProcesses(vec![101])).unwrap();
        assert_eq!(orchestrator.live_taps(), 1);
        assert_eq!(hardware.object_counts().taps, 1);
        assert_eq!(hardware.object_counts().aggregate_devices, 1);
        assert_eq!(orchestrator.selection().len(), 1);
        assert_eq!(orchestrator.selection()[0].id, 101);
        assert_eq!(hardware.tap_descriptions()[0].processes, vec![11]);
    }

    /// Process snapshots are ignored until permission is granted
    #[test]
    fn test_snapshot_requires_permission() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let mut orchestrator = CaptureOrchestrator::new(
            hardware.clone(),
            Arc::new(StaticPermissionProvider::new(PermissionStatus::Denied, false)),
            workspace(),
            config(dir.path()),
        );

        let result = orchestrator.handle_event(CaptureEvent::ApplicationsChanged(Vec::new()));
        assert!(matches!(result, Err(CaptureError::PermissionDenied)));
        assert!(orchestrator.registry().processes().is_empty());
    }

    async fn wait_for(
        status: &mut tokio::sync::watch::Receiver<SessionStatus>,
        predicate: impl Fn(&SessionStatus) -> bool,
    ) -> SessionStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let current = status.borrow_and_update();
                    if predicate(&*current) {
                        return current.clone();
                    }
                }
                status.changed().await.expect("orchestrator stopped publishing");
            }
        })
        .await
        .expect("timed out waiting for status")
    }

    /// Driving a spawned orchestrator through its handle
    #[tokio::test]
    async fn test_spawned_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = hardware();
        let orchestrator = CaptureOrchestrator::new(
            hardware.clone(),
            Arc::new(StaticPermissionProvider::new(PermissionStatus::Unknown, true)),
            workspace(),
            config(dir.path()),
        );

        let (handle, task) = orchestrator.spawn();
        let mut status = handle.subscribe();

        let ready = wait_for(&mut status, |s| {
            s.permission == PermissionStatus::Authorized && !s.groups.is_empty()
        })
        .await;
        let music = ready
            .groups
            .iter()
            .flat_map(|g| g.members.iter())
            .find(|p| p.id == 100)
            .expect("Music in snapshot");
        assert_eq!(music.kind, ProcessKind::App);
        assert_eq!(music.name, "Music");

        handle.select(vec![100]).unwrap();
        handle.start_recording().unwrap();
        let recording = wait_for(&mut status, |s| s.is_recording).await;
        assert!(recording.has_session);
        assert_eq!(recording.selection.len(), 1);

        handle.stop_recording().unwrap();
        let stopped = wait_for(&mut status, |s| !s.is_recording && s.last_stats.is_some()).await;
        assert!(stopped.destination.as_deref().is_some_and(Path::exists));

        handle.shutdown().unwrap();
        task.await.unwrap();

        assert!(!handle.status().has_session);
        assert!(handle.select(vec![100]).is_err(), "Handle is closed after shutdown");
        assert_eq!(hardware.object_counts(), ObjectCounts::default());
    }
}
