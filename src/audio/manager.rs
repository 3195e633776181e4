// Capture orchestrator - High-level session control for process capture
//
// This module composes permission gating, the process registry, and the
// tap + recorder pair into one session. All lifecycle changes happen on the
// orchestrator's own context, one `CaptureEvent` at a time; callbacks from
// other threads (permission results, application changes) only send events.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::recording::{PathManager, RecordingStats, StreamRecorder};
use super::tap::hardware::AudioHardware;
use super::tap::process::{ProcessGroup, ProcessIdentity};
use super::tap::process_discovery::{RunningApplication, Workspace};
use super::tap::process_tap::ProcessTap;
use super::tap::registry::ProcessRegistry;
use super::tap::tap_registry::{TapHandle, TapRegistry};
use super::tap::types::{AudioObjectId, CaptureError, ProcessId, Result};
use crate::config::CaptureConfig;
use crate::permissions::{PermissionGate, PermissionProvider, PermissionStatus};

/// Inputs to the orchestrator, processed strictly in order
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    PermissionResolved(bool),
    ApplicationsChanged(Vec<RunningApplication>),
    SelectProcesses(Vec<ProcessId>),
    ClearSelection,
    StartRecording,
    StopRecording,
    Shutdown,
}

/// Snapshot published after every event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub permission: PermissionStatus,
    pub groups: Vec<ProcessGroup>,
    pub selection: Vec<ProcessIdentity>,
    pub has_session: bool,
    pub is_recording: bool,
    pub destination: Option<PathBuf>,
    pub last_stats: Option<RecordingStats>,
    pub last_error: Option<String>,
}

impl SessionStatus {
    fn initial(permission: PermissionStatus) -> Self {
        Self {
            permission,
            groups: Vec::new(),
            selection: Vec::new(),
            has_session: false,
            is_recording: false,
            destination: None,
            last_stats: None,
            last_error: None,
        }
    }
}

/// The current tap + recorder pair
struct CaptureSession {
    tap: TapHandle,
    recorder: StreamRecorder,
}

pub struct CaptureOrchestrator {
    hardware: Arc<dyn AudioHardware>,
    permission: PermissionGate,
    registry: ProcessRegistry,
    taps: Arc<TapRegistry>,
    config: CaptureConfig,
    selection: Vec<ProcessIdentity>,
    session: Option<CaptureSession>,
    last_stats: Option<RecordingStats>,
    last_error: Option<String>,
    events_tx: mpsc::UnboundedSender<CaptureEvent>,
    events_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    status_tx: watch::Sender<SessionStatus>,
}

impl CaptureOrchestrator {
    pub fn new(
        hardware: Arc<dyn AudioHardware>,
        permission_provider: Arc<dyn PermissionProvider>,
        workspace: Arc<dyn Workspace>,
        config: CaptureConfig,
    ) -> Self {
        if let Err(e) = config.validate() {
            warn!("Capture config out of range, clamping where needed: {}", e);
        }
        let permission = PermissionGate::new(permission_provider);
        let registry = ProcessRegistry::new(hardware.clone(), workspace)
            .with_bundle_search_depth(config.bundle_search_depth);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SessionStatus::initial(permission.status()));

        Self {
            hardware,
            permission,
            registry,
            taps: TapRegistry::new(),
            config,
            selection: Vec::new(),
            session: None,
            last_stats: None,
            last_error: None,
            events_tx,
            events_rx,
            status_tx,
        }
    }

    /// Sender for events from other contexts
    pub fn sender(&self) -> mpsc::UnboundedSender<CaptureEvent> {
        self.events_tx.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn permission_status(&self) -> PermissionStatus {
        self.permission.status()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn selection(&self) -> &[ProcessIdentity] {
        &self.selection
    }

    /// Number of taps currently alive
    pub fn live_taps(&self) -> usize {
        self.taps.len()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.recorder.is_recording())
    }

    pub fn destination(&self) -> Option<&Path> {
        self.session.as_ref().map(|session| session.recorder.destination())
    }

    /// Aggregate device of the current tap, while activated
    pub fn aggregate_device_id(&self) -> Option<AudioObjectId> {
        let session = self.session.as_ref()?;
        session.tap.with_tap(|tap| tap.aggregate_device_id()).ok().flatten()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            permission: self.permission.status(),
            groups: self.registry.groups().to_vec(),
            selection: self.selection.clone(),
            has_session: self.session.is_some(),
            is_recording: self.is_recording(),
            destination: self.destination().map(Path::to_path_buf),
            last_stats: self.last_stats,
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    /// Act on the current permission status: request it when unknown,
    /// start watching processes when authorized, open settings when denied.
    pub fn start(&mut self) {
        debug!("CaptureOrchestrator::start");

        match self.permission.refresh() {
            PermissionStatus::Unknown => {
                let events = self.events_tx.clone();
                self.permission.request(Box::new(move |granted| {
                    // Delivered on an arbitrary thread; the status changes when the event is handled
                    let _ = events.send(CaptureEvent::PermissionResolved(granted));
                }));
            }
            PermissionStatus::Authorized => self.activate_registry(),
            PermissionStatus::Denied => self.defer_to_settings(),
        }

        self.publish();
    }

    fn activate_registry(&mut self) {
        let events = self.events_tx.clone();
        let result = self.registry.activate(self.config.app_poll_interval(), move |apps| {
            let _ = events.send(CaptureEvent::ApplicationsChanged(apps));
        });

        if let Err(e) = result {
            error!("Failed to watch running applications: {}", e);
            self.last_error = Some(e.to_string());
        }
    }

    fn defer_to_settings(&mut self) {
        warn!("System audio capture permission denied");
        self.last_error = Some(CaptureError::PermissionDenied.to_string());
        if let Err(e) = self.permission.open_settings() {
            error!("Failed to open privacy settings: {}", e);
        }
    }

    /// Apply one event. Errors are also recorded as `last_error`.
    pub fn handle_event(&mut self, event: CaptureEvent) -> Result<()> {
        debug!("Handling {:?}", event);

        let result = match event {
            CaptureEvent::PermissionResolved(granted) => {
                match self.permission.apply(granted) {
                    PermissionStatus::Authorized => self.activate_registry(),
                    _ => self.defer_to_settings(),
                }
                Ok(())
            }
            CaptureEvent::ApplicationsChanged(apps) => self.refresh_processes(&apps),
            CaptureEvent::SelectProcesses(pids) => self.select(&pids),
            CaptureEvent::ClearSelection => {
                self.selection.clear();
                self.teardown_session();
                Ok(())
            }
            CaptureEvent::StartRecording => self.start_recording(),
            CaptureEvent::StopRecording => self.stop_recording(),
            CaptureEvent::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };

        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        self.publish();
        result
    }

    /// Handle every event already queued, without waiting
    pub fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            if let Err(e) = self.handle_event(event) {
                warn!("Capture event failed: {}", e);
            }
            handled += 1;
        }
        handled
    }

    fn refresh_processes(&mut self, apps: &[RunningApplication]) -> Result<()> {
        if self.permission.status() != PermissionStatus::Authorized {
            return Err(CaptureError::PermissionDenied);
        }
        if self.registry.refresh(apps)? {
            self.registry.recompute_groups();
            debug!("Process snapshot changed ({} processes)", self.registry.processes().len());
        }
        Ok(())
    }

    fn select(&mut self, pids: &[ProcessId]) -> Result<()> {
        let selection: Vec<ProcessIdentity> = pids
            .iter()
            .filter_map(|pid| {
                let process = self.registry.process(*pid).cloned();
                if process.is_none() {
                    warn!("Ignoring unknown process {} in selection", pid);
                }
                process
            })
            .collect();

        if selection.is_empty() {
            self.selection.clear();
            self.teardown_session();
            return Ok(());
        }

        if self.session.is_some() && same_targets(&selection, &self.selection) {
            // Same processes; only refresh their names and activity
            self.selection = selection;
            return Ok(());
        }

        self.selection = selection;
        self.replace_session()
    }

    /// Tear down the current pair completely, then build a new one over the selection
    fn replace_session(&mut self) -> Result<()> {
        self.teardown_session();
        self.last_error = None;

        let mut tap = ProcessTap::new(
            self.hardware.clone(),
            self.selection.clone(),
            self.config.mute_source_when_tapped,
        );
        tap.activate()?;
        info!("{} tapping {} process(es)", tap.name(), self.selection.len());

        let handle = self.taps.insert(tap);

        let destination = match PathManager::destination_for(&self.config.output_directory, self.selection.len()) {
            Ok(destination) => destination,
            Err(e) => {
                drop(self.taps.remove(handle.key()));
                return Err(CaptureError::System(e));
            }
        };

        let recorder = StreamRecorder::new(destination, handle.clone())
            .with_ring_buffer_seconds(self.config.ring_buffer_seconds);
        self.session = Some(CaptureSession { tap: handle, recorder });

        if self.config.auto_record {
            self.start_recording()?;
        }
        Ok(())
    }

    fn teardown_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Err(e) = session.recorder.stop() {
            warn!("Failed to stop recorder for {}: {}", session.recorder.destination().display(), e);
        }
        if let Some(stats) = session.recorder.last_stats() {
            self.last_stats = Some(stats);
        }

        if let Some(mut tap) = self.taps.remove(session.tap.key()) {
            tap.invalidate();
            debug!("{} released", tap.name());
        }
    }

    /// No-op without a session. A take that was already stopped is kept and
    /// the next one gets a new recorder on a fresh destination.
    pub fn start_recording(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if !session.recorder.is_recording() && session.recorder.destination().exists() {
            let destination = PathManager::destination_for(&self.config.output_directory, self.selection.len())
                .map_err(CaptureError::System)?;
            session.recorder = StreamRecorder::new(destination, session.tap.clone())
                .with_ring_buffer_seconds(self.config.ring_buffer_seconds);
        }
        session.recorder.start()
    }

    /// No-op without a session
    pub fn stop_recording(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let result = session.recorder.stop();
        if let Some(stats) = session.recorder.last_stats() {
            self.last_stats = Some(stats);
        }
        result
    }

    /// Tear down the current pair and stop watching applications
    pub fn shutdown(&mut self) {
        info!("Shutting down capture session");
        self.teardown_session();
        self.registry.deactivate();
    }

    /// Process events until `Shutdown`
    pub async fn run(mut self) {
        self.start();

        while let Some(event) = self.events_rx.recv().await {
            let stop = event == CaptureEvent::Shutdown;
            if let Err(e) = self.handle_event(event) {
                warn!("Capture event failed: {}", e);
            }
            if stop {
                break;
            }
        }

        self.shutdown();
        self.publish();
    }

    /// Run the event loop on the current tokio runtime
    pub fn spawn(self) -> (CaptureHandle, JoinHandle<()>) {
        let handle = CaptureHandle {
            events: self.events_tx.clone(),
            status: self.status_tx.subscribe(),
        };
        (handle, tokio::spawn(self.run()))
    }
}

/// Whether two selections tap the same audio objects, ignoring metadata that
/// changes between refreshes
fn same_targets(a: &[ProcessIdentity], b: &[ProcessIdentity]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(a, b)| a.id == b.id && a.object_id == b.object_id)
}

impl Drop for CaptureOrchestrator {
    fn drop(&mut self) {
        self.teardown_session();
    }
}

/// Host-side control of a spawned orchestrator
#[derive(Clone)]
pub struct CaptureHandle {
    events: mpsc::UnboundedSender<CaptureEvent>,
    status: watch::Receiver<SessionStatus>,
}

impl CaptureHandle {
    pub fn send(&self, event: CaptureEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| CaptureError::InvalidState("capture session has shut down"))
    }

    pub fn select(&self, pids: Vec<ProcessId>) -> Result<()> {
        self.send(CaptureEvent::SelectProcesses(pids))
    }

    pub fn clear_selection(&self) -> Result<()> {
        self.send(CaptureEvent::ClearSelection)
    }

    pub fn start_recording(&self) -> Result<()> {
        self.send(CaptureEvent::StartRecording)
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.send(CaptureEvent::StopRecording)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(CaptureEvent::Shutdown)
    }

    /// Latest published status
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}
