// Process tap lifecycle: tap object, private aggregate device, IO proc
//
// inactive -> activated -> running -> inactive. `invalidate` tears everything
// down in reverse creation order and is reachable from any state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::hardware::{
    AggregateDeviceDescription, AudioHardware, HardwareError, IoProcId, TapDescription, TapMuteBehavior,
};
use super::process::ProcessIdentity;
use super::types::{AudioObjectId, CaptureError, IoCallback, Result, StreamFormat, UNKNOWN_AUDIO_OBJECT};

static NEXT_TAP_NUMBER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    Inactive,
    Activated,
    Running,
}

/// A stereo mixdown tap over a set of processes, mixed into a private
/// aggregate device on the system output
pub struct ProcessTap {
    hardware: Arc<dyn AudioHardware>,
    processes: Vec<ProcessIdentity>,
    mute_when_tapped: bool,
    name: String,
    state: TapState,
    tap_id: AudioObjectId,
    tap_uuid: Option<Uuid>,
    aggregate_device_id: AudioObjectId,
    io_proc: Option<IoProcId>,
    stream_format: Option<StreamFormat>,
    last_error: Option<String>,
}

impl ProcessTap {
    pub fn new(hardware: Arc<dyn AudioHardware>, processes: Vec<ProcessIdentity>, mute_when_tapped: bool) -> Self {
        let name = format!("Tap-{}", NEXT_TAP_NUMBER.fetch_add(1, Ordering::Relaxed));
        Self {
            hardware,
            processes,
            mute_when_tapped,
            name,
            state: TapState::Inactive,
            tap_id: UNKNOWN_AUDIO_OBJECT,
            tap_uuid: None,
            aggregate_device_id: UNKNOWN_AUDIO_OBJECT,
            io_proc: None,
            stream_format: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processes(&self) -> &[ProcessIdentity] {
        &self.processes
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    pub fn is_activated(&self) -> bool {
        self.state != TapState::Inactive
    }

    pub fn is_running(&self) -> bool {
        self.state == TapState::Running
    }

    /// Format negotiated by the tap, present only while activated
    pub fn stream_format(&self) -> Option<StreamFormat> {
        self.stream_format
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn aggregate_device_id(&self) -> Option<AudioObjectId> {
        (self.aggregate_device_id != UNKNOWN_AUDIO_OBJECT).then_some(self.aggregate_device_id)
    }

    /// Create the tap and its aggregate device. No-op when already activated.
    ///
    /// If any step fails, whatever this attempt created is torn down again,
    /// `last_error` records the failure and the tap stays inactive.
    pub fn activate(&mut self) -> Result<()> {
        debug!("{}: activate", self.name);

        if self.state != TapState::Inactive {
            return Ok(());
        }

        self.last_error = None;

        if let Err(e) = self.prepare() {
            let message = e.to_string();
            error!("{}: activation failed: {}", self.name, message);
            self.teardown();
            self.last_error = Some(message.clone());
            return Err(CaptureError::Configuration(message));
        }

        self.state = TapState::Activated;
        Ok(())
    }

    fn prepare(&mut self) -> std::result::Result<(), ActivationError> {
        if self.processes.is_empty() {
            return Err(ActivationError::NoProcesses);
        }

        let uuid = Uuid::new_v4();
        let description = TapDescription {
            processes: self.processes.iter().map(|process| process.object_id).collect(),
            uuid,
            mute_behavior: TapMuteBehavior::from_mute_flag(self.mute_when_tapped),
        };

        self.tap_id = self
            .hardware
            .create_process_tap(&description)
            .map_err(|e| ActivationError::Step("Process tap creation failed", e))?;
        self.tap_uuid = Some(uuid);
        info!("{}: created process tap #{}", self.name, self.tap_id);

        let output_device = self
            .hardware
            .default_output_device()
            .map_err(|e| ActivationError::Step("Failed to read default output device", e))?;
        let output_uid = self
            .hardware
            .device_uid(output_device)
            .map_err(|e| ActivationError::Step("Failed to read output device UID", e))?;

        let aggregate = AggregateDeviceDescription::for_tap(self.name.clone(), &output_uid, &uuid);
        self.aggregate_device_id = self
            .hardware
            .create_aggregate_device(&aggregate)
            .map_err(|e| ActivationError::Step("Failed to create aggregate device", e))?;

        let format = self
            .hardware
            .tap_stream_format(self.tap_id)
            .map_err(|e| ActivationError::Step("Failed to read tap stream format", e))?;
        info!("{}: aggregate device #{} ({})", self.name, self.aggregate_device_id, format);
        self.stream_format = Some(format);

        Ok(())
    }

    /// Register `callback` on the aggregate device and start it.
    ///
    /// `callback` runs on the real-time audio thread for every IO cycle.
    pub fn run(&mut self, callback: IoCallback) -> Result<()> {
        debug!("{}: run", self.name);

        match self.state {
            TapState::Inactive => return Err(CaptureError::InvalidState("tap must be activated before run")),
            TapState::Running => return Err(CaptureError::InvalidState("tap already has a buffer callback")),
            TapState::Activated => {}
        }

        let device = self.aggregate_device_id;
        let io_proc = self.hardware.create_io_proc(device, callback).map_err(|e| {
            self.last_error = Some(e.to_string());
            e
        })?;

        if let Err(e) = self.hardware.start_device(device, io_proc) {
            self.last_error = Some(e.to_string());
            if let Err(destroy) = self.hardware.destroy_io_proc(device, io_proc) {
                warn!("{}: failed to destroy IO proc after start failure: {}", self.name, destroy);
            }
            return Err(e.into());
        }

        self.io_proc = Some(io_proc);
        self.state = TapState::Running;
        info!("{}: running on aggregate device #{}", self.name, device);
        Ok(())
    }

    /// Stop and destroy everything this tap created. No-op when inactive.
    ///
    /// Once this returns the buffer callback is no longer invoked.
    pub fn invalidate(&mut self) {
        if self.state == TapState::Inactive {
            return;
        }
        debug!("{}: invalidate", self.name);
        self.teardown();
    }

    fn teardown(&mut self) {
        let device = self.aggregate_device_id;

        if let Some(io_proc) = self.io_proc.take() {
            if let Err(e) = self.hardware.stop_device(device, io_proc) {
                warn!("{}: failed to stop aggregate device #{}: {}", self.name, device, e);
            }
            if let Err(e) = self.hardware.destroy_io_proc(device, io_proc) {
                warn!("{}: failed to destroy IO proc: {}", self.name, e);
            }
        }

        if device != UNKNOWN_AUDIO_OBJECT {
            if let Err(e) = self.hardware.destroy_aggregate_device(device) {
                warn!("{}: failed to destroy aggregate device #{}: {}", self.name, device, e);
            }
            self.aggregate_device_id = UNKNOWN_AUDIO_OBJECT;
        }

        if self.tap_id != UNKNOWN_AUDIO_OBJECT {
            if let Err(e) = self.hardware.destroy_process_tap(self.tap_id) {
                warn!("{}: failed to destroy process tap #{}: {}", self.name, self.tap_id, e);
            }
            self.tap_id = UNKNOWN_AUDIO_OBJECT;
        }

        self.tap_uuid = None;
        self.stream_format = None;
        self.state = TapState::Inactive;
    }
}

impl Drop for ProcessTap {
    fn drop(&mut self) {
        self.invalidate();
    }
}

#[derive(Debug, thiserror::Error)]
enum ActivationError {
    #[error("No processes to tap")]
    NoProcesses,

    #[error("{0}: {1}")]
    Step(&'static str, HardwareError),
}
