// In-memory audio hardware for tests and unsupported platforms
//
// Models the subset of the HAL used by the tap pipeline: it hands out object
// ids, keeps track of every live tap, aggregate device and IO proc, records
// each call in order, and lets callers inject a failure at any step or push a
// buffer cycle through a registered IO proc.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::hardware::{
    AggregateDeviceDescription, AudioHardware, HardwareError, HardwareResult, IoProcId,
    TapDescription,
};
use super::types::{
    AudioBufferView, AudioObjectId, AudioTimestamp, IoCallback, IoCycle, ProcessId, StreamFormat,
};

/// Status returned by injected failures (`kAudioHardwareUnspecifiedError`)
pub const FAKE_FAILURE_STATUS: i32 = i32::from_be_bytes(*b"what");

/// A process object as the fake HAL reports it
#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub object: AudioObjectId,
    pub pid: ProcessId,
    pub bundle_id: Option<String>,
    pub running: bool,
    /// `false` makes every property read on this object fail
    pub readable: bool,
}

impl FakeProcess {
    pub fn new(object: AudioObjectId, pid: ProcessId) -> Self {
        Self {
            object,
            pid,
            bundle_id: None,
            running: false,
            readable: true,
        }
    }

    pub fn with_bundle_id(mut self, bundle_id: &str) -> Self {
        self.bundle_id = Some(bundle_id.to_string());
        self
    }

    pub fn running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }

    pub fn unreadable(mut self) -> Self {
        self.readable = false;
        self
    }
}

/// HAL operations the fake records and can fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeStep {
    ProcessList,
    CreateTap,
    ReadTapFormat,
    DefaultOutput,
    DeviceUid,
    CreateAggregate,
    CreateIoProc,
    StartDevice,
    StopDevice,
    DestroyIoProc,
    DestroyAggregate,
    DestroyTap,
}

/// Live OS objects at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub taps: usize,
    pub aggregate_devices: usize,
    pub io_procs: usize,
    pub running_devices: usize,
}

struct FakeState {
    next_object: AudioObjectId,
    next_io_proc: usize,
    output_device: AudioObjectId,
    processes: Vec<FakeProcess>,
    tap_format: Option<StreamFormat>,
    taps: HashMap<AudioObjectId, TapDescription>,
    aggregates: HashMap<AudioObjectId, AggregateDeviceDescription>,
    io_procs: HashMap<IoProcId, AudioObjectId>,
    running: HashSet<IoProcId>,
    failures: HashSet<FakeStep>,
    calls: Vec<FakeStep>,
}

/// Deterministic `AudioHardware` implementation
pub struct FakeAudioHardware {
    state: Mutex<FakeState>,
    callbacks: Mutex<HashMap<IoProcId, IoCallback>>,
}

impl FakeAudioHardware {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_object: 1000,
                next_io_proc: 1,
                output_device: 42,
                processes: Vec::new(),
                tap_format: Some(StreamFormat::float32(48_000.0, 2, true)),
                taps: HashMap::new(),
                aggregates: HashMap::new(),
                io_procs: HashMap::new(),
                running: HashSet::new(),
                failures: HashSet::new(),
                calls: Vec::new(),
            }),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_processes(processes: Vec<FakeProcess>) -> Self {
        let hardware = Self::new();
        hardware.set_processes(processes);
        hardware
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> MutexGuard<'_, HashMap<IoProcId, IoCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_processes(&self, processes: Vec<FakeProcess>) {
        self.state().processes = processes;
    }

    /// Format reported for newly created taps; `None` makes the read fail
    pub fn set_tap_format(&self, format: Option<StreamFormat>) {
        self.state().tap_format = format;
    }

    pub fn fail(&self, step: FakeStep) {
        self.state().failures.insert(step);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Every HAL call made so far, in order
    pub fn calls(&self) -> Vec<FakeStep> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn object_counts(&self) -> ObjectCounts {
        let state = self.state();
        ObjectCounts {
            taps: state.taps.len(),
            aggregate_devices: state.aggregates.len(),
            io_procs: state.io_procs.len(),
            running_devices: state
                .running
                .iter()
                .filter_map(|io_proc| state.io_procs.get(io_proc))
                .collect::<HashSet<_>>()
                .len(),
        }
    }

    pub fn tap_descriptions(&self) -> Vec<TapDescription> {
        self.state().taps.values().cloned().collect()
    }

    pub fn aggregate_descriptions(&self) -> Vec<AggregateDeviceDescription> {
        self.state().aggregates.values().cloned().collect()
    }

    /// Run one IO cycle on `device`, invoking every started IO proc.
    /// Returns how many callbacks ran.
    pub fn deliver(&self, device: AudioObjectId, input: &[AudioBufferView<'_>]) -> usize {
        let targets: Vec<IoProcId> = {
            let state = self.state();
            state
                .running
                .iter()
                .filter(|io_proc| state.io_procs.get(io_proc) == Some(&device))
                .copied()
                .collect()
        };

        let cycle = IoCycle {
            now: AudioTimestamp::default(),
            input_time: AudioTimestamp::default(),
            input,
        };

        let mut callbacks = self.callbacks();
        let mut delivered = 0;
        for io_proc in targets {
            if let Some(callback) = callbacks.get_mut(&io_proc) {
                callback(&cycle);
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver interleaved float samples as a single buffer
    pub fn deliver_interleaved(&self, device: AudioObjectId, channels: u32, samples: &[f32]) -> usize {
        let bytes: Vec<u8> = samples.iter().flat_map(|sample| sample.to_ne_bytes()).collect();
        let views = [AudioBufferView {
            channels,
            data: &bytes,
        }];
        self.deliver(device, &views)
    }

    fn begin(&self, step: FakeStep, operation: &'static str) -> HardwareResult<MutexGuard<'_, FakeState>> {
        let mut state = self.state();
        state.calls.push(step);
        if state.failures.contains(&step) {
            return Err(HardwareError::status(operation, FAKE_FAILURE_STATUS));
        }
        Ok(state)
    }

    fn process(&self, process: AudioObjectId, operation: &'static str) -> HardwareResult<FakeProcess> {
        let state = self.state();
        match state.processes.iter().find(|candidate| candidate.object == process) {
            Some(found) if found.readable => Ok(found.clone()),
            Some(_) => Err(HardwareError::status(operation, i32::from_be_bytes(*b"!obj"))),
            None => Err(HardwareError::UnknownObject(process)),
        }
    }
}

impl Default for FakeAudioHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHardware for FakeAudioHardware {
    fn process_objects(&self) -> HardwareResult<Vec<AudioObjectId>> {
        let state = self.begin(FakeStep::ProcessList, "Read process object list")?;
        Ok(state.processes.iter().map(|process| process.object).collect())
    }

    fn process_pid(&self, process: AudioObjectId) -> HardwareResult<ProcessId> {
        Ok(self.process(process, "Read process PID")?.pid)
    }

    fn process_bundle_id(&self, process: AudioObjectId) -> HardwareResult<Option<String>> {
        Ok(self
            .process(process, "Read process bundle ID")?
            .bundle_id
            .filter(|id| !id.is_empty()))
    }

    fn process_is_running(&self, process: AudioObjectId) -> HardwareResult<bool> {
        Ok(self.process(process, "Read process is running")?.running)
    }

    fn default_output_device(&self) -> HardwareResult<AudioObjectId> {
        let state = self.begin(FakeStep::DefaultOutput, "Read default system output device")?;
        Ok(state.output_device)
    }

    fn device_uid(&self, device: AudioObjectId) -> HardwareResult<String> {
        let state = self.begin(FakeStep::DeviceUid, "Read device UID")?;
        if device != state.output_device && !state.aggregates.contains_key(&device) {
            return Err(HardwareError::UnknownObject(device));
        }
        Ok(format!("FakeDevice_UID_{}", device))
    }

    fn create_process_tap(&self, description: &TapDescription) -> HardwareResult<AudioObjectId> {
        let mut state = self.begin(FakeStep::CreateTap, "Create process tap")?;
        let tap = state.next_object;
        state.next_object += 1;
        state.taps.insert(tap, description.clone());
        Ok(tap)
    }

    fn destroy_process_tap(&self, tap: AudioObjectId) -> HardwareResult<()> {
        let mut state = self.begin(FakeStep::DestroyTap, "Destroy process tap")?;
        state
            .taps
            .remove(&tap)
            .map(|_| ())
            .ok_or(HardwareError::UnknownObject(tap))
    }

    fn tap_stream_format(&self, tap: AudioObjectId) -> HardwareResult<StreamFormat> {
        let state = self.begin(FakeStep::ReadTapFormat, "Read tap stream format")?;
        if !state.taps.contains_key(&tap) {
            return Err(HardwareError::UnknownObject(tap));
        }
        state.tap_format.ok_or(HardwareError::MissingValue {
            operation: "Read tap stream format",
        })
    }

    fn create_aggregate_device(
        &self,
        description: &AggregateDeviceDescription,
    ) -> HardwareResult<AudioObjectId> {
        let mut state = self.begin(FakeStep::CreateAggregate, "Create aggregate device")?;
        let device = state.next_object;
        state.next_object += 1;
        state.aggregates.insert(device, description.clone());
        Ok(device)
    }

    fn destroy_aggregate_device(&self, device: AudioObjectId) -> HardwareResult<()> {
        let mut state = self.begin(FakeStep::DestroyAggregate, "Destroy aggregate device")?;
        state
            .aggregates
            .remove(&device)
            .map(|_| ())
            .ok_or(HardwareError::UnknownObject(device))
    }

    fn create_io_proc(&self, device: AudioObjectId, callback: IoCallback) -> HardwareResult<IoProcId> {
        let io_proc = {
            let mut state = self.begin(FakeStep::CreateIoProc, "Create device IO proc")?;
            if !state.aggregates.contains_key(&device) {
                return Err(HardwareError::UnknownObject(device));
            }
            let io_proc = IoProcId(state.next_io_proc);
            state.next_io_proc += 1;
            state.io_procs.insert(io_proc, device);
            io_proc
        };
        self.callbacks().insert(io_proc, callback);
        Ok(io_proc)
    }

    fn destroy_io_proc(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()> {
        {
            let mut state = self.begin(FakeStep::DestroyIoProc, "Destroy device IO proc")?;
            if state.io_procs.get(&io_proc) != Some(&device) {
                return Err(HardwareError::MissingValue {
                    operation: "Destroy device IO proc",
                });
            }
            state.io_procs.remove(&io_proc);
            state.running.remove(&io_proc);
        }
        // Waits for an in-flight delivery to finish
        self.callbacks().remove(&io_proc);
        Ok(())
    }

    fn start_device(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()> {
        let mut state = self.begin(FakeStep::StartDevice, "Start audio device")?;
        if state.io_procs.get(&io_proc) != Some(&device) {
            return Err(HardwareError::UnknownObject(device));
        }
        state.running.insert(io_proc);
        Ok(())
    }

    fn stop_device(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()> {
        let mut state = self.begin(FakeStep::StopDevice, "Stop aggregate device")?;
        if state.io_procs.get(&io_proc) != Some(&device) {
            return Err(HardwareError::UnknownObject(device));
        }
        state.running.remove(&io_proc);
        Ok(())
    }
}
