// Core Audio backend for macOS process taps
//
// Implements `AudioHardware` on top of the HAL: process object properties,
// `AudioHardwareCreateProcessTap`, aggregate devices and IO procs. IO procs
// are registered with a C trampoline that hands the Rust callback zero-copy
// views of the delivered `AudioBufferList`.

use std::collections::HashMap;
use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use core_foundation::base::TCFType;
use coreaudio_sys::{
    AudioBufferList, AudioDeviceCreateIOProcID, AudioDeviceDestroyIOProcID, AudioDeviceIOProcID,
    AudioDeviceStart, AudioDeviceStop, AudioHardwareCreateAggregateDevice,
    AudioHardwareDestroyAggregateDevice, AudioTimeStamp, OSStatus,
};
use objc2_core_audio::{AudioHardwareCreateProcessTap, AudioHardwareDestroyProcessTap};
use tracing::{debug, info};

use super::core_audio_bindings::{
    create_aggregate_device_dictionary, create_tap_description, kAudioDevicePropertyDeviceUID,
    kAudioHardwarePropertyDefaultSystemOutputDevice, kAudioHardwarePropertyProcessObjectList,
    kAudioObjectSystemObject, kAudioProcessPropertyBundleID, kAudioProcessPropertyIsRunning,
    kAudioProcessPropertyPID, read_property, read_property_array, read_string_property,
    read_tap_format,
};
use super::hardware::{
    check_status, AggregateDeviceDescription, AudioHardware, HardwareError, HardwareResult,
    IoProcId, TapDescription,
};
use super::types::{
    AudioBufferView, AudioObjectId, AudioTimestamp, IoCallback, IoCycle, ProcessId, StreamFormat,
    UNKNOWN_AUDIO_OBJECT,
};

/// Upper bound on buffers per `AudioBufferList` handed to a callback
const MAX_IO_BUFFERS: usize = 16;

/// Context data for the IO proc trampoline
struct IoProcContext {
    callback: IoCallback,
}

struct IoProcRegistration {
    os_proc: AudioDeviceIOProcID,
    context: *mut IoProcContext,
}

// The context pointer is only dereferenced by the HAL's IO thread while the
// proc is registered, and freed after `AudioDeviceDestroyIOProcID` returns.
unsafe impl Send for IoProcRegistration {}

/// `AudioHardware` backed by the macOS HAL
pub struct CoreAudioHardware {
    io_procs: Mutex<HashMap<IoProcId, IoProcRegistration>>,
    next_io_proc: AtomicUsize,
}

impl CoreAudioHardware {
    pub fn new() -> Self {
        Self {
            io_procs: Mutex::new(HashMap::new()),
            next_io_proc: AtomicUsize::new(1),
        }
    }

    fn os_proc(&self, io_proc: IoProcId) -> HardwareResult<AudioDeviceIOProcID> {
        self.io_procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&io_proc)
            .map(|registration| registration.os_proc)
            .ok_or(HardwareError::MissingValue {
                operation: "Look up IO proc",
            })
    }
}

impl Default for CoreAudioHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHardware for CoreAudioHardware {
    fn process_objects(&self) -> HardwareResult<Vec<AudioObjectId>> {
        unsafe {
            read_property_array::<AudioObjectId>(
                kAudioObjectSystemObject,
                kAudioHardwarePropertyProcessObjectList,
                "Read process object list",
            )
        }
    }

    fn process_pid(&self, process: AudioObjectId) -> HardwareResult<ProcessId> {
        unsafe { read_property::<ProcessId>(process, kAudioProcessPropertyPID, "Read process PID") }
    }

    fn process_bundle_id(&self, process: AudioObjectId) -> HardwareResult<Option<String>> {
        let bundle_id = unsafe {
            read_string_property(process, kAudioProcessPropertyBundleID, "Read process bundle ID")?
        };
        Ok(bundle_id.filter(|id| !id.is_empty()))
    }

    fn process_is_running(&self, process: AudioObjectId) -> HardwareResult<bool> {
        let running = unsafe {
            read_property::<u32>(process, kAudioProcessPropertyIsRunning, "Read process is running")?
        };
        Ok(running != 0)
    }

    fn default_output_device(&self) -> HardwareResult<AudioObjectId> {
        let device = unsafe {
            read_property::<AudioObjectId>(
                kAudioObjectSystemObject,
                kAudioHardwarePropertyDefaultSystemOutputDevice,
                "Read default system output device",
            )?
        };
        if device == UNKNOWN_AUDIO_OBJECT {
            return Err(HardwareError::MissingValue {
                operation: "Read default system output device",
            });
        }
        Ok(device)
    }

    fn device_uid(&self, device: AudioObjectId) -> HardwareResult<String> {
        unsafe { read_string_property(device, kAudioDevicePropertyDeviceUID, "Read device UID")? }
            .ok_or(HardwareError::MissingValue {
                operation: "Read device UID",
            })
    }

    fn create_process_tap(&self, description: &TapDescription) -> HardwareResult<AudioObjectId> {
        let tap_description = create_tap_description(description);
        let mut tap_id: AudioObjectId = UNKNOWN_AUDIO_OBJECT;

        let status = unsafe { AudioHardwareCreateProcessTap(Some(&tap_description), &mut tap_id) };
        check_status("Create process tap", status)?;

        debug!("Created process tap #{}", tap_id);
        Ok(tap_id)
    }

    fn destroy_process_tap(&self, tap: AudioObjectId) -> HardwareResult<()> {
        let status = unsafe { AudioHardwareDestroyProcessTap(tap) };
        check_status("Destroy process tap", status)
    }

    fn tap_stream_format(&self, tap: AudioObjectId) -> HardwareResult<StreamFormat> {
        unsafe { read_tap_format(tap) }
    }

    fn create_aggregate_device(
        &self,
        description: &AggregateDeviceDescription,
    ) -> HardwareResult<AudioObjectId> {
        let dictionary = create_aggregate_device_dictionary(description);
        let mut device_id: AudioObjectId = UNKNOWN_AUDIO_OBJECT;

        let status = unsafe {
            AudioHardwareCreateAggregateDevice(
                dictionary.as_concrete_TypeRef() as *const _,
                &mut device_id,
            )
        };
        check_status("Create aggregate device", status)?;

        if device_id == UNKNOWN_AUDIO_OBJECT {
            return Err(HardwareError::MissingValue {
                operation: "Create aggregate device",
            });
        }

        info!("Created aggregate device #{} ({})", device_id, description.name);
        Ok(device_id)
    }

    fn destroy_aggregate_device(&self, device: AudioObjectId) -> HardwareResult<()> {
        let status = unsafe { AudioHardwareDestroyAggregateDevice(device) };
        check_status("Destroy aggregate device", status)
    }

    fn create_io_proc(&self, device: AudioObjectId, callback: IoCallback) -> HardwareResult<IoProcId> {
        let context = Box::into_raw(Box::new(IoProcContext { callback }));
        let mut os_proc: AudioDeviceIOProcID = None;

        let status = unsafe {
            AudioDeviceCreateIOProcID(
                device,
                Some(io_proc_trampoline),
                context as *mut c_void,
                &mut os_proc,
            )
        };

        if status != 0 {
            unsafe {
                drop(Box::from_raw(context));
            }
            return Err(HardwareError::status("Create device IO proc", status));
        }

        let id = IoProcId(self.next_io_proc.fetch_add(1, Ordering::Relaxed));
        self.io_procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, IoProcRegistration { os_proc, context });

        debug!("Created IO proc {:?} on device #{}", id, device);
        Ok(id)
    }

    fn destroy_io_proc(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()> {
        let registration = self
            .io_procs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&io_proc)
            .ok_or(HardwareError::MissingValue {
                operation: "Destroy device IO proc",
            })?;

        let status = unsafe { AudioDeviceDestroyIOProcID(device, registration.os_proc) };

        // The HAL no longer calls the trampoline once the proc is destroyed;
        // if destruction failed the context is leaked rather than freed under it.
        if status == 0 {
            unsafe {
                drop(Box::from_raw(registration.context));
            }
        }

        check_status("Destroy device IO proc", status)
    }

    fn start_device(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()> {
        let os_proc = self.os_proc(io_proc)?;
        let status = unsafe { AudioDeviceStart(device, os_proc) };
        check_status("Start audio device", status)
    }

    fn stop_device(&self, device: AudioObjectId, io_proc: IoProcId) -> HardwareResult<()> {
        let os_proc = self.os_proc(io_proc)?;
        let status = unsafe { AudioDeviceStop(device, os_proc) };
        check_status("Stop aggregate device", status)
    }
}

fn timestamp(raw: *const AudioTimeStamp) -> AudioTimestamp {
    if raw.is_null() {
        return AudioTimestamp::default();
    }
    let raw = unsafe { &*raw };
    AudioTimestamp {
        sample_time: raw.mSampleTime,
        host_time: raw.mHostTime,
    }
}

/// Core Audio IOProc callback for the aggregate device
unsafe extern "C" fn io_proc_trampoline(
    _device: AudioObjectId,
    now: *const AudioTimeStamp,
    input_data: *const AudioBufferList,
    input_time: *const AudioTimeStamp,
    _output_data: *mut AudioBufferList,
    _output_time: *const AudioTimeStamp,
    client_data: *mut c_void,
) -> OSStatus {
    if client_data.is_null() {
        return 0;
    }
    let context = &mut *(client_data as *mut IoProcContext);

    let mut views = [AudioBufferView::EMPTY; MAX_IO_BUFFERS];
    let mut count = 0;
    if !input_data.is_null() {
        let list = &*input_data;
        count = (list.mNumberBuffers as usize).min(MAX_IO_BUFFERS);
        let first = list.mBuffers.as_ptr();
        for (index, view) in views.iter_mut().enumerate().take(count) {
            let buffer = &*first.add(index);
            *view = AudioBufferView {
                channels: buffer.mNumberChannels,
                data: if buffer.mData.is_null() || buffer.mDataByteSize == 0 {
                    &[]
                } else {
                    std::slice::from_raw_parts(buffer.mData as *const u8, buffer.mDataByteSize as usize)
                },
            };
        }
    }

    let cycle = IoCycle {
        now: timestamp(now),
        input_time: timestamp(input_time),
        input: &views[..count],
    };

    // Unwinding across the HAL boundary aborts the host
    let _ = catch_unwind(AssertUnwindSafe(|| (context.callback)(&cycle)));

    0
}
