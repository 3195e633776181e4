// FFI helpers for the macOS Core Audio process tap API (14.4+)
//
// Property selectors that coreaudio-sys does not ship yet, typed property
// readers, and conversions from the crate's tap/aggregate descriptions into
// `CATapDescription` and CoreFoundation dictionaries.

#![allow(non_upper_case_globals)]

use std::mem;
use std::os::raw::c_void;
use std::ptr;

use core_foundation::array::CFArray;
use core_foundation::base::{CFType, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::string::{CFString, CFStringRef};
use coreaudio_sys::{
    AudioObjectGetPropertyData, AudioObjectGetPropertyDataSize, AudioObjectPropertyAddress,
    AudioStreamBasicDescription, UInt32,
};
use objc2::rc::Retained;
use objc2::AnyThread;
use objc2_core_audio::{CATapDescription, CATapMuteBehavior};
use objc2_foundation::{NSArray, NSNumber, NSUUID};

use super::hardware::{
    check_status, AggregateDeviceDescription, HardwareError, HardwareResult, TapDescription,
    TapMuteBehavior,
};
use super::types::{AudioObjectId, StreamFormat};

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

pub const kAudioObjectSystemObject: AudioObjectId = 1;
pub const kAudioObjectPropertyScopeGlobal: u32 = fourcc(b"glob");
pub const kAudioObjectPropertyElementMain: u32 = 0;

pub const kAudioHardwarePropertyProcessObjectList: u32 = fourcc(b"prs#");
pub const kAudioHardwarePropertyDefaultSystemOutputDevice: u32 = fourcc(b"sOut");
pub const kAudioProcessPropertyPID: u32 = fourcc(b"ppid");
pub const kAudioProcessPropertyBundleID: u32 = fourcc(b"pbid");
pub const kAudioProcessPropertyIsRunning: u32 = fourcc(b"pir?");
pub const kAudioDevicePropertyDeviceUID: u32 = fourcc(b"uid ");
pub const kAudioTapPropertyFormat: u32 = fourcc(b"tfmt");

// Aggregate device dictionary keys (AudioHardware.h)
pub const kAudioAggregateDeviceNameKey: &str = "name";
pub const kAudioAggregateDeviceUIDKey: &str = "uid";
pub const kAudioAggregateDeviceMainSubDeviceKey: &str = "master";
pub const kAudioAggregateDeviceIsPrivateKey: &str = "private";
pub const kAudioAggregateDeviceIsStackedKey: &str = "stacked";
pub const kAudioAggregateDeviceTapAutoStartKey: &str = "tapautostart";
pub const kAudioAggregateDeviceSubDeviceListKey: &str = "subdevices";
pub const kAudioAggregateDeviceTapListKey: &str = "taps";
pub const kAudioSubDeviceUIDKey: &str = "uid";
pub const kAudioSubTapUIDKey: &str = "uid";
pub const kAudioSubTapDriftCompensationKey: &str = "drift";

fn global_address(selector: u32) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMain,
    }
}

/// Read a fixed-size property value
pub unsafe fn read_property<T: Copy + Default>(
    object: AudioObjectId,
    selector: u32,
    operation: &'static str,
) -> HardwareResult<T> {
    let address = global_address(selector);
    let mut value = T::default();
    let mut data_size = mem::size_of::<T>() as UInt32;

    let status = AudioObjectGetPropertyData(
        object,
        &address,
        0,
        ptr::null(),
        &mut data_size,
        &mut value as *mut T as *mut c_void,
    );
    check_status(operation, status)?;

    Ok(value)
}

/// Read a variable-length array property
pub unsafe fn read_property_array<T: Copy + Default>(
    object: AudioObjectId,
    selector: u32,
    operation: &'static str,
) -> HardwareResult<Vec<T>> {
    let address = global_address(selector);
    let mut data_size: UInt32 = 0;

    let status = AudioObjectGetPropertyDataSize(object, &address, 0, ptr::null(), &mut data_size);
    check_status(operation, status)?;

    let count = data_size as usize / mem::size_of::<T>();
    let mut values = vec![T::default(); count];
    if count == 0 {
        return Ok(values);
    }

    let status = AudioObjectGetPropertyData(
        object,
        &address,
        0,
        ptr::null(),
        &mut data_size,
        values.as_mut_ptr() as *mut c_void,
    );
    check_status(operation, status)?;

    values.truncate(data_size as usize / mem::size_of::<T>());
    Ok(values)
}

/// Read a CFString property. The HAL hands out a retained reference.
pub unsafe fn read_string_property(
    object: AudioObjectId,
    selector: u32,
    operation: &'static str,
) -> HardwareResult<Option<String>> {
    let address = global_address(selector);
    let mut string_ref: CFStringRef = ptr::null();
    let mut data_size = mem::size_of::<CFStringRef>() as UInt32;

    let status = AudioObjectGetPropertyData(
        object,
        &address,
        0,
        ptr::null(),
        &mut data_size,
        &mut string_ref as *mut CFStringRef as *mut c_void,
    );
    check_status(operation, status)?;

    if string_ref.is_null() {
        return Ok(None);
    }

    Ok(Some(CFString::wrap_under_create_rule(string_ref).to_string()))
}

pub unsafe fn read_tap_format(tap: AudioObjectId) -> HardwareResult<StreamFormat> {
    let address = global_address(kAudioTapPropertyFormat);
    let mut description: AudioStreamBasicDescription = mem::zeroed();
    let mut data_size = mem::size_of::<AudioStreamBasicDescription>() as UInt32;

    let status = AudioObjectGetPropertyData(
        tap,
        &address,
        0,
        ptr::null(),
        &mut data_size,
        &mut description as *mut AudioStreamBasicDescription as *mut c_void,
    );
    check_status("Read tap stream format", status)?;

    if description.mSampleRate <= 0.0 || description.mChannelsPerFrame == 0 {
        return Err(HardwareError::MissingValue {
            operation: "Read tap stream format",
        });
    }

    Ok(StreamFormat {
        sample_rate: description.mSampleRate,
        format_id: description.mFormatID,
        format_flags: description.mFormatFlags,
        bytes_per_packet: description.mBytesPerPacket,
        frames_per_packet: description.mFramesPerPacket,
        bytes_per_frame: description.mBytesPerFrame,
        channels_per_frame: description.mChannelsPerFrame,
        bits_per_channel: description.mBitsPerChannel,
    })
}

/// Build a `CATapDescription` requesting a stereo mixdown of the given process objects
pub fn create_tap_description(description: &TapDescription) -> Retained<CATapDescription> {
    let numbers: Vec<Retained<NSNumber>> = description
        .processes
        .iter()
        .map(|object| NSNumber::new_u32(*object))
        .collect();
    let refs: Vec<&NSNumber> = numbers.iter().map(|number| &**number).collect();
    let process_array = NSArray::from_slice(&refs);

    unsafe {
        let tap = CATapDescription::initStereoMixdownOfProcesses(
            CATapDescription::alloc(),
            &process_array,
        );
        let uuid = NSUUID::from_bytes(description.uuid.into_bytes());
        tap.setUUID(&uuid);
        tap.setMuteBehavior(match description.mute_behavior {
            TapMuteBehavior::Unmuted => CATapMuteBehavior::Unmuted,
            TapMuteBehavior::MutedWhenTapped => CATapMuteBehavior::MutedWhenTapped,
        });
        tap
    }
}

/// Create CoreFoundation dictionary for aggregate device configuration
pub fn create_aggregate_device_dictionary(
    description: &AggregateDeviceDescription,
) -> CFDictionary<CFString, CFType> {
    let sub_devices: Vec<CFDictionary<CFString, CFType>> = description
        .sub_devices
        .iter()
        .map(|uid| {
            CFDictionary::from_CFType_pairs(&[(
                CFString::new(kAudioSubDeviceUIDKey),
                CFString::new(uid).as_CFType(),
            )])
        })
        .collect();

    let taps: Vec<CFDictionary<CFString, CFType>> = description
        .taps
        .iter()
        .map(|tap| {
            CFDictionary::from_CFType_pairs(&[
                (
                    CFString::new(kAudioSubTapDriftCompensationKey),
                    CFBoolean::from(tap.drift_compensation).as_CFType(),
                ),
                (CFString::new(kAudioSubTapUIDKey), CFString::new(&tap.uid).as_CFType()),
            ])
        })
        .collect();

    let pairs = [
        (
            CFString::new(kAudioAggregateDeviceNameKey),
            CFString::new(&description.name).as_CFType(),
        ),
        (
            CFString::new(kAudioAggregateDeviceUIDKey),
            CFString::new(&description.uid).as_CFType(),
        ),
        (
            CFString::new(kAudioAggregateDeviceMainSubDeviceKey),
            CFString::new(&description.main_sub_device).as_CFType(),
        ),
        (
            CFString::new(kAudioAggregateDeviceIsPrivateKey),
            CFBoolean::from(description.is_private).as_CFType(),
        ),
        (
            CFString::new(kAudioAggregateDeviceIsStackedKey),
            CFBoolean::from(description.is_stacked).as_CFType(),
        ),
        (
            CFString::new(kAudioAggregateDeviceTapAutoStartKey),
            CFBoolean::from(description.tap_auto_start).as_CFType(),
        ),
        (
            CFString::new(kAudioAggregateDeviceSubDeviceListKey),
            CFArray::from_CFTypes(&sub_devices).as_CFType(),
        ),
        (
            CFString::new(kAudioAggregateDeviceTapListKey),
            CFArray::from_CFTypes(&taps).as_CFType(),
        ),
    ];

    CFDictionary::from_CFType_pairs(&pairs)
}
