use crate::address::{DeviceId, PropertyAddress, fourcc, fourcc_str};
use thiserror::Error;

pub type HalResult<T, E = HalError> = Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HalError {
    #[error("property {address} is not supported by device {device}")]
    UnsupportedProperty {
        device: DeviceId,
        address: PropertyAddress,
    },
    #[error("property {address} is read-only on device {device}")]
    PropertyNotSettable {
        device: DeviceId,
        address: PropertyAddress,
    },
    #[error("malformed payload for {address}: {reason}")]
    MalformedPayload {
        address: PropertyAddress,
        reason: String,
    },
    #[error("{address} expects {expected}, got {found}")]
    TypeMismatch {
        address: PropertyAddress,
        expected: &'static str,
        found: &'static str,
    },
    #[error("short read of {address}: provider promised {expected} bytes, wrote {actual}")]
    ShortRead {
        address: PropertyAddress,
        expected: usize,
        actual: usize,
    },
    #[error("{operation} rejected by the HAL: {}", os_status(*.status))]
    RejectedBySystem { operation: &'static str, status: i32 },
    #[error("unknown audio device {0}")]
    UnknownDevice(DeviceId),
    #[error("no subscription {0}")]
    UnknownSubscription(u64),
    #[error("notification bridge is shut down")]
    BridgeClosed,
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: i64 },
    #[error("audio HAL unavailable: {0}")]
    Unavailable(String),
}

impl HalError {
    /// Native status carried by a provider refusal.
    pub fn status(&self) -> Option<i32> {
        match self {
            HalError::RejectedBySystem { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub const NO_ERROR: i32 = 0;
pub const NOT_RUNNING: i32 = fourcc(b"stop") as i32;
pub const UNSPECIFIED: i32 = fourcc(b"what") as i32;
pub const UNKNOWN_PROPERTY: i32 = fourcc(b"who?") as i32;
pub const BAD_PROPERTY_SIZE: i32 = fourcc(b"!siz") as i32;
pub const ILLEGAL_OPERATION: i32 = fourcc(b"nope") as i32;
pub const BAD_OBJECT: i32 = fourcc(b"!obj") as i32;
pub const BAD_DEVICE: i32 = fourcc(b"!dev") as i32;
pub const BAD_STREAM: i32 = fourcc(b"!str") as i32;
pub const UNSUPPORTED_OPERATION: i32 = fourcc(b"unop") as i32;
pub const UNSUPPORTED_FORMAT: i32 = fourcc(b"!dat") as i32;
pub const PERMISSIONS: i32 = fourcc(b"!hog") as i32;

/// Format a HAL `OSStatus` with its symbolic name when known.
pub fn os_status(code: i32) -> String {
    let name = match code {
        NO_ERROR => "kAudioHardwareNoError",
        NOT_RUNNING => "kAudioHardwareNotRunningError",
        UNSPECIFIED => "kAudioHardwareUnspecifiedError",
        UNKNOWN_PROPERTY => "kAudioHardwareUnknownPropertyError",
        BAD_PROPERTY_SIZE => "kAudioHardwareBadPropertySizeError",
        ILLEGAL_OPERATION => "kAudioHardwareIllegalOperationError",
        BAD_OBJECT => "kAudioHardwareBadObjectError",
        BAD_DEVICE => "kAudioHardwareBadDeviceError",
        BAD_STREAM => "kAudioHardwareBadStreamError",
        UNSUPPORTED_OPERATION => "kAudioHardwareUnsupportedOperationError",
        UNSUPPORTED_FORMAT => "kAudioDeviceUnsupportedFormatError",
        PERMISSIONS => "kAudioDevicePermissionsError",
        other => return format!("OSStatus {other} ('{}')", fourcc_str(other as u32)),
    };
    format!("{name} ('{}')", fourcc_str(code as u32))
}
