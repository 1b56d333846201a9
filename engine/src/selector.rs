//! Well-known HAL selectors and the payload shape each one carries.
//!
//! Codes follow the current CoreAudio headers (`AudioHardware.h`,
//! `AudioHardwareBase.h`). Selectors missing from this table are still
//! addressable; their payloads decode as raw bytes.

use crate::address::{PropertyAddress, Scope, fourcc};

pub const DEVICES: u32 = fourcc(b"dev#");
pub const DEFAULT_INPUT_DEVICE: u32 = fourcc(b"dIn ");
pub const DEFAULT_OUTPUT_DEVICE: u32 = fourcc(b"dOut");
pub const DEFAULT_SYSTEM_OUTPUT_DEVICE: u32 = fourcc(b"sOut");
pub const NAME: u32 = fourcc(b"lnam");
pub const MANUFACTURER: u32 = fourcc(b"lmak");
pub const DEVICE_UID: u32 = fourcc(b"uid ");
pub const STREAMS: u32 = fourcc(b"stm#");
pub const NOMINAL_SAMPLE_RATE: u32 = fourcc(b"nsrt");
pub const VOLUME_SCALAR: u32 = fourcc(b"volm");
pub const MUTE: u32 = fourcc(b"mute");
pub const STREAM_FORMAT: u32 = fourcc(b"sfmt");
pub const BUFFER_FRAME_SIZE: u32 = fourcc(b"fsiz");
pub const DEVICE_IS_ALIVE: u32 = fourcc(b"livn");
pub const LATENCY: u32 = fourcc(b"ltnc");
pub const SAFETY_OFFSET: u32 = fourcc(b"saft");
pub const DATA_SOURCE: u32 = fourcc(b"ssrc");
pub const TRANSPORT_TYPE: u32 = fourcc(b"tran");

/// Native layout of a property payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// `UInt32`/`SInt32`, surfaced as `PropertyValue::Int32`.
    U32,
    /// `Float32`, surfaced as `PropertyValue::Float64`.
    F32,
    /// `Float64`.
    F64,
    /// NUL-terminated UTF-8. CFString on the HAL side.
    Text,
    /// Array of `AudioObjectID`.
    ObjectIds,
    /// `AudioStreamBasicDescription`.
    StreamFormat,
    Raw,
}

impl Shape {
    /// Byte size for fixed-layout shapes.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Shape::U32 | Shape::F32 => Some(4),
            Shape::F64 => Some(8),
            Shape::StreamFormat => Some(crate::codec::STREAM_FORMAT_SIZE),
            Shape::Text | Shape::ObjectIds | Shape::Raw => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Shape::U32 => "Int32",
            Shape::F32 | Shape::F64 => "Float64",
            Shape::Text => "CString",
            Shape::ObjectIds => "DeviceIdList",
            Shape::StreamFormat => "StreamFormat",
            Shape::Raw => "RawBytes",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectorInfo {
    pub code: u32,
    pub name: &'static str,
    pub shape: Shape,
    pub default_scope: Scope,
}

pub const TABLE: &[SelectorInfo] = &[
    entry(DEVICES, "devices", Shape::ObjectIds, Scope::Global),
    entry(DEFAULT_INPUT_DEVICE, "default-input", Shape::U32, Scope::Global),
    entry(DEFAULT_OUTPUT_DEVICE, "default-output", Shape::U32, Scope::Global),
    entry(
        DEFAULT_SYSTEM_OUTPUT_DEVICE,
        "default-system-output",
        Shape::U32,
        Scope::Global,
    ),
    entry(NAME, "name", Shape::Text, Scope::Global),
    entry(MANUFACTURER, "manufacturer", Shape::Text, Scope::Global),
    entry(DEVICE_UID, "uid", Shape::Text, Scope::Global),
    entry(STREAMS, "streams", Shape::ObjectIds, Scope::Output),
    entry(NOMINAL_SAMPLE_RATE, "sample-rate", Shape::F64, Scope::Global),
    entry(VOLUME_SCALAR, "volume", Shape::F32, Scope::Output),
    entry(MUTE, "mute", Shape::U32, Scope::Output),
    entry(STREAM_FORMAT, "stream-format", Shape::StreamFormat, Scope::Output),
    entry(BUFFER_FRAME_SIZE, "buffer-frame-size", Shape::U32, Scope::Global),
    entry(DEVICE_IS_ALIVE, "alive", Shape::U32, Scope::Global),
    entry(LATENCY, "latency", Shape::U32, Scope::Output),
    entry(SAFETY_OFFSET, "safety-offset", Shape::U32, Scope::Output),
    entry(DATA_SOURCE, "data-source", Shape::U32, Scope::Output),
    entry(TRANSPORT_TYPE, "transport-type", Shape::U32, Scope::Global),
];

const fn entry(code: u32, name: &'static str, shape: Shape, default_scope: Scope) -> SelectorInfo {
    SelectorInfo {
        code,
        name,
        shape,
        default_scope,
    }
}

pub fn lookup(code: u32) -> Option<&'static SelectorInfo> {
    TABLE.iter().find(|info| info.code == code)
}

pub fn shape_of(code: u32) -> Shape {
    lookup(code).map(|info| info.shape).unwrap_or(Shape::Raw)
}

/// Resolve a selector from a table name, a four-char code or a number.
pub fn parse(text: &str) -> Option<u32> {
    if let Some(info) = TABLE.iter().find(|info| info.name.eq_ignore_ascii_case(text)) {
        return Some(info.code);
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Ok(code) = text.parse() {
        return Some(code);
    }
    <&[u8; 4]>::try_from(text.as_bytes()).ok().map(fourcc)
}

pub fn name_of(code: u32) -> Option<&'static str> {
    lookup(code).map(|info| info.name)
}

pub const DEVICES_ADDRESS: PropertyAddress = PropertyAddress::new(DEVICES, Scope::Global);
pub const DEFAULT_INPUT_ADDRESS: PropertyAddress =
    PropertyAddress::new(DEFAULT_INPUT_DEVICE, Scope::Global);
pub const DEFAULT_OUTPUT_ADDRESS: PropertyAddress =
    PropertyAddress::new(DEFAULT_OUTPUT_DEVICE, Scope::Global);
pub const NAME_ADDRESS: PropertyAddress = PropertyAddress::new(NAME, Scope::Global);
pub const MANUFACTURER_ADDRESS: PropertyAddress =
    PropertyAddress::new(MANUFACTURER, Scope::Global);
pub const UID_ADDRESS: PropertyAddress = PropertyAddress::new(DEVICE_UID, Scope::Global);
pub const OUTPUT_VOLUME_ADDRESS: PropertyAddress =
    PropertyAddress::new(VOLUME_SCALAR, Scope::Output);
pub const OUTPUT_MUTE_ADDRESS: PropertyAddress = PropertyAddress::new(MUTE, Scope::Output);
pub const SAMPLE_RATE_ADDRESS: PropertyAddress =
    PropertyAddress::new(NOMINAL_SAMPLE_RATE, Scope::Global);

/// Addresses probed for settability when a device is described.
pub const PROBE_ADDRESSES: &[PropertyAddress] = &[
    PropertyAddress::new(DEFAULT_INPUT_DEVICE, Scope::Global),
    PropertyAddress::new(DEFAULT_OUTPUT_DEVICE, Scope::Global),
    PropertyAddress::new(DEFAULT_SYSTEM_OUTPUT_DEVICE, Scope::Global),
    PropertyAddress::new(NAME, Scope::Global),
    PropertyAddress::new(NOMINAL_SAMPLE_RATE, Scope::Global),
    PropertyAddress::new(BUFFER_FRAME_SIZE, Scope::Global),
    PropertyAddress::new(VOLUME_SCALAR, Scope::Output),
    PropertyAddress::new(VOLUME_SCALAR, Scope::Input),
    PropertyAddress::new(MUTE, Scope::Output),
    PropertyAddress::new(MUTE, Scope::Input),
    PropertyAddress::new(STREAM_FORMAT, Scope::Output),
    PropertyAddress::new(STREAM_FORMAT, Scope::Input),
    PropertyAddress::new(DATA_SOURCE, Scope::Output),
    PropertyAddress::new(DATA_SOURCE, Scope::Input),
];
