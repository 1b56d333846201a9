//! Conversion between raw HAL payloads and [`PropertyValue`].
//!
//! The selector of the address decides the expected [`Shape`]. The declared
//! length reported by the provider is authoritative: decoding never looks
//! past it and never tolerates a payload of the wrong size.

use crate::address::{DeviceId, PropertyAddress, fourcc_str};
use crate::error::{HalError, HalResult};
use crate::selector::{self, Shape};
use byteorder::{ByteOrder, NativeEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;

/// Size of `AudioStreamBasicDescription`, including its reserved field.
pub const STREAM_FORMAT_SIZE: usize = 40;

const OBJECT_ID_SIZE: usize = mem::size_of::<u32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatFlags(pub u32);

impl FormatFlags {
    pub const IS_FLOAT: FormatFlags = FormatFlags(1 << 0);
    pub const IS_BIG_ENDIAN: FormatFlags = FormatFlags(1 << 1);
    pub const IS_SIGNED_INTEGER: FormatFlags = FormatFlags(1 << 2);
    pub const IS_PACKED: FormatFlags = FormatFlags(1 << 3);
    pub const IS_ALIGNED_HIGH: FormatFlags = FormatFlags(1 << 4);
    pub const IS_NON_INTERLEAVED: FormatFlags = FormatFlags(1 << 5);
    pub const IS_NON_MIXABLE: FormatFlags = FormatFlags(1 << 6);

    pub fn contains(self, other: FormatFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FormatFlags {
    type Output = FormatFlags;

    fn bitor(self, rhs: FormatFlags) -> FormatFlags {
        FormatFlags(self.0 | rhs.0)
    }
}

/// Stream format record, mirroring `AudioStreamBasicDescription`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub format_id: u32,
    pub format_flags: FormatFlags,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
}

impl StreamFormat {
    /// `kAudioFormatLinearPCM`.
    pub const LINEAR_PCM: u32 = crate::address::fourcc(b"lpcm");

    /// Packed interleaved 32-bit float PCM.
    pub fn float32_interleaved(sample_rate: f64, channels: u32) -> Self {
        let bytes_per_frame = channels * 4;
        Self {
            sample_rate,
            format_id: Self::LINEAR_PCM,
            format_flags: FormatFlags::IS_FLOAT | FormatFlags::IS_PACKED,
            bytes_per_packet: bytes_per_frame,
            frames_per_packet: 1,
            bytes_per_frame,
            channels_per_frame: channels,
            bits_per_channel: 32,
        }
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            sample_rate: NativeEndian::read_f64(&buf[0..8]),
            format_id: NativeEndian::read_u32(&buf[8..12]),
            format_flags: FormatFlags(NativeEndian::read_u32(&buf[12..16])),
            bytes_per_packet: NativeEndian::read_u32(&buf[16..20]),
            frames_per_packet: NativeEndian::read_u32(&buf[20..24]),
            bytes_per_frame: NativeEndian::read_u32(&buf[24..28]),
            channels_per_frame: NativeEndian::read_u32(&buf[28..32]),
            bits_per_channel: NativeEndian::read_u32(&buf[32..36]),
        }
    }

    fn write(&self) -> Vec<u8> {
        let mut buf = vec![0u8; STREAM_FORMAT_SIZE];
        NativeEndian::write_f64(&mut buf[0..8], self.sample_rate);
        NativeEndian::write_u32(&mut buf[8..12], self.format_id);
        NativeEndian::write_u32(&mut buf[12..16], self.format_flags.0);
        NativeEndian::write_u32(&mut buf[16..20], self.bytes_per_packet);
        NativeEndian::write_u32(&mut buf[20..24], self.frames_per_packet);
        NativeEndian::write_u32(&mut buf[24..28], self.bytes_per_frame);
        NativeEndian::write_u32(&mut buf[28..32], self.channels_per_frame);
        NativeEndian::write_u32(&mut buf[32..36], self.bits_per_channel);
        // mReserved stays zero.
        buf
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' {} Hz, {} ch, {} bit, flags {:#x}",
            fourcc_str(self.format_id),
            self.sample_rate,
            self.channels_per_frame,
            self.bits_per_channel,
            self.format_flags.0
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PropertyValue {
    Int32(i32),
    Float64(f64),
    CString(String),
    DeviceIdList(Vec<DeviceId>),
    StreamFormat(StreamFormat),
    RawBytes(Vec<u8>),
}

impl PropertyValue {
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Int32(_) => "Int32",
            PropertyValue::Float64(_) => "Float64",
            PropertyValue::CString(_) => "CString",
            PropertyValue::DeviceIdList(_) => "DeviceIdList",
            PropertyValue::StreamFormat(_) => "StreamFormat",
            PropertyValue::RawBytes(_) => "RawBytes",
        }
    }

    /// The integer reinterpreted as the HAL's `UInt32`.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropertyValue::Int32(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::CString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_device_id(&self) -> Option<DeviceId> {
        self.as_u32().map(DeviceId)
    }

    pub fn as_device_ids(&self) -> Option<&[DeviceId]> {
        match self {
            PropertyValue::DeviceIdList(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_stream_format(&self) -> Option<&StreamFormat> {
        match self {
            PropertyValue::StreamFormat(format) => Some(format),
            _ => None,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        PropertyValue::Int32(value as i32)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int32(v) => write!(f, "{v}"),
            PropertyValue::Float64(v) => write!(f, "{v}"),
            PropertyValue::CString(s) => write!(f, "{s:?}"),
            PropertyValue::DeviceIdList(ids) => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "[{}]", ids.join(", "))
            }
            PropertyValue::StreamFormat(format) => write!(f, "{format}"),
            PropertyValue::RawBytes(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

fn malformed(address: &PropertyAddress, reason: impl Into<String>) -> HalError {
    HalError::MalformedPayload {
        address: *address,
        reason: reason.into(),
    }
}

fn expect_len(address: &PropertyAddress, payload: &[u8], want: usize) -> HalResult<()> {
    if payload.len() != want {
        return Err(malformed(
            address,
            format!("expected {want} bytes, provider reported {}", payload.len()),
        ));
    }
    Ok(())
}

/// Decode the first `declared_len` bytes of `buffer` for `address`.
pub fn decode(
    address: &PropertyAddress,
    buffer: &[u8],
    declared_len: usize,
) -> HalResult<PropertyValue> {
    let payload = buffer.get(..declared_len).ok_or_else(|| {
        malformed(
            address,
            format!(
                "declared length {declared_len} exceeds the {} byte buffer",
                buffer.len()
            ),
        )
    })?;

    match selector::shape_of(address.selector) {
        Shape::U32 => {
            expect_len(address, payload, 4)?;
            Ok(PropertyValue::Int32(NativeEndian::read_i32(payload)))
        }
        Shape::F32 => {
            expect_len(address, payload, 4)?;
            Ok(PropertyValue::Float64(NativeEndian::read_f32(payload) as f64))
        }
        Shape::F64 => {
            expect_len(address, payload, 8)?;
            Ok(PropertyValue::Float64(NativeEndian::read_f64(payload)))
        }
        Shape::Text => {
            let end = payload
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| malformed(address, "no terminator within declared length"))?;
            // Zero padding after the terminator is allowed, anything else
            // would be lost on decode.
            let trailing = payload[end + 1..].iter().filter(|b| **b != 0).count();
            if trailing > 0 {
                return Err(malformed(
                    address,
                    format!("{trailing} bytes of data after the terminator"),
                ));
            }
            let text = std::str::from_utf8(&payload[..end])
                .map_err(|e| malformed(address, format!("invalid UTF-8: {e}")))?;
            Ok(PropertyValue::CString(text.to_owned()))
        }
        Shape::ObjectIds => {
            if payload.len() % OBJECT_ID_SIZE != 0 {
                return Err(malformed(
                    address,
                    format!(
                        "{} bytes is not a whole number of object IDs",
                        payload.len()
                    ),
                ));
            }
            let ids = payload
                .chunks_exact(OBJECT_ID_SIZE)
                .map(|chunk| DeviceId(NativeEndian::read_u32(chunk)))
                .collect();
            Ok(PropertyValue::DeviceIdList(ids))
        }
        Shape::StreamFormat => {
            expect_len(address, payload, STREAM_FORMAT_SIZE)?;
            Ok(PropertyValue::StreamFormat(StreamFormat::read(payload)))
        }
        Shape::Raw => Ok(PropertyValue::RawBytes(payload.to_vec())),
    }
}

/// Encode `value` in the layout `address` expects.
pub fn encode(address: &PropertyAddress, value: &PropertyValue) -> HalResult<Vec<u8>> {
    let shape = selector::shape_of(address.selector);
    let bytes = match (shape, value) {
        (Shape::U32, PropertyValue::Int32(v)) => {
            let mut buf = vec![0u8; 4];
            NativeEndian::write_i32(&mut buf, *v);
            buf
        }
        (Shape::F32, PropertyValue::Float64(v)) => {
            let mut buf = vec![0u8; 4];
            NativeEndian::write_f32(&mut buf, *v as f32);
            buf
        }
        (Shape::F64, PropertyValue::Float64(v)) => {
            let mut buf = vec![0u8; 8];
            NativeEndian::write_f64(&mut buf, *v);
            buf
        }
        (Shape::Text, PropertyValue::CString(s)) => {
            if s.as_bytes().contains(&0) {
                return Err(malformed(address, "string contains an interior NUL"));
            }
            let mut buf = Vec::with_capacity(s.len() + 1);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
            buf
        }
        (Shape::ObjectIds, PropertyValue::DeviceIdList(ids)) => {
            let mut buf = vec![0u8; ids.len() * OBJECT_ID_SIZE];
            for (chunk, id) in buf.chunks_exact_mut(OBJECT_ID_SIZE).zip(ids) {
                NativeEndian::write_u32(chunk, id.0);
            }
            buf
        }
        (Shape::StreamFormat, PropertyValue::StreamFormat(format)) => format.write(),
        (Shape::Raw, PropertyValue::RawBytes(bytes)) => bytes.clone(),
        (shape, value) => {
            return Err(HalError::TypeMismatch {
                address: *address,
                expected: shape.name(),
                found: value.kind(),
            });
        }
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Scope, fourcc};
    use crate::selector::{
        DEVICES_ADDRESS, NAME_ADDRESS, OUTPUT_MUTE_ADDRESS, OUTPUT_VOLUME_ADDRESS,
        SAMPLE_RATE_ADDRESS,
    };

    fn stream_format_address() -> PropertyAddress {
        PropertyAddress::new(selector::STREAM_FORMAT, Scope::Output)
    }

    #[test]
    fn stream_format_round_trip() {
        let format = StreamFormat::float32_interleaved(48_000.0, 2);
        let address = stream_format_address();
        let bytes = encode(&address, &PropertyValue::StreamFormat(format)).unwrap();
        assert_eq!(bytes.len(), STREAM_FORMAT_SIZE);
        let decoded = decode(&address, &bytes, STREAM_FORMAT_SIZE).unwrap();
        assert_eq!(decoded, PropertyValue::StreamFormat(format));
    }

    #[test]
    fn stream_format_requires_exact_size() {
        let address = stream_format_address();
        let bytes = vec![0u8; STREAM_FORMAT_SIZE + 4];
        let err = decode(&address, &bytes, STREAM_FORMAT_SIZE + 4).unwrap_err();
        assert!(matches!(err, HalError::MalformedPayload { .. }));
        let err = decode(&address, &bytes, STREAM_FORMAT_SIZE - 4).unwrap_err();
        assert!(matches!(err, HalError::MalformedPayload { .. }));
    }

    #[test]
    fn unterminated_string_is_malformed() {
        // Terminator sits just past the declared length.
        let buffer = b"Speakers\0";
        let err = decode(&NAME_ADDRESS, buffer, 8).unwrap_err();
        assert!(matches!(err, HalError::MalformedPayload { .. }));

        let ok = decode(&NAME_ADDRESS, buffer, 9).unwrap();
        assert_eq!(ok, PropertyValue::CString("Speakers".into()));
    }

    #[test]
    fn data_after_terminator_is_malformed() {
        let err = decode(&NAME_ADDRESS, b"USB\0junk", 8).unwrap_err();
        assert!(matches!(err, HalError::MalformedPayload { .. }));

        let padded = decode(&NAME_ADDRESS, b"USB\0\0\0\0\0", 8).unwrap();
        assert_eq!(padded.as_str(), Some("USB"));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let err = decode(&NAME_ADDRESS, &[0xff, 0xfe, 0], 3).unwrap_err();
        assert!(matches!(err, HalError::MalformedPayload { .. }));
    }

    #[test]
    fn declared_length_beyond_buffer_is_malformed() {
        let err = decode(&DEVICES_ADDRESS, &[0u8; 4], 8).unwrap_err();
        assert!(matches!(err, HalError::MalformedPayload { .. }));
    }

    #[test]
    fn device_list_uses_declared_length() {
        let mut bytes = vec![0u8; 12];
        NativeEndian::write_u32(&mut bytes[0..4], 73);
        NativeEndian::write_u32(&mut bytes[4..8], 81);
        NativeEndian::write_u32(&mut bytes[8..12], 99);
        let decoded = decode(&DEVICES_ADDRESS, &bytes, 8).unwrap();
        assert_eq!(
            decoded,
            PropertyValue::DeviceIdList(vec![DeviceId(73), DeviceId(81)])
        );

        let empty = decode(&DEVICES_ADDRESS, &[], 0).unwrap();
        assert_eq!(empty, PropertyValue::DeviceIdList(Vec::new()));

        let err = decode(&DEVICES_ADDRESS, &bytes, 6).unwrap_err();
        assert!(matches!(err, HalError::MalformedPayload { .. }));
    }

    #[test]
    fn volume_is_float32_on_the_wire() {
        let bytes = encode(&OUTPUT_VOLUME_ADDRESS, &PropertyValue::Float64(0.5)).unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(
            decode(&OUTPUT_VOLUME_ADDRESS, &bytes, 4).unwrap(),
            PropertyValue::Float64(0.5)
        );
        let err = decode(&OUTPUT_VOLUME_ADDRESS, &[0u8; 8], 8).unwrap_err();
        assert!(matches!(err, HalError::MalformedPayload { .. }));
    }

    #[test]
    fn sample_rate_is_float64() {
        let bytes = encode(&SAMPLE_RATE_ADDRESS, &PropertyValue::Float64(44_100.0)).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn encode_rejects_wrong_tag() {
        let err = encode(&OUTPUT_VOLUME_ADDRESS, &PropertyValue::Int32(1)).unwrap_err();
        match err {
            HalError::TypeMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, "Float64");
                assert_eq!(found, "Int32");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(encode(&OUTPUT_MUTE_ADDRESS, &PropertyValue::CString("on".into())).is_err());
    }

    #[test]
    fn unknown_selector_is_raw() {
        let address = PropertyAddress::new(fourcc(b"zzzz"), Scope::Global);
        assert_eq!(
            decode(&address, &[1, 2, 3], 3).unwrap(),
            PropertyValue::RawBytes(vec![1, 2, 3])
        );
        assert_eq!(
            decode(&address, &[], 0).unwrap(),
            PropertyValue::RawBytes(Vec::new())
        );
    }
}
