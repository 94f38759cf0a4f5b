//! Raw BraveJIG wire layouts.
//!
//! Every frame starts with the protocol version and a type byte. The meaning of
//! the type byte depends on who sent the frame: `0x00` from the host is a
//! downlink request, `0x00` from the router is an uplink notification. All
//! multi-byte integers are little-endian.
//!
//! The structs in this module map one-to-one onto the fixed parts of each frame
//! and are read and written with `zerocopy`. [`expected_frame_len`] is the
//! length oracle used by the stream framer.

use crate::constants::{
    DATA_LENGTH_OFFSET, DFU_REQUEST_SIZE, DFU_RESPONSE_SIZE, DOWNLINK_REQUEST_HEADER_SIZE, DOWNLINK_RESPONSE_SIZE,
    ERROR_NOTIFICATION_SIZE, JIG_INFO_REQUEST_SIZE, JIG_INFO_RESPONSE_HEADER_SIZE, MAX_PAYLOAD_SIZE, PACKET_TYPE_OFFSET,
    PROTOCOL_VERSION, UPLINK_HEADER_SIZE,
};
use crate::error::BjigError;
use crate::router;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Which side of the serial link produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToRouter,
    RouterToHost,
}

/// Type byte of frames sent by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RequestType {
    Downlink = 0x00,
    JigInfo = 0x01,
    Dfu = 0x03,
}

/// Type byte of frames sent by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseType {
    Uplink = 0x00,
    DownlinkResponse = 0x01,
    JigInfo = 0x02,
    Dfu = 0x03,
    ErrorNotification = 0xFF,
}

/// Fixed part of a downlink request (21 bytes), followed by `data_length` payload bytes
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DownlinkRequestHeader {
    pub protocol_version: u8,
    pub packet_type: u8,
    pub data_length: U16,
    pub unix_time: U32,
    pub device_id: U64,
    pub sensor_id: U16,
    pub cmd: u8,
    pub order: U16,
}

/// Downlink response (20 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DownlinkResponseRaw {
    pub protocol_version: u8,
    pub packet_type: u8,
    pub unix_time: U32,
    pub device_id: U64,
    pub sensor_id: U16,
    pub order: U16,
    pub cmd: u8,
    pub result: u8,
}

/// Fixed part of an uplink notification (21 bytes), followed by the sensor payload
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct UplinkHeader {
    pub protocol_version: u8,
    pub packet_type: u8,
    /// Sensor payload length only; the RSSI and reserved bytes are not counted
    pub data_length: U16,
    pub unix_time: U32,
    pub device_id: U64,
    pub sensor_id: U16,
    pub rssi: i8,
    pub reserved: U16,
}

/// JIG info request (11 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct JigInfoRequestRaw {
    pub protocol_version: u8,
    pub packet_type: u8,
    pub cmd: u8,
    /// Router local time, JST
    pub local_time: U32,
    pub unix_time: U32,
}

/// Fixed part of a JIG info response (15 bytes). The payload has no length field.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct JigInfoResponseHeader {
    pub protocol_version: u8,
    pub packet_type: u8,
    pub unix_time: U32,
    pub cmd: u8,
    pub router_device_id: U64,
}

/// Router firmware update request (10 bytes). The image follows as raw chunks once accepted.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DfuRequestRaw {
    pub protocol_version: u8,
    pub packet_type: u8,
    pub unix_time: U32,
    pub total_length: U32,
}

/// Router firmware update response (7 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DfuResponseRaw {
    pub protocol_version: u8,
    pub packet_type: u8,
    pub unix_time: U32,
    pub result: u8,
}

/// Router error notification (7 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ErrorNotificationRaw {
    pub protocol_version: u8,
    pub packet_type: u8,
    pub unix_time: U32,
    pub reason: u8,
}

/// Total length of the frame at the start of `buf`.
///
/// Returns `Ok(None)` while too few bytes are buffered to know the length, and
/// `Ok(Some(n))` once it is known, even if fewer than `n` bytes are present.
/// Fails when the first bytes cannot start a frame: wrong protocol version, a
/// type byte that is not valid for `direction`, or a declared payload longer
/// than [`MAX_PAYLOAD_SIZE`].
pub fn expected_frame_len(buf: &[u8], direction: Direction) -> Result<Option<usize>, BjigError> {
    let Some(&version) = buf.first() else {
        return Ok(None);
    };
    if version != PROTOCOL_VERSION {
        return Err(BjigError::MalformedPacket(format!(
            "unexpected protocol version 0x{version:02X}"
        )));
    }
    let Some(&type_byte) = buf.get(PACKET_TYPE_OFFSET) else {
        return Ok(None);
    };

    let len = match direction {
        Direction::HostToRouter => match RequestType::try_from(type_byte) {
            Ok(RequestType::Downlink) => length_prefixed(buf, DOWNLINK_REQUEST_HEADER_SIZE)?,
            Ok(RequestType::JigInfo) => Some(JIG_INFO_REQUEST_SIZE),
            Ok(RequestType::Dfu) => Some(DFU_REQUEST_SIZE),
            Err(_) => return Err(unknown_type(type_byte, direction)),
        },
        Direction::RouterToHost => match ResponseType::try_from(type_byte) {
            Ok(ResponseType::Uplink) => length_prefixed(buf, UPLINK_HEADER_SIZE)?,
            Ok(ResponseType::DownlinkResponse) => Some(DOWNLINK_RESPONSE_SIZE),
            Ok(ResponseType::JigInfo) => jig_info_response_len(buf),
            Ok(ResponseType::Dfu) => Some(DFU_RESPONSE_SIZE),
            Ok(ResponseType::ErrorNotification) => Some(ERROR_NOTIFICATION_SIZE),
            Err(_) => return Err(unknown_type(type_byte, direction)),
        },
    };
    Ok(len)
}

/// True if `buf` could be the start of a frame in `direction`.
pub fn is_plausible_frame_start(buf: &[u8], direction: Direction) -> bool {
    match (buf.first(), buf.get(PACKET_TYPE_OFFSET)) {
        (Some(&PROTOCOL_VERSION), Some(&type_byte)) => match direction {
            Direction::HostToRouter => RequestType::try_from(type_byte).is_ok(),
            Direction::RouterToHost => ResponseType::try_from(type_byte).is_ok(),
        },
        (Some(&PROTOCOL_VERSION), None) => true,
        _ => false,
    }
}

fn length_prefixed(buf: &[u8], header_size: usize) -> Result<Option<usize>, BjigError> {
    let Some(field) = buf.get(DATA_LENGTH_OFFSET..DATA_LENGTH_OFFSET + 2) else {
        return Ok(None);
    };
    let data_length = u16::from_le_bytes([field[0], field[1]]) as usize;
    if data_length > MAX_PAYLOAD_SIZE {
        return Err(BjigError::MalformedPacket(format!(
            "declared data length {data_length} exceeds the {MAX_PAYLOAD_SIZE}-byte maximum"
        )));
    }
    Ok(Some(header_size + data_length))
}

fn jig_info_response_len(buf: &[u8]) -> Option<usize> {
    let header: &JigInfoResponseHeader = match JigInfoResponseHeader::ref_from_prefix(buf) {
        Ok((header, _)) => header,
        Err(_) => return None,
    };
    let payload = router::response_payload_len(header.cmd, &buf[JIG_INFO_RESPONSE_HEADER_SIZE..])?;
    Some(JIG_INFO_RESPONSE_HEADER_SIZE + payload)
}

pub(crate) fn unknown_type(type_byte: u8, direction: Direction) -> BjigError {
    BjigError::MalformedPacket(format!("unknown packet type 0x{type_byte:02X} for {direction:?}"))
}
