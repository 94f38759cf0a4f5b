//! JIG info command catalogue.
//!
//! JIG info commands address the router itself rather than a module. Most of
//! them have a single fixed command code. The device-id table commands encode
//! a slot index (0..=99) into the code.

use crate::error::BjigError;
use crate::message::JigInfoResponse;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use strum_macros::Display;

/// Highest device table slot addressable by an indexed command
pub const MAX_DEVICE_INDEX: u8 = 99;

const GET_DEVICE_ID_INDEX_BASE: u8 = 0x03;
const REMOVE_DEVICE_ID_INDEX_BASE: u8 = 0x6C;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum JigInfoCommand {
    #[strum(to_string = "ROUTER_STOP")]
    RouterStop = 0x00,
    #[strum(to_string = "ROUTER_START")]
    RouterStart = 0x01,
    #[strum(to_string = "GET_VERSION")]
    GetVersion = 0x02,
    #[strum(to_string = "GET_SCAN_MODE")]
    GetScanMode = 0x67,
    #[strum(to_string = "SET_SCAN_MODE_LONG_RANGE")]
    SetScanModeLongRange = 0x69,
    #[strum(to_string = "SET_SCAN_MODE_LEGACY")]
    SetScanModeLegacy = 0x6A,
    #[strum(to_string = "REMOVE_DEVICE_ID_ALL")]
    RemoveDeviceIdAll = 0x6B,
    #[strum(to_string = "GET_DEVICE_ID_ALL")]
    GetDeviceIdAll = 0xCF,
    #[strum(to_string = "KEEP_ALIVE")]
    KeepAlive = 0xD0,
}

/// Router radio scan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ScanMode {
    #[strum(to_string = "Long Range")]
    LongRange = 0,
    #[strum(to_string = "Legacy")]
    Legacy = 1,
}

/// Command code reading the device id registered in table slot `index`.
pub fn get_device_id_cmd(index: u8) -> Result<u8, BjigError> {
    check_index(index)?;
    Ok(GET_DEVICE_ID_INDEX_BASE + index)
}

/// Command code removing the device id registered in table slot `index`.
pub fn remove_device_id_cmd(index: u8) -> Result<u8, BjigError> {
    check_index(index)?;
    Ok(REMOVE_DEVICE_ID_INDEX_BASE + index)
}

pub fn scan_mode_cmd(mode: ScanMode) -> JigInfoCommand {
    match mode {
        ScanMode::LongRange => JigInfoCommand::SetScanModeLongRange,
        ScanMode::Legacy => JigInfoCommand::SetScanModeLegacy,
    }
}

fn check_index(index: u8) -> Result<(), BjigError> {
    if index > MAX_DEVICE_INDEX {
        return Err(BjigError::InvalidParameter(format!(
            "device index {index} out of range (0-{MAX_DEVICE_INDEX})"
        )));
    }
    Ok(())
}

fn is_get_device_id_index(cmd: u8) -> bool {
    (GET_DEVICE_ID_INDEX_BASE..=GET_DEVICE_ID_INDEX_BASE + MAX_DEVICE_INDEX).contains(&cmd)
}

fn is_remove_device_id_index(cmd: u8) -> bool {
    (REMOVE_DEVICE_ID_INDEX_BASE..=REMOVE_DEVICE_ID_INDEX_BASE + MAX_DEVICE_INDEX).contains(&cmd)
}

/// Human-readable name of a JIG info command code.
pub fn command_name(cmd: u8) -> String {
    if let Ok(known) = JigInfoCommand::try_from(cmd) {
        return known.to_string();
    }
    if is_get_device_id_index(cmd) {
        return format!("GET_DEVICE_ID_INDEX_{}", cmd - GET_DEVICE_ID_INDEX_BASE);
    }
    if is_remove_device_id_index(cmd) {
        return format!("REMOVE_DEVICE_ID_INDEX_{}", cmd - REMOVE_DEVICE_ID_INDEX_BASE);
    }
    format!("UNKNOWN(0x{cmd:02X})")
}

/// Payload length of a JIG info response to `cmd`.
///
/// `payload` holds whatever has been received after the 15-byte header; it is
/// only consulted for `GET_DEVICE_ID_ALL`, whose first byte is the entry count.
/// Returns `None` while that count byte is still missing.
pub fn response_payload_len(cmd: u8, payload: &[u8]) -> Option<usize> {
    match JigInfoCommand::try_from(cmd) {
        Ok(JigInfoCommand::GetVersion) => Some(3),
        Ok(JigInfoCommand::GetDeviceIdAll) => payload.first().map(|&count| 1 + 8 * count as usize),
        Ok(_) => Some(1),
        Err(_) if is_get_device_id_index(cmd) => Some(9),
        // Status byte
        Err(_) => Some(1),
    }
}

/// One entry of the router's device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceSlot {
    pub index: u8,
    #[serde(serialize_with = "crate::message::serialize_device_id")]
    pub device_id: u64,
}

/// Typed view of a JIG info response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouterReply {
    Version { major: u8, minor: u8, build: u8 },
    ScanMode { mode: ScanMode },
    Status { success: bool },
    DeviceId(DeviceSlot),
    DeviceIds { devices: Vec<DeviceSlot> },
}

impl RouterReply {
    /// Interpret the payload of `response` according to its command code.
    pub fn parse(response: &JigInfoResponse) -> Result<Self, BjigError> {
        let data = response.payload.as_ref();
        let short = |expected: usize| {
            BjigError::MalformedPacket(format!(
                "{} payload too short: expected {expected} bytes, got {}",
                command_name(response.cmd),
                data.len()
            ))
        };

        match JigInfoCommand::try_from(response.cmd) {
            Ok(JigInfoCommand::GetVersion) => match data {
                [major, minor, build, ..] => Ok(RouterReply::Version {
                    major: *major,
                    minor: *minor,
                    build: *build,
                }),
                _ => Err(short(3)),
            },
            Ok(JigInfoCommand::GetScanMode) => {
                let raw = *data.first().ok_or_else(|| short(1))?;
                // The router reports anything it does not recognise as long range
                let mode = ScanMode::try_from(raw).unwrap_or(ScanMode::LongRange);
                Ok(RouterReply::ScanMode { mode })
            }
            Ok(JigInfoCommand::GetDeviceIdAll) => {
                let count = *data.first().ok_or_else(|| short(1))? as usize;
                let entries = &data[1..];
                if entries.len() < count * 8 {
                    return Err(short(1 + count * 8));
                }
                let devices = entries
                    .chunks_exact(8)
                    .take(count)
                    .enumerate()
                    .map(|(index, chunk)| {
                        Ok(DeviceSlot {
                            index: index as u8,
                            device_id: u64::from_le_bytes(chunk.try_into()?),
                        })
                    })
                    .collect::<Result<Vec<_>, BjigError>>()?;
                Ok(RouterReply::DeviceIds { devices })
            }
            Ok(_) => status_reply(data).ok_or_else(|| short(1)),
            Err(_) if is_get_device_id_index(response.cmd) => {
                if data.len() < 9 {
                    return Err(short(9));
                }
                Ok(RouterReply::DeviceId(DeviceSlot {
                    index: data[0],
                    device_id: u64::from_le_bytes(data[1..9].try_into()?),
                }))
            }
            Err(_) => status_reply(data).ok_or_else(|| short(1)),
        }
    }
}

fn status_reply(data: &[u8]) -> Option<RouterReply> {
    data.first().map(|&status| RouterReply::Status { success: status == 0x01 })
}

/// Reason codes carried by router error notifications.
pub fn error_reason_description(reason: u8) -> &'static str {
    match reason {
        0x01 => "Invalid request",
        0x02 => "Downlink in progress",
        0x03..=0x05 => "Reserved",
        0x06 => "No device id registered at the given index",
        0x07 => "Device not found",
        _ => "Unknown error reason",
    }
}
