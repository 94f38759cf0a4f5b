// Protocol constants for BraveJIG

/// Protocol version carried in byte 0 of every frame
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of a downlink request header, payload excluded (21 bytes)
pub const DOWNLINK_REQUEST_HEADER_SIZE: usize = 21;

/// Size of a downlink response (20 bytes, no payload)
pub const DOWNLINK_RESPONSE_SIZE: usize = 20;

/// Size of an uplink notification header, sensor payload excluded (21 bytes)
pub const UPLINK_HEADER_SIZE: usize = 21;

/// Size of a JIG info request (11 bytes, no payload)
pub const JIG_INFO_REQUEST_SIZE: usize = 11;

/// Size of a JIG info response header, payload excluded (15 bytes)
pub const JIG_INFO_RESPONSE_HEADER_SIZE: usize = 15;

/// Size of a router error notification (7 bytes)
pub const ERROR_NOTIFICATION_SIZE: usize = 7;

/// Largest payload a length-prefixed frame may declare (the router DFU chunk size).
/// A bigger declared length is treated as line noise, not as a frame to wait for.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Size of a router DFU request (10 bytes, no payload)
pub const DFU_REQUEST_SIZE: usize = 10;

/// Size of a router DFU response (7 bytes)
pub const DFU_RESPONSE_SIZE: usize = 7;

/// Offset of the little-endian data length field in length-prefixed frames
pub const DATA_LENGTH_OFFSET: usize = 2;

/// Offset of the type byte
pub const PACKET_TYPE_OFFSET: usize = 1;

/// Order value used by every non-DFU downlink request
pub const ORDER_FIXED: u16 = 0xFFFF;

/// Downlink result code meaning success
pub const RESULT_SUCCESS: u8 = 0x00;

/// Router DFU response result meaning the router is ready for the image
pub const DFU_READY: u8 = 0x01;

/// JIG info local time is Japan Standard Time (UTC+9)
pub const JST_OFFSET_SECS: u32 = 9 * 3600;

/// Default router baud rate
pub const DEFAULT_BAUD_RATE: u32 = 38_400;
