use crate::constants::{
    DFU_READY, DFU_REQUEST_SIZE, DFU_RESPONSE_SIZE, DOWNLINK_REQUEST_HEADER_SIZE, DOWNLINK_RESPONSE_SIZE,
    ERROR_NOTIFICATION_SIZE, JIG_INFO_REQUEST_SIZE, JIG_INFO_RESPONSE_HEADER_SIZE, JST_OFFSET_SECS, MAX_PAYLOAD_SIZE,
    PACKET_TYPE_OFFSET, PROTOCOL_VERSION, RESULT_SUCCESS, UPLINK_HEADER_SIZE,
};
use crate::error::BjigError;
use crate::packet::{
    DfuRequestRaw, DfuResponseRaw, Direction, DownlinkRequestHeader, DownlinkResponseRaw, ErrorNotificationRaw,
    JigInfoRequestRaw, JigInfoResponseHeader, RequestType, ResponseType, UplinkHeader, unknown_type,
};
use crate::router;
use bytes::{Bytes, BytesMut};
use serde::{Serialize, Serializer};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, IntoBytes};

/// Downlink request sent from the host to a module via the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownlinkRequest {
    pub protocol_version: u8,
    pub unix_time: u32,
    #[serde(serialize_with = "serialize_device_id")]
    pub device_id: u64,
    pub sensor_id: u16,
    pub cmd: u8,
    pub order: u16,
    #[serde(serialize_with = "serialize_hex")]
    pub payload: Bytes,
}

/// Router acknowledgement of a downlink request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownlinkResponse {
    pub protocol_version: u8,
    pub unix_time: u32,
    #[serde(serialize_with = "serialize_device_id")]
    pub device_id: u64,
    pub sensor_id: u16,
    pub order: u16,
    pub cmd: u8,
    pub result: u8,
}

/// Notification pushed by a module, either spontaneously or in reply to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UplinkNotification {
    pub protocol_version: u8,
    pub unix_time: u32,
    #[serde(serialize_with = "serialize_device_id")]
    pub device_id: u64,
    pub sensor_id: u16,
    /// Signal strength in dBm
    pub rssi: i8,
    pub reserved: u16,
    #[serde(serialize_with = "serialize_hex")]
    pub payload: Bytes,
}

/// Router-level control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JigInfoRequest {
    pub protocol_version: u8,
    pub cmd: u8,
    pub local_time: u32,
    pub unix_time: u32,
}

/// Router-level control response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JigInfoResponse {
    pub protocol_version: u8,
    pub unix_time: u32,
    pub cmd: u8,
    #[serde(serialize_with = "serialize_device_id")]
    pub router_device_id: u64,
    #[serde(serialize_with = "serialize_hex")]
    pub payload: Bytes,
}

/// Asks the router to accept a firmware image of `total_length` bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DfuRequest {
    pub protocol_version: u8,
    pub unix_time: u32,
    pub total_length: u32,
}

/// Router answer to a [`DfuRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DfuResponse {
    pub protocol_version: u8,
    pub unix_time: u32,
    pub result: u8,
}

/// Router-reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorNotification {
    pub protocol_version: u8,
    pub unix_time: u32,
    pub reason: u8,
}

/// Any frame that can appear on the serial link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "packet", rename_all = "snake_case")]
pub enum Packet {
    DownlinkRequest(DownlinkRequest),
    DownlinkResponse(DownlinkResponse),
    UplinkNotification(UplinkNotification),
    JigInfoRequest(JigInfoRequest),
    JigInfoResponse(JigInfoResponse),
    DfuRequest(DfuRequest),
    DfuResponse(DfuResponse),
    ErrorNotification(ErrorNotification),
}

/// Current time as a 32-bit unix timestamp
pub fn unix_now() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

impl DownlinkRequest {
    /// Build a request stamped with the current time
    pub fn new(device_id: u64, sensor_id: u16, cmd: u8, order: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            unix_time: unix_now(),
            device_id,
            sensor_id,
            cmd,
            order,
            payload: payload.into(),
        }
    }

    pub fn with_unix_time(mut self, unix_time: u32) -> Self {
        self.unix_time = unix_time;
        self
    }

    pub fn to_bytes(&self) -> Result<Bytes, BjigError> {
        let header = DownlinkRequestHeader {
            protocol_version: self.protocol_version,
            packet_type: RequestType::Downlink.into(),
            data_length: U16::new(payload_len_u16(&self.payload)?),
            unix_time: U32::new(self.unix_time),
            device_id: U64::new(self.device_id),
            sensor_id: U16::new(self.sensor_id),
            cmd: self.cmd,
            order: U16::new(self.order),
        };
        Ok(concat(header.as_bytes(), &self.payload))
    }

    fn from_bytes(bytes: Bytes) -> Result<Self, BjigError> {
        let (header, rest) = DownlinkRequestHeader::ref_from_prefix(bytes.as_ref())
            .map_err(|_| too_short("downlink request", DOWNLINK_REQUEST_HEADER_SIZE, bytes.len()))?;
        check_declared_length(header.data_length.get() as usize, rest.len())?;

        Ok(Self {
            protocol_version: header.protocol_version,
            unix_time: header.unix_time.get(),
            device_id: header.device_id.get(),
            sensor_id: header.sensor_id.get(),
            cmd: header.cmd,
            order: header.order.get(),
            payload: bytes.slice(DOWNLINK_REQUEST_HEADER_SIZE..),
        })
    }
}

impl DownlinkResponse {
    pub fn is_success(&self) -> bool {
        self.result == RESULT_SUCCESS
    }

    pub fn to_bytes(&self) -> Bytes {
        let raw = DownlinkResponseRaw {
            protocol_version: self.protocol_version,
            packet_type: ResponseType::DownlinkResponse.into(),
            unix_time: U32::new(self.unix_time),
            device_id: U64::new(self.device_id),
            sensor_id: U16::new(self.sensor_id),
            order: U16::new(self.order),
            cmd: self.cmd,
            result: self.result,
        };
        Bytes::copy_from_slice(raw.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BjigError> {
        let raw = DownlinkResponseRaw::ref_from_bytes(bytes).map_err(|_| {
            BjigError::MalformedPacket(format!(
                "downlink response must be {DOWNLINK_RESPONSE_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            protocol_version: raw.protocol_version,
            unix_time: raw.unix_time.get(),
            device_id: raw.device_id.get(),
            sensor_id: raw.sensor_id.get(),
            order: raw.order.get(),
            cmd: raw.cmd,
            result: raw.result,
        })
    }
}

impl UplinkNotification {
    pub fn to_bytes(&self) -> Result<Bytes, BjigError> {
        let header = UplinkHeader {
            protocol_version: self.protocol_version,
            packet_type: ResponseType::Uplink.into(),
            data_length: U16::new(payload_len_u16(&self.payload)?),
            unix_time: U32::new(self.unix_time),
            device_id: U64::new(self.device_id),
            sensor_id: U16::new(self.sensor_id),
            rssi: self.rssi,
            reserved: U16::new(self.reserved),
        };
        Ok(concat(header.as_bytes(), &self.payload))
    }

    fn from_bytes(bytes: Bytes) -> Result<Self, BjigError> {
        let (header, rest) = UplinkHeader::ref_from_prefix(bytes.as_ref())
            .map_err(|_| too_short("uplink notification", UPLINK_HEADER_SIZE, bytes.len()))?;
        check_declared_length(header.data_length.get() as usize, rest.len())?;

        Ok(Self {
            protocol_version: header.protocol_version,
            unix_time: header.unix_time.get(),
            device_id: header.device_id.get(),
            sensor_id: header.sensor_id.get(),
            rssi: header.rssi,
            reserved: header.reserved.get(),
            payload: bytes.slice(UPLINK_HEADER_SIZE..),
        })
    }
}

impl JigInfoRequest {
    /// Build a request stamped with the current UTC time and JST local time
    pub fn new(cmd: u8) -> Self {
        Self::at(cmd, unix_now())
    }

    pub fn at(cmd: u8, unix_time: u32) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            cmd,
            local_time: unix_time.wrapping_add(JST_OFFSET_SECS),
            unix_time,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let raw = JigInfoRequestRaw {
            protocol_version: self.protocol_version,
            packet_type: RequestType::JigInfo.into(),
            cmd: self.cmd,
            local_time: U32::new(self.local_time),
            unix_time: U32::new(self.unix_time),
        };
        Bytes::copy_from_slice(raw.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BjigError> {
        let raw = JigInfoRequestRaw::ref_from_bytes(bytes).map_err(|_| {
            BjigError::MalformedPacket(format!(
                "JIG info request must be {JIG_INFO_REQUEST_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            protocol_version: raw.protocol_version,
            cmd: raw.cmd,
            local_time: raw.local_time.get(),
            unix_time: raw.unix_time.get(),
        })
    }
}

impl JigInfoResponse {
    pub fn command_name(&self) -> String {
        router::command_name(self.cmd)
    }

    pub fn to_bytes(&self) -> Bytes {
        let header = JigInfoResponseHeader {
            protocol_version: self.protocol_version,
            packet_type: ResponseType::JigInfo.into(),
            unix_time: U32::new(self.unix_time),
            cmd: self.cmd,
            router_device_id: U64::new(self.router_device_id),
        };
        concat(header.as_bytes(), &self.payload)
    }

    fn from_bytes(bytes: Bytes) -> Result<Self, BjigError> {
        let (header, _) = JigInfoResponseHeader::ref_from_prefix(bytes.as_ref())
            .map_err(|_| too_short("JIG info response", JIG_INFO_RESPONSE_HEADER_SIZE, bytes.len()))?;
        Ok(Self {
            protocol_version: header.protocol_version,
            unix_time: header.unix_time.get(),
            cmd: header.cmd,
            router_device_id: header.router_device_id.get(),
            payload: bytes.slice(JIG_INFO_RESPONSE_HEADER_SIZE..),
        })
    }
}

impl DfuRequest {
    pub fn new(total_length: u32) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            unix_time: unix_now(),
            total_length,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let raw = DfuRequestRaw {
            protocol_version: self.protocol_version,
            packet_type: RequestType::Dfu.into(),
            unix_time: U32::new(self.unix_time),
            total_length: U32::new(self.total_length),
        };
        Bytes::copy_from_slice(raw.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BjigError> {
        let raw = DfuRequestRaw::ref_from_bytes(bytes).map_err(|_| {
            BjigError::MalformedPacket(format!(
                "DFU request must be {DFU_REQUEST_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            protocol_version: raw.protocol_version,
            unix_time: raw.unix_time.get(),
            total_length: raw.total_length.get(),
        })
    }
}

impl DfuResponse {
    /// The router is waiting for the image
    pub fn is_ready(&self) -> bool {
        self.result == DFU_READY
    }

    pub fn to_bytes(&self) -> Bytes {
        let raw = DfuResponseRaw {
            protocol_version: self.protocol_version,
            packet_type: ResponseType::Dfu.into(),
            unix_time: U32::new(self.unix_time),
            result: self.result,
        };
        Bytes::copy_from_slice(raw.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BjigError> {
        let raw = DfuResponseRaw::ref_from_bytes(bytes).map_err(|_| {
            BjigError::MalformedPacket(format!(
                "DFU response must be {DFU_RESPONSE_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            protocol_version: raw.protocol_version,
            unix_time: raw.unix_time.get(),
            result: raw.result,
        })
    }
}

impl ErrorNotification {
    pub fn description(&self) -> &'static str {
        router::error_reason_description(self.reason)
    }

    pub fn to_bytes(&self) -> Bytes {
        let raw = ErrorNotificationRaw {
            protocol_version: self.protocol_version,
            packet_type: ResponseType::ErrorNotification.into(),
            unix_time: U32::new(self.unix_time),
            reason: self.reason,
        };
        Bytes::copy_from_slice(raw.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BjigError> {
        let raw = ErrorNotificationRaw::ref_from_bytes(bytes).map_err(|_| {
            BjigError::MalformedPacket(format!(
                "error notification must be {ERROR_NOTIFICATION_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            protocol_version: raw.protocol_version,
            unix_time: raw.unix_time.get(),
            reason: raw.reason,
        })
    }
}

impl Packet {
    /// Decode exactly one frame.
    ///
    /// `direction` selects how the type byte is read: the router and the host
    /// reuse the same type values for different shapes.
    pub fn from_bytes(bytes: Bytes, direction: Direction) -> Result<Self, BjigError> {
        let type_byte = *bytes
            .get(PACKET_TYPE_OFFSET)
            .ok_or_else(|| too_short("frame", PACKET_TYPE_OFFSET + 1, bytes.len()))?;

        match direction {
            Direction::HostToRouter => match RequestType::try_from(type_byte) {
                Ok(RequestType::Downlink) => DownlinkRequest::from_bytes(bytes).map(Packet::DownlinkRequest),
                Ok(RequestType::JigInfo) => JigInfoRequest::from_bytes(&bytes).map(Packet::JigInfoRequest),
                Ok(RequestType::Dfu) => DfuRequest::from_bytes(&bytes).map(Packet::DfuRequest),
                Err(_) => Err(unknown_type(type_byte, direction)),
            },
            Direction::RouterToHost => match ResponseType::try_from(type_byte) {
                Ok(ResponseType::Uplink) => UplinkNotification::from_bytes(bytes).map(Packet::UplinkNotification),
                Ok(ResponseType::DownlinkResponse) => {
                    DownlinkResponse::from_bytes(&bytes).map(Packet::DownlinkResponse)
                }
                Ok(ResponseType::JigInfo) => JigInfoResponse::from_bytes(bytes).map(Packet::JigInfoResponse),
                Ok(ResponseType::Dfu) => DfuResponse::from_bytes(&bytes).map(Packet::DfuResponse),
                Ok(ResponseType::ErrorNotification) => {
                    ErrorNotification::from_bytes(&bytes).map(Packet::ErrorNotification)
                }
                Err(_) => Err(unknown_type(type_byte, direction)),
            },
        }
    }

    /// Encode to wire bytes. Fails only when a payload is longer than [`MAX_PAYLOAD_SIZE`].
    pub fn to_bytes(&self) -> Result<Bytes, BjigError> {
        match self {
            Packet::DownlinkRequest(p) => p.to_bytes(),
            Packet::DownlinkResponse(p) => Ok(p.to_bytes()),
            Packet::UplinkNotification(p) => p.to_bytes(),
            Packet::JigInfoRequest(p) => Ok(p.to_bytes()),
            Packet::JigInfoResponse(p) => Ok(p.to_bytes()),
            Packet::DfuRequest(p) => Ok(p.to_bytes()),
            Packet::DfuResponse(p) => Ok(p.to_bytes()),
            Packet::ErrorNotification(p) => Ok(p.to_bytes()),
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Packet::DownlinkRequest(_) | Packet::JigInfoRequest(_) | Packet::DfuRequest(_) => Direction::HostToRouter,
            _ => Direction::RouterToHost,
        }
    }

    /// Module device id, for packets that carry one
    pub fn device_id(&self) -> Option<u64> {
        match self {
            Packet::DownlinkRequest(p) => Some(p.device_id),
            Packet::DownlinkResponse(p) => Some(p.device_id),
            Packet::UplinkNotification(p) => Some(p.device_id),
            _ => None,
        }
    }
}

fn payload_len_u16(payload: &[u8]) -> Result<u16, BjigError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(BjigError::MalformedPacket(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE}-byte maximum",
            payload.len()
        )));
    }
    Ok(payload.len() as u16)
}

fn concat(header: &[u8], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header.len() + payload.len());
    buf.extend_from_slice(header);
    buf.extend_from_slice(payload);
    buf.freeze()
}

fn check_declared_length(declared: usize, available: usize) -> Result<(), BjigError> {
    if declared > available {
        return Err(BjigError::MalformedPacket(format!(
            "declared data length {declared} exceeds the {available} bytes available"
        )));
    }
    if declared < available {
        return Err(BjigError::MalformedPacket(format!(
            "{} trailing bytes after declared data length {declared}",
            available - declared
        )));
    }
    Ok(())
}

fn too_short(what: &str, expected: usize, actual: usize) -> BjigError {
    BjigError::MalformedPacket(format!(
        "{what} too short: expected at least {expected} bytes, got {actual}"
    ))
}

pub(crate) fn serialize_hex<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode_upper(bytes))
}

pub(crate) fn serialize_hex_opt<S: Serializer>(bytes: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serialize_hex(bytes, serializer),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn serialize_device_id<S: Serializer>(device_id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{device_id:016X}"))
}
