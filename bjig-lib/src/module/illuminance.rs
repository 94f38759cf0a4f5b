//! Illuminance module (BJ-MD-LUX-01) payload decoding and parameter updates.

use super::ModuleHandler;
use crate::error::BjigError;
use crate::message::UplinkNotification;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zerocopy::byteorder::little_endian::{F32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const ILLUMINANCE_SENSOR_ID: u16 = 0x0121;

const INSTANT_UPLINK: &str = "instant_uplink";
const GET_PARAMETER: &str = "get_parameter";
const SET_PARAMETER: &str = "set_parameter";

/// Reported by GET_PARAMETER but never written
const READ_ONLY_FIELDS: [&str; 2] = ["sensor_id", "fw_version"];

/// Fixed part of an instant uplink sensor payload, followed by `sample_count` f32 lux values
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ReadingHeaderRaw {
    pub battery_level: u8,
    pub sampling: u8,
    pub sensor_time: U32,
    pub sample_count: U16,
}

/// Parameter block returned by GET_PARAMETER (24 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ParameterBlockRaw {
    pub connected_sensor_id: U16,
    pub fw_version: [u8; 3],
    pub timezone: u8,
    pub ble_mode: u8,
    pub tx_power: u8,
    pub advertise_interval_ms: U16,
    pub uplink_interval_s: U32,
    pub read_mode: u8,
    pub sampling: u8,
    pub hysteresis_high: U32,
    pub hysteresis_low: U32,
}

/// One instant-uplink reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IlluminanceReading {
    /// Percent
    pub battery_level: u8,
    pub sampling: u8,
    pub sensor_time: u32,
    /// RFC 3339, UTC
    pub sensor_time_utc: Option<String>,
    pub lux: Vec<f32>,
}

impl IlluminanceReading {
    pub fn parse(payload: &[u8]) -> Result<Self, BjigError> {
        let (header, rest) = ReadingHeaderRaw::ref_from_prefix(payload).map_err(|_| {
            BjigError::MalformedPacket(format!(
                "illuminance reading too short: expected at least {} bytes, got {}",
                size_of::<ReadingHeaderRaw>(),
                payload.len()
            ))
        })?;
        let count = header.sample_count.get() as usize;
        let (samples, _) = <[F32]>::ref_from_prefix_with_elems(rest, count).map_err(|_| {
            BjigError::MalformedPacket(format!(
                "illuminance reading declares {count} samples but carries {} bytes",
                rest.len()
            ))
        })?;
        let sensor_time = header.sensor_time.get();

        Ok(Self {
            battery_level: header.battery_level,
            sampling: header.sampling,
            sensor_time,
            sensor_time_utc: DateTime::from_timestamp(sensor_time as i64, 0).map(|t| t.to_rfc3339()),
            lux: samples.iter().map(|s| s.get()).collect(),
        })
    }
}

/// Module parameters as read by GET_PARAMETER and written by SET_PARAMETER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IlluminanceParameters {
    pub sensor_id: u16,
    /// Read-only; not part of the SET_PARAMETER payload
    pub fw_version: [u8; 3],
    /// 0 = JST, 1 = UTC
    pub timezone: u8,
    /// 0 = long range, 1 = legacy
    pub ble_mode: u8,
    pub tx_power: u8,
    pub advertise_interval_ms: u16,
    pub uplink_interval_s: u32,
    /// 0 = instant, 1 = detection, 2 = sampling
    pub read_mode: u8,
    /// 0 = 1 Hz, 1 = 2 Hz
    pub sampling: u8,
    /// Lux
    pub hysteresis_high: u32,
    /// Lux
    pub hysteresis_low: u32,
}

impl Default for IlluminanceParameters {
    fn default() -> Self {
        Self {
            sensor_id: ILLUMINANCE_SENSOR_ID,
            fw_version: [0; 3],
            timezone: 0,
            ble_mode: 0,
            tx_power: 0,
            advertise_interval_ms: 1000,
            uplink_interval_s: 60,
            read_mode: 0,
            sampling: 0,
            hysteresis_high: 500,
            hysteresis_low: 400,
        }
    }
}

impl IlluminanceParameters {
    pub fn parse(payload: &[u8]) -> Result<Self, BjigError> {
        let (raw, _) = ParameterBlockRaw::ref_from_prefix(payload).map_err(|_| {
            BjigError::MalformedPacket(format!(
                "illuminance parameter block too short: expected {} bytes, got {}",
                size_of::<ParameterBlockRaw>(),
                payload.len()
            ))
        })?;
        Ok(Self {
            sensor_id: raw.connected_sensor_id.get(),
            fw_version: raw.fw_version,
            timezone: raw.timezone,
            ble_mode: raw.ble_mode,
            tx_power: raw.tx_power,
            advertise_interval_ms: raw.advertise_interval_ms.get(),
            uplink_interval_s: raw.uplink_interval_s.get(),
            read_mode: raw.read_mode,
            sampling: raw.sampling,
            hysteresis_high: raw.hysteresis_high.get(),
            hysteresis_low: raw.hysteresis_low.get(),
        })
    }

    /// Check every field against the ranges the module accepts.
    pub fn validate(&self) -> Result<(), BjigError> {
        let mut problems = Vec::new();
        if self.timezone > 1 {
            problems.push("timezone must be 0 (JST) or 1 (UTC)");
        }
        if self.ble_mode > 1 {
            problems.push("ble_mode must be 0 (long range) or 1 (legacy)");
        }
        if self.tx_power > 8 {
            problems.push("tx_power must be 0-8");
        }
        if !(100..=10_000).contains(&self.advertise_interval_ms) {
            problems.push("advertise_interval_ms must be 100-10000");
        }
        if !(5..=86_400).contains(&self.uplink_interval_s) {
            problems.push("uplink_interval_s must be 5-86400");
        }
        if self.read_mode > 2 {
            problems.push("read_mode must be 0-2");
        }
        if self.sampling > 1 {
            problems.push("sampling must be 0 (1 Hz) or 1 (2 Hz)");
        }
        let lux_range = 40..=83_865;
        if !lux_range.contains(&self.hysteresis_high) || !lux_range.contains(&self.hysteresis_low) {
            problems.push("hysteresis values must be 40-83865 lux");
        }
        if self.hysteresis_low >= self.hysteresis_high {
            problems.push("hysteresis_low must be below hysteresis_high");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BjigError::InvalidParameter(problems.join("; ")))
        }
    }

    /// Copy with the fields named in `updates` (a JSON object) replaced.
    ///
    /// Unknown and read-only fields are refused, and the result must pass
    /// [`IlluminanceParameters::validate`].
    pub fn merged(&self, updates: &Value) -> Result<Self, BjigError> {
        let Value::Object(updates) = updates else {
            return Err(BjigError::InvalidParameter(
                "parameter updates must be a JSON object".to_string(),
            ));
        };
        let Value::Object(mut fields) = serde_json::to_value(self)? else {
            return Err(BjigError::InvalidParameter("parameters did not serialize to an object".to_string()));
        };
        for (key, value) in updates {
            if READ_ONLY_FIELDS.contains(&key.as_str()) {
                return Err(BjigError::InvalidParameter(format!("{key} is read-only")));
            }
            if !fields.contains_key(key) {
                return Err(BjigError::InvalidParameter(format!("unknown parameter '{key}'")));
            }
            fields.insert(key.clone(), value.clone());
        }
        let merged: Self = serde_json::from_value(Value::Object(fields))
            .map_err(|e| BjigError::InvalidParameter(format!("bad parameter value: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }

    /// SET_PARAMETER payload (21 bytes).
    pub fn to_set_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(21);
        buf.put_u16_le(self.sensor_id);
        buf.put_u8(self.timezone);
        buf.put_u8(self.ble_mode);
        buf.put_u8(self.tx_power);
        buf.put_u16_le(self.advertise_interval_ms);
        buf.put_u32_le(self.uplink_interval_s);
        buf.put_u8(self.read_mode);
        buf.put_u8(self.sampling);
        buf.put_u32_le(self.hysteresis_high);
        buf.put_u32_le(self.hysteresis_low);
        buf.freeze()
    }
}

/// Decodes instant-uplink readings and parameter blocks.
#[derive(Debug, Default)]
pub struct IlluminanceHandler;

impl ModuleHandler for IlluminanceHandler {
    fn name(&self) -> &str {
        "illuminance"
    }

    fn decode_uplink(
        &self,
        command: &str,
        uplink: &UplinkNotification,
    ) -> Result<Option<serde_json::Value>, BjigError> {
        let value = match command {
            INSTANT_UPLINK => serde_json::to_value(IlluminanceReading::parse(&uplink.payload)?)?,
            GET_PARAMETER => serde_json::to_value(IlluminanceParameters::parse(&uplink.payload)?)?,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn settings_source(&self, command: &str) -> Option<&str> {
        (command == SET_PARAMETER).then_some(GET_PARAMETER)
    }

    fn merge_settings(&self, command: &str, current: &UplinkNotification, updates: &Value) -> Result<Bytes, BjigError> {
        if command != SET_PARAMETER {
            return Err(BjigError::InvalidParameter(format!(
                "'{command}' does not accept settings updates"
            )));
        }
        let merged = IlluminanceParameters::parse(&current.payload)?.merged(updates)?;
        Ok(merged.to_set_payload())
    }
}
