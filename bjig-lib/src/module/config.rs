//! Declarative module command tables.
//!
//! A table is a JSON document:
//!
//! ```json
//! {
//!   "name": "illuminance",
//!   "sensor_id": "0x0121",
//!   "commands": {
//!     "instant_uplink": { "cmd": "0x00", "timeout": 90, "has_uplink": true }
//!   }
//! }
//! ```
//!
//! Numeric fields accept JSON integers or `0x`-prefixed hex strings. `data`
//! is a hex string.

use crate::constants::ORDER_FIXED;
use crate::error::BjigError;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: f64 = 10.0;

/// How a command is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// One downlink request to a module
    #[default]
    Downlink,
    /// Firmware image split into DFU blocks, each acknowledged
    SensorDfu,
    /// JIG info request to the router itself
    JigInfo,
}

/// One entry of a module command table, with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSpec {
    pub cmd: u8,
    pub sensor_id: u16,
    pub timeout: Duration,
    pub has_uplink: bool,
    pub uplink_sensor_id: u16,
    pub requires_data: bool,
    #[serde(serialize_with = "crate::message::serialize_hex_opt")]
    pub data: Option<Bytes>,
    pub expects_response: bool,
    pub order: u16,
    pub kind: CommandKind,
    pub description: Option<String>,
}

/// Command table of one module type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleConfig {
    pub name: String,
    pub sensor_id: u16,
    pub description: Option<String>,
    pub commands: BTreeMap<String, CommandSpec>,
}

impl ModuleConfig {
    /// The table bound to names nothing else knows about.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sensor_id: 0x0000,
            description: None,
            commands: BTreeMap::new(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, BjigError> {
        let raw: RawModuleConfig = serde_json::from_str(json)?;
        raw.into_config()
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BjigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModuleConfig {
    name: String,
    #[serde(default, deserialize_with = "de_u16")]
    sensor_id: u16,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    commands: BTreeMap<String, RawCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommand {
    #[serde(deserialize_with = "de_u8")]
    cmd: u8,
    #[serde(default, deserialize_with = "de_opt_u16")]
    sensor_id: Option<u16>,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    has_uplink: bool,
    #[serde(default, deserialize_with = "de_opt_u16")]
    uplink_sensor_id: Option<u16>,
    #[serde(default)]
    requires_data: bool,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    expects_response: bool,
    #[serde(default, deserialize_with = "de_opt_u16")]
    order: Option<u16>,
    #[serde(default)]
    kind: CommandKind,
    #[serde(default)]
    description: Option<String>,
}

impl RawModuleConfig {
    fn into_config(self) -> Result<ModuleConfig, BjigError> {
        let module_sensor_id = self.sensor_id;
        let commands = self
            .commands
            .into_iter()
            .map(|(name, raw)| {
                let spec = raw.into_spec(&name, module_sensor_id)?;
                Ok((name, spec))
            })
            .collect::<Result<BTreeMap<_, _>, BjigError>>()?;
        Ok(ModuleConfig {
            name: self.name,
            sensor_id: module_sensor_id,
            description: self.description,
            commands,
        })
    }
}

impl RawCommand {
    fn into_spec(self, name: &str, module_sensor_id: u16) -> Result<CommandSpec, BjigError> {
        let secs = self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let timeout = Duration::try_from_secs_f64(secs)
            .map_err(|_| BjigError::InvalidParameter(format!("command '{name}': invalid timeout {secs}")))?;
        let data = self
            .data
            .map(|hex_str| {
                let compact: String = hex_str.split_whitespace().collect();
                hex::decode(compact)
                    .map(Bytes::from)
                    .map_err(|e| BjigError::InvalidParameter(format!("command '{name}': bad data hex: {e}")))
            })
            .transpose()?;
        let sensor_id = self.sensor_id.unwrap_or(module_sensor_id);

        Ok(CommandSpec {
            cmd: self.cmd,
            sensor_id,
            timeout,
            has_uplink: self.has_uplink,
            uplink_sensor_id: self.uplink_sensor_id.unwrap_or(sensor_id),
            requires_data: self.requires_data,
            data,
            expects_response: self.expects_response,
            order: self.order.unwrap_or(ORDER_FIXED),
            kind: self.kind,
            description: self.description,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrHex {
    Number(u64),
    Hex(String),
}

impl NumberOrHex {
    fn value(self) -> Result<u64, String> {
        match self {
            NumberOrHex::Number(n) => Ok(n),
            NumberOrHex::Hex(s) => {
                let digits = s.trim_start_matches("0x").trim_start_matches("0X");
                u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value {s:?}: {e}"))
            }
        }
    }
}

fn de_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let value = NumberOrHex::deserialize(deserializer)?
        .value()
        .map_err(serde::de::Error::custom)?;
    T::try_from(value).map_err(|_| serde::de::Error::custom(format!("value {value:#X} out of range")))
}

fn de_u8<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    de_number(deserializer)
}

fn de_u16<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    de_number(deserializer)
}

fn de_opt_u16<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    de_number(deserializer).map(Some)
}
