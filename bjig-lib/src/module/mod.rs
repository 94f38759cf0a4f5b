//! Module command layer: declarative tables, the registry that resolves a
//! module name to one, and the dispatcher that runs named commands.

pub mod config;
pub mod dispatcher;
pub mod illuminance;
pub mod registry;
pub mod wait;

use crate::error::BjigError;
use crate::message::UplinkNotification;
use bytes::Bytes;

pub use config::{CommandKind, CommandSpec, ModuleConfig};
pub use dispatcher::{CommandOutcome, CommandOverrides, Dispatcher};
pub use registry::{ModuleDescriptor, ModuleRegistry, ResolvedModule};

/// Module-specific behaviour layered on top of a command table.
///
/// The generic executor sends and waits the same way for every module; a
/// handler adds interpretation of the sensor payloads it understands and,
/// optionally, read-modify-write support for settings commands.
pub trait ModuleHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Decode the sensor payload of an uplink that answered `command`.
    ///
    /// `Ok(None)` leaves the uplink undecoded.
    fn decode_uplink(&self, command: &str, uplink: &UplinkNotification)
    -> Result<Option<serde_json::Value>, BjigError>;

    /// Command whose uplink reports the settings `command` writes, if
    /// `command` accepts partial JSON updates.
    fn settings_source(&self, _command: &str) -> Option<&str> {
        None
    }

    /// Payload for `command`: the settings reported in `current` with
    /// `updates` applied, validated before anything is sent.
    fn merge_settings(
        &self,
        command: &str,
        _current: &UplinkNotification,
        _updates: &serde_json::Value,
    ) -> Result<Bytes, BjigError> {
        Err(BjigError::InvalidParameter(format!(
            "'{command}' does not accept settings updates"
        )))
    }
}
