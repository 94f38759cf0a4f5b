//! Named command execution.

use super::config::{CommandKind, CommandSpec};
use super::registry::{ModuleRegistry, ResolvedModule};
use super::wait::ReplyStream;
use crate::device_id::DeviceId;
use crate::dfu::{DfuSession, ROUTER_CHUNK_INTERVAL, RouterFirmware, SENSOR_DFU_CMD};
use crate::error::BjigError;
use crate::link::LinkManager;
use crate::message::{DownlinkRequest, DownlinkResponse, JigInfoRequest, JigInfoResponse, Packet, UplinkNotification};
use crate::router::RouterReply;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Caller-supplied values that take precedence over the command table.
#[derive(Debug, Clone, Default)]
pub struct CommandOverrides {
    pub payload: Option<Bytes>,
    /// Firmware image for `sensor_dfu` commands
    pub firmware: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub sensor_id: Option<u16>,
    /// Partial settings (a JSON object) merged into the device's current ones
    /// instead of sending `payload` as-is
    pub settings: Option<serde_json::Value>,
}

/// Successful result of a command.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Sent; nothing was expected back
    Sent,
    Response {
        response: DownlinkResponse,
    },
    RouterResponse {
        command: String,
        response: JigInfoResponse,
        reply: Option<RouterReply>,
    },
    Uplink {
        uplink: UplinkNotification,
        decoded: Option<serde_json::Value>,
    },
    FirmwareUpdated {
        blocks: usize,
        firmware_len: usize,
    },
}

/// Runs module commands over a shared link.
pub struct Dispatcher {
    link: Arc<LinkManager>,
    registry: Arc<ModuleRegistry>,
}

impl Dispatcher {
    pub fn new(link: Arc<LinkManager>, registry: Arc<ModuleRegistry>) -> Self {
        Self { link, registry }
    }

    pub fn link(&self) -> &Arc<LinkManager> {
        &self.link
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Execute `command` of `module` against `device_id`.
    ///
    /// Input is checked before the link is touched: unknown commands, bad
    /// device ids and missing payloads fail without sending anything.
    /// `device_id` is ignored for router (`jig_info`) commands.
    ///
    /// With [`CommandOverrides::settings`] the module handler's source command
    /// runs first and the written payload is its reply with the updates merged.
    pub async fn execute_command(
        &self,
        module: &str,
        command: &str,
        device_id: &str,
        overrides: CommandOverrides,
    ) -> Result<CommandOutcome, BjigError> {
        let resolved = self.registry.resolve(module);
        let spec = resolved
            .config()
            .command(command)
            .ok_or_else(|| BjigError::UnknownCommand {
                module: module.to_string(),
                command: command.to_string(),
            })?
            .clone();
        let timeout = overrides.timeout.unwrap_or(spec.timeout);

        match spec.kind {
            CommandKind::JigInfo if !spec.expects_response => {
                if !self.link.is_connected() {
                    return Err(BjigError::NotConnected);
                }
                debug!("Sending JIG info {} without waiting", crate::router::command_name(spec.cmd));
                self.transmit(&Packet::JigInfoRequest(JigInfoRequest::new(spec.cmd)))?;
                Ok(CommandOutcome::Sent)
            }
            CommandKind::JigInfo => {
                let response = self.execute_jig_info(spec.cmd, timeout).await?;
                let reply = RouterReply::parse(&response)
                    .inspect_err(|e| warn!("Could not interpret {} reply: {e}", response.command_name()))
                    .ok();
                Ok(CommandOutcome::RouterResponse {
                    command: command.to_string(),
                    response,
                    reply,
                })
            }
            CommandKind::SensorDfu => {
                let device: DeviceId = device_id.parse()?;
                let firmware = overrides
                    .firmware
                    .or(overrides.payload)
                    .ok_or_else(|| BjigError::MissingRequiredData(command.to_string()))?;
                let sensor_id = overrides.sensor_id.unwrap_or(spec.sensor_id);
                let session = DfuSession::new(device, sensor_id, &firmware)?;
                self.run_dfu(&session, timeout).await
            }
            CommandKind::Downlink => {
                let device: DeviceId = device_id.parse()?;
                let payload = match overrides.settings {
                    Some(updates) => {
                        self.merged_settings(&resolved, command, device, &updates, overrides.timeout)
                            .await?
                    }
                    None => command_payload(command, &spec, overrides.payload)?,
                };
                let sensor_id = overrides.sensor_id.unwrap_or(spec.sensor_id);
                let request = DownlinkRequest::new(device.get(), sensor_id, spec.cmd, spec.order, payload);
                self.run_downlink(&resolved, command, &spec, request, timeout).await
            }
        }
    }

    /// Send JIG info command `cmd` and wait for the router's response.
    pub async fn execute_jig_info(&self, cmd: u8, timeout: Duration) -> Result<JigInfoResponse, BjigError> {
        let mut replies = self.reply_stream()?;
        let request = JigInfoRequest::new(cmd);
        debug!("Sending JIG info {}", crate::router::command_name(cmd));
        self.transmit(&Packet::JigInfoRequest(request))?;
        replies.jig_info_response(cmd, timeout).await
    }

    /// Update the router's own firmware.
    ///
    /// The router is asked to accept `firmware` and, once it answers ready,
    /// the image is streamed chunk by chunk. The router does not acknowledge
    /// individual chunks.
    pub async fn execute_router_dfu(
        &self,
        firmware: &RouterFirmware,
        timeout: Duration,
    ) -> Result<CommandOutcome, BjigError> {
        let total = firmware.chunk_count();
        let mut replies = self.reply_stream()?;
        info!(
            "Requesting router DFU ({} bytes in {total} chunks)",
            firmware.total_length()
        );
        self.transmit(&Packet::DfuRequest(firmware.request()))?;

        let response = replies.dfu_response(timeout).await?;
        if !response.is_ready() {
            warn!("Router refused DFU with result 0x{:02X}", response.result);
            return Err(BjigError::DfuRefused(response.result));
        }

        for (index, chunk) in firmware.chunks().enumerate() {
            self.transmit_raw(&chunk)?;
            debug!("Router DFU chunk {}/{total} sent", index + 1);
            tokio::time::sleep(ROUTER_CHUNK_INTERVAL).await;
        }

        info!("Router DFU transfer complete");
        Ok(CommandOutcome::FirmwareUpdated {
            blocks: total,
            firmware_len: firmware.total_length() as usize,
        })
    }

    /// Read the settings `command` writes, apply `updates` and return the payload to write.
    async fn merged_settings(
        &self,
        module: &ResolvedModule,
        command: &str,
        device: DeviceId,
        updates: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<Bytes, BjigError> {
        let unsupported = || BjigError::InvalidParameter(format!("'{command}' does not accept settings updates"));
        let handler = module.handler().ok_or_else(unsupported)?;
        let source = handler.settings_source(command).ok_or_else(unsupported)?;
        let source_spec = module
            .config()
            .command(source)
            .ok_or_else(|| BjigError::UnknownCommand {
                module: handler.name().to_string(),
                command: source.to_string(),
            })?
            .clone();
        let request = DownlinkRequest::new(
            device.get(),
            source_spec.sensor_id,
            source_spec.cmd,
            source_spec.order,
            command_payload(source, &source_spec, None)?,
        );

        let mut replies = self.reply_stream()?;
        info!("Reading current settings of {device} with '{source}'");
        self.transmit(&Packet::DownlinkRequest(request))?;
        let current = replies
            .uplink(
                device.get(),
                source_spec.uplink_sensor_id,
                source_spec.cmd,
                timeout.unwrap_or(source_spec.timeout),
            )
            .await?;

        let payload = handler.merge_settings(command, &current, updates)?;
        debug!(bytes = hex::encode(&payload), "Merged '{command}' settings");
        Ok(payload)
    }

    async fn run_downlink(
        &self,
        module: &ResolvedModule,
        command: &str,
        spec: &CommandSpec,
        request: DownlinkRequest,
        timeout: Duration,
    ) -> Result<CommandOutcome, BjigError> {
        let device_id = request.device_id;
        let mut replies = self.reply_stream()?;
        info!(
            "Sending '{command}' (cmd 0x{:02X}) to {}",
            request.cmd,
            DeviceId(device_id)
        );
        self.transmit(&Packet::DownlinkRequest(request))?;

        if spec.has_uplink {
            let uplink = replies
                .uplink(device_id, spec.uplink_sensor_id, spec.cmd, timeout)
                .await?;
            let decoded = match module.handler() {
                Some(handler) => handler
                    .decode_uplink(command, &uplink)
                    .inspect_err(|e| warn!("{} could not decode '{command}' uplink: {e}", handler.name()))
                    .ok()
                    .flatten(),
                None => None,
            };
            Ok(CommandOutcome::Uplink { uplink, decoded })
        } else if spec.expects_response {
            let response = replies.downlink_response(device_id, spec.cmd, timeout).await?;
            Ok(CommandOutcome::Response { response })
        } else {
            Ok(CommandOutcome::Sent)
        }
    }

    /// Send every block in order, each only after the previous one is acknowledged.
    async fn run_dfu(&self, session: &DfuSession, block_timeout: Duration) -> Result<CommandOutcome, BjigError> {
        let device_id = session.device_id().get();
        let total = session.len();
        let mut replies = self.reply_stream()?;
        info!(
            "Starting DFU of {} ({} bytes in {total} blocks)",
            session.device_id(),
            session.firmware_len()
        );

        for (index, block) in session.blocks().iter().enumerate() {
            self.transmit(&Packet::DownlinkRequest(session.request_for(block)))?;
            let ack = replies
                .block_ack(device_id, SENSOR_DFU_CMD, block.sequence, block_timeout)
                .await?;
            if !ack.is_success() {
                let unsent = total - index - 1;
                warn!(
                    "DFU block 0x{:04X} rejected with 0x{:02X}; {unsent} blocks not sent",
                    block.sequence, ack.result
                );
                return Err(BjigError::DfuBlockRejected {
                    sequence: block.sequence,
                    result: ack.result,
                    unsent,
                });
            }
            debug!("DFU block 0x{:04X} acknowledged ({}/{total})", block.sequence, index + 1);
        }

        info!("DFU of {} complete", session.device_id());
        Ok(CommandOutcome::FirmwareUpdated {
            blocks: total,
            firmware_len: session.firmware_len(),
        })
    }

    /// Subscribe before sending so the reply cannot slip past.
    fn reply_stream(&self) -> Result<ReplyStream, BjigError> {
        if !self.link.is_connected() {
            return Err(BjigError::NotConnected);
        }
        Ok(ReplyStream::new(self.link.subscribe(), self.link.watch_state()))
    }

    fn transmit(&self, packet: &Packet) -> Result<(), BjigError> {
        self.transmit_raw(&packet.to_bytes()?)
    }

    fn transmit_raw(&self, bytes: &[u8]) -> Result<(), BjigError> {
        if self.link.send(bytes) {
            Ok(())
        } else {
            Err(BjigError::LinkLost("send failed".to_string()))
        }
    }
}

fn command_payload(command: &str, spec: &CommandSpec, payload: Option<Bytes>) -> Result<Bytes, BjigError> {
    match payload.or_else(|| spec.data.clone()) {
        Some(payload) => Ok(payload),
        None if spec.requires_data => Err(BjigError::MissingRequiredData(command.to_string())),
        None => Ok(Bytes::new()),
    }
}
