//! Reply waits shared by every module type.
//!
//! A wait watches its own broadcast subscription, so packets it does not want
//! remain visible to every other waiter. Each wait is bounded by a timeout and
//! ends early if the link drops. A waiter that falls so far behind that the
//! broadcast channel overwrites unread packets fails with `RepliesMissed`,
//! since its reply may have been among them.

use crate::constants::RESULT_SUCCESS;
use crate::error::BjigError;
use crate::link::ConnectionState;
use crate::message::{DfuResponse, DownlinkResponse, JigInfoResponse, Packet, UplinkNotification};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::warn;

/// Subscriptions taken before a request is sent.
pub struct ReplyStream {
    packets: broadcast::Receiver<Packet>,
    state: watch::Receiver<ConnectionState>,
}

impl ReplyStream {
    pub fn new(packets: broadcast::Receiver<Packet>, state: watch::Receiver<ConnectionState>) -> Self {
        Self { packets, state }
    }

    /// Wait until `matcher` accepts a packet.
    ///
    /// `matcher` returns `None` to keep waiting, `Some(Ok(_))` to finish and
    /// `Some(Err(_))` to abort. Fails with `TimedOut` once `timeout` elapses,
    /// with `LinkLost` if the link disconnects first and with `RepliesMissed`
    /// if packets were dropped before this wait could see them.
    pub async fn wait_for<T, F>(&mut self, timeout: Duration, mut matcher: F) -> Result<T, BjigError>
    where
        F: FnMut(&Packet) -> Option<Result<T, BjigError>>,
    {
        let packets = &mut self.packets;
        let state = &mut self.state;
        let wait = async {
            loop {
                tokio::select! {
                    biased;
                    received = packets.recv() => match received {
                        Ok(packet) => {
                            if let Some(outcome) = matcher(&packet) {
                                return outcome;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Reply wait fell behind; {skipped} packets skipped");
                            return Err(BjigError::RepliesMissed(skipped));
                        }
                        Err(RecvError::Closed) => {
                            return Err(BjigError::LinkLost("packet stream closed".to_string()));
                        }
                    },
                    changed = state.changed() => {
                        if changed.is_err() || *state.borrow_and_update() == ConnectionState::Disconnected {
                            return Err(BjigError::LinkLost("disconnected while waiting for a reply".to_string()));
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BjigError::TimedOut(timeout))?
    }

    /// Direct response to `cmd` from `device_id`. A non-zero result is `CommandRejected`.
    pub async fn downlink_response(
        &mut self,
        device_id: u64,
        cmd: u8,
        timeout: Duration,
    ) -> Result<DownlinkResponse, BjigError> {
        self.wait_for(timeout, |packet| match packet {
            Packet::DownlinkResponse(response) if response.cmd == cmd && response.device_id == device_id => {
                Some(check_result(response))
            }
            _ => None,
        })
        .await
    }

    /// Uplink from `device_id` carrying `sensor_id`.
    ///
    /// A negative downlink response to `cmd` from the same device arriving
    /// first aborts the wait with `CommandRejected`.
    pub async fn uplink(
        &mut self,
        device_id: u64,
        sensor_id: u16,
        cmd: u8,
        timeout: Duration,
    ) -> Result<UplinkNotification, BjigError> {
        self.wait_for(timeout, |packet| match packet {
            Packet::UplinkNotification(uplink) if uplink.device_id == device_id && uplink.sensor_id == sensor_id => {
                Some(Ok(uplink.clone()))
            }
            Packet::DownlinkResponse(response)
                if response.cmd == cmd && response.device_id == device_id && response.result != RESULT_SUCCESS =>
            {
                Some(Err(rejected(response)))
            }
            _ => None,
        })
        .await
    }

    /// Router response to JIG info command `cmd`.
    pub async fn jig_info_response(&mut self, cmd: u8, timeout: Duration) -> Result<JigInfoResponse, BjigError> {
        self.wait_for(timeout, |packet| match packet {
            Packet::JigInfoResponse(response) if response.cmd == cmd => Some(Ok(response.clone())),
            _ => None,
        })
        .await
    }

    /// Acknowledgement of one DFU block: the downlink response to `cmd` from
    /// `device_id` whose order field echoes `sequence`, returned whatever its
    /// result. Acks for other blocks are ignored.
    pub async fn block_ack(
        &mut self,
        device_id: u64,
        cmd: u8,
        sequence: u16,
        timeout: Duration,
    ) -> Result<DownlinkResponse, BjigError> {
        self.wait_for(timeout, |packet| match packet {
            Packet::DownlinkResponse(response)
                if response.cmd == cmd && response.device_id == device_id && response.order == sequence =>
            {
                Some(Ok(*response))
            }
            _ => None,
        })
        .await
    }

    /// Router answer to a firmware update request.
    pub async fn dfu_response(&mut self, timeout: Duration) -> Result<DfuResponse, BjigError> {
        self.wait_for(timeout, |packet| match packet {
            Packet::DfuResponse(response) => Some(Ok(*response)),
            _ => None,
        })
        .await
    }
}

fn check_result(response: &DownlinkResponse) -> Result<DownlinkResponse, BjigError> {
    if response.is_success() {
        Ok(*response)
    } else {
        Err(rejected(response))
    }
}

fn rejected(response: &DownlinkResponse) -> BjigError {
    BjigError::CommandRejected {
        cmd: response.cmd,
        result: response.result,
    }
}
