//! Common test utilities and shared imports

// Shared across test files; not every item is used by each one
#[allow(unused_imports)]
pub use bjig_lib::error::BjigError;
#[allow(unused_imports)]
pub use bjig_lib::message::{
    DfuRequest, DfuResponse, DownlinkRequest, DownlinkResponse, ErrorNotification, JigInfoRequest, JigInfoResponse,
    Packet, UplinkNotification,
};
#[allow(unused_imports)]
pub use bjig_lib::packet::Direction;
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;

use bjig_lib::link::LinkManager;
use bjig_lib::transport::{RouterEnd, memory_link};
use std::time::Duration;

/// Device id printed on the illuminance module used in captures
#[allow(dead_code)]
pub const DEVICE_ID: u64 = 0x2468800203400004;

#[allow(dead_code)]
pub const DEVICE_ID_STR: &str = "2468800203400004";

/// Decode hex string (whitespace allowed) to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    let compact: String = hex_data.split_whitespace().collect();
    Bytes::from(hex::decode(compact).expect("Failed to decode hex"))
}

/// Route library logs through the test harness; `RUST_LOG` picks the level
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A link manager wired to an in-memory router, not yet opened
#[allow(dead_code)]
pub fn memory_manager() -> (LinkManager, RouterEnd) {
    init_tracing();
    let (connector, router) = memory_link();
    (LinkManager::new(connector), router)
}

/// Poll `condition` until it holds or two seconds pass
#[allow(dead_code)]
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[allow(dead_code)]
pub fn downlink_response(device_id: u64, cmd: u8, result: u8) -> Packet {
    Packet::DownlinkResponse(DownlinkResponse {
        protocol_version: 1,
        unix_time: 1_700_000_000,
        device_id,
        sensor_id: 0,
        order: 0xFFFF,
        cmd,
        result,
    })
}

#[allow(dead_code)]
pub fn uplink(device_id: u64, sensor_id: u16, payload: &[u8]) -> Packet {
    Packet::UplinkNotification(UplinkNotification {
        protocol_version: 1,
        unix_time: 1_700_000_000,
        device_id,
        sensor_id,
        rssi: -60,
        reserved: 0,
        payload: Bytes::copy_from_slice(payload),
    })
}

#[allow(dead_code)]
pub fn dfu_response(result: u8) -> Packet {
    Packet::DfuResponse(DfuResponse {
        protocol_version: 1,
        unix_time: 1_700_000_000,
        result,
    })
}

/// DFU block acknowledgement echoing `sequence` in the order field
#[allow(dead_code)]
pub fn block_ack(device_id: u64, sequence: u16, result: u8) -> Packet {
    Packet::DownlinkResponse(DownlinkResponse {
        protocol_version: 1,
        unix_time: 1_700_000_000,
        device_id,
        sensor_id: 0x0121,
        order: sequence,
        cmd: 0x12,
        result,
    })
}

#[allow(dead_code)]
pub fn jig_info_response(cmd: u8, payload: &[u8]) -> Packet {
    Packet::JigInfoResponse(JigInfoResponse {
        protocol_version: 1,
        unix_time: 1_700_000_000,
        cmd,
        router_device_id: 0x0000_0000_0000_0001,
        payload: Bytes::copy_from_slice(payload),
    })
}

#[allow(dead_code)]
pub mod strategies {
    //! proptest strategies for well-formed packets in either direction

    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn payload(max: usize) -> impl Strategy<Value = Bytes> {
        vec(any::<u8>(), 0..=max).prop_map(Bytes::from)
    }

    /// JIG info responses whose payload length agrees with their command code
    fn jig_info_response() -> impl Strategy<Value = JigInfoResponse> {
        let shaped = prop_oneof![
            (Just(0x02u8), vec(any::<u8>(), 3)),
            ((0x03u8..=0x66), vec(any::<u8>(), 9)),
            vec(any::<u64>(), 0..8).prop_map(|ids| {
                let mut data = vec![ids.len() as u8];
                for id in ids {
                    data.extend_from_slice(&id.to_le_bytes());
                }
                (0xCFu8, data)
            }),
            (
                prop_oneof![Just(0x00u8), Just(0x01), Just(0x67), Just(0x6B), Just(0xD0), 0x6Cu8..=0xCE],
                vec(any::<u8>(), 1)
            ),
        ];
        (any::<u32>(), any::<u64>(), shaped).prop_map(|(unix_time, router_device_id, (cmd, data))| JigInfoResponse {
            protocol_version: 1,
            unix_time,
            cmd,
            router_device_id,
            payload: Bytes::from(data),
        })
    }

    /// Anything the router can send to the host
    pub fn router_packet() -> impl Strategy<Value = Packet> {
        prop_oneof![
            (any::<u32>(), any::<u64>(), any::<u16>(), any::<i8>(), any::<u16>(), payload(300)).prop_map(
                |(unix_time, device_id, sensor_id, rssi, reserved, payload)| {
                    Packet::UplinkNotification(UplinkNotification {
                        protocol_version: 1,
                        unix_time,
                        device_id,
                        sensor_id,
                        rssi,
                        reserved,
                        payload,
                    })
                }
            ),
            (any::<u32>(), any::<u64>(), any::<u16>(), any::<u16>(), any::<u8>(), any::<u8>()).prop_map(
                |(unix_time, device_id, sensor_id, order, cmd, result)| {
                    Packet::DownlinkResponse(DownlinkResponse {
                        protocol_version: 1,
                        unix_time,
                        device_id,
                        sensor_id,
                        order,
                        cmd,
                        result,
                    })
                }
            ),
            jig_info_response().prop_map(Packet::JigInfoResponse),
            (any::<u32>(), any::<u8>()).prop_map(|(unix_time, result)| {
                Packet::DfuResponse(DfuResponse {
                    protocol_version: 1,
                    unix_time,
                    result,
                })
            }),
            (any::<u32>(), any::<u8>()).prop_map(|(unix_time, reason)| {
                Packet::ErrorNotification(ErrorNotification {
                    protocol_version: 1,
                    unix_time,
                    reason,
                })
            }),
        ]
    }

    /// Anything the host can send to the router
    pub fn host_packet() -> impl Strategy<Value = Packet> {
        prop_oneof![
            (any::<u32>(), any::<u64>(), any::<u16>(), any::<u8>(), any::<u16>(), payload(300)).prop_map(
                |(unix_time, device_id, sensor_id, cmd, order, payload)| {
                    Packet::DownlinkRequest(DownlinkRequest {
                        protocol_version: 1,
                        unix_time,
                        device_id,
                        sensor_id,
                        cmd,
                        order,
                        payload,
                    })
                }
            ),
            (any::<u8>(), any::<u32>()).prop_map(|(cmd, unix_time)| Packet::JigInfoRequest(JigInfoRequest::at(cmd, unix_time))),
            (any::<u32>(), any::<u32>()).prop_map(|(unix_time, total_length)| {
                Packet::DfuRequest(DfuRequest {
                    protocol_version: 1,
                    unix_time,
                    total_length,
                })
            }),
        ]
    }
}
