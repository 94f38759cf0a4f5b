//! Encode/decode round trips for every packet type

mod common;

use bjig_lib::constants::MAX_PAYLOAD_SIZE;
use common::strategies::{host_packet, router_packet};
use common::*;
use proptest::prelude::*;

proptest! {
    #[test]
    fn router_packets_round_trip(packet in router_packet()) {
        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::from_bytes(bytes, Direction::RouterToHost).unwrap();
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn host_packets_round_trip(packet in host_packet()) {
        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::from_bytes(bytes, Direction::HostToRouter).unwrap();
        prop_assert_eq!(decoded, packet);
    }

    /// Length-prefixed frames always declare exactly the bytes that follow the header
    #[test]
    fn data_length_matches_payload(packet in prop_oneof![router_packet(), host_packet()]) {
        let bytes = packet.to_bytes().unwrap();
        let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        match &packet {
            Packet::DownlinkRequest(request) => {
                prop_assert_eq!(declared, request.payload.len());
                prop_assert_eq!(bytes.len(), 21 + declared);
            }
            Packet::UplinkNotification(uplink) => {
                prop_assert_eq!(declared, uplink.payload.len());
                prop_assert_eq!(bytes.len(), 21 + declared);
            }
            _ => {}
        }
    }
}

#[test]
fn oversized_payload_is_rejected_on_encode() {
    for len in [70_000, MAX_PAYLOAD_SIZE + 1] {
        let request = DownlinkRequest::new(1, 0, 0, 0xFFFF, Bytes::from(vec![0u8; len]));
        assert!(matches!(request.to_bytes(), Err(BjigError::MalformedPacket(_))), "{len}");
    }
    let largest = DownlinkRequest::new(1, 0, 0, 0xFFFF, Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE]));
    assert_eq!(largest.to_bytes().unwrap().len(), 21 + MAX_PAYLOAD_SIZE);
}

#[test]
fn jig_info_request_round_trip_keeps_both_clocks() {
    let request = JigInfoRequest::at(0xD0, 1_700_000_000);
    let decoded = Packet::from_bytes(request.to_bytes(), Direction::HostToRouter).unwrap();
    let Packet::JigInfoRequest(decoded) = decoded else {
        panic!("expected a JIG info request");
    };
    assert_eq!(decoded.local_time - decoded.unix_time, 9 * 3600);
    assert_eq!(decoded, request);
}
