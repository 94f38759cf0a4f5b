//! Sensor firmware update (DFU) block builder.
//!
//! A firmware image is delivered as a series of downlink requests with command
//! code `0x12`. The `order` field of each request carries the block sequence
//! number:
//!
//! | Sequence          | Payload                                                     |
//! |-------------------|-------------------------------------------------------------|
//! | `0x0000`          | hardware id (`0x0000`) + 236 × `0xFF`                       |
//! | `0x0001`          | firmware length (u32 LE) + first 234 bytes, `0xFF`-padded   |
//! | `0x0002`, …       | next 238 bytes each, while more than 238 bytes remain       |
//! | `0xFFFF`          | everything left, possibly nothing                            |
//!
//! The final block is sent as-is. The image's own trailing 4 bytes are the
//! checksum the module verifies, so nothing is appended here.
//!
//! The router's own firmware travels differently: a type `0x03` request
//! announces the total length, and once the router answers ready the image is
//! streamed as raw chunks of at most 1024 bytes, each prefixed by its length
//! (u16 LE). See [`RouterFirmware`].

use crate::device_id::DeviceId;
use crate::error::BjigError;
use crate::message::{DfuRequest, DownlinkRequest};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;

/// Downlink command code for sensor DFU
pub const SENSOR_DFU_CMD: u8 = 0x12;

pub const HEADER_SEQUENCE: u16 = 0x0000;
pub const LENGTH_SEQUENCE: u16 = 0x0001;
pub const FIRST_CONTINUATION_SEQUENCE: u16 = 0x0002;
pub const FINAL_SEQUENCE: u16 = 0xFFFF;

/// Hardware id placed in the header block
pub const HARDWARE_ID: u16 = 0x0000;
/// Every non-final block payload is this long
pub const BLOCK_PAYLOAD_SIZE: usize = 238;
/// Firmware bytes carried by the length block
pub const LENGTH_BLOCK_DATA_SIZE: usize = BLOCK_PAYLOAD_SIZE - 4;
const HEADER_FILLER_SIZE: usize = BLOCK_PAYLOAD_SIZE - 2;
const FILLER: u8 = 0xFF;

/// Continuation sequences run from `0x0002` to `0xFFFE`
const MAX_CONTINUATION_BLOCKS: usize = (FINAL_SEQUENCE - FIRST_CONTINUATION_SEQUENCE) as usize;

/// Largest sensor image the sequence space can carry with a final block no
/// longer than a regular one
pub const MAX_SENSOR_FIRMWARE_SIZE: usize =
    LENGTH_BLOCK_DATA_SIZE + BLOCK_PAYLOAD_SIZE * MAX_CONTINUATION_BLOCKS + BLOCK_PAYLOAD_SIZE;

/// Firmware bytes per router DFU chunk
pub const ROUTER_CHUNK_SIZE: usize = 1024;
/// Pause after each router DFU chunk; the router does not acknowledge chunks
pub const ROUTER_CHUNK_INTERVAL: Duration = Duration::from_millis(10);

/// One block of a DFU transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuBlock {
    pub sequence: u16,
    pub payload: Bytes,
    /// Firmware bytes inside `payload`, excluding the length field and any padding
    pub firmware_bytes: usize,
}

impl DfuBlock {
    pub fn is_final(&self) -> bool {
        self.sequence == FINAL_SEQUENCE
    }
}

/// Ordered blocks for updating one module.
///
/// Built once from a firmware image and consumed block by block by the sender.
#[derive(Debug, Clone)]
pub struct DfuSession {
    device_id: DeviceId,
    sensor_id: u16,
    firmware_len: usize,
    blocks: Vec<DfuBlock>,
}

impl DfuSession {
    /// Split `firmware` into DFU blocks addressed to `device_id`/`sensor_id`.
    ///
    /// Fails with `InvalidParameter` for images over [`MAX_SENSOR_FIRMWARE_SIZE`].
    pub fn new(device_id: DeviceId, sensor_id: u16, firmware: &[u8]) -> Result<Self, BjigError> {
        if firmware.len() > MAX_SENSOR_FIRMWARE_SIZE {
            return Err(BjigError::InvalidParameter(format!(
                "firmware of {} bytes exceeds the {MAX_SENSOR_FIRMWARE_SIZE}-byte sensor DFU limit",
                firmware.len()
            )));
        }
        let mut blocks = Vec::new();

        let mut header = BytesMut::with_capacity(BLOCK_PAYLOAD_SIZE);
        header.put_u16_le(HARDWARE_ID);
        header.put_bytes(FILLER, HEADER_FILLER_SIZE);
        blocks.push(DfuBlock {
            sequence: HEADER_SEQUENCE,
            payload: header.freeze(),
            firmware_bytes: 0,
        });

        let first = &firmware[..firmware.len().min(LENGTH_BLOCK_DATA_SIZE)];
        let mut length_block = BytesMut::with_capacity(BLOCK_PAYLOAD_SIZE);
        length_block.put_u32_le(firmware.len() as u32);
        length_block.put_slice(first);
        length_block.put_bytes(FILLER, LENGTH_BLOCK_DATA_SIZE - first.len());
        blocks.push(DfuBlock {
            sequence: LENGTH_SEQUENCE,
            payload: length_block.freeze(),
            firmware_bytes: first.len(),
        });

        let mut offset = first.len();
        let mut sequence = FIRST_CONTINUATION_SEQUENCE;
        // The remainder that fits in one block is left for the final block
        while firmware.len() - offset > BLOCK_PAYLOAD_SIZE && sequence < FINAL_SEQUENCE {
            let chunk = &firmware[offset..offset + BLOCK_PAYLOAD_SIZE];
            blocks.push(DfuBlock {
                sequence,
                payload: Bytes::copy_from_slice(chunk),
                firmware_bytes: chunk.len(),
            });
            offset += chunk.len();
            sequence += 1;
        }

        let rest = &firmware[offset..];
        blocks.push(DfuBlock {
            sequence: FINAL_SEQUENCE,
            payload: Bytes::copy_from_slice(rest),
            firmware_bytes: rest.len(),
        });

        Ok(Self {
            device_id,
            sensor_id,
            firmware_len: firmware.len(),
            blocks,
        })
    }

    /// Like [`DfuSession::new`], parsing the device id first.
    pub fn build(device_id: &str, sensor_id: u16, firmware: &[u8]) -> Result<Self, BjigError> {
        Self::new(device_id.parse()?, sensor_id, firmware)
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn sensor_id(&self) -> u16 {
        self.sensor_id
    }

    pub fn firmware_len(&self) -> usize {
        self.firmware_len
    }

    pub fn blocks(&self) -> &[DfuBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Downlink request for `block`, stamped with the current time.
    pub fn request_for(&self, block: &DfuBlock) -> DownlinkRequest {
        DownlinkRequest::new(
            self.device_id.get(),
            self.sensor_id,
            SENSOR_DFU_CMD,
            block.sequence,
            block.payload.clone(),
        )
    }

    /// All requests in send order, each stamped when built.
    pub fn requests(&self) -> Vec<DownlinkRequest> {
        self.blocks.iter().map(|block| self.request_for(block)).collect()
    }
}

/// A router firmware image ready to stream.
#[derive(Debug, Clone)]
pub struct RouterFirmware {
    image: Bytes,
    total_length: u32,
}

impl RouterFirmware {
    /// Fails with `InvalidParameter` for an empty image or one whose length does not fit in 32 bits.
    pub fn new(image: impl Into<Bytes>) -> Result<Self, BjigError> {
        let image = image.into();
        if image.is_empty() {
            return Err(BjigError::InvalidParameter("router firmware image is empty".to_string()));
        }
        let total_length = u32::try_from(image.len()).map_err(|_| {
            BjigError::InvalidParameter(format!("router firmware of {} bytes exceeds 4 GiB", image.len()))
        })?;
        Ok(Self { image, total_length })
    }

    pub fn total_length(&self) -> u32 {
        self.total_length
    }

    pub fn chunk_count(&self) -> usize {
        self.image.len().div_ceil(ROUTER_CHUNK_SIZE)
    }

    /// The request announcing this image, stamped with the current time.
    pub fn request(&self) -> DfuRequest {
        DfuRequest::new(self.total_length)
    }

    /// Wire chunks in send order: length (u16 LE) followed by up to 1024 image bytes.
    pub fn chunks(&self) -> impl Iterator<Item = Bytes> + '_ {
        self.image.chunks(ROUTER_CHUNK_SIZE).map(|data| {
            let mut chunk = BytesMut::with_capacity(2 + data.len());
            chunk.put_u16_le(data.len() as u16);
            chunk.put_slice(data);
            chunk.freeze()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn session(len: usize) -> DfuSession {
        DfuSession::new(DeviceId(0x2468800203400004), 0x0121, &image(len)).unwrap()
    }

    #[test]
    fn empty_firmware_yields_three_blocks() {
        let s = session(0);
        let sequences: Vec<u16> = s.blocks().iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![0x0000, 0x0001, 0xFFFF]);
        assert!(s.blocks()[2].payload.is_empty());
        assert_eq!(&s.blocks()[1].payload[..4], &[0, 0, 0, 0]);
        assert!(s.blocks()[1].payload[4..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn header_block_layout() {
        let s = session(10);
        let header = &s.blocks()[0];
        assert_eq!(header.payload.len(), 238);
        assert_eq!(&header.payload[..2], &[0x00, 0x00]);
        assert!(header.payload[2..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn exactly_one_block_beyond_length_block_goes_to_final() {
        // 234 + 238: the remainder fits one block, so no continuation
        let s = session(234 + 238);
        let sequences: Vec<u16> = s.blocks().iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![0x0000, 0x0001, 0xFFFF]);
        assert_eq!(s.blocks()[2].payload.len(), 238);
    }

    #[test]
    fn continuation_blocks_are_full() {
        let s = session(234 + 238 * 2 + 5);
        let sequences: Vec<u16> = s.blocks().iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![0x0000, 0x0001, 0x0002, 0x0003, 0xFFFF]);
        assert_eq!(s.blocks()[2].payload.len(), 238);
        assert_eq!(s.blocks()[3].payload.len(), 238);
        assert_eq!(s.blocks()[4].payload.len(), 5);
        assert_eq!(&s.blocks()[1].payload[..4], &((234 + 238 * 2 + 5) as u32).to_le_bytes());
    }

    #[test]
    fn requests_carry_dfu_command_and_sequence() {
        let s = session(600);
        let requests = s.requests();
        assert_eq!(requests.len(), s.len());
        for (request, block) in requests.iter().zip(s.blocks()) {
            assert_eq!(request.cmd, SENSOR_DFU_CMD);
            assert_eq!(request.order, block.sequence);
            assert_eq!(request.sensor_id, 0x0121);
            assert_eq!(request.payload, block.payload);
        }
    }

    #[test]
    fn largest_image_keeps_final_block_regular() {
        let s = session(MAX_SENSOR_FIRMWARE_SIZE);
        let blocks = s.blocks();
        assert_eq!(blocks.len(), 2 + MAX_CONTINUATION_BLOCKS + 1);
        assert_eq!(blocks[blocks.len() - 2].sequence, 0xFFFE);
        assert_eq!(blocks[blocks.len() - 1].sequence, FINAL_SEQUENCE);
        assert_eq!(blocks[blocks.len() - 1].payload.len(), BLOCK_PAYLOAD_SIZE);
        for request in s.requests().iter().rev().take(3) {
            assert!(request.to_bytes().is_ok());
        }
    }

    #[test]
    fn image_past_the_sequence_space_is_rejected() {
        let firmware = image(MAX_SENSOR_FIRMWARE_SIZE + 1);
        assert!(matches!(
            DfuSession::new(DeviceId(1), 0x0121, &firmware),
            Err(BjigError::InvalidParameter(_))
        ));
    }

    #[test]
    fn router_chunks_carry_length_prefix() {
        let firmware = RouterFirmware::new(image(2 * 1024 + 100)).unwrap();
        assert_eq!(firmware.total_length(), 2148);
        assert_eq!(firmware.chunk_count(), 3);
        assert_eq!(firmware.request().total_length, 2148);

        let chunks: Vec<Bytes> = firmware.chunks().collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0][..2], &[0x00, 0x04]);
        assert_eq!(chunks[0].len(), 1026);
        assert_eq!(&chunks[2][..2], &[100, 0]);
        assert_eq!(chunks[2].len(), 102);

        let rebuilt: Vec<u8> = chunks.iter().flat_map(|c| c[2..].to_vec()).collect();
        assert_eq!(rebuilt, image(2148));
    }

    #[test]
    fn empty_router_image_is_rejected() {
        assert!(matches!(
            RouterFirmware::new(Bytes::new()),
            Err(BjigError::InvalidParameter(_))
        ));
    }

    #[test]
    fn build_rejects_bad_device_id() {
        assert!(matches!(
            DfuSession::build("not-a-device", 0x0121, &[1, 2, 3]),
            Err(BjigError::InvalidDeviceId(_))
        ));
    }
}
