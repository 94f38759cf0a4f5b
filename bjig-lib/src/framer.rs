//! Byte-stream framer.
//!
//! The serial link delivers bytes in arbitrary chunks. [`FrameBuffer`] keeps
//! them until a whole frame is present, then hands out decoded packets in
//! arrival order. Corrupt input is dropped up to the next byte that could start
//! a frame, so the stream never stalls.

use crate::error::BjigError;
use crate::message::Packet;
use crate::packet::{Direction, expected_frame_len, is_plausible_frame_start};
use bytes::{Bytes, BytesMut};
use tracing::warn;

/// Outcome of one [`FrameBuffer::next_frame`] call.
#[derive(Debug)]
pub enum FrameEvent {
    /// A complete frame and its decoded packet
    Packet { packet: Packet, raw: Bytes },
    /// Bytes that could not be decoded and were discarded
    Discarded { error: BjigError, dropped: Bytes },
}

#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    direction: Direction,
}

impl FrameBuffer {
    /// A framer for frames sent in `direction`: `RouterToHost` on the host side.
    pub fn new(direction: Direction) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            direction,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet framed
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the next frame from the front of the buffer.
    ///
    /// Returns `None` when more bytes are needed; nothing is consumed in that
    /// case.
    pub fn next_frame(&mut self) -> Option<FrameEvent> {
        if self.buf.is_empty() {
            return None;
        }

        let frame_len = match expected_frame_len(&self.buf, self.direction) {
            Ok(Some(len)) => len,
            Ok(None) => return None,
            Err(error) => return Some(self.resync(error)),
        };
        if self.buf.len() < frame_len {
            return None;
        }

        let raw = self.buf.split_to(frame_len).freeze();
        match Packet::from_bytes(raw.clone(), self.direction) {
            Ok(packet) => Some(FrameEvent::Packet { packet, raw }),
            Err(error) => {
                warn!(bytes = hex::encode(&raw), "Dropping undecodable frame: {error}");
                Some(FrameEvent::Discarded { error, dropped: raw })
            }
        }
    }

    /// Drain every complete frame currently buffered.
    pub fn drain_frames(&mut self) -> Vec<FrameEvent> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Drop the front byte and everything after it up to the next plausible frame start.
    fn resync(&mut self, error: BjigError) -> FrameEvent {
        let skip = (1..self.buf.len())
            .find(|&offset| is_plausible_frame_start(&self.buf[offset..], self.direction))
            .unwrap_or(self.buf.len());
        let dropped = self.buf.split_to(skip).freeze();
        warn!(
            bytes = hex::encode(&dropped),
            remaining = self.buf.len(),
            "Resynchronising after framing error: {error}"
        );
        FrameEvent::Discarded { error, dropped }
    }
}
