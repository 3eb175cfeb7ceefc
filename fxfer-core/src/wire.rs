//! Framing: `[preamble:4][msg_id:1][len:2][payload][crc32:4]`, all little-endian.
//! CRC32 covers preamble through payload.

use std::io::{self, Read};

use crate::integrity;
use crate::protocol::{
    Message, MessageId, CRC_LEN, HEADER_LEN, LEN_FIELD_LEN, MSG_ID_LEN, PACKET_OVERHEAD, PREAMBLE,
    PREAMBLE_LEN,
};

const LEN_OFFSET: usize = PREAMBLE_LEN + MSG_ID_LEN;

/// Fixed-capacity packet buffer. Every write checks capacity; nothing is ever truncated.
#[derive(Debug)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl FrameBuffer {
    /// Buffer large enough for one packet carrying up to `payload` bytes.
    pub fn for_payload(payload: usize) -> Self {
        let capacity = PACKET_OVERHEAD + payload;
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload a packet built in this buffer can carry.
    pub fn payload_capacity(&self) -> usize {
        self.capacity - PACKET_OVERHEAD
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn extend(&mut self, data: &[u8]) -> Result<(), FrameEncodeError> {
        self.check(data.len())?;
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    /// Grow by `len` bytes and let `fill` write them. On failure the buffer is left as it was.
    pub fn extend_with<F>(&mut self, len: usize, fill: F) -> Result<(), FrameEncodeError>
    where
        F: FnOnce(&mut [u8]) -> io::Result<()>,
    {
        self.check(len)?;
        let start = self.bytes.len();
        self.bytes.resize(start + len, 0);
        if let Err(e) = fill(&mut self.bytes[start..]) {
            self.bytes.truncate(start);
            return Err(FrameEncodeError::Fill(e));
        }
        Ok(())
    }

    /// Append exactly `len` bytes read from `reader`.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R, len: usize) -> Result<(), FrameEncodeError> {
        self.extend_with(len, |dst| reader.read_exact(dst))
    }

    fn check(&self, additional: usize) -> Result<(), FrameEncodeError> {
        if additional > self.remaining() {
            return Err(FrameEncodeError::TooLarge {
                needed: self.bytes.len() + additional,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Error building a packet (capacity exceeded or payload source failed).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large: {needed} bytes, capacity {capacity}")]
    TooLarge { needed: usize, capacity: usize },
    #[error("payload source failed: {0}")]
    Fill(#[source] io::Error),
}

/// Builds one packet in a `FrameBuffer`: header first, payload in pieces, CRC last.
pub struct PacketWriter<'a> {
    buf: &'a mut FrameBuffer,
}

impl<'a> PacketWriter<'a> {
    /// Reset the buffer and write preamble and message id. The length field is filled by `finish`.
    pub fn begin(buf: &'a mut FrameBuffer, id: MessageId) -> Result<Self, FrameEncodeError> {
        buf.clear();
        buf.extend(&PREAMBLE.to_le_bytes())?;
        buf.extend(&[id.as_byte()])?;
        buf.extend(&[0u8; LEN_FIELD_LEN])?;
        Ok(Self { buf })
    }

    /// Payload bytes still available, keeping room for the CRC.
    pub fn remaining_payload(&self) -> usize {
        self.buf.remaining().saturating_sub(CRC_LEN)
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_LEN
    }

    pub fn push(&mut self, data: &[u8]) -> Result<(), FrameEncodeError> {
        self.reserve(data.len())?;
        self.buf.extend(data)
    }

    /// Append `len` payload bytes produced in place by `fill` (e.g. a file chunk read from storage).
    pub fn push_with<F>(&mut self, len: usize, fill: F) -> Result<(), FrameEncodeError>
    where
        F: FnOnce(&mut [u8]) -> io::Result<()>,
    {
        self.reserve(len)?;
        self.buf.extend_with(len, fill)
    }

    /// Write the payload length and the CRC over everything before it.
    pub fn finish(self) -> Result<&'a [u8], FrameEncodeError> {
        let payload_len = self.payload_len();
        let len = u16::try_from(payload_len).map_err(|_| FrameEncodeError::TooLarge {
            needed: payload_len,
            capacity: usize::from(u16::MAX),
        })?;
        self.buf.bytes[LEN_OFFSET..HEADER_LEN].copy_from_slice(&len.to_le_bytes());
        let crc = integrity::checksum(self.buf.as_slice());
        self.buf.extend(&crc.to_le_bytes())?;
        let buf: &'a FrameBuffer = self.buf;
        Ok(buf.as_slice())
    }

    fn reserve(&self, len: usize) -> Result<(), FrameEncodeError> {
        if len > self.remaining_payload() {
            return Err(FrameEncodeError::TooLarge {
                needed: self.buf.len() + len + CRC_LEN,
                capacity: self.buf.capacity(),
            });
        }
        Ok(())
    }
}

/// Encode a whole message into `buf`. Returns the packet bytes.
pub fn encode_packet<'a>(
    buf: &'a mut FrameBuffer,
    msg: &Message<'_>,
) -> Result<&'a [u8], FrameEncodeError> {
    let mut w = PacketWriter::begin(buf, msg.id())?;
    msg.write_payload(&mut w)?;
    w.finish()
}

/// Payload length declared in a header (`bytes` must hold at least `HEADER_LEN`).
pub fn declared_len(header: &[u8]) -> usize {
    usize::from(u16::from_le_bytes([header[LEN_OFFSET], header[LEN_OFFSET + 1]]))
}

/// Check preamble, declared length and CRC of one complete packet.
pub fn verify_packet(bytes: &[u8]) -> bool {
    if bytes.len() < PACKET_OVERHEAD || bytes[..PREAMBLE_LEN] != PREAMBLE.to_le_bytes() {
        return false;
    }
    if declared_len(bytes) != bytes.len() - PACKET_OVERHEAD {
        return false;
    }
    let (body, crc) = bytes.split_at(bytes.len() - CRC_LEN);
    integrity::verify(body, u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]))
}

/// Raw message id and payload of a packet that passed `verify_packet`.
pub fn split_packet(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if !verify_packet(bytes) {
        return None;
    }
    Some((bytes[PREAMBLE_LEN], &bytes[HEADER_LEN..bytes.len() - CRC_LEN]))
}
