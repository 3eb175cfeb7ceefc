//! fxfer wire protocol: message ids, NACK codes, field sizes, typed messages.

use crate::wire::{FrameEncodeError, PacketWriter};

/// Packet start marker, written little-endian (`EF BE AD DE` on the wire).
pub const PREAMBLE: u32 = 0xDEAD_BEEF;

pub const PREAMBLE_LEN: usize = 4;
pub const MSG_ID_LEN: usize = 1;
pub const LEN_FIELD_LEN: usize = 2;
pub const CRC_LEN: usize = 4;

/// Bytes before the payload: preamble, message id, payload length.
pub const HEADER_LEN: usize = PREAMBLE_LEN + MSG_ID_LEN + LEN_FIELD_LEN;
/// Header plus trailing CRC.
pub const PACKET_OVERHEAD: usize = HEADER_LEN + CRC_LEN;

/// Segment index prefix of every FILE_DATA payload.
pub const SEGMENT_INDEX_LEN: usize = 2;

/// Smallest window that still leaves room for one data byte per segment.
pub const MIN_WINDOW: u16 = SEGMENT_INDEX_LEN as u16 + 1;

/// Message kinds. Discriminants are the on-wire ids (1..=11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    HandshakeReq = 1,
    HandshakeRes = 2,
    FilesListReq = 3,
    FilesListRes = 4,
    FileHashReq = 5,
    FileHashRes = 6,
    FileSendReq = 7,
    FileReceiveReq = 8,
    FileData = 9,
    Ack = 10,
    Nack = 11,
}

impl MessageId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 11;

    pub fn from_byte(id: u8) -> Option<Self> {
        let kind = match id {
            1 => Self::HandshakeReq,
            2 => Self::HandshakeRes,
            3 => Self::FilesListReq,
            4 => Self::FilesListRes,
            5 => Self::FileHashReq,
            6 => Self::FileHashRes,
            7 => Self::FileSendReq,
            8 => Self::FileReceiveReq,
            9 => Self::FileData,
            10 => Self::Ack,
            11 => Self::Nack,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Error code carried by a NACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NackCode {
    NoHandshake,
    WrongCrc,
    UnexpectedPacket,
    BadRequest,
    NoMemory,
    /// A code this implementation does not know; kept so it can be logged.
    Other(u8),
}

impl NackCode {
    pub fn from_byte(code: u8) -> Self {
        match code {
            1 => Self::NoHandshake,
            2 => Self::WrongCrc,
            3 => Self::UnexpectedPacket,
            4 => Self::BadRequest,
            5 => Self::NoMemory,
            other => Self::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::NoHandshake => 1,
            Self::WrongCrc => 2,
            Self::UnexpectedPacket => 3,
            Self::BadRequest => 4,
            Self::NoMemory => 5,
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for NackCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoHandshake => f.write_str("no handshake"),
            Self::WrongCrc => f.write_str("wrong crc"),
            Self::UnexpectedPacket => f.write_str("unexpected packet"),
            Self::BadRequest => f.write_str("bad request"),
            Self::NoMemory => f.write_str("no memory"),
            Self::Other(code) => write!(f, "unknown error {}", code),
        }
    }
}

/// A decoded message. Borrows from the receive buffer; dropped before the next packet is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    HandshakeReq { window: u16 },
    HandshakeRes { window: u16 },
    FilesListReq,
    FilesListRes(FileList),
    FileHashReq { name: &'a str },
    FileHashRes { hash: u32 },
    FileSendReq { name: &'a str },
    FileReceiveReq,
    FileData { segment: u16, data: &'a [u8] },
    Ack,
    Nack { code: NackCode },
}

/// Payload does not match the layout its message id requires.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{kind:?} payload too short: {len} bytes, need {need}")]
    TooShort {
        kind: MessageId,
        len: usize,
        need: usize,
    },
    #[error("file name is not valid utf-8")]
    BadName,
    #[error("file list declares {declared} names, found {found}")]
    ListCount { declared: usize, found: usize },
}

impl<'a> Message<'a> {
    /// Interpret the payload of a packet whose id has already been validated.
    pub fn decode(kind: MessageId, payload: &'a [u8]) -> Result<Self, DecodeError> {
        let msg = match kind {
            MessageId::HandshakeReq => Self::HandshakeReq {
                window: read_u16(kind, payload)?,
            },
            MessageId::HandshakeRes => Self::HandshakeRes {
                window: read_u16(kind, payload)?,
            },
            MessageId::FilesListReq => Self::FilesListReq,
            MessageId::FilesListRes => Self::FilesListRes(FileList::decode(payload)?),
            MessageId::FileHashReq => Self::FileHashReq {
                name: read_name(payload)?,
            },
            MessageId::FileHashRes => {
                let bytes = need(kind, payload, 4)?;
                Self::FileHashRes {
                    hash: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                }
            }
            MessageId::FileSendReq => Self::FileSendReq {
                name: read_name(payload)?,
            },
            MessageId::FileReceiveReq => Self::FileReceiveReq,
            MessageId::FileData => Self::FileData {
                segment: read_u16(kind, payload)?,
                data: &payload[SEGMENT_INDEX_LEN..],
            },
            MessageId::Ack => Self::Ack,
            MessageId::Nack => Self::Nack {
                code: NackCode::from_byte(need(kind, payload, 1)?[0]),
            },
        };
        Ok(msg)
    }

    pub fn id(&self) -> MessageId {
        match self {
            Self::HandshakeReq { .. } => MessageId::HandshakeReq,
            Self::HandshakeRes { .. } => MessageId::HandshakeRes,
            Self::FilesListReq => MessageId::FilesListReq,
            Self::FilesListRes(_) => MessageId::FilesListRes,
            Self::FileHashReq { .. } => MessageId::FileHashReq,
            Self::FileHashRes { .. } => MessageId::FileHashRes,
            Self::FileSendReq { .. } => MessageId::FileSendReq,
            Self::FileReceiveReq => MessageId::FileReceiveReq,
            Self::FileData { .. } => MessageId::FileData,
            Self::Ack => MessageId::Ack,
            Self::Nack { .. } => MessageId::Nack,
        }
    }

    /// Write this message's payload after `PacketWriter::begin`.
    pub fn write_payload(&self, out: &mut PacketWriter<'_>) -> Result<(), FrameEncodeError> {
        match self {
            Self::HandshakeReq { window } | Self::HandshakeRes { window } => {
                out.push(&window.to_le_bytes())
            }
            Self::FilesListReq | Self::FileReceiveReq | Self::Ack => Ok(()),
            Self::FilesListRes(list) => list.write_to(out),
            Self::FileHashReq { name } | Self::FileSendReq { name } => {
                out.push(name.as_bytes())?;
                out.push(&[0])
            }
            Self::FileHashRes { hash } => out.push(&hash.to_le_bytes()),
            Self::FileData { segment, data } => {
                out.push(&segment.to_le_bytes())?;
                out.push(data)
            }
            Self::Nack { code } => out.push(&[code.as_byte()]),
        }
    }
}

fn need(kind: MessageId, payload: &[u8], n: usize) -> Result<&[u8], DecodeError> {
    if payload.len() < n {
        return Err(DecodeError::TooShort {
            kind,
            len: payload.len(),
            need: n,
        });
    }
    Ok(&payload[..n])
}

fn read_u16(kind: MessageId, payload: &[u8]) -> Result<u16, DecodeError> {
    let b = need(kind, payload, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

/// File names travel NUL-terminated; a missing terminator is tolerated.
fn read_name(payload: &[u8]) -> Result<&str, DecodeError> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).map_err(|_| DecodeError::BadName)
}

/// Remote directory listing: `[count:1][name\0]*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileList {
    pub names: Vec<String>,
}

impl FileList {
    /// Keep as many names (in order) as fit in `capacity` payload bytes. At most 255 names.
    pub fn pack<I, S>(names: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut used = 1usize;
        let mut kept = Vec::new();
        if capacity == 0 {
            return Self { names: kept };
        }
        for name in names {
            let name = name.into();
            let cost = name.len() + 1;
            if used + cost > capacity || kept.len() == usize::from(u8::MAX) {
                break;
            }
            used += cost;
            kept.push(name);
        }
        Self { names: kept }
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.names.iter().map(|n| n.len() + 1).sum::<usize>()
    }

    pub fn write_to(&self, out: &mut PacketWriter<'_>) -> Result<(), FrameEncodeError> {
        out.push(&[self.names.len() as u8])?;
        for name in &self.names {
            out.push(name.as_bytes())?;
            out.push(&[0])?;
        }
        Ok(())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let declared = usize::from(need(MessageId::FilesListRes, payload, 1)?[0]);
        let names = payload[1..]
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .take(declared)
            .map(|s| {
                std::str::from_utf8(s)
                    .map(str::to_owned)
                    .map_err(|_| DecodeError::BadName)
            })
            .collect::<Result<Vec<_>, _>>()?;
        if names.len() != declared {
            return Err(DecodeError::ListCount {
                declared,
                found: names.len(),
            });
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
