//! Segmentation: split an outgoing file into window-sized chunks with descending
//! segment indices (0 = last), and track an incoming file's progress.

use crate::protocol::SEGMENT_INDEX_LEN;

/// Highest number of segments a 16-bit index can address.
pub const MAX_SEGMENTS: u64 = u16::MAX as u64 + 1;

/// One FILE_DATA packet worth of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Descending index; 0 is sent last and ends the transfer.
    pub index: u16,
    pub offset: u64,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("window {window} leaves no room for data after the segment index")]
    WindowTooSmall { window: usize },
    #[error(
        "file of {file_size} bytes needs more than {max} segments of {chunk_size} bytes",
        max = MAX_SEGMENTS
    )]
    TooManySegments { file_size: u64, chunk_size: usize },
}

/// Data bytes per segment: the usable window minus the segment index prefix.
/// `peer_window` is what the receiver advertised, `tx_payload` what our send buffer holds.
pub fn chunk_size(peer_window: u16, tx_payload: usize) -> Result<usize, PlanError> {
    let window = usize::from(peer_window).min(tx_payload);
    if window <= SEGMENT_INDEX_LEN {
        return Err(PlanError::WindowTooSmall { window });
    }
    Ok(window - SEGMENT_INDEX_LEN)
}

/// Send order for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    file_size: u64,
    chunk_size: usize,
    count: u64,
}

impl SegmentPlan {
    /// `ceil(file_size / chunk_size)` segments. An exact multiple ends with a full-size
    /// segment 0; an empty file is a single empty segment 0 so the receiver still completes.
    pub fn new(file_size: u64, chunk_size: usize) -> Result<Self, PlanError> {
        if chunk_size == 0 {
            return Err(PlanError::WindowTooSmall {
                window: SEGMENT_INDEX_LEN,
            });
        }
        let count = file_size.div_ceil(chunk_size as u64).max(1);
        if count > MAX_SEGMENTS {
            return Err(PlanError::TooManySegments {
                file_size,
                chunk_size,
            });
        }
        Ok(Self {
            file_size,
            chunk_size,
            count,
        })
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Segments in send order: index `count - 1` first, index 0 last.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        (0..self.count).map(move |i| {
            let offset = i * self.chunk_size as u64;
            let index = (self.count - 1 - i) as u16;
            let len = if index > 0 {
                self.chunk_size
            } else {
                (self.file_size - offset) as usize
            };
            Segment { index, offset, len }
        })
    }
}

/// File being received between FILE_SEND_REQ and the segment-0 FILE_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFile {
    pub name: String,
    pub segments: u32,
    pub bytes: u64,
    last_index: Option<u16>,
}

impl InboundFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segments: 0,
            bytes: 0,
            last_index: None,
        }
    }

    /// Count an appended segment. Returns false when its index does not follow the
    /// previous one (the data is still appended in arrival order).
    pub fn record(&mut self, index: u16, len: usize) -> bool {
        let in_order = match self.last_index {
            Some(prev) => prev.checked_sub(1) == Some(index),
            None => true,
        };
        self.last_index = Some(index);
        self.segments += 1;
        self.bytes += len as u64;
        in_order
    }
}
