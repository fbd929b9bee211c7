//! Segment Assembler
//!
//! Accumulates chunk bytes and cuts them into numbered segments. A segment
//! is cut as soon as the buffer reaches the part size, taking the whole
//! buffer with it, so chunks are never split and every non-final segment is
//! at least `part_size` bytes. Pure buffering, no I/O.

use super::types::Segment;
use bytes::BytesMut;

/// Result of [`SegmentAssembler::append`].
#[derive(Debug, PartialEq, Eq)]
pub enum Assembled {
    Ready(Segment),
    Pending,
}

/// Result of [`SegmentAssembler::flush_partial`].
#[derive(Debug, PartialEq, Eq)]
pub enum Flushed {
    Ready(Segment),
    Empty,
}

#[derive(Debug)]
pub struct SegmentAssembler {
    part_size: u64,
    buffer: BytesMut,
    next_part_number: u32,
}

impl SegmentAssembler {
    /// `part_size` must be non-zero; [`UploadSession`](super::UploadSession)
    /// guarantees it.
    pub fn new(part_size: u64) -> Self {
        debug_assert!(part_size > 0);
        Self {
            part_size,
            buffer: BytesMut::new(),
            next_part_number: 1,
        }
    }

    /// Bytes waiting for the next segment.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of segments emitted so far.
    pub fn emitted(&self) -> u32 {
        self.next_part_number - 1
    }

    pub fn append(&mut self, chunk: &[u8]) -> Assembled {
        self.buffer.extend_from_slice(chunk);
        if (self.buffer.len() as u64) < self.part_size {
            return Assembled::Pending;
        }
        Assembled::Ready(self.cut())
    }

    /// Emit whatever remains, even below the part size. Only the final
    /// segment of an upload may be short.
    pub fn flush_partial(&mut self) -> Flushed {
        if self.buffer.is_empty() {
            return Flushed::Empty;
        }
        Flushed::Ready(self.cut())
    }

    fn cut(&mut self) -> Segment {
        let segment = Segment {
            part_number: self.next_part_number,
            bytes: self.buffer.split().freeze(),
        };
        self.next_part_number += 1;
        segment
    }
}
