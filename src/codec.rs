//! Length-prefixed framing of chunks into logical units.
//!
//! Encoding is split in two steps so callers can adjust the first chunk
//! between them: [`frame_chunks`] prefixes every chunk with its own length,
//! then [`seal_unit`] prefixes the first chunk with the total byte length of
//! the unit. [`encode_unit`] runs both.
//!
//! Decoding is incremental: a [`UnitDecoder`] accepts the carrier's byte
//! stream one segment at a time, reports [`Decoded::Incomplete`] until a
//! whole unit has arrived, and then hands back its chunks.
use tracing::trace;

use crate::{
    error::MalformedFraming,
    segment::{Segment, SegmentBatch},
    specification::{CHUNK_MAX_LEN, LEN_FIELD_LEN, UNIT_MAX_LEN},
};

/// Prefixes every chunk in `batch` with its 2-byte big-endian length.
pub fn frame_chunks(batch: &mut SegmentBatch) -> Result<(), MalformedFraming> {
    if batch.is_empty() {
        return Err(MalformedFraming::EmptyBatch);
    }
    for chunk in batch.iter_mut() {
        let len = chunk.len();
        if len > CHUNK_MAX_LEN {
            return Err(MalformedFraming::ChunkTooLong { len });
        }
        chunk.prepend_u16(len as u16);
    }
    Ok(())
}

/// Prefixes the first chunk in `batch` with the total byte length of the
/// whole batch.
pub fn seal_unit(batch: &mut SegmentBatch) -> Result<(), MalformedFraming> {
    let len: usize = batch.iter().map(Segment::len).sum();
    if len == 0 {
        return Err(MalformedFraming::EmptyUnit);
    }
    if len > UNIT_MAX_LEN {
        return Err(MalformedFraming::UnitTooLong { len });
    }
    match batch.first_mut() {
        Some(first) => first.prepend_u16(len as u16),
        None => return Err(MalformedFraming::EmptyBatch),
    }
    trace!(len, chunks = batch.len(), "sealed unit");
    Ok(())
}

/// Frames every chunk and seals the batch into a single logical unit.
pub fn encode_unit(mut batch: SegmentBatch) -> Result<SegmentBatch, MalformedFraming> {
    frame_chunks(&mut batch)?;
    seal_unit(&mut batch)?;
    Ok(batch)
}

/// Splits the body of a unit (everything after its total length field) into
/// its chunks.
pub fn split_chunks(body: &[u8]) -> Result<SegmentBatch, MalformedFraming> {
    let mut chunks = SegmentBatch::new();
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < LEN_FIELD_LEN {
            return Err(MalformedFraming::MissingChunkLength {
                remaining: rest.len(),
            });
        }
        let declared = u16::from_be_bytes([rest[0], rest[1]]);
        rest = &rest[LEN_FIELD_LEN..];
        if rest.len() < declared as usize {
            return Err(MalformedFraming::TruncatedChunk {
                declared,
                available: rest.len(),
            });
        }
        let (chunk, tail) = rest.split_at(declared as usize);
        chunks.push(Segment::from(chunk));
        rest = tail;
    }
    Ok(chunks)
}

/// Result of feeding bytes to a [`UnitDecoder`].
#[derive(Debug, Eq, PartialEq)]
pub enum Decoded {
    /// More bytes are needed to complete the current unit.
    Incomplete,
    /// A complete unit, as its chunks.
    Unit(SegmentBatch),
}

/// Incremental decoder for logical units.
///
/// State Transition Diagram:
///
/// ```text
///
///         |
///         V
///   +--> Idle
///   |     |
///   |     V
///   |   ReadTotal --+
///   |     |   ^     |
///   |     |   +-----+
///   |     V
///   +-- ReadBody --+
///         ^        |
///         +--------+
/// ```
#[derive(Debug)]
pub struct UnitDecoder {
    state: UnitReadState,
    acc: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UnitReadState {
    Idle,
    ReadTotal { n: usize, buf: [u8; LEN_FIELD_LEN] },
    ReadBody { total: usize },
}

impl UnitDecoder {
    /// Creates a decoder waiting for the start of a unit.
    pub fn new() -> Self {
        Self {
            state: UnitReadState::Idle,
            acc: Vec::new(),
        }
    }

    /// Returns `true` if no part of a unit has been consumed yet.
    pub fn is_idle(&self) -> bool {
        self.state == UnitReadState::Idle
    }

    /// Consumes bytes of the current unit from the front of `segment`.
    ///
    /// Bytes after the end of a completed unit are left in `segment`.
    pub fn decode(&mut self, segment: &mut Segment) -> Result<Decoded, MalformedFraming> {
        loop {
            match self.state {
                UnitReadState::Idle => {
                    if segment.is_empty() {
                        return Ok(Decoded::Incomplete);
                    }
                    self.state = UnitReadState::ReadTotal {
                        n: 0,
                        buf: [0; LEN_FIELD_LEN],
                    };
                }
                UnitReadState::ReadTotal { mut n, mut buf } => {
                    let k = core::cmp::min(LEN_FIELD_LEN - n, segment.len());
                    buf[n..n + k].copy_from_slice(segment.peek(k));
                    segment.advance(k);
                    n += k;
                    if n < LEN_FIELD_LEN {
                        self.state = UnitReadState::ReadTotal { n, buf };
                        return Ok(Decoded::Incomplete);
                    }
                    let total = u16::from_be_bytes(buf) as usize;
                    if total == 0 {
                        self.reset();
                        return Err(MalformedFraming::EmptyUnit);
                    }
                    self.acc.clear();
                    self.acc.reserve(total);
                    self.state = UnitReadState::ReadBody { total };
                }
                UnitReadState::ReadBody { total } => {
                    let k = core::cmp::min(total - self.acc.len(), segment.len());
                    self.acc.extend_from_slice(segment.peek(k));
                    segment.advance(k);
                    if self.acc.len() < total {
                        return Ok(Decoded::Incomplete);
                    }
                    let chunks = split_chunks(&self.acc);
                    self.reset();
                    let chunks = chunks?;
                    trace!(total, chunks = chunks.len(), "decoded unit");
                    return Ok(Decoded::Unit(chunks));
                }
            }
        }
    }

    fn reset(&mut self) {
        self.state = UnitReadState::Idle;
        self.acc.clear();
    }
}

impl Default for UnitDecoder {
    fn default() -> Self {
        Self::new()
    }
}
