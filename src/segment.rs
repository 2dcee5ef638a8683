//! Owned byte segments and the batches they travel in.
use core::fmt::{Debug, Formatter};
use std::io::{self, ErrorKind, Write};

/// A growable, owned byte buffer with a read cursor at its head.
///
/// Consuming bytes from the front only moves the cursor, and the bytes in
/// front of the cursor are reused as headroom by [`prepend`](Segment::prepend),
/// so length prefixes can be added without moving the payload.
#[derive(Clone, Default)]
pub struct Segment {
    buf: Vec<u8>,
    head: usize,
}

/// An ordered sequence of segments produced or consumed together.
pub type SegmentBatch = Vec<Segment>;

impl Segment {
    /// Creates an empty segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty segment that can take `headroom` prepended bytes
    /// without reallocating.
    pub fn with_headroom(headroom: usize, capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(headroom + capacity);
        buf.resize(headroom, 0);
        Self {
            buf,
            head: headroom,
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    /// Returns `true` if no unread bytes are left.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The unread bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    /// Mutable access to the unread bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..]
    }

    /// Returns at most `n` unread bytes without consuming them.
    pub fn peek(&self, n: usize) -> &[u8] {
        let end = core::cmp::min(self.buf.len(), self.head + n);
        &self.buf[self.head..end]
    }

    /// Consumes `n` bytes from the front. Consuming more than
    /// [`len`](Segment::len) empties the segment.
    pub fn advance(&mut self, n: usize) {
        self.head = core::cmp::min(self.buf.len(), self.head + n);
    }

    /// Puts `bytes` in front of the unread bytes.
    pub fn prepend(&mut self, bytes: &[u8]) {
        if self.head >= bytes.len() {
            self.head -= bytes.len();
            self.buf[self.head..self.head + bytes.len()].copy_from_slice(bytes);
        } else {
            self.buf.splice(self.head..self.head, bytes.iter().copied());
        }
    }

    /// Puts a big-endian `u16` in front of the unread bytes.
    pub fn prepend_u16(&mut self, n: u16) {
        self.prepend(&n.to_be_bytes());
    }

    /// Appends `bytes` after the unread bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Splits off the first `n` unread bytes into a new segment.
    pub fn split_to(&mut self, n: usize) -> Segment {
        let n = core::cmp::min(n, self.len());
        let front = Segment::from(&self.buf[self.head..self.head + n]);
        self.head += n;
        front
    }

    /// Takes every unread byte, leaving this segment empty.
    pub fn take(&mut self) -> Segment {
        let len = self.len();
        self.split_to(len)
    }

    /// Drops the contents and frees the allocation.
    pub fn release(&mut self) {
        self.buf = Vec::new();
        self.head = 0;
    }

    /// Converts into a vector holding only the unread bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.head > 0 {
            self.buf.drain(..self.head);
        }
        self.buf
    }
}

impl From<Vec<u8>> for Segment {
    fn from(buf: Vec<u8>) -> Self {
        Self { buf, head: 0 }
    }
}

impl From<&[u8]> for Segment {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Segment {}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment").field("len", &self.len()).finish()
    }
}

/// Total number of unread bytes in a batch.
pub fn batch_len(batch: &[Segment]) -> usize {
    batch.iter().map(Segment::len).sum()
}

/// Decompose `io::Result<usize>`.
///
/// Keep the number of bytes successfully written, turn EOF (i.e. Ok(0)) into
/// `WriteZero` and return any other error.
macro_rules! handle_write_result {
    ($io_result:expr) => {
        match $io_result {
            Ok(n) if n > 0 => n,
            Ok(_) => return Err(ErrorKind::WriteZero.into()),
            Err(e) => return Err(e),
        }
    };
}

/// Bytes waiting to be written to the carrier, in order.
#[derive(Debug, Default)]
pub(crate) struct WireBuf {
    buf: Vec<u8>,
    n: usize,
}

impl WireBuf {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        if self.is_empty() {
            self.buf.clear();
            self.n = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn push_batch(&mut self, batch: SegmentBatch) {
        for segment in batch {
            self.push(segment.as_slice());
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.n == self.buf.len()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.n
    }

    pub(crate) fn clear(&mut self) {
        self.buf = Vec::new();
        self.n = 0;
    }

    /// Writes as much as `wire` accepts, returning the number of bytes
    /// written. `WouldBlock` is only returned when nothing was written.
    pub(crate) fn write_to(&mut self, wire: &mut dyn Write) -> io::Result<usize> {
        let mut written = 0;
        while !self.is_empty() {
            let result = wire.write(&self.buf[self.n..]);
            let n = match result {
                Err(e) if e.kind() == ErrorKind::WouldBlock && written > 0 => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                result => handle_write_result!(result),
            };
            self.n += n;
            written += n;
        }
        Ok(written)
    }
}
