use core::fmt::{Debug, Formatter};
use std::{
    collections::VecDeque,
    io::{self, BufRead, ErrorKind, Read, Write},
    sync::Arc,
};

use rand::rngs::StdRng;
use tracing::{debug, trace, warn};

use crate::{
    binding::{ConnectionBinding, Role},
    codec::{Decoded, UnitDecoder},
    config::{Config, DecoyRanges},
    decoy::{send_decoys, validate},
    error::{Error, MalformedFraming},
    handshake::{is_handshake_record, may_be_handshake},
    padding::remove_padding,
    segment::{Segment, SegmentBatch, WireBuf},
    signal::{FirstRoundSignal, Handoff, HandoffReceiver},
    specification::{
        FRAMED_DATA_OFFSET, HANDSHAKE_PREFIX_LEN, LEN_FIELD_LEN, READ_BUF_LEN,
        REQUEST_HEADER_LEN_FIELD, RESPONSE_HEADER_PLACEHOLDER,
    },
};

/// A liveness hook, notified whenever inbound data arrives.
///
/// Typically used to push back an idle timeout.
pub trait ActivityTracker: Send + Sync {
    /// Called once per non-empty inbound segment.
    fn update(&self);
}

impl<F: Fn() + Send + Sync> ActivityTracker for F {
    fn update(&self) {
        self()
    }
}

/// The inbound half of a connection.
///
/// The read engine reassembles logical units from the carrier, strips padding,
/// validates decoy bursts and forwards the application bytes upward. It also
/// owns the outbound bytes of the first round (the responder's first decoy
/// burst, the initiator's handoff queue), because those are triggered by what
/// it reads.
///
/// State Transition Diagram:
///
/// ```text
///
///            |
///            V
///    AwaitingFirstUnit -----------------------+
///            |                                |
///            | (initiator)                    | (responder)
///            V                                |
///    ValidatingFirstDecoys                    |
///            |                                |
///            V                                |
///    Streaming { awaiting_decoy } <-----------+
///        |        ^         |
///        +--------+         +------> Eof
///
///    (any state) --- fatal error ---> Terminated
/// ```
pub struct ReadEngine {
    role: Role,
    config: Arc<Config>,
    binding: Arc<ConnectionBinding>,
    state: ReadState,
    decoder: UnitDecoder,
    lookahead: Segment,
    placeholder_read: usize,
    first_burst_queued: bool,
    decoded: VecDeque<Segment>,
    outbound: WireBuf,
    request_header: Option<Segment>,
    signal: Option<FirstRoundSignal>,
    fire_on_flush: bool,
    handoff: HandoffReceiver,
    handoff_pending: bool,
    activity: Option<Arc<dyn ActivityTracker>>,
    rng: StdRng,
    buf: Box<[u8]>,
    error: Option<Error>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ReadState {
    AwaitingFirstUnit,
    ValidatingFirstDecoys,
    Streaming { awaiting_decoy: bool },
    Eof,
    Terminated,
}

impl ReadEngine {
    pub(crate) fn new(
        role: Role,
        config: Arc<Config>,
        binding: Arc<ConnectionBinding>,
        signal: FirstRoundSignal,
        handoff: HandoffReceiver,
        rng: StdRng,
    ) -> Self {
        Self {
            role,
            config,
            binding,
            state: ReadState::AwaitingFirstUnit,
            decoder: UnitDecoder::new(),
            lookahead: Segment::new(),
            placeholder_read: 0,
            first_burst_queued: false,
            decoded: VecDeque::new(),
            outbound: WireBuf::default(),
            request_header: None,
            signal: Some(signal),
            fire_on_flush: false,
            handoff,
            handoff_pending: false,
            activity: None,
            rng,
            buf: vec![0u8; READ_BUF_LEN].into_boxed_slice(),
            error: None,
        }
    }

    /// The role this engine was built for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Installs a hook that is notified on every non-empty inbound segment.
    pub fn set_activity_tracker(&mut self, tracker: impl ActivityTracker + 'static) {
        self.activity = Some(Arc::new(tracker));
    }

    /// The request header the initiator embedded in its first unit.
    ///
    /// Only available on a responder, once the first unit has been
    /// reassembled.
    pub fn request_header(&self) -> Option<&[u8]> {
        self.request_header.as_ref().map(Segment::as_slice)
    }

    /// Returns `true` once the carrier reached EOF.
    pub fn is_eof(&self) -> bool {
        self.state == ReadState::Eof
    }

    /// Read bytes from the `wire` and process them, returning how many bytes
    /// were read.
    ///
    /// After this function succeeds, decoded application bytes can be taken
    /// with [`reader`] or [`take_batch`], and outbound bytes may be waiting
    /// for [`write_wire`].
    ///
    /// If this function returns `Ok(0)`, the carrier reached EOF. This is a
    /// clean shutdown. If the first round had not finished, the write side is
    /// released with failure.
    ///
    /// # Errors
    ///
    /// 1. I/O errors from the `wire` are returned as-is. `WouldBlock` and
    ///    `Interrupted` are recoverable; any other I/O error terminates the
    ///    engine.
    ///
    /// 2. Errors with `ErrorKind::Other` downcast to [`Error`] and are fatal.
    ///    The same error is returned by every later call.
    ///
    /// [`reader`]: ReadEngine::reader
    /// [`take_batch`]: ReadEngine::take_batch
    /// [`write_wire`]: ReadEngine::write_wire
    pub fn read_wire(&mut self, wire: &mut dyn Read) -> io::Result<usize> {
        self.check_alive()?;
        if self.state == ReadState::Eof {
            return Ok(0);
        }
        let n = match wire.read(&mut self.buf) {
            Ok(0) => {
                self.on_eof();
                return Ok(0);
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Err(e);
            }
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        let segment = Segment::from(&self.buf[..n]);
        self.feed(segment)?;
        Ok(n)
    }

    /// Processes one inbound segment.
    ///
    /// A segment may hold any part of the byte stream: several units, or a
    /// fraction of one.
    pub fn feed(&mut self, segment: Segment) -> Result<(), Error> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if matches!(self.state, ReadState::Eof | ReadState::Terminated) {
            return Ok(());
        }
        if !segment.is_empty() {
            if let Some(activity) = &self.activity {
                activity.update();
            }
        }
        match self.process(segment) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.terminate(e.clone());
                Err(e)
            }
        }
    }

    /// Write pending outbound bytes to the `wire`, returning how many bytes
    /// were written. `Ok(0)` means nothing was pending.
    ///
    /// When the bytes of the first round are fully written, the write engine
    /// of the same connection is released. A terminated engine has nothing
    /// left to write; its error is reported by [`read_wire`].
    ///
    /// [`read_wire`]: ReadEngine::read_wire
    pub fn write_wire(&mut self, wire: &mut dyn Write) -> io::Result<usize> {
        if self.state == ReadState::Terminated {
            return Ok(0);
        }
        self.poll_handoff();
        let n = match self.outbound.write_to(wire) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Err(e);
            }
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };
        if self.outbound.is_empty() && self.fire_on_flush && !self.handoff_pending {
            self.fire_on_flush = false;
            if let Some(signal) = self.signal.take() {
                signal.fire(true);
            }
        }
        Ok(n)
    }

    /// Returns `true` if [`write_wire`](ReadEngine::write_wire) has work to
    /// do.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty() || self.fire_on_flush
    }

    /// Returns a [`Reader`] over the decoded application bytes.
    pub fn reader(&mut self) -> Reader<'_> {
        Reader(self)
    }

    /// Takes every decoded application segment, in order.
    pub fn take_batch(&mut self) -> SegmentBatch {
        self.decoded.drain(..).collect()
    }

    fn check_alive(&self) -> io::Result<()> {
        match (&self.error, self.state) {
            (Some(e), _) => Err(e.clone().into()),
            (None, ReadState::Terminated) => Err(ErrorKind::NotConnected.into()),
            _ => Ok(()),
        }
    }

    fn process(&mut self, mut segment: Segment) -> Result<(), Error> {
        loop {
            match self.state {
                ReadState::AwaitingFirstUnit => {
                    if segment.is_empty() {
                        return Ok(());
                    }
                    match self.role {
                        Role::Responder => {
                            if !self.first_burst_queued {
                                self.queue_first_burst()?;
                            }
                            let Decoded::Unit(chunks) = self.decoder.decode(&mut segment)? else {
                                return Ok(());
                            };
                            self.accept_request(chunks)?;
                            self.state = ReadState::Streaming {
                                awaiting_decoy: false,
                            };
                        }
                        Role::Initiator => {
                            if self.placeholder_read < RESPONSE_HEADER_PLACEHOLDER.len() {
                                let k = core::cmp::min(
                                    RESPONSE_HEADER_PLACEHOLDER.len() - self.placeholder_read,
                                    segment.len(),
                                );
                                segment.advance(k);
                                self.placeholder_read += k;
                                if self.placeholder_read == RESPONSE_HEADER_PLACEHOLDER.len()
                                    && !self.peer_decoys().is_enabled()
                                {
                                    self.state = ReadState::ValidatingFirstDecoys;
                                }
                                continue;
                            }
                            let Decoded::Unit(burst) = self.decoder.decode(&mut segment)? else {
                                return Ok(());
                            };
                            self.validate_burst(&burst)?;
                            self.state = ReadState::ValidatingFirstDecoys;
                        }
                    }
                }
                ReadState::ValidatingFirstDecoys => {
                    debug!("first decoy burst accepted, releasing handoff");
                    self.handoff_pending = true;
                    self.poll_handoff();
                    self.state = ReadState::Streaming {
                        awaiting_decoy: false,
                    };
                }
                ReadState::Streaming { awaiting_decoy } => {
                    if !self.lookahead.is_empty() {
                        let mut held = core::mem::take(&mut self.lookahead);
                        held.extend_from_slice(segment.as_slice());
                        segment = held;
                    }
                    if segment.is_empty() {
                        return Ok(());
                    }
                    if self.decoder.is_idle() && !awaiting_decoy {
                        match self.classify(segment.as_slice()) {
                            Some(true) => {}
                            Some(false) => {
                                self.decoded.push_back(segment.take());
                                return Ok(());
                            }
                            None => {
                                trace!(len = segment.len(), "holding bytes until classified");
                                self.lookahead = segment;
                                return Ok(());
                            }
                        }
                    }
                    let Decoded::Unit(chunks) = self.decoder.decode(&mut segment)? else {
                        return Ok(());
                    };
                    if awaiting_decoy {
                        self.validate_burst(&chunks)?;
                        self.state = ReadState::Streaming {
                            awaiting_decoy: false,
                        };
                        continue;
                    }
                    let data = remove_padding(
                        chunks,
                        self.config.padding_size,
                        self.config.subchunk_size,
                    );
                    let awaiting_decoy =
                        self.peer_decoys().is_enabled() && is_handshake_record(&data);
                    trace!(len = data.len(), awaiting_decoy, "handshake unit reassembled");
                    if !data.is_empty() {
                        self.decoded.push_back(data);
                    }
                    self.state = ReadState::Streaming { awaiting_decoy };
                }
                ReadState::Eof | ReadState::Terminated => return Ok(()),
            }
        }
    }

    /// Queues the response header placeholder and the responder's first
    /// decoy burst.
    fn queue_first_burst(&mut self) -> Result<(), Error> {
        let ranges = self.config.decoys(Role::Responder);
        match send_decoys(&self.binding, ranges, true, &mut self.rng)? {
            Some(burst) => self.outbound.push_batch(burst),
            None => self.outbound.push(&RESPONSE_HEADER_PLACEHOLDER),
        }
        debug!(bytes = self.outbound.remaining(), "first decoy burst queued");
        self.first_burst_queued = true;
        self.fire_on_flush = true;
        Ok(())
    }

    /// Splits the initiator's first unit into its request header and
    /// payload.
    fn accept_request(&mut self, chunks: SegmentBatch) -> Result<(), Error> {
        let mut chunks = chunks.into_iter();
        // The first chunk only inflates the unit.
        if chunks.next().is_none() {
            return Err(MalformedFraming::TruncatedRequestHeader {
                declared: None,
                available: 0,
            }
            .into());
        }
        let mut data = remove_padding(
            chunks.collect(),
            self.config.padding_size,
            self.config.subchunk_size,
        );
        if data.len() < REQUEST_HEADER_LEN_FIELD {
            return Err(MalformedFraming::TruncatedRequestHeader {
                declared: None,
                available: data.len(),
            }
            .into());
        }
        let field = data.peek(REQUEST_HEADER_LEN_FIELD);
        let declared = u16::from_be_bytes([field[0], field[1]]);
        data.advance(REQUEST_HEADER_LEN_FIELD);
        if data.len() < declared as usize {
            return Err(MalformedFraming::TruncatedRequestHeader {
                declared: Some(declared),
                available: data.len(),
            }
            .into());
        }
        self.request_header = Some(data.split_to(declared as usize));
        debug!(header_len = declared, payload_len = data.len(), "first unit accepted");
        if !data.is_empty() {
            self.decoded.push_back(data);
        }
        Ok(())
    }

    fn validate_burst(&self, burst: &[Segment]) -> Result<(), Error> {
        let ranges = self.peer_decoys();
        validate(
            burst,
            self.binding.auth_key().as_bytes(),
            self.binding.established_time(),
            ranges.size.min(),
        )
        .map_err(Error::from)
    }

    fn peer_decoys(&self) -> DecoyRanges {
        self.config.decoys(self.role.peer())
    }

    /// Decides whether bytes at a unit boundary start a framed unit.
    ///
    /// A framed unit carries a handshake prefix right after the unit total,
    /// the first chunk length and one padding block, and its first chunk
    /// fits in the unit. Returns `None` while `bytes` is too short to tell.
    fn classify(&self, bytes: &[u8]) -> Option<bool> {
        let padding = if self.config.is_padding_enabled() {
            self.config.padding_size as usize
        } else {
            0
        };
        let offset = FRAMED_DATA_OFFSET + padding;
        if bytes.len() >= FRAMED_DATA_OFFSET {
            let total = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
            let chunk = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
            if chunk + LEN_FIELD_LEN > total || chunk < padding + HANDSHAKE_PREFIX_LEN {
                return Some(false);
            }
        }
        if bytes.len() > offset {
            let end = core::cmp::min(bytes.len(), offset + HANDSHAKE_PREFIX_LEN);
            if !may_be_handshake(&bytes[offset..end]) {
                return Some(false);
            }
        }
        if bytes.len() >= offset + HANDSHAKE_PREFIX_LEN {
            Some(true)
        } else {
            None
        }
    }

    fn poll_handoff(&mut self) {
        if !self.handoff_pending {
            return;
        }
        match self.handoff.try_take() {
            Handoff::Ready(queue) => {
                trace!(chunks = queue.len(), "handoff queue released");
                self.outbound.push_batch(queue);
            }
            Handoff::Closed => {}
            Handoff::Pending => return,
        }
        self.handoff_pending = false;
        self.fire_on_flush = true;
    }

    fn on_eof(&mut self) {
        if !self.decoder.is_idle() {
            debug!("carrier closed inside a unit");
        }
        if !self.lookahead.is_empty() {
            let held = core::mem::take(&mut self.lookahead);
            self.decoded.push_back(held);
        }
        self.state = ReadState::Eof;
        self.fire_on_flush = false;
        if let Some(signal) = self.signal.take() {
            signal.fire(false);
        }
    }

    fn abort(&mut self) {
        self.state = ReadState::Terminated;
        self.fire_on_flush = false;
        self.outbound.clear();
        if let Some(signal) = self.signal.take() {
            signal.fire(false);
        }
    }

    fn terminate(&mut self, e: Error) {
        warn!(error = %e, role = ?self.role, "read engine terminated");
        self.abort();
        self.decoded.clear();
        self.lookahead.release();
        self.error = Some(e);
    }
}

impl Debug for ReadEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("decoder", &self.decoder)
            .field("decoded", &self.decoded.len())
            .field("outbound", &self.outbound.remaining())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A structure that implements [`Read`] and [`BufRead`] for reading decoded
/// application data.
///
/// `Reader` points to the decoded queue of the [`ReadEngine`].
/// To create a `Reader`, use the [`reader`] method.
///
/// [`reader`]: ReadEngine::reader
#[derive(Debug)]
pub struct Reader<'a>(&'a mut ReadEngine);

impl Reader<'_> {
    /// Returns the number of decoded bytes that have not been read.
    pub fn remaining(&self) -> usize {
        self.0.decoded.iter().map(Segment::len).sum()
    }

    /// Returns true if there is unread data in the reader.
    ///
    /// This is equivalent to `self.remaining() != 0`.
    pub fn has_remaining(&self) -> bool {
        self.remaining() != 0
    }
}

impl Read for Reader<'_> {
    /// Reads decoded bytes from the [`ReadEngine`].
    ///
    /// If the carrier reached EOF and every decoded byte was read, this
    /// function returns `Ok(0)`.
    ///
    /// If no decoded data is available yet, this function returns I/O error
    /// with `ErrorKind::WouldBlock`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let buffer = self.fill_buf()?;
        let k = core::cmp::min(buf.len(), buffer.len());
        buf[..k].copy_from_slice(&buffer[..k]);
        self.consume(k);
        Ok(k)
    }
}

impl BufRead for Reader<'_> {
    /// Returns the front of the decoded queue.
    ///
    /// If the carrier reached EOF and every decoded byte was read, this
    /// function returns an empty buffer.
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        let engine = &*self.0;
        match engine.decoded.front() {
            Some(front) => Ok(front.as_slice()),
            None => match (&engine.error, engine.state) {
                (Some(e), _) => Err(e.clone().into()),
                (None, ReadState::Terminated) => Err(ErrorKind::NotConnected.into()),
                (None, ReadState::Eof) => Ok(&[]),
                _ => Err(ErrorKind::WouldBlock.into()),
            },
        }
    }

    /// Consumes `amt` bytes from the front of the decoded queue.
    fn consume(&mut self, amt: usize) {
        let mut amt = amt;
        while amt > 0 {
            let Some(front) = self.0.decoded.front_mut() else {
                return;
            };
            let k = core::cmp::min(amt, front.len());
            front.advance(k);
            amt -= k;
            if front.is_empty() {
                self.0.decoded.pop_front();
            }
        }
    }
}
