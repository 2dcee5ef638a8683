use core::task::{Context, Poll};
use std::{
    io::{self, ErrorKind, Write},
    sync::Arc,
};

use rand::{RngCore, rngs::StdRng};
use tracing::{debug, trace, warn};

use crate::{
    binding::{ConnectionBinding, Role},
    codec::{encode_unit, frame_chunks, seal_unit},
    config::Config,
    decoy::send_decoys,
    error::{Error, MalformedFraming},
    handshake::is_handshake_record,
    padding::add_padding,
    segment::{Segment, SegmentBatch, WireBuf},
    signal::{FirstRoundWaiter, HandoffSender},
    specification::{CHUNK_MAX_LEN, LEN_FIELD_LEN, REQUEST_HEADER_LEN_FIELD, RESPONDER_SENTINEL},
};

/// The outbound half of a connection.
///
/// The write engine turns batches from the application into wire bytes. Its
/// first call is special: an initiator emits one inflated chunk right away and
/// hands the rest of its first batch to the read engine, a responder encodes
/// its handshake records. After the first call, nothing is written until the
/// read engine reports that the first round finished.
///
/// State Transition Diagram:
///
/// ```text
///
///        |
///        V
///   WaitFirstBatch
///        |
///        V
///      Gated ------------+
///        |               |
///        | (signal ok)   | (signal failed)
///        V               V
///       Open          Aborted
/// ```
#[derive(Debug)]
pub struct WriteEngine {
    role: Role,
    config: Arc<Config>,
    binding: Arc<ConnectionBinding>,
    state: WriteState,
    request_header: Vec<u8>,
    immediate: WireBuf,
    gated: WireBuf,
    waiter: FirstRoundWaiter,
    handoff: Option<HandoffSender>,
    rng: StdRng,
    error: Option<Error>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum WriteState {
    WaitFirstBatch,
    Gated,
    Open,
    Aborted,
}

impl WriteEngine {
    pub(crate) fn new(
        role: Role,
        config: Arc<Config>,
        binding: Arc<ConnectionBinding>,
        waiter: FirstRoundWaiter,
        handoff: HandoffSender,
        rng: StdRng,
    ) -> Self {
        let request_header = match role {
            Role::Initiator => Vec::new(),
            Role::Responder => RESPONDER_SENTINEL.to_vec(),
        };
        Self {
            role,
            config,
            binding,
            state: WriteState::WaitFirstBatch,
            request_header,
            immediate: WireBuf::default(),
            gated: WireBuf::default(),
            waiter,
            handoff: Some(handoff),
            rng,
            error: None,
        }
    }

    /// The role this engine writes for.
    ///
    /// Before the first call this is the role the engine was built for;
    /// afterwards it is the role the first call settled on.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Sets the request header sent in front of the initiator's first
    /// payload.
    ///
    /// Setting the 2-byte zero sentinel makes the first call take the
    /// responder path. Has no effect once the first call was made.
    pub fn set_request_header(&mut self, header: &[u8]) {
        if self.state != WriteState::WaitFirstBatch {
            debug!("request header set after the first write, ignored");
            return;
        }
        self.request_header = header.to_vec();
    }

    /// Encodes `batch` and queues the result for [`write_wire`].
    ///
    /// # Errors
    ///
    /// Framing errors (a request header or chunk that does not fit a length
    /// field) are fatal. So is a failed first round. The same error is
    /// returned by every later call.
    ///
    /// [`write_wire`]: WriteEngine::write_wire
    pub fn write_batch(&mut self, batch: SegmentBatch) -> Result<(), Error> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let result = match self.state {
            WriteState::WaitFirstBatch => self.encode_first(batch),
            _ => self.encode_streaming(batch),
        };
        if let Err(e) = &result {
            warn!(error = %e, role = ?self.role, "write engine terminated");
            self.error = Some(e.clone());
            self.gated.clear();
        }
        result
    }

    /// Write pending bytes to the `wire`, returning how many bytes were
    /// written. `Ok(0)` means nothing was pending.
    ///
    /// Bytes produced after the first call are held back until the first
    /// round finished. While they are held back and nothing else could be
    /// written, this function returns I/O error with `ErrorKind::WouldBlock`.
    pub fn write_wire(&mut self, wire: &mut dyn Write) -> io::Result<usize> {
        if let Some(e) = &self.error {
            return Err(e.clone().into());
        }
        let mut written = self.write_immediate(wire)?;
        if !self.immediate.is_empty() || self.gated.is_empty() {
            return Ok(written);
        }
        if self.state == WriteState::Gated {
            match self.waiter.try_outcome() {
                Some(result) => self.settle(result)?,
                None if written > 0 => return Ok(written),
                None => return Err(ErrorKind::WouldBlock.into()),
            }
        }
        match self.gated.write_to(wire) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock && written > 0 => {}
            Err(e) => return Err(e),
        }
        Ok(written)
    }

    /// Writes the bytes that are not subject to the first-round gate.
    pub(crate) fn write_immediate(&mut self, wire: &mut dyn Write) -> io::Result<usize> {
        self.immediate.write_to(wire)
    }

    pub(crate) fn has_immediate(&self) -> bool {
        !self.immediate.is_empty()
    }

    /// Polls the first-round outcome, registering `cx` to be woken when it
    /// becomes known. Ready at once when the engine is not gated.
    pub fn poll_first_round(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        match self.state {
            WriteState::Gated => {}
            WriteState::Aborted => return Poll::Ready(Err(Error::SynchronizationAborted)),
            WriteState::WaitFirstBatch | WriteState::Open => return Poll::Ready(Ok(())),
        }
        let result = core::task::ready!(self.waiter.poll_outcome(cx));
        Poll::Ready(self.settle(result))
    }

    /// Blocks the current thread until the first round finished.
    ///
    /// Must not be called from within an asynchronous execution context.
    pub fn wait_first_round(&mut self) -> Result<(), Error> {
        if self.state != WriteState::Gated {
            return match self.state {
                WriteState::Aborted => Err(Error::SynchronizationAborted),
                _ => Ok(()),
            };
        }
        let result = self.waiter.blocking_outcome();
        self.settle(result)
    }

    /// Returns `true` if bytes are held back by the first-round gate.
    pub fn is_gated(&self) -> bool {
        self.state == WriteState::Gated && !self.gated.is_empty()
    }

    /// Returns `true` if any encoded bytes wait to be written.
    pub fn wants_write(&self) -> bool {
        !self.immediate.is_empty() || !self.gated.is_empty()
    }

    /// Returns a [`Writer`] that encodes each write as a batch of one
    /// segment.
    pub fn writer(&mut self) -> Writer<'_> {
        Writer(self)
    }

    fn settle(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        match result {
            Ok(()) => {
                trace!(held = self.gated.remaining(), "first round finished, gate opened");
                self.state = WriteState::Open;
                Ok(())
            }
            Err(e) => {
                warn!(held = self.gated.remaining(), "first round failed, dropping held bytes");
                self.state = WriteState::Aborted;
                self.gated.clear();
                self.error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn encode_first(&mut self, batch: SegmentBatch) -> Result<(), Error> {
        let header = core::mem::take(&mut self.request_header);
        let role = if header == RESPONDER_SENTINEL {
            Role::Responder
        } else {
            Role::Initiator
        };
        if role != self.role {
            warn!(?role, bound = ?self.role, "request header disagrees with the bound role");
            self.role = role;
        }
        debug!(?role, segments = batch.len(), "first write");
        self.state = WriteState::Gated;
        match role {
            Role::Initiator => self.encode_initiator_first(&header, batch),
            Role::Responder => {
                // Nothing to hand off, the responder has already read.
                self.handoff = None;
                self.encode_streaming(batch)
            }
        }
    }

    fn encode_initiator_first(&mut self, header: &[u8], batch: SegmentBatch) -> Result<(), Error> {
        let header_len = u16::try_from(header.len())
            .map_err(|_| MalformedFraming::ChunkTooLong { len: header.len() })?;
        let mut batch = batch.into_iter();
        let payload = batch.next().unwrap_or_default();

        let capacity = REQUEST_HEADER_LEN_FIELD + header.len() + payload.len();
        let mut data = Segment::with_headroom(0, capacity);
        data.extend_from_slice(&header_len.to_be_bytes());
        data.extend_from_slice(header);
        data.extend_from_slice(payload.as_slice());

        let config = self.config.clone();
        let mut pieces = add_padding(
            data,
            config.split_size,
            config.padding_size,
            config.subchunk_size,
            &mut self.rng,
        );
        frame_chunks(&mut pieces)?;
        if let Some(first) = pieces.first_mut() {
            self.inflate_first_chunk(first)?;
        }
        seal_unit(&mut pieces)?;

        let mut pieces = pieces.into_iter();
        if let Some(first) = pieces.next() {
            trace!(len = first.len(), "first chunk queued");
            self.immediate.push(first.as_slice());
        }
        let mut queue: SegmentBatch = pieces.collect();
        for segment in batch {
            if is_handshake_record(&segment) {
                queue.extend(self.obfuscate_record(segment)?);
            } else {
                queue.push(segment);
            }
        }
        debug!(segments = queue.len(), "handoff queue sent");
        if let Some(handoff) = self.handoff.take() {
            handoff.send(queue);
        }
        Ok(())
    }

    /// Prepends a random inflation chunk to the first framed chunk.
    ///
    /// A short first chunk grows to a length sampled from the split size
    /// range; otherwise the inflation chunk is empty.
    fn inflate_first_chunk(&mut self, first: &mut Segment) -> Result<(), Error> {
        let split = self.config.split_size;
        let len = first.len();
        if !split.is_enabled() || len >= split.min() as usize {
            first.prepend(&[0u8; LEN_FIELD_LEN]);
            return Ok(());
        }
        let target = split.sample(&mut self.rng) as usize;
        let pad_len = if target + len > split.max() as usize {
            target - len
        } else {
            target
        };
        if pad_len > CHUNK_MAX_LEN {
            return Err(MalformedFraming::ChunkTooLong { len: pad_len }.into());
        }
        let mut pad = vec![0u8; pad_len];
        self.rng.fill_bytes(&mut pad);
        first.prepend(&pad);
        first.prepend_u16(pad_len as u16);
        Ok(())
    }

    fn encode_streaming(&mut self, batch: SegmentBatch) -> Result<(), Error> {
        for segment in batch {
            if is_handshake_record(&segment) {
                let unit = self.obfuscate_record(segment)?;
                self.gated.push_batch(unit);
            } else {
                self.gated.push(segment.as_slice());
            }
        }
        Ok(())
    }

    /// A handshake record becomes a padded unit followed by a decoy burst.
    fn obfuscate_record(&mut self, record: Segment) -> Result<SegmentBatch, Error> {
        let len = record.len();
        let pieces = add_padding(
            record,
            self.config.split_size,
            self.config.padding_size,
            self.config.subchunk_size,
            &mut self.rng,
        );
        let mut out = encode_unit(pieces)?;
        let ranges = self.config.decoys(self.role);
        if let Some(burst) = send_decoys(&self.binding, ranges, false, &mut self.rng)? {
            out.extend(burst);
        }
        trace!(len, segments = out.len(), "handshake record obfuscated");
        Ok(out)
    }
}

/// A structure that implements [`Write`] for writing application data.
///
/// `Writer` points to the [`WriteEngine`]. To create a `Writer`, use the
/// [`writer`] method.
///
/// [`writer`]: WriteEngine::writer
#[derive(Debug)]
pub struct Writer<'a>(&'a mut WriteEngine);

impl Write for Writer<'_> {
    /// Encodes `buf` as one segment and queues it.
    ///
    /// Always consumes the whole buffer unless the engine has failed.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() && self.0.state != WriteState::WaitFirstBatch {
            return Ok(0);
        }
        self.0.write_batch(vec![Segment::from(buf)])?;
        Ok(buf.len())
    }

    /// Does nothing. Call [`WriteEngine::write_wire`] to write queued bytes.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, UNIX_EPOCH};

    use rand::SeedableRng;

    use super::*;
    use crate::{
        codec::{Decoded, UnitDecoder},
        config::{DecoyRanges, SizeRange},
        decoy::validate,
        padding::remove_padding,
        signal::{FirstRoundSignal, HandoffReceiver, Handoff, first_round, handoff},
        test::MockStream,
    };

    struct Harness {
        engine: WriteEngine,
        signal: Option<FirstRoundSignal>,
        handoff: HandoffReceiver,
    }

    fn binding() -> ConnectionBinding {
        ConnectionBinding::new([3u8; 32], UNIX_EPOCH + Duration::from_secs(1_715_000_000))
    }

    fn harness(role: Role, config: Config) -> Harness {
        let (signal, waiter) = first_round();
        let (tx, rx) = handoff();
        let engine = WriteEngine::new(
            role,
            Arc::new(config),
            Arc::new(binding()),
            waiter,
            tx,
            StdRng::from_seed([2u8; 32]),
        );
        Harness {
            engine,
            signal: Some(signal),
            handoff: rx,
        }
    }

    fn config(split: SizeRange) -> Config {
        Config::builder_with_padding(8, 32)
            .unwrap()
            .with_split_size(split)
            .unwrap()
            .with_decoys(
                DecoyRanges::parse("50-100", "1-3").unwrap(),
                DecoyRanges::parse("20-40", "1-2").unwrap(),
            )
    }

    #[test]
    fn test_initiator_first_chunk_is_inflated() {
        let split = SizeRange::new(200, 300).unwrap();
        let mut h = harness(Role::Initiator, config(split));
        h.engine.set_request_header(b"");
        h.engine
            .write_batch(vec![Segment::from(&b"0123456789"[..])])
            .unwrap();

        let mut wire = MockStream::default();
        let n = h.engine.write_wire(&mut wire).unwrap();
        assert_eq!(n, wire.buf.len());

        // total | pad_len | pad | len | padded data
        let bytes = &wire.buf;
        let total = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        assert_eq!(total, bytes.len() - 2);
        let pad_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        assert!((200..=300).contains(&pad_len));
        let rest = &bytes[4 + pad_len..];
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        assert_eq!(len, rest.len() - 2);
        let data = remove_padding(vec![Segment::from(&rest[2..])], 8, 32);
        assert_eq!(data.as_slice(), b"\x00\x000123456789");

        // nothing was handed off beyond the first chunk
        assert_eq!(h.handoff.try_take(), Handoff::Ready(vec![]));
    }

    #[test]
    fn test_initiator_hands_off_the_rest() {
        let split = SizeRange::new(16, 16).unwrap();
        let mut h = harness(Role::Initiator, config(split));
        h.engine.set_request_header(b"hdr");
        let hello = [&b"\x16\x03\x01"[..], &[0x42; 61][..]].concat();
        h.engine
            .write_batch(vec![
                Segment::from(hello.clone()),
                Segment::from(&b"\x17\x03\x03raw"[..]),
            ])
            .unwrap();

        let mut wire = MockStream::default();
        h.engine.write_wire(&mut wire).unwrap();
        let Handoff::Ready(queue) = h.handoff.try_take() else {
            panic!("queue expected");
        };
        for segment in &queue {
            wire.buf.extend_from_slice(segment.as_slice());
        }

        let mut stream = Segment::from(core::mem::take(&mut wire.buf));
        let mut decoder = UnitDecoder::new();
        let Decoded::Unit(chunks) = decoder.decode(&mut stream).unwrap() else {
            panic!("unit expected");
        };
        let mut data = remove_padding(chunks[1..].to_vec(), 8, 32);
        assert_eq!(data.split_to(2).as_slice(), &[0, 3]);
        assert_eq!(data.split_to(3).as_slice(), b"hdr");
        assert_eq!(data.as_slice(), &hello[..]);
        // the trailing raw record is queued verbatim after the first unit
        assert!(stream.as_slice().ends_with(b"\x17\x03\x03raw"));
    }

    #[test]
    fn test_gate_holds_until_signal() {
        let mut h = harness(Role::Initiator, config(SizeRange::DISABLED));
        h.engine.writer().write_all(b"\x16\x03\x01first").unwrap();
        h.engine.writer().write_all(b"\x17\x03\x03later").unwrap();
        assert!(h.engine.is_gated());

        let mut wire = MockStream::default();
        let first = h.engine.write_wire(&mut wire).unwrap();
        assert!(first > 0);
        assert_eq!(
            h.engine.write_wire(&mut wire).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );

        h.signal.take().unwrap().fire(true);
        assert_eq!(h.engine.write_wire(&mut wire).unwrap(), 8);
        assert!(wire.buf.ends_with(b"\x17\x03\x03later"));
        assert!(!h.engine.wants_write());
    }

    #[test]
    fn test_failed_first_round_aborts_writes() {
        let mut h = harness(Role::Initiator, config(SizeRange::DISABLED));
        h.engine.writer().write_all(b"\x16\x03\x01first").unwrap();
        h.engine.writer().write_all(b"\x17\x03\x03later").unwrap();
        drop(h.signal.take());

        let mut wire = MockStream::default();
        let err = h.engine.write_wire(&mut wire).unwrap_err();
        assert_eq!(
            err.into_inner().unwrap().downcast::<Error>().unwrap(),
            Box::new(Error::SynchronizationAborted)
        );
        assert_eq!(
            h.engine.write_batch(vec![Segment::from(&b"x"[..])]),
            Err(Error::SynchronizationAborted)
        );
    }

    #[test]
    fn test_responder_frames_handshake_and_passes_data() {
        let mut h = harness(Role::Responder, config(SizeRange::DISABLED));
        let server_hello = [&b"\x16\x03\x03"[..], &[0x24; 117][..]].concat();
        h.engine
            .write_batch(vec![
                Segment::from(server_hello.clone()),
                Segment::from(&b"\x17\x03\x03data"[..]),
            ])
            .unwrap();
        assert_eq!(h.handoff.try_take(), Handoff::Closed);

        h.signal.take().unwrap().fire(true);
        let mut wire = MockStream::default();
        h.engine.write_wire(&mut wire).unwrap();

        let mut stream = Segment::from(core::mem::take(&mut wire.buf));
        let mut decoder = UnitDecoder::new();
        let Decoded::Unit(chunks) = decoder.decode(&mut stream).unwrap() else {
            panic!("unit expected");
        };
        assert_eq!(remove_padding(chunks, 8, 32).as_slice(), &server_hello[..]);
        // decoy burst of 1..=3 packets of 50..=100 bytes
        let Decoded::Unit(burst) = decoder.decode(&mut stream).unwrap() else {
            panic!("burst expected");
        };
        assert!((1..=3).contains(&burst.len()));
        assert!(burst.iter().all(|p| (50..=100).contains(&p.len())));
        // every packet is re-derivable from the shared binding
        let b = binding();
        assert_eq!(
            validate(&burst, b.auth_key().as_bytes(), b.established_time(), 50),
            Ok(())
        );
        assert_eq!(stream.as_slice(), b"\x17\x03\x03data");
    }

    #[test]
    fn test_sentinel_selects_responder_path() {
        let mut h = harness(Role::Initiator, config(SizeRange::DISABLED));
        h.engine.set_request_header(&RESPONDER_SENTINEL);
        h.engine
            .write_batch(vec![Segment::from(&b"\x17\x03\x03data"[..])])
            .unwrap();
        assert_eq!(h.engine.role(), Role::Responder);
        assert!(h.engine.is_gated());
    }
}
