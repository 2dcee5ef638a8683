use core::task::{Context, Poll};
use std::{
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
};

use rand::{
    SeedableRng, TryRngCore,
    rngs::{OsRng, StdRng},
};

use crate::{
    binding::{self, ConnectionBinding, ResolveBinding, Role},
    config::Config,
    error::Error,
    read_engine::{ActivityTracker, ReadEngine, Reader},
    signal::{first_round, handoff},
    write_engine::{WriteEngine, Writer},
};

/// A traffic-shaping engine for one connection.
///
/// `Vision` couples a [`ReadEngine`] and a [`WriteEngine`] sharing one
/// configuration and one connection binding. You provide handshake records and
/// application data on one side and receive shaped traffic on the other, and
/// vice versa:
///
/// ```text
///         Application                          Shaped Traffic
///         ===========                          ==============
///     writer()        +-------------------+      write_wire()
///                     |                   |
///           +--------->                   +--------->
///                     |      Vision       |
///           <---------+                   <---------+
///                     |                   |
///     reader()        +-------------------+       read_wire()
/// ```
///
/// * Use [`read_wire`] to receive bytes from the peer. Then, use [`reader`]
///   to create a [`Reader`] for reading the application data.
///
/// * Use [`writer`] to create a [`Writer`] to encode data into the internal
///   buffer, and then use [`write_wire`] to send it to the peer.
///
/// Both halves depend on each other during the first round: the responder's
/// read side answers the initiator's first chunk with a decoy burst, and
/// neither write side sends more than that first chunk before the burst was
/// exchanged. Call [`write_wire`] after every [`read_wire`] so the read side
/// can emit those bytes.
///
/// [`read_wire`]: Vision::read_wire
/// [`write_wire`]: Vision::write_wire
/// [`reader`]: Vision::reader
/// [`writer`]: Vision::writer
#[derive(Debug)]
pub struct Vision {
    read: ReadEngine,
    write: WriteEngine,
}

impl Vision {
    /// Creates the engines for the endpoint playing `role`.
    ///
    /// For details on constructing and configuring `config`, refer to
    /// the [`config`] module.
    ///
    /// [`config`]: crate::config
    pub fn new(config: Config, binding: ConnectionBinding, role: Role) -> Self {
        let mut random = [0u8; 64];
        OsRng
            .try_fill_bytes(&mut random)
            .expect("system random source failure");
        Self::with_random(config, binding, role, random)
    }

    /// Creates the engines with a 64-byte random seed.
    ///
    /// This method can be used when you need to deterministically construct
    /// a `Vision`.
    ///
    /// **Warning**: The `random` parameter must be sourced from a
    /// high-quality, cryptographically secure entropy source. Padding and
    /// decoy sizes are derived from it. For general use cases, the `new`
    /// method is recommended.
    pub fn with_random(
        config: Config,
        binding: ConnectionBinding,
        role: Role,
        random: [u8; 64],
    ) -> Self {
        let mut read_seed = [0u8; 32];
        let mut write_seed = [0u8; 32];
        read_seed.copy_from_slice(&random[..32]);
        write_seed.copy_from_slice(&random[32..]);

        let config = Arc::new(config);
        let binding = Arc::new(binding);
        let (signal, waiter) = first_round();
        let (handoff_tx, handoff_rx) = handoff();
        Self {
            read: ReadEngine::new(
                role,
                config.clone(),
                binding.clone(),
                signal,
                handoff_rx,
                StdRng::from_seed(read_seed),
            ),
            write: WriteEngine::new(
                role,
                config,
                binding,
                waiter,
                handoff_tx,
                StdRng::from_seed(write_seed),
            ),
        }
    }

    /// Creates the engines for a carrier connection, resolving its binding
    /// through any wrappers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedBinding`] if no secure channel backs the
    /// connection, or the channel binds the other role.
    pub fn resolve<C: ResolveBinding + ?Sized>(
        config: Config,
        conn: &C,
        role: Role,
    ) -> Result<Self, Error> {
        let binding = binding::resolve(conn, role)?;
        Ok(Self::new(config, binding, role))
    }

    /// The role this endpoint plays.
    pub fn role(&self) -> Role {
        self.read.role()
    }

    /// Sets the request header the initiator sends with its first payload.
    ///
    /// See [`WriteEngine::set_request_header`].
    pub fn set_request_header(&mut self, header: &[u8]) {
        self.write.set_request_header(header);
    }

    /// The request header received from the initiator, on a responder.
    pub fn request_header(&self) -> Option<&[u8]> {
        self.read.request_header()
    }

    /// Installs a hook notified on every non-empty inbound segment.
    pub fn set_activity_tracker(&mut self, tracker: impl ActivityTracker + 'static) {
        self.read.set_activity_tracker(tracker);
    }

    /// Read bytes from the `wire` and process them, returning how many bytes
    /// were read.
    ///
    /// Once this function succeeds, you can call [`reader`] to get the
    /// decoded application data.
    ///
    /// If this function returns `Ok(0)`, the carrier reached EOF.
    ///
    /// # Errors
    ///
    /// See [`ReadEngine::read_wire`].
    ///
    /// [`reader`]: Vision::reader
    pub fn read_wire(&mut self, wire: &mut dyn Read) -> io::Result<usize> {
        self.read.read_wire(wire)
    }

    /// Write pending bytes to the `wire`, returning how many bytes were
    /// written. `Ok(0)` means nothing was pending.
    ///
    /// The initiator's first chunk goes first, then the bytes the read side
    /// produced, then everything else the write side encoded. If bytes are
    /// held back until the first round finished and nothing else could be
    /// written, this function returns I/O error with `ErrorKind::WouldBlock`.
    pub fn write_wire(&mut self, wire: &mut dyn Write) -> io::Result<usize> {
        let mut written = self.write.write_immediate(wire)?;
        if self.write.has_immediate() {
            return Ok(written);
        }
        match self.read.write_wire(wire) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock && written > 0 => return Ok(written),
            Err(e) => return Err(e),
        }
        if self.read.wants_write() {
            return Ok(written);
        }
        match self.write.write_wire(wire) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock && written > 0 => {}
            Err(e) => return Err(e),
        }
        Ok(written)
    }

    /// Returns `true` if [`write_wire`](Vision::write_wire) has work to do.
    pub fn wants_write(&self) -> bool {
        self.read.wants_write() || self.write.wants_write()
    }

    /// Returns `true` if encoded bytes wait for the first round to finish.
    pub fn is_gated(&self) -> bool {
        self.write.is_gated()
    }

    /// Polls the first-round outcome. See [`WriteEngine::poll_first_round`].
    pub fn poll_first_round(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.write.poll_first_round(cx)
    }

    /// Returns a [`Reader`] for reading decoded application data.
    pub fn reader(&mut self) -> Reader<'_> {
        self.read.reader()
    }

    /// Returns a [`Writer`] for encoding application data.
    pub fn writer(&mut self) -> Writer<'_> {
        self.write.writer()
    }

    /// The inbound half.
    pub fn read_engine_mut(&mut self) -> &mut ReadEngine {
        &mut self.read
    }

    /// The outbound half.
    pub fn write_engine_mut(&mut self) -> &mut WriteEngine {
        &mut self.write
    }

    /// Splits into the two halves, so they can be driven from different
    /// tasks or threads.
    ///
    /// The read half must keep calling [`ReadEngine::write_wire`] on the
    /// carrier; the first round only finishes once its bytes were written.
    pub fn into_split(self) -> (ReadEngine, WriteEngine) {
        (self.read, self.write)
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::BufRead,
        time::{Duration, UNIX_EPOCH},
    };

    use super::*;
    use crate::{
        binding::{SecureChannel, StatConnection, Unbound},
        config::{DecoyRanges, SizeRange},
        error::{DecoyMismatch, UnresolvedBinding},
        segment::Segment,
        test::MockStream,
    };

    fn binding() -> ConnectionBinding {
        ConnectionBinding::new([0x5au8; 32], UNIX_EPOCH + Duration::from_secs(1_721_000_000))
    }

    fn config() -> Config {
        Config::builder_with_padding(8, 32)
            .unwrap()
            .with_split_size(SizeRange::new(64, 128).unwrap())
            .unwrap()
            .with_decoys(
                DecoyRanges::parse("50-100", "1-3").unwrap(),
                DecoyRanges::parse("20-40", "1-2").unwrap(),
            )
    }

    fn record(kind: &[u8], len: usize, fill: u8) -> Vec<u8> {
        let mut record = kind.to_vec();
        record.resize(len, fill);
        record
    }

    fn read_all(vision: &mut Vision) -> Vec<u8> {
        let mut reader = vision.reader();
        let mut out = Vec::new();
        while let Ok(buf) = reader.fill_buf() {
            if buf.is_empty() {
                break;
            }
            out.extend_from_slice(buf);
            let n = buf.len();
            reader.consume(n);
        }
        out
    }

    fn pair(config: Config) -> (Vision, Vision) {
        (
            Vision::with_random(config.clone(), binding(), Role::Initiator, [1; 64]),
            Vision::with_random(config, binding(), Role::Responder, [2; 64]),
        )
    }

    /// Runs the first round and delivers a client hello to the server.
    fn open_pair(config: Config) -> (Vision, Vision) {
        let mut c2s = MockStream::default();
        let mut s2c = MockStream::default();
        let (mut client, mut server) = pair(config);
        let client_hello = record(b"\x16\x03\x01", 200, 0xaa);
        client.writer().write_all(&client_hello).unwrap();
        client.write_wire(&mut c2s).unwrap();
        server.read_wire(&mut c2s).unwrap();
        server.write_wire(&mut s2c).unwrap();
        client.read_wire(&mut s2c).unwrap();
        client.write_wire(&mut c2s).unwrap();
        server.read_wire(&mut c2s).unwrap();
        assert_eq!(read_all(&mut server), client_hello);
        assert!(s2c.buf.is_empty() && c2s.buf.is_empty());
        (client, server)
    }

    fn wire_of(vision: &mut Vision) -> Vec<u8> {
        let mut wire = MockStream::default();
        vision.write_wire(&mut wire).unwrap();
        wire.buf
    }

    #[test]
    fn test_stat_connection_counts_engine_traffic() {
        let mut c2s = StatConnection::new(MockStream::default());
        let (mut client, mut server) = pair(config());
        client
            .writer()
            .write_all(&record(b"\x16\x03\x01", 200, 0xaa))
            .unwrap();
        client.write_wire(&mut c2s).unwrap();
        let sent = c2s.get_ref().buf.len() as u64;
        assert!(sent > 0);
        assert_eq!(c2s.uplink(), sent);
        assert_eq!(c2s.downlink(), 0);

        server.read_wire(&mut c2s).unwrap();
        assert_eq!(c2s.downlink(), sent);
        assert!(c2s.get_mut().buf.is_empty());
    }

    #[test]
    fn test_full_handshake() {
        let mut c2s = MockStream::default();
        let mut s2c = MockStream::default();
        let (mut client, mut server) = pair(config());
        client.set_request_header(b"example.com:443");

        let client_hello = record(b"\x16\x03\x01", 300, 0xaa);
        client.writer().write_all(&client_hello).unwrap();
        client.write_wire(&mut c2s).unwrap();
        let first_chunk_len = c2s.buf.len();
        assert!(first_chunk_len < client_hello.len());

        // The first chunk alone does not complete the unit.
        server.read_wire(&mut c2s).unwrap();
        assert_eq!(
            server.reader().read(&mut [0u8; 8]).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );
        assert!(server.write_wire(&mut s2c).unwrap() > 0);

        // Validating the burst releases the rest of the first unit.
        client.read_wire(&mut s2c).unwrap();
        assert!(client.write_wire(&mut c2s).unwrap() > 0);

        server.read_wire(&mut c2s).unwrap();
        assert_eq!(server.request_header(), Some(&b"example.com:443"[..]));
        assert_eq!(read_all(&mut server), client_hello);

        let server_hello = record(b"\x16\x03\x03", 120, 0xcc);
        server.writer().write_all(&server_hello).unwrap();
        server.write_wire(&mut s2c).unwrap();
        client.read_wire(&mut s2c).unwrap();
        assert_eq!(read_all(&mut client), server_hello);

        // Application data passes unframed in both directions.
        let request = record(b"\x17\x03\x03", 100, 0xbb);
        client.writer().write_all(&request).unwrap();
        client.write_wire(&mut c2s).unwrap();
        assert_eq!(c2s.buf, request);
        server.read_wire(&mut c2s).unwrap();
        assert_eq!(read_all(&mut server), request);

        let response = record(b"\x17\x03\x03", 2000, 0xdd);
        server.writer().write_all(&response).unwrap();
        server.write_wire(&mut s2c).unwrap();
        assert_eq!(s2c.buf, response);
        client.read_wire(&mut s2c).unwrap();
        assert_eq!(read_all(&mut client), response);
    }

    #[test]
    fn test_framed_unit_split_after_five_bytes() {
        let (mut client, mut server) = open_pair(config());
        let server_hello = record(b"\x16\x03\x03", 120, 0xcc);
        server.writer().write_all(&server_hello).unwrap();
        let wire = wire_of(&mut server);

        let engine = client.read_engine_mut();
        engine.feed(Segment::from(&wire[..5])).unwrap();
        assert!(!engine.reader().has_remaining());
        engine.feed(Segment::from(&wire[5..])).unwrap();
        assert_eq!(read_all(&mut client), server_hello);
    }

    #[test]
    fn test_framed_unit_fed_byte_by_byte() {
        let (mut client, mut server) = open_pair(config());
        let finished = record(b"\x14\x03\x03", 6, 0x01);
        client.writer().write_all(&finished).unwrap();
        let wire = wire_of(&mut client);
        assert_ne!(wire, finished);

        for byte in wire {
            server.read_engine_mut().feed(Segment::from(vec![byte])).unwrap();
        }
        assert_eq!(read_all(&mut server), finished);

        // raw records still pass afterwards
        let data = record(b"\x17\x03\x03", 64, 0x33);
        client.writer().write_all(&data).unwrap();
        let wire = wire_of(&mut client);
        server.read_engine_mut().feed(Segment::from(wire)).unwrap();
        assert_eq!(read_all(&mut server), data);
    }

    #[test]
    fn test_tampered_decoy_after_server_hello() {
        let (mut client, mut server) = open_pair(config());
        let server_hello = record(b"\x16\x03\x03", 120, 0xcc);
        server.writer().write_all(&server_hello).unwrap();
        let mut s2c = MockStream::default();
        s2c.buf = wire_of(&mut server);

        // unit | burst total(2) | len(2) | packet
        let unit_len = 2 + u16::from_be_bytes([s2c.buf[0], s2c.buf[1]]) as usize;
        s2c.buf[unit_len + 4 + 3] ^= 0x01;

        let mismatch = Error::DecoyMismatch(DecoyMismatch::PacketMismatch { index: 0 });
        let err = client.read_wire(&mut s2c).unwrap_err();
        assert_eq!(
            err.get_ref().and_then(|e| e.downcast_ref::<Error>()),
            Some(&mismatch)
        );
        // terminal: nothing is delivered and the error repeats
        let err = client.reader().read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(
            err.get_ref().and_then(|e| e.downcast_ref::<Error>()),
            Some(&mismatch)
        );
        assert_eq!(
            client.read_engine_mut().feed(Segment::from(vec![0x17])),
            Err(mismatch)
        );
    }

    #[test]
    fn test_handshake_without_padding_or_decoys() {
        let config = Config::builder_with_padding(0, 0)
            .unwrap()
            .without_split()
            .without_decoys();
        let mut c2s = MockStream::default();
        let mut s2c = MockStream::default();
        let (mut client, mut server) = pair(config);

        let client_hello = record(b"\x16\x03\x01", 64, 0x11);
        client.writer().write_all(&client_hello).unwrap();
        client.write_wire(&mut c2s).unwrap();
        // total | 00 00 | len | 00 00 | client hello
        assert_eq!(c2s.buf.len(), 2 + 2 + 2 + 2 + 64);

        server.read_wire(&mut c2s).unwrap();
        assert_eq!(server.request_header(), Some(&b""[..]));
        assert_eq!(read_all(&mut server), client_hello);
        server.write_wire(&mut s2c).unwrap();
        assert_eq!(s2c.buf, [0, 0]);

        let server_hello = record(b"\x16\x03\x03", 90, 0x22);
        server.writer().write_all(&server_hello).unwrap();
        server.write_wire(&mut s2c).unwrap();

        client.read_wire(&mut s2c).unwrap();
        assert_eq!(read_all(&mut client), server_hello);
    }

    #[test]
    fn test_tampered_decoy_aborts_both_sides() {
        let mut c2s = MockStream::default();
        let mut s2c = MockStream::default();
        let (mut client, mut server) = pair(config());

        client
            .writer()
            .write_all(&record(b"\x16\x03\x01", 300, 0xaa))
            .unwrap();
        client.write_wire(&mut c2s).unwrap();
        server.read_wire(&mut c2s).unwrap();
        server.write_wire(&mut s2c).unwrap();

        // flip a byte inside the first decoy packet:
        // placeholder(2) | total(2) | len(2) | packet
        s2c.buf[8] ^= 0x80;
        let err = client.read_wire(&mut s2c).unwrap_err();
        assert_eq!(
            err.get_ref().and_then(|e| e.downcast_ref::<Error>()),
            Some(&Error::DecoyMismatch(DecoyMismatch::PacketMismatch {
                index: 0
            }))
        );

        client
            .writer()
            .write_all(&record(b"\x17\x03\x03", 50, 0xbb))
            .unwrap();
        let err = client.write_wire(&mut c2s).unwrap_err();
        assert_eq!(
            err.get_ref().and_then(|e| e.downcast_ref::<Error>()),
            Some(&Error::SynchronizationAborted)
        );
    }

    #[test]
    fn test_eof_before_first_round() {
        let mut c2s = MockStream::default();
        let mut s2c = MockStream::default();
        let (mut client, _server) = pair(config());

        client
            .writer()
            .write_all(&record(b"\x16\x03\x01", 100, 0xaa))
            .unwrap();
        client.write_wire(&mut c2s).unwrap();
        client
            .writer()
            .write_all(&record(b"\x17\x03\x03", 10, 0xbb))
            .unwrap();

        s2c.set_eof();
        assert_eq!(client.read_wire(&mut s2c).unwrap(), 0);
        assert_eq!(client.reader().read(&mut [0u8; 4]).unwrap(), 0);
        let err = client.write_wire(&mut c2s).unwrap_err();
        assert_eq!(
            err.get_ref().and_then(|e| e.downcast_ref::<Error>()),
            Some(&Error::SynchronizationAborted)
        );
    }

    #[test]
    fn test_resolve_through_carrier() {
        let channel = SecureChannel::server(binding());
        let vision = Vision::resolve(config(), &channel, Role::Responder).unwrap();
        assert_eq!(vision.role(), Role::Responder);

        assert_eq!(
            Vision::resolve(config(), &Unbound, Role::Initiator).unwrap_err(),
            Error::UnresolvedBinding(UnresolvedBinding::NoSecureChannel)
        );
    }

    #[test]
    fn test_split_halves_across_threads() {
        let mut c2s = MockStream::default();
        let mut s2c = MockStream::default();
        let (mut client, server) = pair(config());
        let (mut server_read, mut server_write) = server.into_split();

        client
            .writer()
            .write_all(&record(b"\x16\x03\x01", 200, 0xaa))
            .unwrap();
        client.write_wire(&mut c2s).unwrap();

        server_write
            .writer()
            .write_all(&record(b"\x16\x03\x03", 80, 0xcc))
            .unwrap();
        let waiter = std::thread::spawn(move || {
            server_write.wait_first_round().map(|()| server_write)
        });

        server_read.read_wire(&mut c2s).unwrap();
        server_read.write_wire(&mut s2c).unwrap();
        let mut server_write = waiter.join().unwrap().unwrap();
        assert!(server_write.write_wire(&mut s2c).unwrap() > 0);
    }
}
