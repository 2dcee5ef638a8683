//! Segaro is a traffic-shaping stream engine for proxy transports. It carries
//! an inner TLS session over a connection that is already encrypted, and
//! hides the record lengths and timing of the inner handshake from traffic
//! analysis.
//!
//! ## How It Works
//!
//! Handshake records of the inner session (client hello, server hello,
//! change cipher spec) are split into pieces of random length, interleaved
//! with random padding and framed as length-prefixed units. Every framed
//! handshake record is followed by a burst of decoy packets. Decoys are
//! derived from a secret both endpoints already share, so the receiver
//! recomputes and checks each of them without any extra bytes on the wire.
//! Application data after the handshake passes through unmodified.
//!
//! The first round of every connection is fixed: the initiator sends one
//! inflated chunk, the responder answers with a decoy burst, and only after
//! that burst validated does either side send anything else.
//!
//! ## Quick Start
//!
//! Segaro provides two interfaces: [`Vision`] and [`SegaroStream`].
//!
//! * [`Vision`]
//!
//!   `Vision` is a deterministic state machine following the sans-I/O
//!   principle. It does not include any network I/O code or spawn internal
//!   threads. It is driven with any handle implementing [`Read`] and
//!   [`Write`] (e.g., [`TcpStream`]), and can be split into a
//!   [`ReadEngine`] and a [`WriteEngine`] to drive the two directions from
//!   different threads.
//!
//! * [`SegaroStream`]
//!
//!   For asynchronous scenarios, Segaro provides a ready-to-use stream based
//!   on tokio. `SegaroStream` requires the underlying transport to implement
//!   the [`AsyncRead`] and [`AsyncWrite`] traits and the `tokio-stream-impl`
//!   feature to be enabled.
//!
//! ## Connection Binding
//!
//! Decoys are keyed by a [`ConnectionBinding`]: the authentication key and
//! establishment time of the secure channel beneath the carrier. Carrier
//! wrappers implement [`ResolveBinding`] so the binding can be found through
//! any number of layers; see the [`binding`] module.
//!
//! ## Configuration
//!
//! [`Config`] holds the padding block and sub-chunk sizes, the split size
//! range and the decoy ranges of both roles. Any range with a zero bound
//! disables its feature. For details, refer to the [`config`] module.
//!
//! [`Read`]: std::io::Read
//! [`Write`]: std::io::Write
//! [`TcpStream`]: std::net::TcpStream
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod binding;
pub mod codec;
pub mod config;
pub mod decoy;
pub mod error;
pub mod handshake;
pub mod padding;
pub mod segment;

mod read_engine;
mod signal;
mod specification;
mod state_machine;
mod write_engine;

#[cfg(feature = "tokio-stream-impl")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-stream-impl")))]
mod tokio_stream_impl;

pub use binding::{AuthKey, ConnectionBinding, ResolveBinding, Role};
pub use config::{Config, ConfigError, DecoyRanges, SizeRange};
pub use error::Error;
pub use segment::{Segment, SegmentBatch};

pub use read_engine::{ActivityTracker, ReadEngine, Reader};
pub use state_machine::Vision;
pub use write_engine::{WriteEngine, Writer};
#[cfg(feature = "tokio-stream-impl")]
pub use tokio_stream_impl::SegaroStream;

#[cfg(test)]
mod test {
    use std::io::{self, ErrorKind, Read, Write};

    #[derive(Debug)]
    pub(crate) struct MockStream {
        pub(crate) buf: Vec<u8>,
        pub(crate) eof: bool,
    }

    impl MockStream {
        #[allow(unused)]
        pub(crate) fn set_eof(&mut self) {
            self.buf.clear();
            self.eof = true;
        }

        #[allow(unused)]
        pub(crate) fn clear(&mut self) {
            self.buf.clear();
            self.eof = false;
        }
    }

    impl Default for MockStream {
        fn default() -> Self {
            Self {
                buf: Vec::with_capacity(65536),
                eof: false,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.eof {
                return Ok(0);
            }
            if self.buf.is_empty() {
                return Err(io::Error::new(ErrorKind::WouldBlock, "empty buffer"));
            }
            let n = core::cmp::min(buf.len(), self.buf.len());
            buf[..n].copy_from_slice(&self.buf[..n]);
            self.buf = self.buf.split_off(n);
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.eof {
                return Ok(0);
            }
            self.buf.extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
