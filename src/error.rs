//! All possible non-I/O engine errors.
//!
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

use crate::binding::Role;

/// Enumeration of all possible non-I/O engine errors.
///
/// Every variant is fatal for the connection it was raised on. An engine that
/// returned one of these errors stays terminated and returns the same error on
/// every later call.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// A length prefix disagreed with the bytes that followed it.
    ///
    /// This is typically caused by a peer that does not speak the protocol,
    /// truncation of the carrier, or a configuration mismatch between the two
    /// endpoints (e.g. different padding sizes).
    MalformedFraming(MalformedFraming),

    /// A decoy packet did not match the packet derived locally from the
    /// connection binding.
    ///
    /// # Suggested error handling strategy
    ///
    /// Treat it as evidence of tampering or of a peer holding a different
    /// binding. Tear the connection down in both directions.
    DecoyMismatch(DecoyMismatch),

    /// The carrier connection could not provide a connection binding.
    UnresolvedBinding(UnresolvedBinding),

    /// The first-round exchange failed on the read side, so the write side
    /// will never be released.
    SynchronizationAborted,
}

/// Framing violations detected while encoding or decoding logical units.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum MalformedFraming {
    /// A batch with no chunks was given to the unit encoder.
    EmptyBatch,

    /// A unit declared a total length of zero.
    EmptyUnit,

    /// The encoded unit does not fit in the 2-byte total length field.
    UnitTooLong {
        /// The length the unit would need.
        len: usize,
    },

    /// A chunk does not fit in its 2-byte length field.
    ChunkTooLong {
        /// The length of the chunk.
        len: usize,
    },

    /// The unit ended in the middle of a chunk length field.
    MissingChunkLength {
        /// The number of bytes left in the unit.
        remaining: usize,
    },

    /// A chunk declared more bytes than the unit holds.
    TruncatedChunk {
        /// The declared chunk length.
        declared: u16,
        /// The number of bytes left in the unit.
        available: usize,
    },

    /// The initiator's first unit is too short to hold the request header.
    TruncatedRequestHeader {
        /// The declared header length, if it could be read.
        declared: Option<u16>,
        /// The number of bytes available after padding removal.
        available: usize,
    },
}

/// Reasons a decoy burst was rejected.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum DecoyMismatch {
    /// A decoy burst was expected but held no packets.
    EmptyBurst,

    /// A decoy packet is shorter than the minimum decoy size.
    PacketTooShort {
        /// Index of the packet in its burst.
        index: usize,
        /// The received length.
        len: usize,
        /// The configured minimum size.
        min: u32,
    },

    /// A decoy packet does not match the locally derived bytes.
    PacketMismatch {
        /// Index of the packet in its burst.
        index: usize,
    },
}

/// Reasons a connection binding could not be resolved.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum UnresolvedBinding {
    /// The carrier is not backed by a secure channel.
    NoSecureChannel,

    /// The secure channel was negotiated for the other side of the
    /// connection.
    RoleMismatch {
        /// The role the channel was negotiated for.
        bound: Role,
        /// The role that was asked for.
        requested: Role,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::MalformedFraming(err) => write!(f, "MalformedFraming: {}", err),
            Error::DecoyMismatch(err) => write!(f, "DecoyMismatch: {}", err),
            Error::UnresolvedBinding(err) => write!(f, "UnresolvedBinding: {}", err),
            Error::SynchronizationAborted => write!(f, "SynchronizationAborted"),
        }
    }
}

impl Display for MalformedFraming {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            MalformedFraming::EmptyBatch => write!(f, "EmptyBatch"),
            MalformedFraming::EmptyUnit => write!(f, "EmptyUnit"),
            MalformedFraming::UnitTooLong { len } => write!(f, "UnitTooLong: {} bytes", len),
            MalformedFraming::ChunkTooLong { len } => write!(f, "ChunkTooLong: {} bytes", len),
            MalformedFraming::MissingChunkLength { remaining } => {
                write!(f, "MissingChunkLength: {} bytes remaining", remaining)
            }
            MalformedFraming::TruncatedChunk {
                declared,
                available,
            } => write!(
                f,
                "TruncatedChunk: declared {}, available {}",
                declared, available
            ),
            MalformedFraming::TruncatedRequestHeader {
                declared,
                available,
            } => write!(
                f,
                "TruncatedRequestHeader: declared {:?}, available {}",
                declared, available
            ),
        }
    }
}

impl Display for DecoyMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            DecoyMismatch::EmptyBurst => write!(f, "EmptyBurst"),
            DecoyMismatch::PacketTooShort { index, len, min } => write!(
                f,
                "PacketTooShort: packet {} has {} bytes, minimum {}",
                index, len, min
            ),
            DecoyMismatch::PacketMismatch { index } => {
                write!(f, "PacketMismatch: packet {}", index)
            }
        }
    }
}

impl Display for UnresolvedBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            UnresolvedBinding::NoSecureChannel => write!(f, "NoSecureChannel"),
            UnresolvedBinding::RoleMismatch { bound, requested } => write!(
                f,
                "RoleMismatch: bound {:?}, requested {:?}",
                bound, requested
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::MalformedFraming(err) => Some(err),
            Error::DecoyMismatch(err) => Some(err),
            Error::UnresolvedBinding(err) => Some(err),
            Error::SynchronizationAborted => None,
        }
    }
}

impl error::Error for MalformedFraming {}

impl error::Error for DecoyMismatch {}

impl error::Error for UnresolvedBinding {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(ErrorKind::Other, e)
    }
}

impl From<MalformedFraming> for io::Error {
    fn from(e: MalformedFraming) -> Self {
        io::Error::new(ErrorKind::Other, Error::MalformedFraming(e))
    }
}

impl From<DecoyMismatch> for io::Error {
    fn from(e: DecoyMismatch) -> Self {
        io::Error::new(ErrorKind::Other, Error::DecoyMismatch(e))
    }
}

impl From<UnresolvedBinding> for io::Error {
    fn from(e: UnresolvedBinding) -> Self {
        io::Error::new(ErrorKind::Other, Error::UnresolvedBinding(e))
    }
}

impl From<MalformedFraming> for Error {
    fn from(e: MalformedFraming) -> Self {
        Error::MalformedFraming(e)
    }
}

impl From<DecoyMismatch> for Error {
    fn from(e: DecoyMismatch) -> Self {
        Error::DecoyMismatch(e)
    }
}

impl From<UnresolvedBinding> for Error {
    fn from(e: UnresolvedBinding) -> Self {
        Error::UnresolvedBinding(e)
    }
}
