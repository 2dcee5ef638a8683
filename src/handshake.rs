//! Recognition of TLS handshake records by their first bytes.
use crate::{
    segment::Segment,
    specification::{
        HANDSHAKE_PREFIX_LEN, TLS_CHANGE_CIPHER_SPEC_START, TLS_CLIENT_HANDSHAKE_START,
        TLS_SERVER_HANDSHAKE_START,
    },
};

/// Returns `true` if `prefix` starts with one of the known handshake record
/// prefixes: client hello, server hello or change cipher spec.
pub fn is_handshake(prefix: &[u8]) -> bool {
    [
        TLS_CLIENT_HANDSHAKE_START,
        TLS_SERVER_HANDSHAKE_START,
        TLS_CHANGE_CIPHER_SPEC_START,
    ]
    .iter()
    .any(|start| prefix.starts_with(start))
}

/// Returns `false` once `partial`, the first bytes of a record, can no longer
/// grow into a handshake prefix.
pub(crate) fn may_be_handshake(partial: &[u8]) -> bool {
    [
        TLS_CLIENT_HANDSHAKE_START,
        TLS_SERVER_HANDSHAKE_START,
        TLS_CHANGE_CIPHER_SPEC_START,
    ]
    .iter()
    .any(|start| start.iter().zip(partial).all(|(a, b)| a == b))
}

/// Classifies an outgoing buffer. Buffers of two bytes or fewer are never
/// handshake records.
pub(crate) fn is_handshake_record(segment: &Segment) -> bool {
    segment.len() >= HANDSHAKE_PREFIX_LEN && is_handshake(segment.peek(HANDSHAKE_PREFIX_LEN))
}
