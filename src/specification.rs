//! The informal specification of the Segaro/Vision wire format.

// Logical unit:
// ```text
// | total | len_1 | chunk_1 | len_2 | chunk_2 | ... | len_n | chunk_n |
// |  2B   |  2B   |  len_1  |  2B   |  len_2  |     |  2B   |  len_n  |
// |       |                     <- total bytes ->                     |
// ```
// All length fields are big-endian. `total` counts every byte that follows
// it, length fields included.
pub(crate) const LEN_FIELD_LEN: usize = 2;
pub(crate) const UNIT_MAX_LEN: usize = u16::MAX as usize;
pub(crate) const CHUNK_MAX_LEN: usize = u16::MAX as usize;

// Padded chunk, one entry per sub-chunk:
// ```text
// | padding      | data              | padding      | data              | ...
// | padding_size | <= subchunk_size  | padding_size | <= subchunk_size  |
// ```
// The padding bytes are random.

// Initiator's first unit:
// ```text
// | total | pad_len | pad     | len_1 | padded chunk_1 | ... |
// |  2B   |   2B    | pad_len |  2B   |     len_1      |     |
// ```
// `pad_len | pad` is itself a chunk (the inflation chunk) and may be empty.
// After padding removal the remaining chunks carry:
// ```text
// | header_len | header     | payload  |
// |     2B     | header_len | variable |
// ```
pub(crate) const REQUEST_HEADER_LEN_FIELD: usize = 2;

// Responder's first burst:
// ```text
// | 0x00 0x00 | total | len_1 | decoy_1 | ... | len_n | decoy_n |
// |    2B     |  2B   |  2B   |  len_1  |     |  2B   |  len_n  |
// ```
// The leading zero pair is the response header placeholder. When the server
// decoy ranges are disabled only the placeholder is sent.
pub(crate) const RESPONSE_HEADER_PLACEHOLDER: [u8; 2] = [0, 0];

// A responder marks its first write call with a request header equal to the
// placeholder. Any other header means the caller is the initiator.
pub(crate) const RESPONDER_SENTINEL: [u8; 2] = RESPONSE_HEADER_PLACEHOLDER;

// Handshake record prefixes (TLS record type | legacy version).
pub(crate) const TLS_CLIENT_HANDSHAKE_START: &[u8] = &[0x16, 0x03];
pub(crate) const TLS_SERVER_HANDSHAKE_START: &[u8] = &[0x16, 0x03, 0x03];
pub(crate) const TLS_CHANGE_CIPHER_SPEC_START: &[u8] = &[0x14, 0x03, 0x03];
pub(crate) const HANDSHAKE_PREFIX_LEN: usize = 3;

// In streaming mode a segment starting a framed unit carries the first data
// byte after `total`, `len_1` and one padding block:
// ```text
// | total | len_1 | padding      | 16 03 03 ... |
// |  2B   |  2B   | padding_size |              |
// ```
pub(crate) const FRAMED_DATA_OFFSET: usize = 2 * LEN_FIELD_LEN;

// Size of a single read from the carrier.
pub(crate) const READ_BUF_LEN: usize = 32 * 1024;
