//! Splitting payloads into padded pieces, and the inverse.
//!
//! A padded piece is a run of sub-chunks, each one a block of
//! `padding_size` random bytes followed by at most `subchunk_size` payload
//! bytes:
//!
//! ```text
//! | padding | data | padding | data | ... | padding | data (tail) |
//! ```
//!
//! Payloads are first cut into pieces whose length is sampled from the split
//! size range, so one payload becomes several chunks of a logical unit.
use rand::Rng;

use crate::{
    config::SizeRange,
    segment::{Segment, SegmentBatch},
    specification::LEN_FIELD_LEN,
};

/// Splits `segment` into padded pieces.
///
/// With padding disabled (`padding_size` or `subchunk_size` is zero) the
/// segment is returned unchanged as a single piece. With `split` disabled the
/// payload is not cut. An empty payload yields one piece of padding only.
pub fn add_padding<R: Rng>(
    segment: Segment,
    split: SizeRange,
    padding_size: u32,
    subchunk_size: u32,
    rng: &mut R,
) -> SegmentBatch {
    if padding_size == 0 || subchunk_size == 0 {
        return vec![segment];
    }
    let padding_size = padding_size as usize;
    let subchunk_size = subchunk_size as usize;

    let mut pieces = SegmentBatch::new();
    let mut rest = segment.as_slice();
    loop {
        let take = if split.is_enabled() {
            core::cmp::min(split.sample(rng) as usize, rest.len())
        } else {
            rest.len()
        };
        let (piece, tail) = rest.split_at(take);
        pieces.push(pad_piece(piece, padding_size, subchunk_size, rng));
        rest = tail;
        if rest.is_empty() {
            break;
        }
    }
    pieces
}

fn pad_piece<R: Rng>(
    piece: &[u8],
    padding_size: usize,
    subchunk_size: usize,
    rng: &mut R,
) -> Segment {
    let n_subchunks = core::cmp::max(1, piece.len().div_ceil(subchunk_size));
    let mut out = Segment::with_headroom(
        2 * LEN_FIELD_LEN,
        n_subchunks * padding_size + piece.len(),
    );
    let mut padding = vec![0u8; padding_size];
    if piece.is_empty() {
        rng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
        return out;
    }
    for data in piece.chunks(subchunk_size) {
        rng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
        out.extend_from_slice(data);
    }
    out
}

/// Strips the padding from every piece in `batch` and joins the payload.
///
/// This is the inverse of [`add_padding`] for the same `padding_size` and
/// `subchunk_size`. With padding disabled the pieces are concatenated.
pub fn remove_padding(batch: SegmentBatch, padding_size: u32, subchunk_size: u32) -> Segment {
    let capacity = batch.iter().map(Segment::len).sum();
    let mut out = Segment::from(Vec::with_capacity(capacity));
    if padding_size == 0 || subchunk_size == 0 {
        for piece in &batch {
            out.extend_from_slice(piece.as_slice());
        }
        return out;
    }
    let padding_size = padding_size as usize;
    let subchunk_size = subchunk_size as usize;
    for piece in &batch {
        let mut rest = piece.as_slice();
        while !rest.is_empty() {
            rest = &rest[core::cmp::min(padding_size, rest.len())..];
            let take = core::cmp::min(subchunk_size, rest.len());
            out.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
    }
    out
}
