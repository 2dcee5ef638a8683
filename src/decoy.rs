//! Authenticated decoy packets.
//!
//! A decoy packet is a pseudo-random byte string that both endpoints can
//! derive from the connection binding. Bursts of decoys follow handshake
//! records on the wire so the record sizes an observer sees do not match the
//! record sizes of the tunneled handshake. The receiver recomputes every
//! packet and rejects the connection on the first mismatch.
use std::time::{SystemTime, UNIX_EPOCH};

use aws_lc_rs::constant_time::verify_slices_are_equal;
use blake3::Hasher;
use rand::Rng;
use tracing::{trace, warn};

use crate::{
    binding::ConnectionBinding,
    codec::encode_unit,
    config::{DecoyRanges, SizeRange},
    error::{DecoyMismatch, Error},
    segment::{Segment, SegmentBatch},
    specification::RESPONSE_HEADER_PLACEHOLDER,
};

const DECOY_CONTEXT: &str = "segaro vision 2024-06 decoy packet";

/// Derives `length` pseudo-random bytes from the binding and the packet's
/// `time_interval`.
///
/// The output is deterministic and prefix-stable: the first `n` bytes of a
/// longer packet equal the packet of length `n`.
pub fn generate(
    auth_key: &[u8],
    client_time: SystemTime,
    time_interval: u64,
    length: usize,
) -> Vec<u8> {
    let seconds = client_time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let mut hasher = Hasher::new_derive_key(DECOY_CONTEXT);
    hasher.update(auth_key);
    hasher.update(&seconds.to_be_bytes());
    hasher.update(&time_interval.to_be_bytes());
    let mut packet = vec![0u8; length];
    hasher.finalize_xof().fill(&mut packet);
    packet
}

/// The derivation input of the `index`-th packet of a burst, given its
/// `length` and the minimum decoy size of the sending role.
pub fn time_interval(index: usize, length: usize, min_random_size: u32) -> u64 {
    (index as u64 + 1) * length as u64 + u64::from(min_random_size)
}

/// Checks every packet of a received burst against the locally derived
/// packets.
///
/// An empty burst is accepted only when decoys are disabled, i.e.
/// `min_random_size` is zero.
pub fn validate(
    burst: &[Segment],
    auth_key: &[u8],
    client_time: SystemTime,
    min_random_size: u32,
) -> Result<(), DecoyMismatch> {
    if burst.is_empty() {
        return if min_random_size == 0 {
            Ok(())
        } else {
            Err(DecoyMismatch::EmptyBurst)
        };
    }
    for (index, packet) in burst.iter().enumerate() {
        let len = packet.len();
        if len < min_random_size as usize {
            warn!(index, len, min = min_random_size, "decoy packet too short");
            return Err(DecoyMismatch::PacketTooShort {
                index,
                len,
                min: min_random_size,
            });
        }
        let expected = generate(
            auth_key,
            client_time,
            time_interval(index, len, min_random_size),
            len,
        );
        if verify_slices_are_equal(packet.as_slice(), &expected).is_err() {
            warn!(index, len, "decoy packet mismatch");
            return Err(DecoyMismatch::PacketMismatch { index });
        }
    }
    trace!(packets = burst.len(), "decoy burst validated");
    Ok(())
}

/// Builds a burst of decoys framed as one logical unit.
///
/// Returns `None` when `ranges` is disabled. With `prepend_header` the burst
/// is preceded by the 2-byte response header placeholder.
pub fn send_decoys<R: Rng>(
    binding: &ConnectionBinding,
    ranges: DecoyRanges,
    prepend_header: bool,
    rng: &mut R,
) -> Result<Option<SegmentBatch>, Error> {
    let DecoyRanges { size, count } = ranges;
    if !ranges.is_enabled() {
        return Ok(None);
    }
    let burst = decoy_packets(binding, size, count.sample(rng) as usize, rng);
    let mut unit = encode_unit(burst)?;
    if prepend_header {
        if let Some(first) = unit.first_mut() {
            first.prepend(&RESPONSE_HEADER_PLACEHOLDER);
        }
    }
    trace!(packets = unit.len(), prepend_header, "decoy burst built");
    Ok(Some(unit))
}

fn decoy_packets<R: Rng>(
    binding: &ConnectionBinding,
    size: SizeRange,
    count: usize,
    rng: &mut R,
) -> SegmentBatch {
    (0..count)
        .map(|index| {
            let len = size.sample(rng) as usize;
            let packet = generate(
                binding.auth_key().as_bytes(),
                binding.established_time(),
                time_interval(index, len, size.min()),
                len,
            );
            Segment::from(packet)
        })
        .collect()
}
