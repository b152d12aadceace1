//! Key mixing for the long map.
//!
//! The multiplier and shift are the MurmurHash64A finalizer constants. Only
//! distribution quality matters here: the mixed value never leaves the
//! process, so the exact bit pattern may change between releases.

const M: u64 = 0xc6a4a7935bd1e995;
const R: u32 = 47;

/// Mixes all 64 bits of `key` into a well distributed hash.
///
/// The low half of the result selects a slot inside a segment and the high
/// half selects the segment, so shard choice and slot choice are drawn from
/// different bits.
#[inline]
pub fn hash(key: u64) -> u64 {
    let mut h = key.wrapping_mul(M);
    h ^= h >> R;
    h.wrapping_mul(M)
}

/// Maps `hash` into `[0, capacity)`. `capacity` must be a power of two.
#[inline]
pub fn sign_safe_mod(hash: u64, capacity: usize) -> usize {
    debug_assert!(capacity.is_power_of_two());
    (hash as usize) & (capacity - 1)
}

/// Picks the segment owning `hash` among `segments` (a power of two).
#[inline]
pub(crate) fn segment_index(hash: u64, segments: usize) -> usize {
    debug_assert!(segments.is_power_of_two());
    ((hash >> 32) as usize) & (segments - 1)
}
