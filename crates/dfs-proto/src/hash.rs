//! FNV-1a hash functions for ring placement.
//!
//! Filenames are hashed onto the ring keyspace `0..=RING_MAX`. Collisions
//! during replica selection are resolved by re-hashing the previous hash
//! value, giving a deterministic probe sequence per filename.

use crate::constants::RING_MAX;

/// FNV-1a 64-bit initial basis.
const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_64_PRIME: u64 = 0x0100_0000_01b3;

/// Compute FNV-1a hash over a byte buffer.
#[inline]
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for &byte in buf {
        hval ^= byte as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Compute FNV-1a hash over a single u64 value.
#[inline]
pub fn fnv_64a_64(val: u64, mut hval: u64) -> u64 {
    for i in 0..8 {
        hval ^= (val >> (i * 8)) & 0xff;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Hash a filename (double-hash for better distribution).
#[inline]
pub fn file_hash(name: &str) -> u64 {
    let hval = fnv_64a_buf(name.as_bytes(), FNV1A_64_INIT);
    fnv_64a_64(hval, hval)
}

/// Hash the next value in a probe chain.
#[inline]
pub fn rehash(hval: u64) -> u64 {
    fnv_64a_64(hval, hval)
}

/// Fold a 64-bit hash onto a ring position.
#[inline]
pub fn ring_position(hval: u64) -> u32 {
    (hval % (RING_MAX as u64 + 1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_hash_deterministic() {
        assert_eq!(file_hash("fileA"), file_hash("fileA"));
    }

    #[test]
    fn test_file_hash_different_inputs() {
        assert_ne!(file_hash("fileA"), file_hash("fileB"));
    }

    #[test]
    fn test_rehash_changes_value() {
        let h = file_hash("fileA");
        assert_ne!(rehash(h), h);
        assert_eq!(rehash(h), rehash(h));
    }

    #[test]
    fn test_ring_position_in_range() {
        for name in ["a", "fileA", "some/long-ish_name.txt", ""] {
            assert!(ring_position(file_hash(name)) <= RING_MAX);
        }
        assert_eq!(ring_position(RING_MAX as u64), RING_MAX);
        assert_eq!(ring_position(RING_MAX as u64 + 1), 0);
    }
}
