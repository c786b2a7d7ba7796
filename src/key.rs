//! Key helpers.
//!
//! Keys are opaque byte strings. The tree branches on one byte per level: at
//! depth `d` it reads `key[d]`, or `0` once `d` runs past the end of the key.
//! Comparing zero-padded keys byte by byte therefore agrees with plain
//! lexicographic order whenever the padded bytes differ somewhere, which is
//! what lets range scans prune subtrees by branch byte.
//!
//! Integer keys are stored big-endian so byte order equals numeric order.
//!
//! ```rust
//! use nvart::key::{decode_u64, encode_u64, key_byte};
//!
//! let k = encode_u64(0x0102);
//! assert_eq!(key_byte(&k, 6), 0x01);
//! assert_eq!(key_byte(&k, 7), 0x02);
//! assert_eq!(key_byte(&k, 8), 0);
//! assert_eq!(decode_u64(&k), Some(0x0102));
//! ```

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Byte of `key` at `depth`, zero past the end.
#[inline(always)]
#[must_use]
pub fn key_byte(key: &[u8], depth: usize) -> u8 {
    key.get(depth).copied().unwrap_or(0)
}

/// Encode an integer key big-endian.
#[inline]
#[must_use]
pub const fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decode an 8-byte big-endian key. `None` for any other length.
#[inline]
#[must_use]
pub fn decode_u64(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// FNV-1a over the key bytes.
#[inline]
#[must_use]
pub fn fnv1a_64(key: &[u8]) -> u64 {
    let mut h: u64 = FNV_OFFSET;
    for &b in key {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// 16-bit fingerprint stored next to a leaf address in a LeafArray slot.
///
/// Folds the 64-bit hash so every input byte influences the result.
#[inline]
#[must_use]
pub fn fingerprint(key: &[u8]) -> u16 {
    let h: u64 = fnv1a_64(key);
    let folded: u64 = h ^ (h >> 32);
    ((folded ^ (folded >> 16)) & 0xffff) as u16
}

/// First depth `>= from` at which the zero-padded keys differ.
///
/// `None` if they are equal at every depth up to `max(a.len(), b.len())`,
/// i.e. they differ at most in trailing zero bytes.
#[must_use]
pub fn first_difference(a: &[u8], b: &[u8], from: usize) -> Option<usize> {
    let end: usize = a.len().max(b.len());
    (from..end).find(|&d| key_byte(a, d) != key_byte(b, d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_byte_pads_with_zero() {
        assert_eq!(key_byte(b"ab", 0), b'a');
        assert_eq!(key_byte(b"ab", 1), b'b');
        assert_eq!(key_byte(b"ab", 2), 0);
        assert_eq!(key_byte(b"", 100), 0);
    }

    #[test]
    fn test_u64_order_matches_byte_order() {
        let values = [0u64, 1, 255, 256, 65_535, 1 << 40, u64::MAX - 1, u64::MAX];
        for pair in values.windows(2) {
            assert!(encode_u64(pair[0]) < encode_u64(pair[1]));
        }
        for v in values {
            assert_eq!(decode_u64(&encode_u64(v)), Some(v));
        }
        assert_eq!(decode_u64(b"short"), None);
    }

    #[test]
    fn test_fnv_known_vectors() {
        assert_eq!(fnv1a_64(b""), FNV_OFFSET);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint(b"hello"), fingerprint(b"hello"));
        let distinct = (0u64..1000)
            .map(|i| fingerprint(&encode_u64(i)))
            .collect::<std::collections::HashSet<_>>();
        // 1000 keys into 65536 buckets: collisions exist but are rare.
        assert!(distinct.len() > 950);
    }

    #[test]
    fn test_first_difference() {
        assert_eq!(first_difference(b"abc", b"abd", 0), Some(2));
        assert_eq!(first_difference(b"abc", b"abd", 3), None);
        assert_eq!(first_difference(b"ab", b"abc", 0), Some(2));
        assert_eq!(first_difference(b"a", b"a\0\0", 0), None);
        assert_eq!(first_difference(b"xa", b"ya", 1), None);
    }
}
