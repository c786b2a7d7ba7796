//! Compressed path prefix.
//!
//! A branch node skips the key bytes between its parent's branch byte and its
//! own. The skipped span is stored as a 16-bit length plus up to
//! [`MAX_INLINE_PREFIX`] inlined bytes, packed into one `u64` so the header
//! can publish a new prefix with a single atomic store.
//!
//! ```text
//! bits 0-15   length (total skipped bytes, may exceed the inline part)
//! bits 16-63  inline bytes 0..6
//! ```

use crate::key::key_byte;

/// Bytes of the prefix kept inline.
pub const MAX_INLINE_PREFIX: usize = 6;

/// A packed node prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Prefix {
    len: u16,
    bytes: [u8; MAX_INLINE_PREFIX],
}

impl Prefix {
    /// The empty prefix.
    pub const EMPTY: Self = Self {
        len: 0,
        bytes: [0; MAX_INLINE_PREFIX],
    };

    /// Prefix covering `key[start..start + len]` (zero padded).
    #[must_use]
    pub fn from_key(key: &[u8], start: usize, len: usize) -> Self {
        let mut bytes = [0u8; MAX_INLINE_PREFIX];
        for (i, b) in bytes.iter_mut().enumerate().take(len.min(MAX_INLINE_PREFIX)) {
            *b = key_byte(key, start + i);
        }
        Self {
            len: u16::try_from(len).unwrap_or(u16::MAX),
            bytes,
        }
    }

    /// Total prefix length.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// True for a zero-length prefix.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The inlined bytes (at most [`MAX_INLINE_PREFIX`]).
    #[inline]
    #[must_use]
    pub fn inline(&self) -> &[u8] {
        &self.bytes[..self.len().min(MAX_INLINE_PREFIX)]
    }

    /// True when the whole prefix is inline.
    #[inline]
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.len() <= MAX_INLINE_PREFIX
    }

    /// Pack into the header word.
    #[inline]
    #[must_use]
    pub const fn pack(&self) -> u64 {
        let mut word: u64 = self.len as u64;
        let mut i = 0;
        while i < MAX_INLINE_PREFIX {
            word |= (self.bytes[i] as u64) << (16 + 8 * i);
            i += 1;
        }
        word
    }

    /// Unpack a header word.
    #[inline]
    #[must_use]
    pub const fn unpack(word: u64) -> Self {
        let mut bytes = [0u8; MAX_INLINE_PREFIX];
        let mut i = 0;
        while i < MAX_INLINE_PREFIX {
            bytes[i] = (word >> (16 + 8 * i)) as u8;
            i += 1;
        }
        Self {
            len: word as u16,
            bytes,
        }
    }
}
