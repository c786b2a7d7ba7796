//! Leaf records.
//!
//! A leaf is one pool block holding a 16-byte header followed by the key and
//! value bytes. Key and value never change after the leaf is published; an
//! update writes a new leaf and swaps the LeafArray slot. Only the tombstone
//! flag is written in place.
//!
//! ```text
//! 0   key_len   u32
//! 4   value_len u32
//! 8   flags     u8   (bit 0: tombstone)
//! 9   padding
//! 16  key bytes, then value bytes
//! ```

use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ArtError;
use crate::pool::{PAddr, PmemPool, MAX_BLOCK};

/// Bytes before the key.
pub const LEAF_HEADER_SIZE: usize = 16;

/// Largest `key.len() + value.len()` a leaf can hold.
pub const MAX_RECORD: usize = MAX_BLOCK - LEAF_HEADER_SIZE;

const TOMBSTONE: u8 = 1;

/// View of a leaf block.
#[derive(Debug)]
#[repr(C)]
pub struct Leaf {
    key_len: u32,
    value_len: u32,
    flags: AtomicU8,
    _pad: [u8; 7],
}

impl Leaf {
    /// Allocate, fill and persist a leaf. The caller publishes it.
    ///
    /// # Errors
    /// [`ArtError::RecordTooLarge`] above [`MAX_RECORD`], or a pool error.
    pub fn create(
        pool: &PmemPool,
        key: &[u8],
        value: &[u8],
        tombstone: bool,
    ) -> Result<PAddr, ArtError> {
        check_record(key, value)?;

        let total: usize = LEAF_HEADER_SIZE + key.len() + value.len();
        let addr: PAddr = pool.alloc(total)?;
        let base: *mut u8 = pool.ptr(addr);

        // SAFETY: fresh zeroed block of at least `total` bytes, private to us
        // until the caller publishes `addr`.
        unsafe {
            let leaf: *mut Self = base.cast();
            (*leaf).key_len = key.len() as u32;
            (*leaf).value_len = value.len() as u32;
            (*leaf)
                .flags
                .store(if tombstone { TOMBSTONE } else { 0 }, Ordering::Relaxed);

            let body: *mut u8 = base.add(LEAF_HEADER_SIZE);
            ptr::copy_nonoverlapping(key.as_ptr(), body, key.len());
            ptr::copy_nonoverlapping(value.as_ptr(), body.add(key.len()), value.len());
        }

        pool.persist(base, total);
        Ok(addr)
    }

    /// Key length in bytes.
    #[inline]
    #[must_use]
    pub const fn key_len(&self) -> usize {
        self.key_len as usize
    }

    /// The key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &[u8] {
        // SAFETY: the block holds `key_len` key bytes right after the header
        // and they are immutable once published.
        unsafe { std::slice::from_raw_parts(self.body(), self.key_len()) }
    }

    /// The value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> &[u8] {
        // SAFETY: as for `key`, the value follows the key.
        unsafe {
            std::slice::from_raw_parts(self.body().add(self.key_len()), self.value_len as usize)
        }
    }

    /// True if the key is logically deleted.
    #[inline]
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flags.load(Ordering::Acquire) & TOMBSTONE != 0
    }

    /// Set the tombstone flag and persist it. Caller holds the owning
    /// LeafArray's lock.
    pub fn set_tombstone(&self, pool: &PmemPool) {
        self.flags.fetch_or(TOMBSTONE, Ordering::Release);
        pool.persist_val(&self.flags);
    }

    #[inline(always)]
    fn body(&self) -> *const u8 {
        // SAFETY: a leaf view always sits at the start of a block larger than
        // the header.
        unsafe { ptr::from_ref(self).cast::<u8>().add(LEAF_HEADER_SIZE) }
    }
}

/// Reject records that do not fit into one leaf block.
///
/// # Errors
/// [`ArtError::RecordTooLarge`].
pub fn check_record(key: &[u8], value: &[u8]) -> Result<(), ArtError> {
    if key.len() + value.len() > MAX_RECORD {
        return Err(ArtError::RecordTooLarge {
            key_len: key.len(),
            value_len: value.len(),
            limit: MAX_RECORD,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_pool;

    #[test]
    fn test_create_and_read() {
        let pool = test_pool();
        let addr = Leaf::create(&pool, b"key", b"value", false).unwrap();
        // SAFETY: just built.
        let leaf: &Leaf = unsafe { pool.get(addr) };

        assert_eq!(leaf.key(), b"key");
        assert_eq!(leaf.value(), b"value");
        assert!(!leaf.is_tombstone());

        leaf.set_tombstone(&pool);
        assert!(leaf.is_tombstone());
        assert_eq!(leaf.value(), b"value");
    }

    #[test]
    fn test_empty_key_and_value() {
        let pool = test_pool();
        let addr = Leaf::create(&pool, b"", b"", true).unwrap();
        // SAFETY: just built.
        let leaf: &Leaf = unsafe { pool.get(addr) };
        assert!(leaf.key().is_empty());
        assert!(leaf.value().is_empty());
        assert!(leaf.is_tombstone());
    }

    #[test]
    fn test_record_limit() {
        let pool = test_pool();
        let key = vec![1u8; 16];
        let fits = vec![2u8; MAX_RECORD - 16];
        assert!(Leaf::create(&pool, &key, &fits, false).is_ok());

        let too_big = vec![2u8; MAX_RECORD - 15];
        assert!(matches!(
            Leaf::create(&pool, &key, &too_big, false),
            Err(ArtError::RecordTooLarge { key_len: 16, .. })
        ));
    }
}
