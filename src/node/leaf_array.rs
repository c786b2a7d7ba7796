//! LeafArray: a batch of up to 64 leaves hanging off one branch byte.
//!
//! Each slot packs a leaf address (low 48 bits) with the key's 16-bit
//! fingerprint, so a lookup touches only the leaves whose fingerprint
//! matches. Slots are unordered; readers sort when order matters.
//!
//! Every LeafArray is also a node of the doubly linked list that threads all
//! leaves in key order, rooted at the head sentinel. The `next` links are the
//! durable ones; `prev` links are rebuilt by recovery.
//!
//! The slot word is the commit point of an insert or removal. The `bitmap`
//! mirrors which slots are occupied for writers looking for room and is
//! rebuilt from the slots on recovery.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{Leaf, NodeHeader, NodeType, Prefix};
use crate::key::fingerprint;
use crate::pool::{PAddr, PmemPool};

/// Slots per LeafArray.
pub const LEAF_ARRAY_SLOTS: usize = 64;

const ADDR_BITS: u32 = 48;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// Decoded LeafArray slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafSlot {
    /// Leaf block.
    pub leaf: PAddr,
    /// Fingerprint of the leaf's key.
    pub fingerprint: u16,
}

impl LeafSlot {
    /// Slot for a leaf holding `key`.
    #[must_use]
    pub fn for_key(leaf: PAddr, key: &[u8]) -> Self {
        Self {
            leaf,
            fingerprint: fingerprint(key),
        }
    }

    /// Pack into a slot word.
    #[inline]
    #[must_use]
    pub const fn pack(self) -> u64 {
        (self.leaf.get() & ADDR_MASK) | ((self.fingerprint as u64) << ADDR_BITS)
    }

    /// Unpack a slot word. `None` for an empty slot.
    #[inline]
    #[must_use]
    pub const fn unpack(word: u64) -> Option<Self> {
        if word & ADDR_MASK == 0 {
            return None;
        }
        Some(Self {
            leaf: PAddr::new(word & ADDR_MASK),
            fingerprint: (word >> ADDR_BITS) as u16,
        })
    }
}

/// A LeafArray node.
#[derive(Debug)]
#[repr(C)]
pub struct LeafArray {
    header: NodeHeader,
    bitmap: AtomicU64,
    prev: AtomicU64,
    next: AtomicU64,
    slots: [AtomicU64; LEAF_ARRAY_SLOTS],
}

impl LeafArray {
    /// Initialize a freshly allocated block. Nothing is persisted.
    pub fn init(&self, level: usize) {
        let level: u32 = u32::try_from(level).unwrap_or(u32::MAX);
        self.header.init(NodeType::LeafArray, level, Prefix::EMPTY);
        self.bitmap.store(0, Ordering::Relaxed);
        self.prev.store(0, Ordering::Relaxed);
        self.next.store(0, Ordering::Relaxed);
    }

    /// The node header.
    #[inline(always)]
    #[must_use]
    pub const fn header(&self) -> &NodeHeader {
        &self.header
    }

    // ========================================================================
    //  Readers
    // ========================================================================

    /// Slot `i`, if occupied.
    #[inline]
    #[must_use]
    pub fn slot(&self, i: usize) -> Option<LeafSlot> {
        LeafSlot::unpack(self.slots[i].load(Ordering::Acquire))
    }

    /// Occupied slots as `(index, slot)`, in slot order.
    #[must_use]
    pub fn occupied(&self) -> Vec<(usize, LeafSlot)> {
        (0..LEAF_ARRAY_SLOTS)
            .filter_map(|i| self.slot(i).map(|s| (i, s)))
            .collect()
    }

    /// Find the slot holding `key`, tombstoned or not.
    ///
    /// # Safety
    /// The caller is pinned, so every leaf a slot points to is allocated.
    #[must_use]
    pub unsafe fn find<'p>(&self, pool: &'p PmemPool, key: &[u8]) -> Option<(usize, &'p Leaf)> {
        let fp: u16 = fingerprint(key);
        for i in 0..LEAF_ARRAY_SLOTS {
            let Some(slot) = self.slot(i) else {
                continue;
            };
            if slot.fingerprint != fp {
                continue;
            }
            // SAFETY: forwarded to the caller.
            let leaf: &Leaf = unsafe { pool.get(slot.leaf) };
            if leaf.key() == key {
                return Some((i, leaf));
            }
        }
        None
    }

    /// Occupied slot count according to the bitmap.
    #[inline]
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.bitmap.load(Ordering::Acquire).count_ones() as usize
    }

    /// True if every slot is occupied.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.bitmap.load(Ordering::Acquire) == u64::MAX
    }

    /// First unoccupied slot.
    #[inline]
    #[must_use]
    pub fn free_slot(&self) -> Option<usize> {
        let free: u64 = !self.bitmap.load(Ordering::Acquire);
        (free != 0).then(|| free.trailing_zeros() as usize)
    }

    /// Left neighbor in the leaf list (null for the head sentinel).
    #[inline]
    #[must_use]
    pub fn prev(&self) -> PAddr {
        PAddr::new(self.prev.load(Ordering::Acquire))
    }

    /// Right neighbor in the leaf list (null at the end).
    #[inline]
    #[must_use]
    pub fn next(&self) -> PAddr {
        PAddr::new(self.next.load(Ordering::Acquire))
    }

    // ========================================================================
    //  Writers (LeafArray lock held, or the node is still private)
    // ========================================================================

    /// Publish `slot` at index `i` and persist the slot word.
    pub fn insert_slot(&self, pool: &PmemPool, i: usize, slot: LeafSlot) {
        debug_assert!(self.slot(i).is_none());
        self.slots[i].store(slot.pack(), Ordering::Release);
        pool.persist_val(&self.slots[i]);
        self.bitmap.fetch_or(1 << i, Ordering::Release);
    }

    /// Clear slot `i` and persist.
    pub fn remove_slot(&self, pool: &PmemPool, i: usize) {
        self.slots[i].store(0, Ordering::Release);
        pool.persist_val(&self.slots[i]);
        self.bitmap.fetch_and(!(1 << i), Ordering::Release);
    }

    /// Swap the leaf in slot `i` and persist.
    pub fn replace_slot(&self, pool: &PmemPool, i: usize, slot: LeafSlot) {
        debug_assert!(self.slot(i).is_some());
        self.slots[i].store(slot.pack(), Ordering::Release);
        pool.persist_val(&self.slots[i]);
    }

    /// Fill slot `i` of a node nobody else can see. Not persisted.
    pub fn fill_slot(&self, i: usize, slot: LeafSlot) {
        self.slots[i].store(slot.pack(), Ordering::Relaxed);
        self.bitmap.fetch_or(1 << i, Ordering::Relaxed);
    }

    /// Set the left link and persist it.
    pub fn set_prev(&self, pool: &PmemPool, prev: PAddr) {
        self.prev.store(prev.get(), Ordering::Release);
        pool.persist_val(&self.prev);
    }

    /// Set the right link and persist it.
    pub fn set_next(&self, pool: &PmemPool, next: PAddr) {
        self.next.store(next.get(), Ordering::Release);
        pool.persist_val(&self.next);
    }

    /// Set both links of a node nobody else can see. Not persisted.
    pub fn fill_links(&self, prev: PAddr, next: PAddr) {
        self.prev.store(prev.get(), Ordering::Relaxed);
        self.next.store(next.get(), Ordering::Relaxed);
    }

    /// Rebuild the bitmap from the durable slots.
    pub fn recover(&self) {
        let bitmap: u64 = (0..LEAF_ARRAY_SLOTS)
            .filter(|&i| self.slots[i].load(Ordering::Relaxed) != 0)
            .fold(0u64, |acc, i| acc | (1 << i));
        self.bitmap.store(bitmap, Ordering::Relaxed);
        self.header.set_count(bitmap.count_ones() as usize);
    }
}

/// Allocate a LeafArray holding `leaves`, with the given links, and persist
/// it. The caller publishes it.
///
/// # Errors
/// Pool exhaustion.
pub fn build_leaf_array(
    pool: &PmemPool,
    level: usize,
    leaves: &[LeafSlot],
    prev: PAddr,
    next: PAddr,
) -> Result<PAddr, crate::error::ArtError> {
    debug_assert!(leaves.len() <= LEAF_ARRAY_SLOTS);

    let addr: PAddr = pool.alloc(NodeType::LeafArray.size())?;
    // SAFETY: fresh zeroed block of LeafArray size, private to us.
    let la: &LeafArray = unsafe { pool.get(addr) };

    la.init(level);
    for (i, &slot) in leaves.iter().enumerate() {
        la.fill_slot(i, slot);
    }
    la.fill_links(prev, next);
    pool.persist_addr(addr, NodeType::LeafArray.size());

    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_pool;

    #[test]
    fn test_slot_pack_unpack() {
        let slot = LeafSlot {
            leaf: PAddr::new(0x0000_1234_5678_9ac0),
            fingerprint: 0xbeef,
        };
        assert_eq!(LeafSlot::unpack(slot.pack()), Some(slot));
        assert_eq!(LeafSlot::unpack(0), None);
    }

    #[test]
    fn test_find_by_key() {
        let pool = test_pool();
        let a = Leaf::create(&pool, b"alpha", b"1", false).unwrap();
        let b = Leaf::create(&pool, b"beta", b"2", false).unwrap();

        let addr = build_leaf_array(
            &pool,
            1,
            &[LeafSlot::for_key(a, b"alpha"), LeafSlot::for_key(b, b"beta")],
            PAddr::NULL,
            PAddr::NULL,
        )
        .unwrap();
        // SAFETY: just built.
        let la: &LeafArray = unsafe { pool.get(addr) };

        assert_eq!(la.leaf_count(), 2);
        // SAFETY: single-threaded test, nothing is freed.
        let (i, leaf) = unsafe { la.find(&pool, b"beta") }.unwrap();
        assert_eq!(i, 1);
        assert_eq!(leaf.value(), b"2");
        assert!(unsafe { la.find(&pool, b"gamma") }.is_none());
    }

    #[test]
    fn test_free_slot_and_full() {
        let pool = test_pool();
        let addr = build_leaf_array(&pool, 1, &[], PAddr::NULL, PAddr::NULL).unwrap();
        // SAFETY: just built.
        let la: &LeafArray = unsafe { pool.get(addr) };

        for i in 0..LEAF_ARRAY_SLOTS {
            assert_eq!(la.free_slot(), Some(i));
            let slot = LeafSlot {
                leaf: PAddr::new(0x1000 + 64 * i as u64),
                fingerprint: 0,
            };
            la.insert_slot(&pool, i, slot);
        }
        assert!(la.is_full());
        assert_eq!(la.free_slot(), None);

        la.remove_slot(&pool, 17);
        assert_eq!(la.free_slot(), Some(17));
        assert_eq!(la.occupied().len(), 63);
    }

    #[test]
    fn test_recover_bitmap() {
        let pool = test_pool();
        let addr = build_leaf_array(&pool, 1, &[], PAddr::NULL, PAddr::NULL).unwrap();
        // SAFETY: just built.
        let la: &LeafArray = unsafe { pool.get(addr) };

        la.slots[3].store(
            LeafSlot {
                leaf: PAddr::new(0x4000),
                fingerprint: 7,
            }
            .pack(),
            Ordering::Relaxed,
        );
        assert_eq!(la.leaf_count(), 0);

        la.recover();
        assert_eq!(la.leaf_count(), 1);
        assert_eq!(la.free_slot(), Some(0));
        assert_eq!(la.header().count(), 1);
    }
}
