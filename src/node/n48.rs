//! N48: byte-indexed node with 48 child slots.
//!
//! `child_index[b]` holds `slot + 1` for the slot owning byte `b`, or 0. An
//! insert writes the child into a free slot, persists it, then publishes the
//! index byte (the commit). A removal clears the index byte first, so a crash
//! can leave at most an unreferenced child slot, which recovery clears.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use super::{Branch, NodeHeader, NodeType};
use crate::pool::{PAddr, PmemPool};

const SLOTS: usize = 48;

/// Branch node with up to 48 children.
#[derive(Debug)]
#[repr(C)]
pub struct N48 {
    header: NodeHeader,
    child_index: [AtomicU8; 256],
    children: [AtomicU64; SLOTS],
}

impl N48 {
    /// Live children at or below which a non-root N48 shrinks to an N16.
    pub const SHRINK_LIMIT: usize = 12;

    #[inline]
    fn slot_of(&self, byte: u8) -> Option<usize> {
        match self.child_index[byte as usize].load(Ordering::Acquire) {
            0 => None,
            idx => Some(idx as usize - 1),
        }
    }

    fn free_slot(&self) -> Option<usize> {
        (0..SLOTS).find(|&i| self.children[i].load(Ordering::Relaxed) == 0)
    }
}

impl Branch for N48 {
    #[inline(always)]
    fn header(&self) -> &NodeHeader {
        &self.header
    }

    fn kind(&self) -> NodeType {
        NodeType::N48
    }

    #[inline]
    fn find_child(&self, byte: u8) -> PAddr {
        self.slot_of(byte).map_or(PAddr::NULL, |slot| {
            PAddr::new(self.children[slot].load(Ordering::Acquire))
        })
    }

    fn children(&self) -> Vec<(u8, PAddr)> {
        (0..=255u8)
            .filter_map(|b| {
                let child: PAddr = self.find_child(b);
                (!child.is_null()).then_some((b, child))
            })
            .collect()
    }

    fn has_room(&self) -> bool {
        self.header.count() < SLOTS
    }

    fn insert_child(&self, pool: &PmemPool, byte: u8, child: PAddr) {
        debug_assert!(self.slot_of(byte).is_none());
        let Some(slot) = self.free_slot() else {
            debug_assert!(false, "insert_child on a full N48");
            return;
        };

        self.children[slot].store(child.get(), Ordering::Release);
        pool.persist_val(&self.children[slot]);
        self.child_index[byte as usize].store(slot as u8 + 1, Ordering::Release);
        pool.persist_val(&self.child_index[byte as usize]);

        self.header.set_count(self.header.count() + 1);
    }

    fn fill_child(&self, byte: u8, child: PAddr) {
        let slot: usize = self.header.count();
        self.children[slot].store(child.get(), Ordering::Release);
        self.child_index[byte as usize].store(slot as u8 + 1, Ordering::Release);
        self.header.set_count(slot + 1);
    }

    fn change_child(&self, pool: &PmemPool, byte: u8, child: PAddr) -> bool {
        let Some(slot) = self.slot_of(byte) else {
            return false;
        };
        self.children[slot].store(child.get(), Ordering::Release);
        pool.persist_val(&self.children[slot]);
        true
    }

    fn remove_child(&self, pool: &PmemPool, byte: u8) -> bool {
        let Some(slot) = self.slot_of(byte) else {
            return false;
        };
        self.child_index[byte as usize].store(0, Ordering::Release);
        pool.persist_val(&self.child_index[byte as usize]);
        self.children[slot].store(0, Ordering::Release);
        pool.persist_val(&self.children[slot]);

        self.header.set_count(self.header.count().saturating_sub(1));
        true
    }

    fn recover(&self, pool: &PmemPool) {
        let mut referenced = [false; SLOTS];
        let mut count: usize = 0;

        for b in 0..256 {
            let idx: usize = self.child_index[b].load(Ordering::Relaxed) as usize;
            if idx == 0 {
                continue;
            }
            if idx > SLOTS || self.children[idx - 1].load(Ordering::Relaxed) == 0 {
                self.child_index[b].store(0, Ordering::Relaxed);
                pool.persist_val(&self.child_index[b]);
                continue;
            }
            referenced[idx - 1] = true;
            count += 1;
        }

        for (slot, used) in referenced.iter().enumerate() {
            if !used && self.children[slot].load(Ordering::Relaxed) != 0 {
                // Child written but index never published.
                self.children[slot].store(0, Ordering::Relaxed);
                pool.persist_val(&self.children[slot]);
            }
        }

        self.header.set_count(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_pool;
    use crate::node::{build_branch_of, Prefix};

    fn fresh(pool: &PmemPool) -> &N48 {
        let addr = build_branch_of(pool, NodeType::N48, 0, Prefix::EMPTY, &[]).unwrap();
        // SAFETY: just built.
        unsafe { pool.get::<N48>(addr) }
    }

    #[test]
    fn test_insert_remove_reuses_slot() {
        let pool = test_pool();
        let n48 = fresh(&pool);

        for b in 0..48u8 {
            n48.insert_child(&pool, b * 5, PAddr::new(0x1000 + u64::from(b) * 64));
        }
        assert!(!n48.has_room());

        assert!(n48.remove_child(&pool, 10));
        assert!(n48.has_room());
        n48.insert_child(&pool, 251, PAddr::new(0x9000));

        assert_eq!(n48.find_child(10), PAddr::NULL);
        assert_eq!(n48.find_child(251), PAddr::new(0x9000));
        assert_eq!(n48.header().count(), 48);

        let children = n48.children();
        assert_eq!(children.len(), 48);
        assert!(children.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_recover_clears_unpublished_slot() {
        let pool = test_pool();
        let n48 = fresh(&pool);
        n48.insert_child(&pool, 1, PAddr::new(0x1000));

        // A crash between the child store and the index store.
        n48.children[5].store(0x2000, Ordering::Relaxed);
        n48.header().set_count(0);

        n48.recover(&pool);

        assert_eq!(n48.header().count(), 1);
        assert_eq!(n48.children[5].load(Ordering::Relaxed), 0);
        assert_eq!(n48.children(), vec![(1, PAddr::new(0x1000))]);
    }
}
