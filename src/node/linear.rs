//! N4 and N16: small branch nodes with append-only slots.
//!
//! A child is added by writing its key byte into the next free slot,
//! persisting, then writing the child address and persisting again. The
//! 8-byte child store is the commit point: a slot is live iff its child is
//! non-null. Removed slots are not reused until the node is compacted (rebuilt
//! without holes), so slot order is insertion order and readers sort on the
//! fly.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use super::{Branch, NodeHeader, NodeType};
use crate::pool::{PAddr, PmemPool};

/// Branch node with `CAP` append slots.
#[derive(Debug)]
#[repr(C)]
pub struct LinearNode<const CAP: usize> {
    header: NodeHeader,
    keys: [AtomicU8; CAP],
    children: [AtomicU64; CAP],
}

/// Four-slot node.
pub type N4 = LinearNode<4>;

/// Sixteen-slot node.
pub type N16 = LinearNode<16>;

impl<const CAP: usize> LinearNode<CAP> {
    /// Live children at or below which a full node is compacted in place of
    /// growing.
    pub const COMPACT_LIMIT: usize = if CAP == 4 { 3 } else { 14 };

    #[inline]
    fn slot_of(&self, byte: u8) -> Option<usize> {
        (0..CAP).find(|&i| {
            self.children[i].load(Ordering::Acquire) != 0
                && self.keys[i].load(Ordering::Relaxed) == byte
        })
    }
}

impl<const CAP: usize> Branch for LinearNode<CAP> {
    #[inline(always)]
    fn header(&self) -> &NodeHeader {
        &self.header
    }

    fn kind(&self) -> NodeType {
        if CAP == 4 {
            NodeType::N4
        } else {
            NodeType::N16
        }
    }

    #[inline]
    fn find_child(&self, byte: u8) -> PAddr {
        for i in 0..CAP {
            let child: u64 = self.children[i].load(Ordering::Acquire);
            if child != 0 && self.keys[i].load(Ordering::Relaxed) == byte {
                return PAddr::new(child);
            }
        }
        PAddr::NULL
    }

    fn children(&self) -> Vec<(u8, PAddr)> {
        let mut out: Vec<(u8, PAddr)> = Vec::with_capacity(CAP);
        for i in 0..CAP {
            let child: u64 = self.children[i].load(Ordering::Acquire);
            if child != 0 {
                out.push((self.keys[i].load(Ordering::Relaxed), PAddr::new(child)));
            }
        }
        out.sort_unstable_by_key(|&(b, _)| b);
        out
    }

    fn has_room(&self) -> bool {
        self.header.cursor() < CAP
    }

    fn insert_child(&self, pool: &PmemPool, byte: u8, child: PAddr) {
        let slot: usize = self.header.cursor();
        debug_assert!(slot < CAP, "insert_child on a full node");
        debug_assert!(self.slot_of(byte).is_none());

        self.keys[slot].store(byte, Ordering::Relaxed);
        pool.persist_val(&self.keys[slot]);
        self.children[slot].store(child.get(), Ordering::Release);
        pool.persist_val(&self.children[slot]);

        self.header.set_cursor(slot + 1);
        self.header.set_count(self.header.count() + 1);
    }

    fn fill_child(&self, byte: u8, child: PAddr) {
        let slot: usize = self.header.cursor();
        self.keys[slot].store(byte, Ordering::Relaxed);
        self.children[slot].store(child.get(), Ordering::Release);
        self.header.set_cursor(slot + 1);
        self.header.set_count(self.header.count() + 1);
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
        self.children[slot].store(0, Ordering::Release);
        pool.persist_val(&self.children[slot]);
        self.header.set_count(self.header.count().saturating_sub(1));
        true
    }

    fn recover(&self, _pool: &PmemPool) {
        let live: Vec<usize> = (0..CAP)
            .filter(|&i| self.children[i].load(Ordering::Relaxed) != 0)
            .collect();

        // A slot whose child never got committed is reusable.
        self.header.set_cursor(live.last().map_or(0, |&i| i + 1));
        self.header.set_count(live.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_pool;
    use crate::node::{build_branch_of, Prefix};

    fn fresh<const CAP: usize>(pool: &PmemPool) -> &LinearNode<CAP> {
        let kind = if CAP == 4 { NodeType::N4 } else { NodeType::N16 };
        let addr = build_branch_of(pool, kind, 0, Prefix::EMPTY, &[]).unwrap();
        // SAFETY: just built.
        unsafe { pool.get::<LinearNode<CAP>>(addr) }
    }

    #[test]
    fn test_children_sorted_regardless_of_append_order() {
        let pool = test_pool();
        let n4: &N4 = fresh(&pool);

        for (b, c) in [(9u8, 0x1000u64), (3, 0x2000), (200, 0x3000)] {
            n4.insert_child(&pool, b, PAddr::new(c));
        }

        assert_eq!(
            n4.children(),
            vec![
                (3, PAddr::new(0x2000)),
                (9, PAddr::new(0x1000)),
                (200, PAddr::new(0x3000)),
            ]
        );
        assert_eq!(n4.predecessor(9), Some((3, PAddr::new(0x2000))));
        assert_eq!(n4.predecessor(3), None);
        assert_eq!(n4.find_child(4), PAddr::NULL);
    }

    #[test]
    fn test_removed_slot_is_not_reused() {
        let pool = test_pool();
        let n4: &N4 = fresh(&pool);

        for b in 0..4u8 {
            n4.insert_child(&pool, b, PAddr::new(0x1000 + u64::from(b) * 64));
        }
        assert!(!n4.has_room());

        assert!(n4.remove_child(&pool, 1));
        assert!(!n4.remove_child(&pool, 1));
        assert_eq!(n4.header().count(), 3);
        assert!(!n4.has_room());
        assert!(3 <= N4::COMPACT_LIMIT);
        assert_eq!(n4.find_child(1), PAddr::NULL);
    }

    #[test]
    fn test_change_child() {
        let pool = test_pool();
        let n16: &N16 = fresh(&pool);
        n16.insert_child(&pool, 7, PAddr::new(0x1000));

        assert!(n16.change_child(&pool, 7, PAddr::new(0x5000)));
        assert!(!n16.change_child(&pool, 8, PAddr::new(0x5000)));
        assert_eq!(n16.find_child(7), PAddr::new(0x5000));
        assert_eq!(n16.kind(), NodeType::N16);
    }

    #[test]
    fn test_recover_rebuilds_cursor_and_count() {
        let pool = test_pool();
        let n16: &N16 = fresh(&pool);
        for b in 0..5u8 {
            n16.insert_child(&pool, b, PAddr::new(0x1000 + u64::from(b) * 64));
        }
        n16.remove_child(&pool, 4);
        n16.remove_child(&pool, 0);

        n16.header().set_count(99);
        n16.header().set_cursor(0);
        n16.recover(&pool);

        assert_eq!(n16.header().count(), 3);
        // Slot 4 lost its child, so appends resume there.
        assert_eq!(n16.header().cursor(), 4);
    }
}
