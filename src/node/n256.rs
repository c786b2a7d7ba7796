//! N256: one child slot per byte value.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{Branch, NodeHeader, NodeType};
use crate::pool::{PAddr, PmemPool};

/// Branch node with a direct child array. Also the root type.
#[derive(Debug)]
#[repr(C)]
pub struct N256 {
    header: NodeHeader,
    children: [AtomicU64; 256],
}

impl N256 {
    /// Live children at or below which a non-root N256 shrinks to an N48.
    pub const SHRINK_LIMIT: usize = 37;
}

impl Branch for N256 {
    #[inline(always)]
    fn header(&self) -> &NodeHeader {
        &self.header
    }

    fn kind(&self) -> NodeType {
        NodeType::N256
    }

    #[inline(always)]
    fn find_child(&self, byte: u8) -> PAddr {
        PAddr::new(self.children[byte as usize].load(Ordering::Acquire))
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
        true
    }

    fn insert_child(&self, pool: &PmemPool, byte: u8, child: PAddr) {
        debug_assert!(self.find_child(byte).is_null());
        self.children[byte as usize].store(child.get(), Ordering::Release);
        pool.persist_val(&self.children[byte as usize]);
        self.header.set_count(self.header.count() + 1);
    }

    fn fill_child(&self, byte: u8, child: PAddr) {
        self.children[byte as usize].store(child.get(), Ordering::Release);
        self.header.set_count(self.header.count() + 1);
    }

    fn change_child(&self, pool: &PmemPool, byte: u8, child: PAddr) -> bool {
        if self.find_child(byte).is_null() {
            return false;
        }
        self.children[byte as usize].store(child.get(), Ordering::Release);
        pool.persist_val(&self.children[byte as usize]);
        true
    }

    fn remove_child(&self, pool: &PmemPool, byte: u8) -> bool {
        if self.find_child(byte).is_null() {
            return false;
        }
        self.children[byte as usize].store(0, Ordering::Release);
        pool.persist_val(&self.children[byte as usize]);
        self.header.set_count(self.header.count().saturating_sub(1));
        true
    }

    fn recover(&self, _pool: &PmemPool) {
        let count: usize = self
            .children
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) != 0)
            .count();
        self.header.set_count(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_pool;
    use crate::node::{build_branch_of, Prefix};

    #[test]
    fn test_direct_slots() {
        let pool = test_pool();
        let addr = build_branch_of(&pool, NodeType::N256, 0, Prefix::EMPTY, &[]).unwrap();
        // SAFETY: just built.
        let root: &N256 = unsafe { pool.get(addr) };

        root.insert_child(&pool, 0, PAddr::new(0x1000));
        root.insert_child(&pool, 255, PAddr::new(0x2000));
        assert_eq!(root.header().count(), 2);
        assert_eq!(root.predecessor(255), Some((0, PAddr::new(0x1000))));

        assert!(root.remove_child(&pool, 0));
        assert!(!root.change_child(&pool, 0, PAddr::new(0x3000)));
        root.header().set_count(0);
        root.recover(&pool);
        assert_eq!(root.header().count(), 1);
        assert_eq!(root.first_child(), Some((255, PAddr::new(0x2000))));
    }
}
