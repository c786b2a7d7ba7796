//! Recovery after reopening a pool.
//!
//! Runs single-threaded before the tree is handed out. One depth-first walk
//! from the root:
//!
//! 1. resets every version word (a crash can leave lock bits set);
//! 2. rebuilds transient node metadata and drops uncommitted slots;
//! 3. recomputes prefixes that disagree with the node's level;
//! 4. reports every reachable block to the [`ExtentSink`];
//! 5. rethreads the leaf list in tree order, rewriting only wrong links.
//!
//! Anything the walk does not reach was allocated but never published (or
//! was unlinked before the crash) and becomes free again.

use crate::error::{ArtError, PoolError};
use crate::node::{NodeRef, Prefix, LEAF_HEADER_SIZE};
use crate::pool::{ExtentSink, PAddr};
use crate::tracing_helpers::{debug_log, info_log};

use super::ArtTree;

/// What recovery found and fixed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Leaves without the tombstone flag.
    pub live_keys: usize,
    /// Tombstoned leaves.
    pub tombstones: usize,
    /// Branch nodes reached (the root included).
    pub branches: usize,
    /// LeafArrays in the tree (the list head excluded).
    pub leaf_arrays: usize,
    /// Prefixes rewritten to match their node's level.
    pub prefixes_repaired: usize,
    /// Leaf-list pointers rewritten.
    pub links_repaired: usize,
}

/// Walk state.
struct Walk<'s> {
    sink: &'s mut dyn ExtentSink,
    stats: RecoveryStats,
    /// Last LeafArray threaded so far.
    last: PAddr,
}

impl ArtTree {
    /// Rebuild volatile state from the durable image and report every
    /// reachable block to `sink`.
    ///
    /// Must run before any other thread uses the tree.
    ///
    /// # Errors
    /// [`PoolError::LayoutMismatch`] or [`PoolError::InvalidAddress`] if a
    /// published pointer does not lead to a well-formed node.
    pub fn rebuild_after_crash(
        &self,
        sink: &mut dyn ExtentSink,
    ) -> Result<RecoveryStats, ArtError> {
        let head: PAddr = self.head_addr();
        let head_la = self
            .node_at(head)?
            .as_leaf_array()
            .ok_or_else(|| corrupt(head, "list head is not a leaf array"))?;
        head_la.header().version().reset();
        head_la.recover();
        sink.record(head, self.pool().block_size(head)?);

        let mut walk = Walk {
            sink,
            stats: RecoveryStats::default(),
            last: head,
        };
        if !head_la.prev().is_null() {
            head_la.set_prev(self.pool(), PAddr::NULL);
            walk.stats.links_repaired += 1;
        }

        self.recover_node(self.root_addr(), 0, &mut walk)?;

        let last = self
            .node_at(walk.last)?
            .as_leaf_array()
            .ok_or_else(|| corrupt(walk.last, "list tail is not a leaf array"))?;
        if !last.next().is_null() {
            last.set_next(self.pool(), PAddr::NULL);
            walk.stats.links_repaired += 1;
        }

        let stats: RecoveryStats = walk.stats;
        self.set_len(stats.live_keys);

        info_log!(
            live_keys = stats.live_keys,
            tombstones = stats.tombstones,
            branches = stats.branches,
            leaf_arrays = stats.leaf_arrays,
            "recovery walk finished"
        );
        Ok(stats)
    }

    /// A node reached during recovery, checked to be a tagged pool block.
    fn node_at(&self, addr: PAddr) -> Result<NodeRef<'_>, ArtError> {
        self.pool().block_size(addr)?;
        // SAFETY: `addr` is a block boundary inside an assigned chunk.
        unsafe { NodeRef::load(self.pool(), addr) }
            .ok_or_else(|| corrupt(addr, "block carries no node tag"))
    }

    fn recover_node(
        &self,
        addr: PAddr,
        depth: usize,
        walk: &mut Walk<'_>,
    ) -> Result<(), ArtError> {
        let node: NodeRef<'_> = self.node_at(addr)?;
        node.version().reset();
        walk.sink.record(addr, node.kind().size());

        let Some(branch) = node.as_branch() else {
            return self.recover_leaf_array(addr, node, walk);
        };

        branch.recover(self.pool());
        walk.stats.branches += 1;

        let level: usize = branch.header().level();
        if level < depth {
            return Err(corrupt(addr, "branch level above its parent"));
        }
        if addr != self.root_addr() {
            self.repair_prefix_at(addr, node, depth, level, walk);
        }

        for (_, child) in branch.children() {
            self.recover_node(child, level + 1, walk)?;
        }
        Ok(())
    }

    fn repair_prefix_at(
        &self,
        _addr: PAddr,
        node: NodeRef<'_>,
        depth: usize,
        level: usize,
        walk: &mut Walk<'_>,
    ) {
        // A branch with nothing below it has no key to take the bytes from.
        let Some(leaf_key) = self.any_leaf_key(node) else {
            return;
        };

        let expected = Prefix::from_key(leaf_key, depth, level - depth);
        if node.header().prefix() != expected {
            node.header().set_prefix(self.pool(), expected);
            walk.stats.prefixes_repaired += 1;
            debug_log!(addr = ?_addr, depth, level, "prefix repaired during recovery");
        }
    }

    fn recover_leaf_array(
        &self,
        addr: PAddr,
        node: NodeRef<'_>,
        walk: &mut Walk<'_>,
    ) -> Result<(), ArtError> {
        let Some(la) = node.as_leaf_array() else {
            return Err(corrupt(addr, "expected a leaf array"));
        };
        la.recover();
        walk.stats.leaf_arrays += 1;

        for (_, slot) in la.occupied() {
            self.pool().block_size(slot.leaf)?;
            let leaf = self.leaf(slot.leaf);
            walk.sink.record(
                slot.leaf,
                LEAF_HEADER_SIZE + leaf.key_len() + leaf.value().len(),
            );
            if leaf.is_tombstone() {
                walk.stats.tombstones += 1;
            } else {
                walk.stats.live_keys += 1;
            }
        }

        if la.prev() != walk.last {
            la.set_prev(self.pool(), walk.last);
            walk.stats.links_repaired += 1;
        }
        let last = self
            .node_at(walk.last)?
            .as_leaf_array()
            .ok_or_else(|| corrupt(walk.last, "list member is not a leaf array"))?;
        if last.next() != addr {
            last.set_next(self.pool(), addr);
            walk.stats.links_repaired += 1;
        }

        walk.last = addr;
        Ok(())
    }
}

fn corrupt(addr: PAddr, what: &str) -> ArtError {
    PoolError::LayoutMismatch {
        reason: format!("{what} at {addr:?}"),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use crate::key::encode_u64;
    use crate::node::{Branch, LeafArray, Prefix};
    use crate::pool::{PAddr, UsedExtents};
    use crate::{ArtConfig, ArtTree};

    #[test]
    fn test_clean_tree_needs_no_repair() {
        let t = ArtTree::create(ArtConfig::in_memory(16 << 20)).unwrap();
        for i in 0..500u64 {
            t.insert(&encode_u64(i * 3), b"v").unwrap();
        }
        t.remove_tombstone(&encode_u64(3)).unwrap();

        let mut used = UsedExtents::new();
        let stats = t.rebuild_after_crash(&mut used).unwrap();
        assert_eq!(stats.live_keys, 499);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.prefixes_repaired, 0);
        assert_eq!(stats.links_repaired, 0);
        assert_eq!(t.len(), 499);
        // Every leaf, every node and the list head.
        assert_eq!(used.len(), 500 + stats.branches + stats.leaf_arrays + 1);
    }

    #[test]
    fn test_broken_links_and_prefix_are_rebuilt() {
        let t = ArtTree::create(ArtConfig::in_memory(16 << 20)).unwrap();
        for i in 0..300u64 {
            t.insert(&[b'p', b'q', b'r', (i >> 8) as u8, i as u8], b"").unwrap();
        }

        // Cut the list after the first array and corrupt the child's prefix.
        let first: PAddr = t.head().next();
        let first_la: &LeafArray = t.leaf_array(first).unwrap();
        first_la.set_next(t.pool(), PAddr::NULL);
        let (_, child) = t.root_node().first_child().unwrap();
        let child_node = t.load(child).unwrap();
        child_node.header().set_prefix(t.pool(), Prefix::from_key(b"zz", 0, 2));

        let mut used = UsedExtents::new();
        let stats = t.rebuild_after_crash(&mut used).unwrap();
        assert!(stats.links_repaired >= 1);
        assert_eq!(stats.prefixes_repaired, 1);
        assert_eq!(stats.live_keys, 300);
        assert!(t.verify().violations.is_empty(), "{:?}", t.verify().violations);
        assert_eq!(t.scan(b"", b"\xff", usize::MAX).entries.len(), 300);
    }
}
