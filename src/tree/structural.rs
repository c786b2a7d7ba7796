//! Structural helpers shared by insert and remove: leaf-list maintenance,
//! LeafArray split, and node type selection for grow, compact and shrink.
//!
//! Everything here runs with the link mutex held, so the set of LeafArrays
//! and the children of every branch are frozen while it looks at them.

use std::collections::BTreeMap;

use crate::error::ArtError;
use crate::key::{first_difference, key_byte};
use crate::node::{
    build_branch, build_leaf_array, Branch, LeafArray, LeafSlot, NodeType, Prefix, N16, N256,
    N4, N48,
};
use crate::nodeversion::LockGuard;
use crate::pool::PAddr;
use crate::tracing_helpers::debug_log;

use super::prefix_check::RangeCmp;
use super::{Abort, ArtGuard, ArtTree, Attempt, Cursor};

/// Where a new LeafArray goes in the leaf list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Neighbors {
    /// Last LeafArray with keys below the new one (the head if none).
    pub(crate) left: PAddr,
    /// `left`'s current successor (null at the end).
    pub(crate) right: PAddr,
}

/// Type for a full branch about to take one more child: the same type when
/// removals left enough dead slots to compact, otherwise the next size up.
pub(crate) fn grown_kind(kind: NodeType, live: usize) -> NodeType {
    match kind {
        NodeType::N4 if live <= N4::COMPACT_LIMIT => NodeType::N4,
        NodeType::N16 if live <= N16::COMPACT_LIMIT => NodeType::N16,
        NodeType::N4 => NodeType::N16,
        NodeType::N16 => NodeType::N48,
        _ => NodeType::N256,
    }
}

/// Smaller type for a non-root branch left with `live` children, if it
/// should shrink.
pub(crate) const fn shrunk_kind(kind: NodeType, live: usize) -> Option<NodeType> {
    match kind {
        NodeType::N16 if live <= N4::COMPACT_LIMIT => Some(NodeType::N4),
        NodeType::N48 if live <= N48::SHRINK_LIMIT => Some(NodeType::N16),
        NodeType::N256 if live <= N256::SHRINK_LIMIT => Some(NodeType::N48),
        _ => None,
    }
}

impl ArtTree {
    // ========================================================================
    //  Leaf list
    // ========================================================================

    /// Find the list position of a key that has no LeafArray yet.
    ///
    /// Descends by `key`, remembering the last subtree seen whose keys all
    /// sort below it. The left neighbor is that subtree's rightmost
    /// LeafArray.
    pub(crate) fn find_neighbors(&self, key: &[u8]) -> Attempt<Neighbors> {
        let mut candidate: Option<PAddr> = None;
        let mut addr: PAddr = self.root_addr();
        let mut depth: usize = 0;

        loop {
            let node = self.load(addr)?;
            let Some(branch) = node.as_branch() else {
                let la: &LeafArray = node.as_leaf_array().ok_or(Abort::Restart)?;
                let below: bool = la
                    .occupied()
                    .iter()
                    .any(|&(_, slot)| self.leaf(slot.leaf).key() < key);
                if below {
                    candidate = Some(addr);
                }
                break;
            };

            match self.range_compare(node, key, depth)? {
                RangeCmp::Bigger => break,
                RangeCmp::Smaller => {
                    candidate = Some(addr);
                    break;
                }
                RangeCmp::Equal => {}
            }

            let level: usize = branch.header().level();
            let byte: u8 = key_byte(key, level);
            if let Some((_, left)) = branch.predecessor(byte) {
                candidate = Some(left);
            }

            let child: PAddr = branch.find_child(byte);
            if child.is_null() {
                break;
            }
            addr = child;
            depth = level + 1;
        }

        let left: PAddr = match candidate {
            Some(subtree) => self.rightmost_leaf_array(subtree)?,
            None => self.head_addr(),
        };
        let right: PAddr = self.leaf_array(left)?.next();
        if !right.is_null() {
            self.leaf_array(right)?;
        }

        Ok(Neighbors { left, right })
    }

    /// Allocate a LeafArray holding one leaf, linked to `neighbors` (not yet
    /// spliced in).
    pub(crate) fn build_single_leaf_array(
        &self,
        level: usize,
        leaf: PAddr,
        key: &[u8],
        neighbors: Neighbors,
    ) -> Attempt<PAddr> {
        Ok(build_leaf_array(
            self.pool(),
            level,
            &[LeafSlot::for_key(leaf, key)],
            neighbors.left,
            neighbors.right,
        )?)
    }

    /// Splice `la` between the neighbors found by
    /// [`find_neighbors`](Self::find_neighbors).
    pub(crate) fn splice(&self, neighbors: Neighbors, la: PAddr) {
        // SAFETY: find_neighbors checked both are LeafArrays, and the link
        // mutex keeps them in the list since.
        let left: &LeafArray = unsafe { self.pool().get(neighbors.left) };
        left.set_next(self.pool(), la);
        if !neighbors.right.is_null() {
            // SAFETY: as above.
            let right: &LeafArray = unsafe { self.pool().get(neighbors.right) };
            right.set_prev(self.pool(), la);
        }
    }

    /// Take `la` out of the leaf list. Its own links are left intact for
    /// scans that are standing on it.
    pub(crate) fn unlink(&self, la: &LeafArray) -> Attempt<()> {
        let (prev, next) = (la.prev(), la.next());
        let prev_la: &LeafArray = self.leaf_array(prev)?;
        let next_la: Option<&LeafArray> = if next.is_null() {
            None
        } else {
            Some(self.leaf_array(next)?)
        };

        prev_la.set_next(self.pool(), next);
        if let Some(next_la) = next_la {
            next_la.set_prev(self.pool(), prev);
        }
        Ok(())
    }

    // ========================================================================
    //  Split
    // ========================================================================

    /// Replace a full LeafArray with a branch over several smaller ones.
    ///
    /// The leaves are regrouped by their byte at the first depth (below the
    /// parent) where they stop agreeing; leaf blocks are reused. Parent and
    /// LeafArray are locked by the caller, who also holds the link mutex.
    pub(crate) fn split_leaf_array(
        &self,
        parent: &Cursor<'_>,
        la_cur: &Cursor<'_>,
        la_lock: &mut LockGuard<'_>,
        key: &[u8],
        guard: &ArtGuard<'_>,
    ) -> Attempt<()> {
        let parent_branch: &dyn Branch = parent.branch()?;
        let la: &LeafArray = la_cur.node.as_leaf_array().ok_or(Abort::Restart)?;
        let from: usize = parent_branch.header().level() + 1;

        let (prev, next) = (la.prev(), la.next());
        let prev_la: &LeafArray = self.leaf_array(prev)?;
        let next_la: Option<&LeafArray> = if next.is_null() {
            None
        } else {
            Some(self.leaf_array(next)?)
        };

        let entries: Vec<(LeafSlot, &[u8])> = la
            .occupied()
            .into_iter()
            .map(|(_, slot)| (slot, self.leaf(slot.leaf).key()))
            .collect();
        let Some(&(_, first)) = entries.first() else {
            return Err(Abort::Restart);
        };

        let split_at: usize = entries
            .iter()
            .filter_map(|&(_, k)| first_difference(first, k, from))
            .min()
            .ok_or(ArtError::LeafArrayOverflow { depth: from })?;

        let mut groups: BTreeMap<u8, Vec<LeafSlot>> = BTreeMap::new();
        for &(slot, k) in &entries {
            groups.entry(key_byte(k, split_at)).or_default().push(slot);
        }

        let mut arrays: Vec<(u8, PAddr)> = Vec::with_capacity(groups.len());
        for (&byte, group) in &groups {
            let built = build_leaf_array(self.pool(), split_at + 1, group, PAddr::NULL, PAddr::NULL);
            match built {
                Ok(addr) => arrays.push((byte, addr)),
                Err(err) => {
                    let addrs: Vec<PAddr> = arrays.iter().map(|&(_, a)| a).collect();
                    return self.or_discard(Err(err.into()), &addrs);
                }
            }
        }

        // Chain the new arrays in key order between the old one's neighbors.
        for (i, &(_, addr)) in arrays.iter().enumerate() {
            let left: PAddr = if i == 0 { prev } else { arrays[i - 1].1 };
            let right: PAddr = arrays.get(i + 1).map_or(next, |&(_, a)| a);
            // SAFETY: built above, still private.
            let fresh: &LeafArray = unsafe { self.pool().get(addr) };
            fresh.set_prev(self.pool(), left);
            fresh.set_next(self.pool(), right);
        }

        let addrs: Vec<PAddr> = arrays.iter().map(|&(_, a)| a).collect();
        let prefix = Prefix::from_key(first, from, split_at - from);
        let branch: PAddr = self.or_discard(
            build_branch(self.pool(), split_at, prefix, &arrays).map_err(Abort::from),
            &addrs,
        )?;

        let (first_la, last_la) = (addrs[0], addrs[addrs.len() - 1]);
        prev_la.set_next(self.pool(), first_la);
        if let Some(next_la) = next_la {
            next_la.set_prev(self.pool(), last_la);
        }

        let replaced: bool = parent_branch.change_child(
            self.pool(),
            key_byte(key, parent_branch.header().level()),
            branch,
        );
        debug_assert!(replaced, "parent lost the slot of a locked LeafArray");

        la_lock.mark_obsolete();
        guard.retire(la_cur.addr);

        debug_log!(
            depth = split_at,
            arrays = addrs.len(),
            leaves = entries.len(),
            "leaf array split"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArtConfig, ArtTree};

    #[test]
    fn test_kind_selection() {
        assert_eq!(grown_kind(NodeType::N4, 3), NodeType::N4);
        assert_eq!(grown_kind(NodeType::N4, 4), NodeType::N16);
        assert_eq!(grown_kind(NodeType::N16, 14), NodeType::N16);
        assert_eq!(grown_kind(NodeType::N16, 16), NodeType::N48);
        assert_eq!(grown_kind(NodeType::N48, 48), NodeType::N256);

        assert_eq!(shrunk_kind(NodeType::N16, 3), Some(NodeType::N4));
        assert_eq!(shrunk_kind(NodeType::N16, 4), None);
        assert_eq!(shrunk_kind(NodeType::N48, 12), Some(NodeType::N16));
        assert_eq!(shrunk_kind(NodeType::N256, 37), Some(NodeType::N48));
        assert_eq!(shrunk_kind(NodeType::N256, 38), None);
        assert_eq!(shrunk_kind(NodeType::N4, 1), None);
    }

    #[test]
    fn test_neighbors_follow_key_order() {
        let t = ArtTree::create(ArtConfig::in_memory(8 << 20)).unwrap();
        t.insert(b"b", b"").unwrap();
        t.insert(b"d", b"").unwrap();

        let _link = t.link_lock();
        let head = t.head_addr();
        let first = t.head().next();
        let second = t.leaf_array(first).unwrap().next();

        assert_eq!(
            t.find_neighbors(b"a").unwrap(),
            Neighbors {
                left: head,
                right: first
            }
        );
        assert_eq!(
            t.find_neighbors(b"c").unwrap(),
            Neighbors {
                left: first,
                right: second
            }
        );
        assert_eq!(
            t.find_neighbors(b"e").unwrap(),
            Neighbors {
                left: second,
                right: PAddr::NULL
            }
        );
    }
}
