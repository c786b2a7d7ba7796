//! Physical removal.
//!
//! Removing a leaf from a LeafArray that holds others only clears its slot.
//! Removing the last leaf removes the LeafArray itself: it leaves the leaf
//! list first, then its parent. The parent may then
//!
//! - simply lose the child,
//! - shrink to a smaller type (non-root only), or
//! - if it is an N4 left with one child, disappear: the survivor moves up
//!   into the grandparent and absorbs the parent's prefix and branch byte.

use crate::error::ArtError;
use crate::key::key_byte;
use crate::node::{build_branch_of, Branch, LeafSlot, NodeType, Prefix};
use crate::nodeversion::LockGuard;
use crate::pool::PAddr;
use crate::tracing_helpers::debug_log;

use super::lookup::Descent;
use super::structural::shrunk_kind;
use super::{Abort, ArtGuard, ArtTree, Attempt, Cursor, RemoveOutcome};

/// What happens to the parent of an emptied LeafArray.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParentPlan {
    Detach,
    Merge,
    Shrink(NodeType),
}

impl ArtTree {
    /// Remove `key` inside an existing pin.
    ///
    /// A tombstoned record is removed physically but reported as
    /// [`RemoveOutcome::NotFound`].
    ///
    /// # Errors
    /// Pool exhaustion while building a shrunk node.
    pub fn remove_with_guard(
        &self,
        key: &[u8],
        guard: &ArtGuard<'_>,
    ) -> Result<RemoveOutcome, ArtError> {
        self.run(|| self.remove_once(key, guard))
    }

    fn remove_once(&self, key: &[u8], guard: &ArtGuard<'_>) -> Attempt<RemoveOutcome> {
        let Descent::LeafArray {
            la: la_cur,
            parent,
            grandparent,
        } = self.descend(key)?
        else {
            return Ok(RemoveOutcome::NotFound);
        };
        let la = la_cur.node.as_leaf_array().ok_or(Abort::Restart)?;

        // SAFETY: pinned by the caller's guard.
        let found: Option<(usize, bool)> =
            unsafe { la.find(self.pool(), key) }.map(|(i, leaf)| (i, leaf.is_tombstone()));
        let alone: bool = la.leaf_count() <= 1;
        la_cur.validate()?;

        let Some((i, tombstoned)) = found else {
            return Ok(RemoveOutcome::NotFound);
        };

        if alone {
            self.remove_leaf_array(&parent, grandparent.as_ref(), &la_cur, i, key, guard)?;
        } else {
            let _lock: LockGuard<'_> = la_cur
                .node
                .version()
                .upgrade(la_cur.version)
                .ok_or(Abort::Restart)?;
            let slot: LeafSlot = la.slot(i).ok_or(Abort::Restart)?;
            la.remove_slot(self.pool(), i);
            guard.retire(slot.leaf);
        }

        if tombstoned {
            Ok(RemoveOutcome::NotFound)
        } else {
            self.count_removed();
            Ok(RemoveOutcome::Removed)
        }
    }

    /// Remove a LeafArray whose only leaf is slot `i`.
    fn remove_leaf_array(
        &self,
        parent: &Cursor<'_>,
        grandparent: Option<&Cursor<'_>>,
        la_cur: &Cursor<'_>,
        i: usize,
        key: &[u8],
        guard: &ArtGuard<'_>,
    ) -> Attempt<()> {
        let parent_branch: &dyn Branch = parent.branch()?;
        let la = la_cur.node.as_leaf_array().ok_or(Abort::Restart)?;

        let mut parent_lock: LockGuard<'_> = parent
            .node
            .version()
            .upgrade(parent.version)
            .ok_or(Abort::Restart)?;
        let mut la_lock: LockGuard<'_> = la_cur
            .node
            .version()
            .upgrade(la_cur.version)
            .ok_or(Abort::Restart)?;

        let slot: LeafSlot = la.slot(i).ok_or(Abort::Restart)?;
        let byte: u8 = key_byte(key, parent_branch.header().level());
        let children: Vec<(u8, PAddr)> = parent_branch.children();

        let plan: ParentPlan = if parent.addr == self.root_addr() {
            ParentPlan::Detach
        } else if parent_branch.kind() == NodeType::N4 && children.len() == 2 {
            ParentPlan::Merge
        } else if let Some(kind) = shrunk_kind(parent_branch.kind(), children.len() - 1) {
            ParentPlan::Shrink(kind)
        } else {
            ParentPlan::Detach
        };

        match plan {
            ParentPlan::Detach => {
                let _link = self.link_lock();
                self.unlink(la)?;
                parent_branch.remove_child(self.pool(), byte);
            }

            ParentPlan::Merge => {
                let grandparent: &Cursor<'_> = grandparent.ok_or(Abort::Restart)?;
                let gp_branch: &dyn Branch = grandparent.branch()?;
                let _gp_lock: LockGuard<'_> = grandparent
                    .node
                    .version()
                    .upgrade(grandparent.version)
                    .ok_or(Abort::Restart)?;

                let (_, survivor_addr) = children
                    .iter()
                    .copied()
                    .find(|&(b, _)| b != byte)
                    .ok_or(Abort::Restart)?;
                let survivor = self.load(survivor_addr)?;
                // Spinning is fine here: we own every ancestor of the survivor.
                let _survivor_lock: LockGuard<'_> =
                    survivor.version().lock().ok_or(Abort::Restart)?;

                let gp_level: usize = gp_branch.header().level();
                let prefix: Option<Prefix> = match survivor.as_branch() {
                    None => None,
                    Some(branch) => {
                        let leaf_key: &[u8] = self.any_leaf_key(survivor).ok_or(Abort::Restart)?;
                        let level: usize = branch.header().level();
                        Some(Prefix::from_key(leaf_key, gp_level + 1, level - gp_level - 1))
                    }
                };

                let _link = self.link_lock();
                self.unlink(la)?;
                if let Some(prefix) = prefix {
                    survivor.header().set_prefix(self.pool(), prefix);
                }
                let replaced: bool =
                    gp_branch.change_child(self.pool(), key_byte(key, gp_level), survivor_addr);
                debug_assert!(replaced, "grandparent lost the slot of a locked parent");

                parent_lock.mark_obsolete();
                guard.retire(parent.addr);
                debug_log!(survivor = ?survivor.kind(), "n4 merged into survivor");
            }

            ParentPlan::Shrink(kind) => {
                let grandparent: &Cursor<'_> = grandparent.ok_or(Abort::Restart)?;
                let gp_branch: &dyn Branch = grandparent.branch()?;
                let _gp_lock: LockGuard<'_> = grandparent
                    .node
                    .version()
                    .upgrade(grandparent.version)
                    .ok_or(Abort::Restart)?;

                let remaining: Vec<(u8, PAddr)> =
                    children.iter().copied().filter(|&(b, _)| b != byte).collect();
                let header = parent_branch.header();
                let replacement: PAddr =
                    build_branch_of(self.pool(), kind, header.level(), header.prefix(), &remaining)?;

                let _link = self.link_lock();
                self.or_discard(self.unlink(la), &[replacement])?;
                let gp_level: usize = gp_branch.header().level();
                let replaced: bool =
                    gp_branch.change_child(self.pool(), key_byte(key, gp_level), replacement);
                debug_assert!(replaced, "grandparent lost the slot of a locked parent");

                parent_lock.mark_obsolete();
                guard.retire(parent.addr);
                debug_log!(from = ?parent_branch.kind(), to = ?kind, "branch shrunk");
            }
        }

        la_lock.mark_obsolete();
        guard.retire(la_cur.addr);
        guard.retire(slot.leaf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::key::encode_u64;
    use crate::{ArtConfig, ArtTree, RemoveOutcome};

    fn tree() -> ArtTree {
        ArtTree::create(ArtConfig::in_memory(32 << 20)).unwrap()
    }

    #[test]
    fn test_remove_tombstoned_is_not_found() {
        let t = tree();
        t.insert(b"k", b"v").unwrap();
        t.remove_tombstone(b"k").unwrap();
        assert_eq!(t.remove(b"k").unwrap(), RemoveOutcome::NotFound);
        assert_eq!(t.verify().tombstones, 0);
        assert!(t.is_empty());
    }

    #[test]
    fn test_merge_collapses_n4() {
        let t = tree();
        // A branch point at depth 2 under first byte 'x'.
        for i in 0..65u8 {
            t.insert(&[b'x', b'a', i], b"").unwrap();
        }
        t.insert(b"xb", b"").unwrap();
        assert!(t.verify().n4 >= 1);

        assert_eq!(t.remove(b"xb").unwrap(), RemoveOutcome::Removed);
        let stats = t.verify();
        assert!(stats.violations.is_empty(), "{:?}", stats.violations);
        assert_eq!(stats.live_keys, 65);
        for i in 0..65u8 {
            assert!(t.lookup(&[b'x', b'a', i]).is_some());
        }

        // The survivor now carries the merged prefix; inserts still route.
        t.insert(b"xc", b"1").unwrap();
        assert_eq!(t.lookup(b"xc").as_deref(), Some(&b"1"[..]));
        assert!(t.verify().violations.is_empty());
    }

    #[test]
    fn test_remove_everything_shrinks_back() {
        let t = tree();
        let n: u64 = 3_000;
        for i in 0..n {
            t.insert(&encode_u64(i * 7919), b"v").unwrap();
        }
        for i in 0..n {
            assert_eq!(
                t.remove(&encode_u64(i * 7919)).unwrap(),
                RemoveOutcome::Removed,
                "key {i}"
            );
            if i % 500 == 0 {
                let stats = t.verify();
                assert!(stats.violations.is_empty(), "{:?}", stats.violations);
            }
        }

        let stats = t.verify();
        assert!(stats.violations.is_empty(), "{:?}", stats.violations);
        assert_eq!(stats.live_keys, 0);
        assert_eq!(stats.leaf_arrays, 0);
        assert!(t.is_empty());
        assert!(t.head().next().is_null());
    }
}
