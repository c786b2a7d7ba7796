//! Insert and tombstone insert.
//!
//! The descent uses the pessimistic prefix check and ends in one of three
//! places:
//!
//! - a prefix mismatch: a new N4 branch point takes the old node and a new
//!   LeafArray;
//! - a missing child: a new LeafArray is added to the branch, which grows or
//!   compacts first if its slots are used up;
//! - a LeafArray: the leaf goes into a free slot, or the array is split and
//!   the insert restarts.
//!
//! Every new LeafArray is spliced into the leaf list before the branch slot
//! that publishes it in the tree is written.

use crate::error::ArtError;
use crate::key::key_byte;
use crate::node::leaf::check_record;
use crate::node::{build_branch_of, Branch, Leaf, LeafSlot, NodeRef, NodeType, Prefix};
use crate::nodeversion::LockGuard;
use crate::pool::PAddr;
use crate::tracing_helpers::debug_log;

use super::prefix_check::PessimisticCheck;
use super::structural::grown_kind;
use super::{Abort, ArtGuard, ArtTree, Attempt, Cursor, InsertOutcome};

/// What a put writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PutMode {
    /// A live record.
    Insert,
    /// A deletion marker.
    Tombstone,
}

impl ArtTree {
    /// Insert `key` inside an existing pin.
    ///
    /// A tombstoned record with the same key is revived with the new value.
    ///
    /// # Errors
    /// [`ArtError::RecordTooLarge`], [`ArtError::LeafArrayOverflow`] or pool
    /// exhaustion.
    pub fn insert_with_guard(
        &self,
        key: &[u8],
        value: &[u8],
        guard: &ArtGuard<'_>,
    ) -> Result<InsertOutcome, ArtError> {
        check_record(key, value)?;
        self.run(|| self.put_once(key, value, PutMode::Insert, guard))
    }

    /// Tombstone `key` inside an existing pin.
    ///
    /// # Errors
    /// As for [`insert_with_guard`](Self::insert_with_guard).
    pub fn remove_tombstone_with_guard(
        &self,
        key: &[u8],
        guard: &ArtGuard<'_>,
    ) -> Result<(), ArtError> {
        check_record(key, &[])?;
        self.run(|| self.put_once(key, &[], PutMode::Tombstone, guard))
            .map(|_| ())
    }

    fn put_once(
        &self,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
        guard: &ArtGuard<'_>,
    ) -> Attempt<InsertOutcome> {
        let mut parent: Option<Cursor<'_>> = None;
        let mut cur: Cursor<'_> = self.root_cursor()?;
        let mut depth: usize = 0;

        loop {
            if let NodeRef::LeafArray(_) = cur.node {
                let parent: Cursor<'_> = parent.ok_or(Abort::Restart)?;
                return self.put_into_leaf_array(&parent, &cur, key, value, mode, guard);
            }

            let branch: &dyn Branch = cur.branch()?;
            if let PessimisticCheck::Mismatch {
                depth: at,
                existing,
                remaining,
            } = self.check_pessimistic(&cur, parent.as_ref(), key, depth)?
            {
                let parent: Cursor<'_> = parent.ok_or(Abort::Restart)?;
                let point = BranchPoint {
                    depth,
                    at,
                    existing,
                    remaining,
                };
                return self.insert_branch_point(&parent, &cur, point, key, value, mode);
            }

            let level: usize = branch.header().level();
            let byte: u8 = key_byte(key, level);
            let child: PAddr = branch.find_child(byte);
            cur.validate()?;

            if child.is_null() {
                return self.insert_leaf_array(parent.as_ref(), &cur, byte, key, value, mode, guard);
            }

            let next: Cursor<'_> = self.visit(child)?;
            cur.validate()?;

            parent = Some(cur);
            cur = next;
            depth = level + 1;
        }
    }

    // ========================================================================
    //  Case (a): prefix mismatch
    // ========================================================================

    fn insert_branch_point(
        &self,
        parent: &Cursor<'_>,
        cur: &Cursor<'_>,
        point: BranchPoint,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
    ) -> Attempt<InsertOutcome> {
        let parent_branch: &dyn Branch = parent.branch()?;
        let _lock: LockGuard<'_> = cur.node.version().upgrade(cur.version).ok_or(Abort::Restart)?;
        let _parent_lock: LockGuard<'_> = parent
            .node
            .version()
            .upgrade(parent.version)
            .ok_or(Abort::Restart)?;

        let leaf: PAddr = self.new_leaf(key, value, mode)?;
        let _link = self.link_lock();

        let neighbors = self.or_discard(self.find_neighbors(key), &[leaf])?;
        let la: PAddr = self.or_discard(
            self.build_single_leaf_array(point.at + 1, leaf, key, neighbors),
            &[leaf],
        )?;

        let mut children: [(u8, PAddr); 2] =
            [(point.existing, cur.addr), (key_byte(key, point.at), la)];
        children.sort_unstable_by_key(|&(b, _)| b);

        let prefix = Prefix::from_key(key, point.depth, point.at - point.depth);
        let n4: PAddr = self.or_discard(
            build_branch_of(self.pool(), NodeType::N4, point.at, prefix, &children)
                .map_err(Abort::from),
            &[la, leaf],
        )?;

        self.splice(neighbors, la);
        let replaced: bool = parent_branch.change_child(
            self.pool(),
            key_byte(key, parent_branch.header().level()),
            n4,
        );
        debug_assert!(replaced, "parent lost the slot of a locked child");
        cur.node.header().set_prefix(self.pool(), point.remaining);

        self.count_put(mode);
        Ok(InsertOutcome::Inserted)
    }

    // ========================================================================
    //  Case (b): missing child
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn insert_leaf_array(
        &self,
        parent: Option<&Cursor<'_>>,
        cur: &Cursor<'_>,
        byte: u8,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
        guard: &ArtGuard<'_>,
    ) -> Attempt<InsertOutcome> {
        let branch: &dyn Branch = cur.branch()?;

        if !branch.has_room() {
            let parent: &Cursor<'_> = parent.ok_or(Abort::Restart)?;
            return self.grow_and_insert(parent, cur, byte, key, value, mode, guard);
        }

        let _lock: LockGuard<'_> = cur.node.version().upgrade(cur.version).ok_or(Abort::Restart)?;
        let leaf: PAddr = self.new_leaf(key, value, mode)?;
        let _link = self.link_lock();

        let neighbors = self.or_discard(self.find_neighbors(key), &[leaf])?;
        let la: PAddr = self.or_discard(
            self.build_single_leaf_array(branch.header().level() + 1, leaf, key, neighbors),
            &[leaf],
        )?;

        self.splice(neighbors, la);
        branch.insert_child(self.pool(), byte, la);

        self.count_put(mode);
        Ok(InsertOutcome::Inserted)
    }

    /// Replace a full branch with a compacted or grown copy that also holds
    /// the new LeafArray.
    #[allow(clippy::too_many_arguments)]
    fn grow_and_insert(
        &self,
        parent: &Cursor<'_>,
        cur: &Cursor<'_>,
        byte: u8,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
        guard: &ArtGuard<'_>,
    ) -> Attempt<InsertOutcome> {
        let branch: &dyn Branch = cur.branch()?;
        let parent_branch: &dyn Branch = parent.branch()?;
        let mut lock: LockGuard<'_> = cur.node.version().upgrade(cur.version).ok_or(Abort::Restart)?;
        let _parent_lock: LockGuard<'_> = parent
            .node
            .version()
            .upgrade(parent.version)
            .ok_or(Abort::Restart)?;

        let mut children: Vec<(u8, PAddr)> = branch.children();
        let kind: NodeType = grown_kind(branch.kind(), children.len());

        let leaf: PAddr = self.new_leaf(key, value, mode)?;
        let _link = self.link_lock();

        let level: usize = branch.header().level();
        let neighbors = self.or_discard(self.find_neighbors(key), &[leaf])?;
        let la: PAddr = self.or_discard(
            self.build_single_leaf_array(level + 1, leaf, key, neighbors),
            &[leaf],
        )?;

        children.push((byte, la));
        children.sort_unstable_by_key(|&(b, _)| b);
        let replacement: PAddr = self.or_discard(
            build_branch_of(self.pool(), kind, level, branch.header().prefix(), &children)
                .map_err(Abort::from),
            &[la, leaf],
        )?;

        self.splice(neighbors, la);
        let replaced: bool = parent_branch.change_child(
            self.pool(),
            key_byte(key, parent_branch.header().level()),
            replacement,
        );
        debug_assert!(replaced, "parent lost the slot of a locked child");

        lock.mark_obsolete();
        guard.retire(cur.addr);

        debug_log!(
            from = ?branch.kind(),
            to = ?kind,
            children = children.len(),
            "branch replaced"
        );
        self.count_put(mode);
        Ok(InsertOutcome::Inserted)
    }

    // ========================================================================
    //  Case (c): LeafArray
    // ========================================================================

    fn put_into_leaf_array(
        &self,
        parent: &Cursor<'_>,
        la_cur: &Cursor<'_>,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
        guard: &ArtGuard<'_>,
    ) -> Attempt<InsertOutcome> {
        let la = la_cur.node.as_leaf_array().ok_or(Abort::Restart)?;

        // SAFETY: pinned by the caller's guard.
        let found: Option<(usize, bool)> =
            unsafe { la.find(self.pool(), key) }.map(|(i, leaf)| (i, leaf.is_tombstone()));
        la_cur.validate()?;

        match (found, mode) {
            (Some((_, false)), PutMode::Insert) => return Ok(InsertOutcome::AlreadyExists),
            (Some((_, true)), PutMode::Tombstone) => return Ok(InsertOutcome::Inserted),
            _ => {}
        }

        let mut lock: LockGuard<'_> = la_cur
            .node
            .version()
            .upgrade(la_cur.version)
            .ok_or(Abort::Restart)?;

        if let Some((i, _)) = found {
            let old: LeafSlot = la.slot(i).ok_or(Abort::Restart)?;
            match mode {
                PutMode::Insert => {
                    // Revive: a fresh live leaf takes the tombstone's slot.
                    let leaf: PAddr = Leaf::create(self.pool(), key, value, false)?;
                    la.replace_slot(self.pool(), i, LeafSlot::for_key(leaf, key));
                    guard.retire(old.leaf);
                    self.count_inserted();
                }
                PutMode::Tombstone => {
                    self.leaf(old.leaf).set_tombstone(self.pool());
                    self.count_removed();
                }
            }
            return Ok(InsertOutcome::Inserted);
        }

        if let Some(i) = la.free_slot() {
            let leaf: PAddr = self.new_leaf(key, value, mode)?;
            la.insert_slot(self.pool(), i, LeafSlot::for_key(leaf, key));
            self.count_put(mode);
            return Ok(InsertOutcome::Inserted);
        }

        let _parent_lock: LockGuard<'_> = parent
            .node
            .version()
            .upgrade(parent.version)
            .ok_or(Abort::Restart)?;
        let _link = self.link_lock();
        self.split_leaf_array(parent, la_cur, &mut lock, key, guard)?;

        Err(Abort::Restart)
    }

    // ========================================================================
    //  Helpers
    // ========================================================================

    fn new_leaf(&self, key: &[u8], value: &[u8], mode: PutMode) -> Attempt<PAddr> {
        Ok(Leaf::create(
            self.pool(),
            key,
            value,
            mode == PutMode::Tombstone,
        )?)
    }

    fn count_put(&self, mode: PutMode) {
        if mode == PutMode::Insert {
            self.count_inserted();
        }
    }

    /// Pass `result` through, freeing the unpublished `blocks` on error.
    pub(crate) fn or_discard<T>(&self, result: Attempt<T>, blocks: &[PAddr]) -> Attempt<T> {
        if result.is_err() {
            for &block in blocks {
                self.discard(block);
            }
        }
        result
    }
}

/// Where a key leaves a node's prefix.
#[derive(Clone, Copy, Debug)]
struct BranchPoint {
    /// Depth at which the node's prefix starts.
    depth: usize,
    /// Depth of the first differing byte.
    at: usize,
    /// The node's byte at `at`.
    existing: u8,
    /// The node's prefix below `at`.
    remaining: Prefix,
}
