//! Point lookup.
//!
//! Lock-free: the descent reads versions and validates them, and restarts if
//! anything it read was concurrently modified.

use crate::key::key_byte;
use crate::node::{Branch, NodeRef};
use crate::pool::PAddr;

use super::prefix_check::{check_simple, PrefixMatch};
use super::{ArtGuard, ArtTree, Attempt, Cursor};

/// Where a descent for a key ended.
pub(crate) enum Descent<'t> {
    /// The key's LeafArray, with its parent and grandparent (if any).
    LeafArray {
        la: Cursor<'t>,
        parent: Cursor<'t>,
        grandparent: Option<Cursor<'t>>,
    },
    /// No subtree can hold the key (all versions validated).
    Absent,
}

impl ArtTree {
    /// Look up `key` inside an existing pin.
    #[must_use]
    pub fn lookup_with_guard(&self, key: &[u8], _guard: &ArtGuard<'_>) -> Option<Vec<u8>> {
        // Lookups never allocate, so the only abort is a restart.
        self.run(|| self.lookup_once(key)).ok().flatten()
    }

    fn lookup_once(&self, key: &[u8]) -> Attempt<Option<Vec<u8>>> {
        let Descent::LeafArray { la, .. } = self.descend(key)? else {
            return Ok(None);
        };
        let Some(array) = la.node.as_leaf_array() else {
            return Ok(None);
        };

        // SAFETY: pinned by the caller's guard.
        let value: Option<Vec<u8>> = unsafe { array.find(self.pool(), key) }
            .filter(|(_, leaf)| !leaf.is_tombstone())
            .map(|(_, leaf)| leaf.value().to_vec());

        la.validate()?;
        Ok(value)
    }

    /// Optimistic descent to the LeafArray that would hold `key`.
    ///
    /// Every returned cursor carries the version it was read at; the caller
    /// validates or upgrades them.
    pub(crate) fn descend(&self, key: &[u8]) -> Attempt<Descent<'_>> {
        let mut grandparent: Option<Cursor<'_>> = None;
        let mut parent: Option<Cursor<'_>> = None;
        let mut cur: Cursor<'_> = self.root_cursor()?;
        let mut depth: usize = 0;

        loop {
            if let NodeRef::LeafArray(_) = cur.node {
                let Some(parent) = parent else {
                    return Ok(Descent::Absent);
                };
                return Ok(Descent::LeafArray {
                    la: cur,
                    parent,
                    grandparent,
                });
            }

            let branch: &dyn Branch = cur.branch()?;
            if check_simple(branch.header(), key, depth) == PrefixMatch::NoMatch {
                cur.validate()?;
                return Ok(Descent::Absent);
            }

            let level: usize = branch.header().level();
            let child: PAddr = branch.find_child(key_byte(key, level));
            cur.validate()?;
            if child.is_null() {
                return Ok(Descent::Absent);
            }

            let next: Cursor<'_> = self.visit(child)?;
            cur.validate()?;

            grandparent = parent;
            parent = Some(cur);
            cur = next;
            depth = level + 1;
        }
    }
}
