//! Value update.
//!
//! Leaves are immutable, so an update writes a complete new leaf, persists
//! it, and swaps it into the LeafArray slot with one 8-byte store. The old
//! leaf is retired.

use crate::error::ArtError;
use crate::node::leaf::check_record;
use crate::node::{Leaf, LeafSlot};
use crate::nodeversion::LockGuard;
use crate::pool::PAddr;

use super::lookup::Descent;
use super::{Abort, ArtGuard, ArtTree, Attempt, UpdateOutcome};

impl ArtTree {
    /// Update `key` inside an existing pin.
    ///
    /// # Errors
    /// [`ArtError::RecordTooLarge`] or pool exhaustion.
    pub fn update_with_guard(
        &self,
        key: &[u8],
        value: &[u8],
        guard: &ArtGuard<'_>,
    ) -> Result<UpdateOutcome, ArtError> {
        check_record(key, value)?;
        self.run(|| self.update_once(key, value, guard))
    }

    fn update_once(
        &self,
        key: &[u8],
        value: &[u8],
        guard: &ArtGuard<'_>,
    ) -> Attempt<UpdateOutcome> {
        let Descent::LeafArray { la: la_cur, .. } = self.descend(key)? else {
            return Ok(UpdateOutcome::NotFound);
        };
        let la = la_cur.node.as_leaf_array().ok_or(Abort::Restart)?;

        // SAFETY: pinned by the caller's guard.
        let found: Option<(usize, bool)> =
            unsafe { la.find(self.pool(), key) }.map(|(i, leaf)| (i, leaf.is_tombstone()));
        la_cur.validate()?;

        let Some((i, false)) = found else {
            return Ok(UpdateOutcome::NotFound);
        };

        let _lock: LockGuard<'_> = la_cur
            .node
            .version()
            .upgrade(la_cur.version)
            .ok_or(Abort::Restart)?;
        let old: LeafSlot = la.slot(i).ok_or(Abort::Restart)?;

        let leaf: PAddr = Leaf::create(self.pool(), key, value, false)?;
        la.replace_slot(self.pool(), i, LeafSlot::for_key(leaf, key));
        guard.retire(old.leaf);

        Ok(UpdateOutcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use crate::{ArtConfig, ArtTree, UpdateOutcome};

    #[test]
    fn test_update_semantics() {
        let t = ArtTree::create(ArtConfig::in_memory(8 << 20)).unwrap();
        assert_eq!(t.update(b"k", b"v").unwrap(), UpdateOutcome::NotFound);

        t.insert(b"k", b"v1").unwrap();
        assert_eq!(t.update(b"k", b"a much longer value").unwrap(), UpdateOutcome::Updated);
        assert_eq!(t.lookup(b"k").as_deref(), Some(&b"a much longer value"[..]));
        assert_eq!(t.len(), 1);

        t.remove_tombstone(b"k").unwrap();
        assert_eq!(t.update(b"k", b"v3").unwrap(), UpdateOutcome::NotFound);
        assert_eq!(t.lookup(b"k"), None);
    }

    #[test]
    fn test_update_retires_old_leaf() {
        let t = ArtTree::create(ArtConfig::in_memory(8 << 20)).unwrap();
        t.insert(b"k", b"v1").unwrap();
        let before = t.pool().stats().live_blocks;

        let handle = t.handle();
        {
            let guard = handle.pin();
            t.update_with_guard(b"k", b"v2", &guard).unwrap();
        }
        assert_eq!(handle.garbage_len(), 1);
        assert_eq!(handle.collect(), 1);
        assert_eq!(t.pool().stats().live_blocks, before);
    }
}
