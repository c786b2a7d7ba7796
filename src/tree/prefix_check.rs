//! Prefix checks.
//!
//! A node reached at key depth `depth` covers the compressed span
//! `[depth, level)`. Three checks compare a key with that span:
//!
//! - [`check_simple`]: lookups. Never blocks and never reads leaves; a long
//!   or inconsistent prefix is passed optimistically and the final full-key
//!   compare decides.
//! - [`ArtTree::check_pessimistic`]: inserts. Repairs an inconsistent prefix
//!   and reports exactly where a mismatching key diverges.
//! - [`ArtTree::range_compare`]: scans. Orders the whole subtree against a
//!   range bound.

use std::cmp::Ordering;

use crate::key::key_byte;
use crate::node::{NodeHeader, NodeRef, Prefix, MAX_INLINE_PREFIX};
use crate::tracing_helpers::debug_log;

use super::{Abort, ArtTree, Attempt, Cursor};

/// Outcome of the optimistic prefix check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PrefixMatch {
    /// Every prefix byte matches.
    Match,
    /// An inlined byte differs: the key is not in this subtree.
    NoMatch,
    /// Could not be decided without reading a leaf; assume a match.
    Optimistic,
}

/// Lookup-side check.
pub(crate) fn check_simple(header: &NodeHeader, key: &[u8], depth: usize) -> PrefixMatch {
    let prefix: Prefix = header.prefix();
    if prefix.len() + depth != header.level() {
        return PrefixMatch::Optimistic;
    }

    for (i, &byte) in prefix.inline().iter().enumerate() {
        if byte != key_byte(key, depth + i) {
            return PrefixMatch::NoMatch;
        }
    }

    if prefix.is_complete() {
        PrefixMatch::Match
    } else {
        PrefixMatch::Optimistic
    }
}

/// Outcome of the insert-side check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PessimisticCheck {
    /// The key runs through the whole prefix.
    Match,
    /// The key leaves the prefix at `depth`.
    Mismatch {
        /// Absolute depth of the first differing byte.
        depth: usize,
        /// The node's byte at that depth.
        existing: u8,
        /// What is left of the node's prefix below the divergence.
        remaining: Prefix,
    },
}

/// Subtree position relative to a range bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RangeCmp {
    /// Every key below the node sorts before the bound.
    Smaller,
    /// The prefix equals the bound's bytes: descend to decide.
    Equal,
    /// Every key below the node sorts after the bound.
    Bigger,
}

impl ArtTree {
    /// Byte `i` of `node`'s prefix, which starts at `depth`.
    fn prefix_byte<'t>(
        &'t self,
        node: NodeRef<'t>,
        prefix: Prefix,
        depth: usize,
        i: usize,
        leaf_key: &mut Option<&'t [u8]>,
    ) -> Attempt<u8> {
        if i < MAX_INLINE_PREFIX {
            return Ok(prefix.inline()[i]);
        }
        if leaf_key.is_none() {
            *leaf_key = Some(self.any_leaf_key(node).ok_or(Abort::Restart)?);
        }
        Ok(leaf_key.map_or(0, |k| key_byte(k, depth + i)))
    }

    /// Insert-side check of `cur` reached at `depth` below `parent`.
    ///
    /// A prefix whose length disagrees with the node's level (left behind by
    /// an interrupted merge or branch-point insert) is recomputed from a
    /// descendant leaf under the node's lock, persisted, and the operation
    /// restarts.
    pub(crate) fn check_pessimistic(
        &self,
        cur: &Cursor<'_>,
        parent: Option<&Cursor<'_>>,
        key: &[u8],
        depth: usize,
    ) -> Attempt<PessimisticCheck> {
        let header: &NodeHeader = cur.node.header();
        let prefix: Prefix = header.prefix();
        let level: usize = header.level();

        if prefix.len() + depth != level {
            return Err(self.repair_prefix(cur, parent, depth));
        }

        let mut leaf_key: Option<&[u8]> = None;
        for i in 0..prefix.len() {
            let existing: u8 = self.prefix_byte(cur.node, prefix, depth, i, &mut leaf_key)?;
            if existing == key_byte(key, depth + i) {
                continue;
            }

            let rest: usize = prefix.len() - i - 1;
            let remaining: Prefix = if prefix.is_complete() {
                Prefix::from_key(prefix.inline(), i + 1, rest)
            } else {
                let source: &[u8] = match leaf_key {
                    Some(k) => k,
                    None => self.any_leaf_key(cur.node).ok_or(Abort::Restart)?,
                };
                Prefix::from_key(source, depth + i + 1, rest)
            };

            return Ok(PessimisticCheck::Mismatch {
                depth: depth + i,
                existing,
                remaining,
            });
        }

        Ok(PessimisticCheck::Match)
    }

    /// Recompute and persist `cur`'s prefix. Always yields a restart.
    fn repair_prefix(&self, cur: &Cursor<'_>, parent: Option<&Cursor<'_>>, depth: usize) -> Abort {
        let Some(parent) = parent else {
            return Abort::Restart;
        };
        let Some(_lock) = cur.node.version().upgrade(cur.version) else {
            return Abort::Restart;
        };
        if parent.validate().is_err() {
            return Abort::Restart;
        }

        let level: usize = cur.node.header().level();
        if level < depth {
            return Abort::Restart;
        }
        let Some(leaf_key) = self.any_leaf_key(cur.node) else {
            return Abort::Restart;
        };

        let repaired = Prefix::from_key(leaf_key, depth, level - depth);
        cur.node.header().set_prefix(self.pool(), repaired);
        debug_log!(addr = ?cur.addr, depth, level, "prefix repaired");

        Abort::Restart
    }

    /// Order the subtree at `node` (reached at `depth`) against `bound`.
    ///
    /// Bytes past the end of either key count as zero, matching how the
    /// tree routes keys.
    pub(crate) fn range_compare(
        &self,
        node: NodeRef<'_>,
        bound: &[u8],
        depth: usize,
    ) -> Attempt<RangeCmp> {
        let prefix: Prefix = node.header().prefix();
        if prefix.len() + depth != node.header().level() {
            return Err(Abort::Restart);
        }

        let mut leaf_key: Option<&[u8]> = None;
        for i in 0..prefix.len() {
            let byte: u8 = self.prefix_byte(node, prefix, depth, i, &mut leaf_key)?;
            match byte.cmp(&key_byte(bound, depth + i)) {
                Ordering::Less => return Ok(RangeCmp::Smaller),
                Ordering::Greater => return Ok(RangeCmp::Bigger),
                Ordering::Equal => {}
            }
        }
        Ok(RangeCmp::Equal)
    }
}
