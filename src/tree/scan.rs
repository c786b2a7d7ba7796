//! Range scan over `[start, end)`.
//!
//! The scan is a recursion over free functions sharing one [`ScanState`]:
//!
//! - while both bounds still constrain a node, it descends along the common
//!   path of `start` and `end`;
//! - below the first byte where they part, only one bound is active on each
//!   side: the left edge narrows toward `start`, the right edge toward `end`;
//! - children strictly between the edges hold only in-range keys. They are
//!   not visited through the tree: the scan finds the run's leftmost and
//!   rightmost LeafArray and walks the leaf list between them.
//!
//! Every LeafArray is read under a validated version. Any failed validation,
//! an obsolete node or a list walk that runs off the end restarts the whole
//! scan with an empty accumulator.

use crate::error::ArtError;
use crate::key::key_byte;
use crate::node::{Branch, LeafArray, NodeRef};
use crate::pool::PAddr;
use crate::tracing_helpers::error_log;

use super::prefix_check::RangeCmp;
use super::{Abort, ArtGuard, ArtTree, Attempt, Cursor};

/// Records returned by a scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Live `(key, value)` pairs in ascending key order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// First in-range key that did not fit, if the limit was reached.
    pub continuation: Option<Vec<u8>>,
}

/// Scan accumulator.
#[derive(Debug)]
pub(crate) struct ScanState<'k> {
    start: &'k [u8],
    end: &'k [u8],
    /// One more than the caller's maximum, to find the continuation.
    limit: usize,
    out: Vec<(Vec<u8>, Vec<u8>)>,
}

impl<'k> ScanState<'k> {
    fn new(start: &'k [u8], end: &'k [u8], max: usize) -> Self {
        Self {
            start,
            end,
            limit: max.saturating_add(1),
            out: Vec::new(),
        }
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.out.len() >= self.limit
    }

    #[inline]
    fn in_range(&self, key: &[u8]) -> bool {
        self.start <= key && key < self.end
    }

    fn finish(mut self, max: usize) -> ScanResult {
        let continuation: Option<Vec<u8>> = if self.out.len() > max {
            self.out.truncate(max + 1);
            self.out.pop().map(|(key, _)| key)
        } else {
            None
        };
        ScanResult {
            entries: self.out,
            continuation,
        }
    }
}

impl ArtTree {
    /// Scan inside an existing pin.
    #[must_use]
    pub fn scan_with_guard(
        &self,
        start: &[u8],
        end: &[u8],
        max: usize,
        _guard: &ArtGuard<'_>,
    ) -> ScanResult {
        if start >= end {
            return ScanResult::default();
        }

        let mut state = ScanState::new(start, end, max);
        // Scans never allocate, so the only abort is a restart.
        let outcome: Result<(), ArtError> = self.run(|| {
            state.out.clear();
            scan_subtree(self, self.root_addr(), 0, true, true, &mut state)
        });
        debug_assert!(outcome.is_ok(), "scan aborted with an error");
        if let Err(_err) = outcome {
            error_log!(error = %_err, "scan aborted");
            return ScanResult::default();
        }
        state.finish(max)
    }
}

/// Scan the subtree at `addr`, reached at key depth `depth`. `lo`/`hi` say
/// whether `start`/`end` still constrain it.
fn scan_subtree(
    tree: &ArtTree,
    addr: PAddr,
    depth: usize,
    lo: bool,
    hi: bool,
    st: &mut ScanState<'_>,
) -> Attempt<()> {
    if st.is_full() {
        return Ok(());
    }
    if !lo && !hi {
        return copy(tree, addr, addr, st);
    }

    let cur: Cursor<'_> = tree.visit(addr)?;
    if let NodeRef::LeafArray(la) = cur.node {
        return collect(tree, &cur, la, st);
    }
    let branch: &dyn Branch = cur.branch()?;

    let mut lo: bool = lo;
    let mut hi: bool = hi;
    if lo {
        match tree.range_compare(cur.node, st.start, depth)? {
            RangeCmp::Smaller => return cur.validate(),
            RangeCmp::Bigger => lo = false,
            RangeCmp::Equal => {}
        }
    }
    if hi {
        match tree.range_compare(cur.node, st.end, depth)? {
            RangeCmp::Bigger => return cur.validate(),
            RangeCmp::Smaller => hi = false,
            RangeCmp::Equal => {}
        }
    }

    let level: usize = branch.header().level();
    let lo_byte: u8 = if lo { key_byte(st.start, level) } else { 0 };
    let hi_byte: u8 = if hi { key_byte(st.end, level) } else { u8::MAX };
    let children: Vec<(u8, PAddr)> = branch
        .children()
        .into_iter()
        .filter(|&(b, _)| lo_byte <= b && b <= hi_byte)
        .collect();
    cur.validate()?;

    let mut i: usize = 0;
    while i < children.len() && !st.is_full() {
        let (byte, child) = children[i];
        let edge_lo: bool = lo && byte == lo_byte;
        let edge_hi: bool = hi && byte == hi_byte;

        if edge_lo || edge_hi {
            scan_subtree(tree, child, level + 1, edge_lo, edge_hi, st)?;
            i += 1;
            continue;
        }

        // Maximal run of children strictly inside the range.
        let mut j: usize = i;
        while j + 1 < children.len() && !(hi && children[j + 1].0 == hi_byte) {
            j += 1;
        }
        copy(tree, child, children[j].1, st)?;
        i = j + 1;
    }

    Ok(())
}

/// Copy every record below the subtrees `first..=last` (siblings, in order)
/// by walking the leaf list.
fn copy(tree: &ArtTree, first: PAddr, last: PAddr, st: &mut ScanState<'_>) -> Attempt<()> {
    let leftmost: PAddr = tree.leftmost_leaf_array(first)?;
    let rightmost: PAddr = tree.rightmost_leaf_array(last)?;

    let mut addr: PAddr = leftmost;
    loop {
        let cur: Cursor<'_> = tree.visit(addr)?;
        let la: &LeafArray = cur.node.as_leaf_array().ok_or(Abort::Restart)?;
        let next: PAddr = la.next();
        collect(tree, &cur, la, st)?;

        if addr == rightmost || st.is_full() {
            return Ok(());
        }
        if next.is_null() {
            return Err(Abort::Restart);
        }
        addr = next;
    }
}

/// Append the live in-range records of one LeafArray in key order.
fn collect(
    tree: &ArtTree,
    cur: &Cursor<'_>,
    la: &LeafArray,
    st: &mut ScanState<'_>,
) -> Attempt<()> {
    let mut records: Vec<(&[u8], &[u8])> = la
        .occupied()
        .into_iter()
        .map(|(_, slot)| tree.leaf(slot.leaf))
        .filter(|leaf| !leaf.is_tombstone() && st.in_range(leaf.key()))
        .map(|leaf| (leaf.key(), leaf.value()))
        .collect();
    cur.validate()?;

    records.sort_unstable_by(|a, b| a.0.cmp(b.0));
    for (key, value) in records {
        if st.is_full() {
            break;
        }
        st.out.push((key.to_vec(), value.to_vec()));
    }
    Ok(())
}
