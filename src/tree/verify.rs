//! Structural self-check.
//!
//! Walks the whole tree and the leaf list and reports every broken
//! invariant as a readable string. Meant for tests and debugging on a
//! quiescent tree: concurrent writers produce spurious violations.

use crate::key::{fingerprint, key_byte};
use crate::node::{NodeRef, NodeType, Prefix};
use crate::pool::PAddr;

use super::ArtTree;

/// Shape and health of a tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Leaves without the tombstone flag.
    pub live_keys: usize,
    /// Tombstoned leaves.
    pub tombstones: usize,
    /// LeafArrays in the tree.
    pub leaf_arrays: usize,
    /// N4 nodes.
    pub n4: usize,
    /// N16 nodes.
    pub n16: usize,
    /// N48 nodes.
    pub n48: usize,
    /// N256 nodes (the root included).
    pub n256: usize,
    /// Most branch nodes on any root-to-LeafArray path.
    pub max_depth: usize,
    /// Broken invariants, empty for a healthy tree.
    pub violations: Vec<String>,
}

impl TreeStats {
    /// True if no invariant is broken.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A key byte every leaf below a node must carry.
#[derive(Clone, Copy)]
struct Constraint {
    depth: usize,
    byte: u8,
}

struct Check {
    stats: TreeStats,
    /// LeafArrays in tree order.
    order: Vec<PAddr>,
    /// Largest key seen so far in tree order.
    last_key: Option<Vec<u8>>,
    constraints: Vec<Constraint>,
}

impl Check {
    fn violation(&mut self, addr: PAddr, what: &str) {
        self.stats.violations.push(format!("{addr:?}: {what}"));
    }
}

impl ArtTree {
    /// Check every structural invariant and count node types.
    #[must_use]
    pub fn verify(&self) -> TreeStats {
        let handle = self.collector().register();
        let _guard = handle.pin();

        let mut check = Check {
            stats: TreeStats::default(),
            order: Vec::new(),
            last_key: None,
            constraints: Vec::new(),
        };
        self.verify_node(self.root_addr(), 0, 1, &mut check);
        self.verify_list(&mut check);

        if check.stats.live_keys != self.len() {
            let what = format!(
                "len() is {} but {} live keys are stored",
                self.len(),
                check.stats.live_keys
            );
            check.violation(self.root_addr(), &what);
        }
        check.stats
    }

    fn verify_node(&self, addr: PAddr, depth: usize, height: usize, check: &mut Check) {
        let Ok(node) = self.load(addr) else {
            check.violation(addr, "pointer does not lead to a node");
            return;
        };
        if node.version().is_locked() {
            check.violation(addr, "node left locked");
        }
        if node.version().is_obsolete() {
            check.violation(addr, "obsolete node still reachable");
        }

        match node {
            NodeRef::LeafArray(_) => {
                check.stats.max_depth = check.stats.max_depth.max(height - 1);
                self.verify_leaf_array(addr, node, check);
            }
            _ => self.verify_branch(addr, node, depth, height, check),
        }
    }

    fn verify_branch(
        &self,
        addr: PAddr,
        node: NodeRef<'_>,
        depth: usize,
        height: usize,
        check: &mut Check,
    ) {
        let Some(branch) = node.as_branch() else {
            return;
        };
        match node.kind() {
            NodeType::N4 => check.stats.n4 += 1,
            NodeType::N16 => check.stats.n16 += 1,
            NodeType::N48 => check.stats.n48 += 1,
            _ => check.stats.n256 += 1,
        }

        let children: Vec<(u8, PAddr)> = branch.children();
        let is_root: bool = addr == self.root_addr();
        if children.len() > node.kind().fanout() {
            check.violation(addr, "more children than the node type holds");
        }
        if branch.header().count() != children.len() {
            check.violation(addr, "child count out of date");
        }
        if !is_root && children.len() < 2 {
            check.violation(addr, "non-root branch with fewer than two children");
        }

        let level: usize = branch.header().level();
        let prefix: Prefix = branch.header().prefix();
        if prefix.len() + depth != level {
            check.violation(addr, "prefix length disagrees with level");
        }

        let mark: usize = check.constraints.len();
        for (i, &byte) in prefix.inline().iter().enumerate() {
            check.constraints.push(Constraint {
                depth: depth + i,
                byte,
            });
        }

        for (byte, child) in children {
            check.constraints.push(Constraint { depth: level, byte });
            self.verify_node(child, level + 1, height + 1, check);
            check.constraints.pop();
        }
        check.constraints.truncate(mark);
    }

    fn verify_leaf_array(&self, addr: PAddr, node: NodeRef<'_>, check: &mut Check) {
        let Some(la) = node.as_leaf_array() else {
            return;
        };
        check.stats.leaf_arrays += 1;
        check.order.push(addr);

        let occupied = la.occupied();
        if la.leaf_count() != occupied.len() {
            check.violation(addr, "bitmap disagrees with slots");
        }
        if occupied.is_empty() {
            check.violation(addr, "empty leaf array still in the tree");
        }

        let mut keys: Vec<&[u8]> = Vec::with_capacity(occupied.len());
        for &(_, slot) in &occupied {
            let leaf = self.leaf(slot.leaf);
            if leaf.is_tombstone() {
                check.stats.tombstones += 1;
            } else {
                check.stats.live_keys += 1;
            }
            let key: &[u8] = leaf.key();
            if fingerprint(key) != slot.fingerprint {
                check.violation(addr, "fingerprint does not match its key");
            }
            let stray: bool = check
                .constraints
                .iter()
                .any(|c| key_byte(key, c.depth) != c.byte);
            if stray {
                check.violation(addr, "key does not match the path to its leaf array");
            }
            keys.push(key);
        }

        keys.sort_unstable();
        if keys.windows(2).any(|w| w[0] == w[1]) {
            check.violation(addr, "duplicate key");
        }
        if let (Some(first), Some(prev)) = (keys.first(), check.last_key.as_deref()) {
            if *first <= prev {
                check.violation(addr, "keys overlap the previous leaf array");
            }
        }
        if let Some(last) = keys.last() {
            check.last_key = Some(last.to_vec());
        }
    }

    /// The list must visit the tree's LeafArrays in tree order.
    fn verify_list(&self, check: &mut Check) {
        let head: PAddr = self.head_addr();
        if !self.head().prev().is_null() {
            check.violation(head, "list head has a predecessor");
        }

        let mut prev: PAddr = head;
        let mut addr: PAddr = self.head().next();
        let mut walked: Vec<PAddr> = Vec::with_capacity(check.order.len());
        while !addr.is_null() {
            if walked.len() > check.order.len() {
                check.violation(head, "leaf list is longer than the tree (cycle?)");
                return;
            }
            let Ok(la) = self.leaf_array(addr) else {
                check.violation(addr, "list member is not a leaf array");
                return;
            };
            if la.prev() != prev {
                check.violation(addr, "prev link does not point back");
            }
            walked.push(addr);
            prev = addr;
            addr = la.next();
        }

        if walked != check.order {
            check.violation(head, "leaf list order differs from tree order");
        }
    }
}
