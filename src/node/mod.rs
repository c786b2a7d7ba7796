//! Node representation.
//!
//! Every node is a block in the pool that starts with a [`NodeHeader`]. The
//! header's version word carries a 3-bit type tag, so a [`NodeRef`] (typed
//! view) can be built from any [`PAddr`] without tagging pointers.
//!
//! | Type        | Fanout | Child lookup                 |
//! |-------------|--------|------------------------------|
//! | [`N4`]      | 4      | linear scan, append slots    |
//! | [`N16`]     | 16     | linear scan, append slots    |
//! | [`N48`]     | 48     | 256-entry byte → slot index  |
//! | [`N256`]    | 256    | direct byte index            |
//! | [`LeafArray`] | 64 leaves | fingerprint scan        |
//!
//! All shared fields are atomics: optimistic readers load them while writers
//! (holding the node's lock) store them. Writers persist each commit point
//! before releasing the lock.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::error::ArtError;
use crate::nodeversion::NodeVersion;
use crate::pool::{PAddr, PmemPool};

pub mod leaf;
pub mod leaf_array;
pub mod linear;
pub mod n256;
pub mod n48;
pub mod prefix;

pub use leaf::{Leaf, LEAF_HEADER_SIZE, MAX_RECORD};
pub use leaf_array::{build_leaf_array, LeafArray, LeafSlot, LEAF_ARRAY_SLOTS};
pub use linear::{LinearNode, N16, N4};
pub use n256::N256;
pub use n48::N48;
pub use prefix::{Prefix, MAX_INLINE_PREFIX};

// ============================================================================
//  NodeType
// ============================================================================

/// Node type tag stored in the version word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    /// Up to 4 children.
    N4 = 1,
    /// Up to 16 children.
    N16 = 2,
    /// Up to 48 children.
    N48 = 3,
    /// Up to 256 children.
    N256 = 4,
    /// Batch of up to 64 leaves.
    LeafArray = 5,
}

impl NodeType {
    /// Decode a type tag. `None` for tags no node carries.
    #[inline]
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::N4),
            2 => Some(Self::N16),
            3 => Some(Self::N48),
            4 => Some(Self::N256),
            5 => Some(Self::LeafArray),
            _ => None,
        }
    }

    /// Block size needed for a node of this type.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::N4 => std::mem::size_of::<N4>(),
            Self::N16 => std::mem::size_of::<N16>(),
            Self::N48 => std::mem::size_of::<N48>(),
            Self::N256 => std::mem::size_of::<N256>(),
            Self::LeafArray => std::mem::size_of::<LeafArray>(),
        }
    }

    /// Maximum children (leaves for a LeafArray).
    #[must_use]
    pub const fn fanout(self) -> usize {
        match self {
            Self::N4 => 4,
            Self::N16 => 16,
            Self::N48 => 48,
            Self::N256 => 256,
            Self::LeafArray => LEAF_ARRAY_SLOTS,
        }
    }

    /// Smallest branch type that holds `children` children.
    #[must_use]
    pub const fn branch_for(children: usize) -> Self {
        if children <= 4 {
            Self::N4
        } else if children <= 16 {
            Self::N16
        } else if children <= 48 {
            Self::N48
        } else {
            Self::N256
        }
    }
}

// ============================================================================
//  NodeHeader
// ============================================================================

/// Common header at offset 0 of every node.
#[derive(Debug)]
#[repr(C)]
pub struct NodeHeader {
    version: NodeVersion,
    /// Absolute key depth of the byte this node branches on.
    level: AtomicU32,
    /// Live children (transient, rebuilt on recovery).
    count: AtomicU16,
    /// Next free append slot of N4/N16 (transient, rebuilt on recovery).
    cursor: AtomicU16,
    prefix: AtomicU64,
}

impl NodeHeader {
    /// Initialize a header in a freshly allocated block.
    pub fn init(&self, kind: NodeType, level: u32, prefix: Prefix) {
        self.version.init(kind as u8);
        self.level.store(level, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
        self.prefix.store(prefix.pack(), Ordering::Release);
    }

    /// The version/lock word.
    #[inline(always)]
    #[must_use]
    pub const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// Branch depth.
    #[inline(always)]
    #[must_use]
    pub fn level(&self) -> usize {
        self.level.load(Ordering::Acquire) as usize
    }

    /// Current prefix.
    #[inline(always)]
    #[must_use]
    pub fn prefix(&self) -> Prefix {
        Prefix::unpack(self.prefix.load(Ordering::Acquire))
    }

    /// Publish a new prefix and persist it. Caller holds the node's lock, or
    /// runs recovery.
    pub fn set_prefix(&self, pool: &PmemPool, prefix: Prefix) {
        self.prefix.store(prefix.pack(), Ordering::Release);
        pool.persist_val(&self.prefix);
    }

    /// Live children.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub(crate) fn set_count(&self, count: usize) {
        self.count.store(count as u16, Ordering::Release);
    }

    #[inline]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub(crate) fn set_cursor(&self, cursor: usize) {
        self.cursor.store(cursor as u16, Ordering::Release);
    }
}

// ============================================================================
//  Branch
// ============================================================================

/// Operations shared by the four branch node types.
///
/// Mutators require the node's write lock (or exclusive access during
/// construction and recovery) and persist their commit store.
pub trait Branch {
    /// The node header.
    fn header(&self) -> &NodeHeader;

    /// The node's type.
    fn kind(&self) -> NodeType;

    /// Child for `byte`, or null.
    fn find_child(&self, byte: u8) -> PAddr;

    /// Live children in ascending byte order.
    fn children(&self) -> Vec<(u8, PAddr)>;

    /// True if [`insert_child`](Self::insert_child) has a free slot.
    fn has_room(&self) -> bool;

    /// Add a child for a byte that has none.
    fn insert_child(&self, pool: &PmemPool, byte: u8, child: PAddr);

    /// [`insert_child`](Self::insert_child) without persisting, for a node
    /// that is still private to its builder.
    fn fill_child(&self, byte: u8, child: PAddr);

    /// Repoint the child for `byte`. Returns false if there is none.
    fn change_child(&self, pool: &PmemPool, byte: u8, child: PAddr) -> bool;

    /// Remove the child for `byte`. Returns false if there is none.
    fn remove_child(&self, pool: &PmemPool, byte: u8) -> bool;

    /// Rebuild transient metadata (count, cursor) from the durable slots and
    /// drop slots that were never committed.
    fn recover(&self, pool: &PmemPool);

    /// Largest child with a byte below `byte`.
    fn predecessor(&self, byte: u8) -> Option<(u8, PAddr)> {
        self.children().into_iter().rev().find(|&(b, _)| b < byte)
    }

    /// Child with the smallest byte.
    fn first_child(&self) -> Option<(u8, PAddr)> {
        self.children().into_iter().next()
    }

    /// Child with the largest byte.
    fn last_child(&self) -> Option<(u8, PAddr)> {
        self.children().into_iter().next_back()
    }
}

// ============================================================================
//  NodeRef
// ============================================================================

/// Typed view of a node block.
#[derive(Clone, Copy, Debug)]
pub enum NodeRef<'a> {
    /// A node with up to 4 children.
    N4(&'a N4),
    /// A node with up to 16 children.
    N16(&'a N16),
    /// A node with up to 48 children.
    N48(&'a N48),
    /// A node with up to 256 children.
    N256(&'a N256),
    /// A leaf batch.
    LeafArray(&'a LeafArray),
}

impl<'a> NodeRef<'a> {
    /// View the node at `addr`. `None` if the header carries no node tag.
    ///
    /// # Safety
    /// `addr` must be a live pool block (reached through the tree while
    /// pinned, or during single-threaded recovery).
    #[must_use]
    pub unsafe fn load(pool: &'a PmemPool, addr: PAddr) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        // SAFETY: every block is at least 64 bytes and starts with a header.
        let header: &NodeHeader = unsafe { pool.get::<NodeHeader>(addr) };
        let kind: NodeType = NodeType::from_tag(header.version().type_tag())?;

        // SAFETY: the type tag names the layout of the block.
        Some(unsafe {
            match kind {
                NodeType::N4 => Self::N4(pool.get(addr)),
                NodeType::N16 => Self::N16(pool.get(addr)),
                NodeType::N48 => Self::N48(pool.get(addr)),
                NodeType::N256 => Self::N256(pool.get(addr)),
                NodeType::LeafArray => Self::LeafArray(pool.get(addr)),
            }
        })
    }

    /// The node header.
    #[inline]
    #[must_use]
    pub fn header(self) -> &'a NodeHeader {
        match self {
            Self::N4(n) => n.header(),
            Self::N16(n) => n.header(),
            Self::N48(n) => n.header(),
            Self::N256(n) => n.header(),
            Self::LeafArray(n) => n.header(),
        }
    }

    /// The version/lock word.
    #[inline]
    #[must_use]
    pub fn version(self) -> &'a NodeVersion {
        self.header().version()
    }

    /// The node's type.
    #[must_use]
    pub const fn kind(self) -> NodeType {
        match self {
            Self::N4(_) => NodeType::N4,
            Self::N16(_) => NodeType::N16,
            Self::N48(_) => NodeType::N48,
            Self::N256(_) => NodeType::N256,
            Self::LeafArray(_) => NodeType::LeafArray,
        }
    }

    /// Branch operations, `None` for a LeafArray.
    #[inline]
    #[must_use]
    pub fn as_branch(self) -> Option<&'a dyn Branch> {
        match self {
            Self::N4(n) => Some(n as &dyn Branch),
            Self::N16(n) => Some(n as &dyn Branch),
            Self::N48(n) => Some(n as &dyn Branch),
            Self::N256(n) => Some(n as &dyn Branch),
            Self::LeafArray(_) => None,
        }
    }

    /// The LeafArray, `None` for a branch.
    #[inline]
    #[must_use]
    pub const fn as_leaf_array(self) -> Option<&'a LeafArray> {
        match self {
            Self::LeafArray(la) => Some(la),
            _ => None,
        }
    }
}

/// Allocate and persist a branch node of the smallest fitting type.
///
/// `children` must be sorted by byte with no duplicates.
///
/// # Errors
/// Pool exhaustion.
pub fn build_branch(
    pool: &PmemPool,
    level: usize,
    prefix: Prefix,
    children: &[(u8, PAddr)],
) -> Result<PAddr, ArtError> {
    build_branch_of(pool, NodeType::branch_for(children.len()), level, prefix, children)
}

/// Allocate and persist a branch node of type `kind`.
///
/// # Errors
/// Pool exhaustion.
pub fn build_branch_of(
    pool: &PmemPool,
    kind: NodeType,
    level: usize,
    prefix: Prefix,
    children: &[(u8, PAddr)],
) -> Result<PAddr, ArtError> {
    debug_assert!(children.len() <= kind.fanout());
    debug_assert!(kind != NodeType::LeafArray);

    let addr: PAddr = pool.alloc(kind.size())?;
    let level: u32 = u32::try_from(level).unwrap_or(u32::MAX);

    // SAFETY: fresh zeroed block of the right size; nobody else sees it.
    let branch: &dyn Branch = unsafe {
        match kind {
            NodeType::N4 => pool.get::<N4>(addr) as &dyn Branch,
            NodeType::N16 => pool.get::<N16>(addr) as &dyn Branch,
            NodeType::N48 => pool.get::<N48>(addr) as &dyn Branch,
            _ => pool.get::<N256>(addr) as &dyn Branch,
        }
    };

    branch.header().init(kind, level, prefix);
    for &(byte, child) in children {
        branch.fill_child(byte, child);
    }
    pool.persist_addr(addr, kind.size());

    Ok(addr)
}
