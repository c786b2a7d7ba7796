//! `ArtTree`: the persistent, concurrent Adaptive Radix Tree.
//!
//! This module holds the tree handle, its outcome types and the helpers the
//! operation modules share. Each operation lives in its own submodule as an
//! `impl ArtTree` block.
//!
//! # Concurrency
//!
//! Readers never lock. They read a node's version with
//! [`NodeVersion::stable`], read what they need, and validate the version
//! before trusting it (lock coupling: the parent is revalidated after the
//! child's version is taken). Writers upgrade the optimistic version they
//! already hold into a write lock, so a writer never blocks while holding a
//! lock except when spinning on a child below nodes it already owns.
//!
//! Any failed validation or upgrade restarts the operation from the root.
//!
//! Changes to the set of LeafArrays, or to any branch's children, also take
//! the tree-wide link mutex. It is taken after all node locks and its holder
//! never waits on a node lock.
//!
//! # Memory
//!
//! Every operation runs inside an epoch [`Guard`]. Unlinked nodes and leaves
//! are retired to the guard and returned to the pool once no pinned thread
//! can still reach them.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ArtConfig;
use crate::epoch::{Collector, Guard, LocalHandle};
use crate::error::{ArtError, PoolError};
use crate::node::{
    build_branch_of, build_leaf_array, Branch, Leaf, LeafArray, NodeRef, NodeType, Prefix,
};
use crate::nodeversion::Backoff;
use crate::pool::{PAddr, PmemPool, UsedExtents};
use crate::tracing_helpers::{error_log, info_log, warn_log};

mod insert;
mod lookup;
mod prefix_check;
mod recovery;
mod remove;
mod scan;
mod structural;
mod update;
mod verify;

pub use recovery::RecoveryStats;
pub use scan::ScanResult;
pub use verify::TreeStats;

// ============================================================================
//  Outcomes
// ============================================================================

/// Result of [`ArtTree::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was added (or revived from a tombstone).
    Inserted,
    /// A live record with this key exists; nothing changed.
    AlreadyExists,
}

/// Result of [`ArtTree::update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The value was replaced.
    Updated,
    /// No live record with this key.
    NotFound,
}

/// Result of [`ArtTree::remove`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The record was removed.
    Removed,
    /// No live record with this key.
    NotFound,
}

/// Epoch guard over retired pool blocks.
pub type ArtGuard<'h> = Guard<'h, PAddr>;

/// Per-thread epoch handle.
pub type ArtHandle = LocalHandle<PAddr>;

// ============================================================================
//  Abort
// ============================================================================

/// Why one attempt at an operation stopped.
#[derive(Debug)]
pub(crate) enum Abort {
    /// A validation or lock upgrade failed; start over from the root.
    Restart,
    /// A real error; return it to the caller.
    Error(ArtError),
}

impl From<ArtError> for Abort {
    fn from(err: ArtError) -> Self {
        Self::Error(err)
    }
}

impl From<PoolError> for Abort {
    fn from(err: PoolError) -> Self {
        Self::Error(ArtError::Pool(err))
    }
}

/// One attempt's result.
pub(crate) type Attempt<T> = Result<T, Abort>;

/// A node visited during a descent, with the version it was read at.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cursor<'t> {
    pub(crate) addr: PAddr,
    pub(crate) node: NodeRef<'t>,
    pub(crate) version: u64,
}

impl<'t> Cursor<'t> {
    #[inline]
    pub(crate) fn branch(&self) -> Attempt<&'t dyn Branch> {
        self.node.as_branch().ok_or(Abort::Restart)
    }

    #[inline]
    pub(crate) fn validate(&self) -> Attempt<()> {
        if self.node.version().validate(self.version) {
            Ok(())
        } else {
            Err(Abort::Restart)
        }
    }
}

// ============================================================================
//  ArtTree
// ============================================================================

/// A persistent, concurrent ordered index over byte-string keys.
///
/// # Example
///
/// ```rust
/// use nvart::{ArtConfig, ArtTree, InsertOutcome};
///
/// let tree = ArtTree::create(ArtConfig::in_memory(8 << 20)).unwrap();
/// assert_eq!(tree.insert(b"hello", b"world").unwrap(), InsertOutcome::Inserted);
/// assert_eq!(tree.lookup(b"hello").as_deref(), Some(&b"world"[..]));
///
/// let handle = tree.handle();
/// let guard = handle.pin();
/// assert!(tree.lookup_with_guard(b"nope", &guard).is_none());
/// ```
pub struct ArtTree {
    pool: Arc<PmemPool>,
    epoch: Collector<PAddr>,
    root: PAddr,
    head: PAddr,
    link: Mutex<()>,
    len: AtomicUsize,
    config: ArtConfig,
}

impl fmt::Debug for ArtTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtTree")
            .field("root", &self.root)
            .field("head", &self.head)
            .field("len", &self.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ArtTree {
    /// Create an empty tree in a fresh pool (truncating any backing file).
    ///
    /// # Errors
    /// Pool creation or allocation failures.
    pub fn create(config: ArtConfig) -> Result<Self, ArtError> {
        let pool = Arc::new(PmemPool::create(&config.pool)?);

        let root: PAddr = build_branch_of(&pool, NodeType::N256, 0, Prefix::EMPTY, &[])?;
        let head: PAddr = build_leaf_array(&pool, 0, &[], PAddr::NULL, PAddr::NULL)?;
        pool.set_roots(root, head);

        info_log!(persistent = pool.is_persistent(), size = pool.size(), "tree created");
        Ok(Self::assemble(pool, root, head, 0, config))
    }

    /// Reopen an existing pool and run recovery.
    ///
    /// # Errors
    /// [`PoolError::BadMagic`] or [`PoolError::LayoutMismatch`] for a file
    /// that does not hold a tree, I/O failures otherwise.
    pub fn open(config: ArtConfig) -> Result<Self, ArtError> {
        let pool = Arc::new(PmemPool::open(&config.pool)?);

        let (root, head) = (pool.root(), pool.list_head());
        if root.is_null() || head.is_null() {
            return Err(PoolError::LayoutMismatch {
                reason: "pool holds no tree root".to_string(),
            }
            .into());
        }

        let tree = Self::assemble(pool, root, head, 0, config);
        let mut used = UsedExtents::new();
        let _stats: RecoveryStats = tree.rebuild_after_crash(&mut used).inspect_err(|_err| {
            error_log!(error = %_err, "recovery walk failed");
        })?;
        tree.pool.rebuild_free_lists(&used);

        info_log!(
            live_keys = _stats.live_keys,
            prefixes_repaired = _stats.prefixes_repaired,
            links_repaired = _stats.links_repaired,
            "tree recovered"
        );
        Ok(tree)
    }

    /// Open the pool at `config.pool.path` if the file exists and is not
    /// empty, otherwise create it.
    ///
    /// # Errors
    /// As for [`open`](Self::open) and [`create`](Self::create).
    pub fn open_or_create(config: ArtConfig) -> Result<Self, ArtError> {
        let exists: bool = config
            .pool
            .path
            .as_deref()
            .is_some_and(|p: &Path| p.metadata().is_ok_and(|m| m.len() > 0));

        if exists {
            Self::open(config)
        } else {
            Self::create(config)
        }
    }

    fn assemble(
        pool: Arc<PmemPool>,
        root: PAddr,
        head: PAddr,
        len: usize,
        config: ArtConfig,
    ) -> Self {
        let reclaim_pool: Arc<PmemPool> = Arc::clone(&pool);
        let epoch = Collector::new(config.epoch.clone(), move |addr: PAddr| {
            if let Err(_err) = reclaim_pool.free(addr) {
                warn_log!(?addr, error = %_err, "retired block could not be freed");
            }
        });

        Self {
            pool,
            epoch,
            root,
            head,
            link: Mutex::new(()),
            len: AtomicUsize::new(len),
            config,
        }
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    /// Register the calling thread and return its epoch handle.
    ///
    /// Keep the handle for the thread's lifetime and [`pin`](LocalHandle::pin)
    /// it around batches of `*_with_guard` calls.
    #[must_use]
    pub fn handle(&self) -> ArtHandle {
        self.pool.register_thread();
        self.epoch.register()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// True if no live key is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PmemPool {
        &self.pool
    }

    /// The epoch service.
    #[must_use]
    pub const fn collector(&self) -> &Collector<PAddr> {
        &self.epoch
    }

    /// The configuration the tree was opened with.
    #[must_use]
    pub const fn config(&self) -> &ArtConfig {
        &self.config
    }

    // ========================================================================
    //  Convenience API (one pin per call)
    // ========================================================================

    /// Look up `key`.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        let handle = self.epoch.register();
        let guard = handle.pin();
        self.lookup_with_guard(key, &guard)
    }

    /// Insert `key` if no live record exists.
    ///
    /// # Errors
    /// [`ArtError::RecordTooLarge`], [`ArtError::LeafArrayOverflow`] or pool
    /// exhaustion.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<InsertOutcome, ArtError> {
        let handle = self.epoch.register();
        let guard = handle.pin();
        self.insert_with_guard(key, value, &guard)
    }

    /// Replace the value of a live record.
    ///
    /// # Errors
    /// [`ArtError::RecordTooLarge`] or pool exhaustion.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<UpdateOutcome, ArtError> {
        let handle = self.epoch.register();
        let guard = handle.pin();
        self.update_with_guard(key, value, &guard)
    }

    /// Physically remove `key`.
    ///
    /// # Errors
    /// Pool exhaustion while shrinking a node.
    pub fn remove(&self, key: &[u8]) -> Result<RemoveOutcome, ArtError> {
        let handle = self.epoch.register();
        let guard = handle.pin();
        self.remove_with_guard(key, &guard)
    }

    /// Mark `key` deleted, inserting a tombstone if it is absent.
    ///
    /// # Errors
    /// As for [`insert`](Self::insert).
    pub fn remove_tombstone(&self, key: &[u8]) -> Result<(), ArtError> {
        let handle = self.epoch.register();
        let guard = handle.pin();
        self.remove_tombstone_with_guard(key, &guard)
    }

    /// Live records in `[start, end)`, at most `max` of them.
    #[must_use]
    pub fn scan(&self, start: &[u8], end: &[u8], max: usize) -> ScanResult {
        let handle = self.epoch.register();
        let guard = handle.pin();
        self.scan_with_guard(start, end, max, &guard)
    }

    // ========================================================================
    //  Shared helpers
    // ========================================================================

    /// Run attempts until one finishes without a restart.
    pub(crate) fn run<T>(&self, mut attempt: impl FnMut() -> Attempt<T>) -> Result<T, ArtError> {
        let mut backoff = Backoff::new();
        loop {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(Abort::Restart) => backoff.snooze(),
                Err(Abort::Error(err)) => return Err(err),
            }
        }
    }

    /// Typed view of a node reached through the tree.
    #[inline]
    pub(crate) fn load(&self, addr: PAddr) -> Attempt<NodeRef<'_>> {
        // SAFETY: `addr` was read from a published slot while pinned (or
        // during single-threaded recovery), so the block is allocated.
        unsafe { NodeRef::load(&self.pool, addr) }.ok_or(Abort::Restart)
    }

    /// Load `addr` and take a stable version.
    #[inline]
    pub(crate) fn visit(&self, addr: PAddr) -> Attempt<Cursor<'_>> {
        let node: NodeRef<'_> = self.load(addr)?;
        let version: u64 = node.version().stable().ok_or(Abort::Restart)?;
        Ok(Cursor {
            addr,
            node,
            version,
        })
    }

    #[inline]
    pub(crate) fn root_cursor(&self) -> Attempt<Cursor<'_>> {
        self.visit(self.root)
    }

    /// The root node.
    #[cfg(test)]
    pub(crate) fn root_node(&self) -> &crate::node::N256 {
        // SAFETY: the root is allocated at creation and never retired.
        unsafe { self.pool.get(self.root) }
    }

    /// The list head sentinel.
    pub(crate) fn head(&self) -> &LeafArray {
        // SAFETY: the head is allocated at creation and never retired.
        unsafe { self.pool.get(self.head) }
    }

    /// The LeafArray at `addr`.
    pub(crate) fn leaf_array(&self, addr: PAddr) -> Attempt<&LeafArray> {
        self.load(addr)?.as_leaf_array().ok_or(Abort::Restart)
    }

    /// The leaf at `addr`.
    #[inline]
    pub(crate) fn leaf(&self, addr: PAddr) -> &Leaf {
        // SAFETY: leaf addresses come from published LeafArray slots read
        // while pinned.
        unsafe { self.pool.get(addr) }
    }

    /// Key of some leaf below `node`. Any leaf works: all of them share the
    /// key bytes up to `node`'s level.
    pub(crate) fn any_leaf_key(&self, node: NodeRef<'_>) -> Option<&[u8]> {
        match node {
            NodeRef::LeafArray(la) => la
                .occupied()
                .first()
                .map(|&(_, slot)| self.leaf(slot.leaf).key()),
            _ => {
                let branch: &dyn Branch = node.as_branch()?;
                branch.children().into_iter().find_map(|(_, child)| {
                    let child: NodeRef<'_> = self.load(child).ok()?;
                    self.any_leaf_key(child)
                })
            }
        }
    }

    /// Leftmost LeafArray below `addr`.
    pub(crate) fn leftmost_leaf_array(&self, mut addr: PAddr) -> Attempt<PAddr> {
        loop {
            let node: NodeRef<'_> = self.load(addr)?;
            match node.as_branch() {
                None => return Ok(addr),
                Some(branch) => addr = branch.first_child().ok_or(Abort::Restart)?.1,
            }
        }
    }

    /// Rightmost LeafArray below `addr`.
    pub(crate) fn rightmost_leaf_array(&self, mut addr: PAddr) -> Attempt<PAddr> {
        loop {
            let node: NodeRef<'_> = self.load(addr)?;
            match node.as_branch() {
                None => return Ok(addr),
                Some(branch) => addr = branch.last_child().ok_or(Abort::Restart)?.1,
            }
        }
    }

    /// Free a block that was never published.
    pub(crate) fn discard(&self, addr: PAddr) {
        if let Err(_err) = self.pool.free(addr) {
            warn_log!(?addr, error = %_err, "unpublished block could not be freed");
        }
    }

    #[inline]
    pub(crate) fn count_inserted(&self) {
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_removed(&self) {
        self.len.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn set_len(&self, len: usize) {
        self.len.store(len, Ordering::Relaxed);
    }

    pub(crate) const fn root_addr(&self) -> PAddr {
        self.root
    }

    pub(crate) const fn head_addr(&self) -> PAddr {
        self.head
    }

    pub(crate) fn link_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.link.lock()
    }
}

impl Drop for ArtTree {
    fn drop(&mut self) {
        if let Err(_err) = self.pool.sync() {
            warn_log!(error = %_err, "pool sync on drop failed");
        }
    }
}
