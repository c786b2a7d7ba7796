//! Node version for optimistic lock coupling.
//!
//! [`NodeVersion`] packs the node type tag, a version counter, a write-lock
//! bit and an obsolete bit into a single `u64`. It lives at offset 0 of every
//! node header in the pool, so the struct is `repr(transparent)` over the
//! atomic word.
//!
//! # Concurrency Model
//! 1. Readers: `stable()` to get a version, read the node, `validate()`.
//! 2. Writers: `upgrade()` an optimistic version (or `lock()`), modify the
//!    node, let the [`LockGuard`] drop.
//!
//! A reader that finds the node obsolete, or a version that changed, restarts
//! its whole operation from the root.
//!
//! ```rust,ignore
//! let v = node.version().stable()?;
//! // ... read children ...
//! let mut guard = node.version().upgrade(v)?;
//! // ... modify ...
//! guard.mark_obsolete(); // optional
//! // lock released (version bumped) when guard drops
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicU64, Ordering};

#[cfg(all(test, loom))]
mod loom_tests;


// ============================================================================
//  Bit Constants
// ============================================================================

/// Obsolete bit: node has been replaced or unlinked.
const OBSOLETE_BIT: u64 = 1 << 0;

/// Lock bit: a writer holds the node.
const LOCK_BIT: u64 = 1 << 1;

/// Low bit of the version counter.
#[cfg(test)]
const VERSION_LOWBIT: u64 = 1 << 2;

/// Shift of the 3-bit node type tag.
const TYPE_SHIFT: u32 = 61;

/// Mask of the node type tag.
const TYPE_MASK: u64 = 0b111 << TYPE_SHIFT;

// ============================================================================
//  Backoff
// ============================================================================

/// Spin-then-yield-then-sleep backoff for lock waits.
///
/// Phase 1 (0-64): spin. Phase 2 (64-1024): yield. Phase 3: 10µs sleeps.
#[derive(Debug, Default)]
pub struct Backoff {
    spins: usize,
}

impl Backoff {
    /// Fresh backoff state.
    #[must_use]
    pub const fn new() -> Self {
        Self { spins: 0 }
    }

    /// Wait one step.
    #[inline]
    pub fn snooze(&mut self) {
        self.spins += 1;

        if self.spins <= 64 {
            std::hint::spin_loop();
        } else if self.spins <= 1024 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(std::time::Duration::from_micros(10));
        }
    }
}

// ============================================================================
//  NodeVersion
// ============================================================================

/// A versioned lock for tree nodes.
///
/// # Layout
/// Bits 61-63: `type_tag` | Bits 2-60: `version` | Bit 1: `locked` | Bit 0: `obsolete`
///
/// # Example
///
/// ```rust
/// use nvart::nodeversion::NodeVersion;
///
/// let v = NodeVersion::new(3);
/// assert_eq!(v.type_tag(), 3);
/// assert!(!v.is_locked());
///
/// let stamp = v.stable().unwrap();
/// {
///     let _guard = v.upgrade(stamp).unwrap();
/// }
/// assert!(!v.validate(stamp));
/// ```
#[derive(Debug)]
#[repr(transparent)]
pub struct NodeVersion {
    value: AtomicU64,
}

// ============================================================================
//  LockGuard
// ============================================================================

/// Proof that a node's write lock is held.
///
/// Only [`NodeVersion::lock`], [`NodeVersion::upgrade`] and
/// [`NodeVersion::try_lock`] construct it. Dropping the guard bumps the
/// version counter and clears the lock bit; after [`LockGuard::mark_obsolete`]
/// it also sets the obsolete bit. Release happens during unwinding too.
///
/// Guards are `!Send` and `!Sync` via `PhantomData<*mut ()>`.
#[derive(Debug)]
#[must_use = "releasing a lock without using the guard is a logic error"]
pub struct LockGuard<'a> {
    version: &'a NodeVersion,
    locked_value: u64,
    obsolete: bool,

    _marker: PhantomData<*mut ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // +2 clears LOCK_BIT and carries one into the version counter.
        // +3 additionally sets OBSOLETE_BIT (clear while locked).
        let add: u64 = if self.obsolete {
            LOCK_BIT | OBSOLETE_BIT
        } else {
            LOCK_BIT
        };
        let bumped: u64 = self.locked_value.wrapping_add(add);
        let new_value: u64 = (bumped & !TYPE_MASK) | (self.locked_value & TYPE_MASK);

        self.version.value.store(new_value, Ordering::Release);
    }
}

impl LockGuard<'_> {
    /// Get the locked version value.
    #[inline]
    #[must_use]
    pub const fn locked_value(&self) -> u64 {
        self.locked_value
    }

    /// Release as obsolete: readers holding any earlier version will fail
    /// validation and new lock attempts fail.
    #[inline]
    pub fn mark_obsolete(&mut self) {
        self.obsolete = true;
    }
}

impl NodeVersion {
    /// Create a version word for a fresh node of the given type.
    #[must_use]
    pub const fn new(type_tag: u8) -> Self {
        Self {
            value: AtomicU64::new(Self::initial(type_tag)),
        }
    }

    /// Create a node version from a raw value.
    ///
    ///  WARN: ONLY FOR TESTING.
    #[must_use]
    pub const fn from_value(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    #[inline]
    const fn initial(type_tag: u8) -> u64 {
        ((type_tag as u64) << TYPE_SHIFT) & TYPE_MASK
    }

    /// Initialize the word of a node built in freshly allocated memory.
    #[inline]
    pub fn init(&self, type_tag: u8) {
        self.value.store(Self::initial(type_tag), Ordering::Release);
    }

    /// Clear lock and obsolete state and restart the counter.
    ///
    /// Used by recovery: a crash can leave lock bits set in the durable image.
    #[inline]
    pub fn reset(&self) {
        let tag: u64 = self.value.load(Ordering::Relaxed) & TYPE_MASK;
        self.value.store(tag, Ordering::Release);
    }

    // ========================================================================
    //  Flag Accessors
    // ========================================================================

    /// The node type tag (bits 61-63).
    #[inline]
    #[must_use]
    pub fn type_tag(&self) -> u8 {
        ((self.value.load(Ordering::Relaxed) & TYPE_MASK) >> TYPE_SHIFT) as u8
    }

    /// Check if a writer holds the node.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        (self.value.load(Ordering::Relaxed) & LOCK_BIT) != 0
    }

    /// Check if the node has been released as obsolete.
    #[inline]
    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        (self.value.load(Ordering::Relaxed) & OBSOLETE_BIT) != 0
    }

    /// Get the raw word without blocking.
    #[inline]
    #[must_use]
    pub fn read_version(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    // ========================================================================
    //  Optimistic Reads
    // ========================================================================

    /// Start an optimistic read.
    ///
    /// Spins while the node is locked.
    ///
    /// # Returns
    /// `None` if the node is obsolete, otherwise an unlocked version to pass
    /// to [`validate`](Self::validate) or [`upgrade`](Self::upgrade).
    #[inline]
    #[must_use]
    pub fn stable(&self) -> Option<u64> {
        let mut backoff = Backoff::new();

        loop {
            let value: u64 = self.value.load(Ordering::Acquire);

            if value & OBSOLETE_BIT != 0 {
                return None;
            }
            if value & LOCK_BIT == 0 {
                return Some(value);
            }

            backoff.snooze();
        }
    }

    /// Finish an optimistic read: true if nothing changed since `old`.
    ///
    /// The acquire fence orders every preceding data load before the version
    /// re-read.
    #[inline]
    #[must_use]
    pub fn validate(&self, old: u64) -> bool {
        fence(Ordering::Acquire);
        self.value.load(Ordering::Relaxed) == old
    }

    // ========================================================================
    //  Lock Operations
    // ========================================================================

    /// Acquire the write lock, spinning while another writer holds it.
    ///
    /// Leaves the version counter unchanged until release.
    ///
    /// # Returns
    /// `None` if the node is (or becomes) obsolete.
    #[must_use]
    pub fn lock(&self) -> Option<LockGuard<'_>> {
        let mut backoff = Backoff::new();

        loop {
            let value: u64 = self.value.load(Ordering::Relaxed);

            if value & OBSOLETE_BIT != 0 {
                return None;
            }
            if value & LOCK_BIT != 0 {
                backoff.snooze();
                continue;
            }

            if let Some(guard) = self.upgrade(value) {
                return Some(guard);
            }
        }
    }

    /// Turn an optimistic version into a write lock.
    ///
    /// # Returns
    /// `None` if the word differs from `version` (another writer, a version
    /// bump, or obsolescence).
    #[inline]
    #[must_use]
    pub fn upgrade(&self, version: u64) -> Option<LockGuard<'_>> {
        if version & (LOCK_BIT | OBSOLETE_BIT) != 0 {
            return None;
        }

        let locked: u64 = version | LOCK_BIT;

        self.value
            .compare_exchange(version, locked, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| LockGuard {
                version: self,
                locked_value: locked,
                obsolete: false,
                _marker: PhantomData,
            })
    }

    /// Try to acquire the lock without blocking.
    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        self.upgrade(self.value.load(Ordering::Relaxed))
    }
}
