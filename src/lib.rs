//! # nvart
//!
//! A concurrent, crash-consistent Adaptive Radix Tree for persistent memory.
//!
//! Keys and values are byte strings. The tree lives in a memory-mapped pool
//! file and survives process crashes: every mutation is ordered so that the
//! durable image is always either the state before or the state after it.
//!
//! | Feature | How |
//! |---------|-----|
//! | Lookups | lock-free, version-validated descent |
//! | Writes | optimistic lock coupling, one node locked per change |
//! | Leaves | LeafArrays of 64 fingerprinted leaves, linked in key order |
//! | Range scans | tree descent at the edges, leaf-list walk in between |
//! | Memory reclamation | epoch-based, retired blocks return to the pool |
//! | Crash recovery | one walk on reopen: locks, prefixes, links, free lists |
//!
//! ## Thread Safety
//!
//! `ArtTree` is `Send + Sync`. The plain methods pin an epoch per call; for
//! batches, register a handle once per thread and use the `*_with_guard`
//! forms:
//!
//! ```rust
//! use nvart::{ArtConfig, ArtTree};
//!
//! let tree = ArtTree::create(ArtConfig::in_memory(8 << 20)).unwrap();
//! let handle = tree.handle();
//! let guard = handle.pin();
//!
//! tree.insert_with_guard(b"key", b"value", &guard).unwrap();
//! assert!(tree.lookup_with_guard(b"key", &guard).is_some());
//! ```
//!
//! ## Key Ordering
//!
//! Keys are compared bytewise. Internally they are routed as if padded with
//! zero bytes, so `b"ab"` and `b"ab\0"` share a LeafArray and are told apart
//! by the full-key compare.
//!
//! ## Persistence
//!
//! ```rust,no_run
//! use nvart::{ArtConfig, ArtTree};
//!
//! let config = ArtConfig::persistent("/mnt/pmem/index.pool", 1 << 30);
//! let tree = ArtTree::open_or_create(config)?;
//! tree.insert(b"k", b"v")?;
//! # Ok::<(), nvart::ArtError>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::inline_always)]

pub mod config;
pub mod epoch;
pub mod error;
pub mod index;
pub mod key;
pub mod node;
pub mod nodeversion;
pub mod persist;
pub mod pool;
pub mod tree;

mod tracing_helpers;

// Re-export main types for convenience
pub use config::{ArtConfig, EpochConfig, PoolConfig};
pub use error::{ArtError, PoolError};
pub use index::{LockedBTreeMap, OrderedIndex};
pub use pool::{PAddr, PmemPool, UsedExtents};
pub use tree::{
    ArtGuard, ArtHandle, ArtTree, InsertOutcome, RecoveryStats, RemoveOutcome, ScanResult,
    TreeStats, UpdateOutcome,
};
