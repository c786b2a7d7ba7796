//! Error types.
//!
//! Only failures that the caller can act on surface here. Concurrency
//! conflicts restart internally and never leave the tree; "key exists" and
//! "key not found" are ordinary outcome values, not errors.

use thiserror::Error;

use crate::pool::PAddr;

/// Result type alias using [`ArtError`].
pub type Result<T> = std::result::Result<T, ArtError>;

/// Errors raised by the persistent pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Underlying file or mapping failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but does not carry the pool magic number.
    #[error("bad pool magic: expected {expected:#x}, found {found:#x}")]
    BadMagic {
        /// Magic this build writes.
        expected: u64,
        /// Magic found in the header.
        found: u64,
    },

    /// The file was written with an incompatible layout.
    #[error("pool layout mismatch: {reason}")]
    LayoutMismatch {
        /// What did not match.
        reason: String,
    },

    /// Requested pool size cannot hold a header and at least one chunk.
    #[error("pool size {size} too small (minimum {minimum})")]
    PoolTooSmall {
        /// Requested size in bytes.
        size: usize,
        /// Smallest usable size in bytes.
        minimum: usize,
    },

    /// Every chunk is assigned and the size class has no free block.
    #[error("out of persistent memory for a {size}-byte block")]
    OutOfSpace {
        /// Size of the failed request.
        size: usize,
    },

    /// Request exceeds the largest size class.
    #[error("allocation of {size} bytes exceeds the largest block ({max})")]
    RequestTooLarge {
        /// Size of the failed request.
        size: usize,
        /// Largest block the pool hands out.
        max: usize,
    },

    /// Address does not belong to an assigned chunk.
    #[error("address {0:?} is not a pool block")]
    InvalidAddress(PAddr),
}

/// Errors raised by tree operations.
#[derive(Debug, Error)]
pub enum ArtError {
    /// Pool failure (fatal for the caller when it is `OutOfSpace`).
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Key and value do not fit into a single leaf block.
    #[error("record too large: key {key_len} bytes, value {value_len} bytes (limit {limit})")]
    RecordTooLarge {
        /// Key length in bytes.
        key_len: usize,
        /// Value length in bytes.
        value_len: usize,
        /// Maximum combined payload.
        limit: usize,
    },

    /// A full LeafArray holds keys that differ only in trailing zero bytes,
    /// so no branch byte can separate them.
    #[error("leaf array overflow: keys cannot be separated at depth >= {depth}")]
    LeafArrayOverflow {
        /// First depth that was tried.
        depth: usize,
    },
}
