//! Zero-cost logging helpers.
//!
//! With the `tracing` feature enabled these macros forward to the `tracing`
//! crate. Without it (the default) they expand to nothing, so the hot paths of
//! the tree carry no logging cost.
//!
//! ```bash
//! # Structural events (splits, grows, merges, recovery) on the console
//! RUST_LOG=nvart=debug cargo test --features tracing --test stress_tests
//!
//! # Only prefix repairs and recovery
//! RUST_LOG=nvart::tree=warn,nvart::tree::recovery=info cargo test --features tracing
//! ```

#![allow(unused_macros, unused_imports)]

/// Trace-level logging. Compiles to nothing without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level logging. Compiles to nothing without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

/// Info-level logging. Compiles to nothing without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! info_log {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! info_log {
    ($($arg:tt)*) => {};
}

/// Warn-level logging. Compiles to nothing without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_log {
    ($($arg:tt)*) => {};
}

/// Error-level logging. Compiles to nothing without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! error_log {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use error_log;
pub(crate) use info_log;
pub(crate) use trace_log;
pub(crate) use warn_log;
