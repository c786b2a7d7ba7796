//! Shared test harness: tracing subscriber and tree fixtures.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     let tree = common::memory_tree(16 << 20);
//!     // ... test code with tracing::info!, tracing::debug!, etc.
//!     common::assert_healthy(&tree);
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Filter directives (e.g., `nvart=debug,nvart::tree::structural=trace`)
//! - `NVART_LOG_DIR`: Log directory (default: `logs/`)
//! - `NVART_LOG_CONSOLE`: Set to "0" to disable console output
//!
//! # Log Files
//!
//! Logs are written to `logs/nvart.jsonl` as newline-delimited JSON (NDJSON).
//! Use `jq` for pretty-printing and filtering:
//!
//! ```bash
//! # Pretty-print all logs
//! cat logs/nvart.jsonl | jq .
//!
//! # Convert to JSON array
//! cat logs/nvart.jsonl | jq -s .
//!
//! # Find events for a specific key
//! cat logs/nvart.jsonl | jq 'select(.fields.message == "leaf array split")'
//!
//! # Show only errors
//! cat logs/nvart.jsonl | jq 'select(.level == "ERROR")'
//! ```

#![allow(dead_code)]

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Once;

use nvart::{ArtConfig, ArtTree};
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with file and console logging.
///
/// Safe to call multiple times - only the first call takes effect.
/// Logs are written to `logs/nvart.jsonl` in JSON format.
pub fn init_tracing() {
    INIT.call_once(|| {
        setup_tracing();
    });
}

/// Configuration for tracing setup.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// Log file name.
    pub log_file: String,
    /// Enable console output.
    pub console_enabled: bool,
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file: "nvart.jsonl".to_string(),
            console_enabled: true,
            default_level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("NVART_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if env::var("NVART_LOG_CONSOLE").is_ok_and(|v| v == "0") {
            config.console_enabled = false;
        }

        config
    }
}

/// Create an EnvFilter from RUST_LOG or use default level.
fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let config = TracingConfig::from_env();

    // Create log directory
    std::fs::create_dir_all(&config.log_dir).expect("Failed to create log directory");

    let log_path = config.log_dir.join(&config.log_file);

    // Open file in append mode (nextest runs tests in separate processes)
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .expect("Failed to open log file");

    // === Console Layer ===
    let console_layer = if config.console_enabled {
        Some(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_ansi(true)
                .compact()
                .with_filter(make_filter(config.default_level)),
        )
    } else {
        None
    };

    // === File Layer (NDJSON format) ===
    // Writes one JSON object per line. Use `jq` for pretty-printing.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .with_filter(make_filter(config.default_level));

    // Compose and install subscriber (use try_init to avoid panic if lib already set one)
    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

// ============================================================================
//  Tree fixtures
// ============================================================================

/// Volatile tree for tests that never reopen.
pub fn memory_tree(size_bytes: usize) -> ArtTree {
    ArtTree::create(ArtConfig::in_memory(size_bytes)).expect("create in-memory tree")
}

/// Config for a pool file inside `dir`.
pub fn file_config(dir: &TempDir, size_bytes: usize) -> ArtConfig {
    ArtConfig::persistent(dir.path().join("tree.pool"), size_bytes)
}

/// Write a durable image to a fresh file and open a tree on it (running
/// recovery). The directory must outlive the tree.
pub fn reopen_image(image: &[u8]) -> (TempDir, ArtTree) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("crashed.pool");
    std::fs::write(&path, image).expect("write crash image");

    let tree = ArtTree::open(ArtConfig::persistent(path, image.len())).expect("reopen crash image");
    (dir, tree)
}

/// Every live record, in key order.
pub fn dump(tree: &ArtTree) -> Vec<(Vec<u8>, Vec<u8>)> {
    tree.scan(b"", &[0xff; 64], usize::MAX).entries
}

/// Panic with the violation list if the tree is malformed.
pub fn assert_healthy(tree: &ArtTree) {
    let stats = tree.verify();
    assert!(stats.violations.is_empty(), "tree violations: {:#?}", stats.violations);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_init() {
        init_tracing();
        tracing::info!("Tracing initialized successfully");
        tracing::debug!(key = "test_key", value = 42, "Debug event");
        tracing::trace!(thread = ?std::thread::current().id(), "Trace event");
    }
}
