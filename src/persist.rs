//! Persistence primitive: flush a byte range out of the CPU caches, then fence.
//!
//! Every durability point in the tree goes through [`persist_range`] (usually
//! via [`PmemPool::persist`](crate::pool::PmemPool::persist), which also feeds
//! the crash-simulation shadow image). The function has no state.
//!
//! On `x86_64` each cache line in the range is written back with `clflush`
//! followed by a single `sfence`. Other targets fall back to a sequentially
//! consistent fence: the bytes still reach the mapping, but durability against
//! power loss then relies on `msync` ([`PmemPool::sync`](crate::pool::PmemPool::sync)).

use std::sync::atomic::{fence, Ordering};

/// Cache line size assumed by the flush loop.
pub const CACHE_LINE: usize = 64;

/// Round `addr` down to the start of its cache line.
#[inline]
#[must_use]
pub const fn line_start(addr: usize) -> usize {
    addr & !(CACHE_LINE - 1)
}

/// Round `addr` up to the next cache-line boundary.
#[inline]
#[must_use]
pub const fn line_end(addr: usize) -> usize {
    (addr + CACHE_LINE - 1) & !(CACHE_LINE - 1)
}

/// Flush `[ptr, ptr + len)` and fence.
///
/// Returns once the range has been written back. An empty range only fences.
///
/// # Safety
///
/// `ptr..ptr + len` must lie inside a single live mapping.
#[inline]
pub unsafe fn persist_range(ptr: *const u8, len: usize) {
    if len != 0 {
        let start: usize = line_start(ptr as usize);
        let end: usize = line_end(ptr as usize + len);

        let mut line: usize = start;
        while line < end {
            // SAFETY: caller guarantees the range is mapped; rounding to cache
            // lines stays within the pages that contain the range.
            unsafe { flush_line(line as *const u8) };
            line += CACHE_LINE;
        }
    }

    store_fence();
}

/// Fence only: orders earlier flushes before later stores.
#[inline]
pub fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: sfence has no memory-safety preconditions.
        unsafe { std::arch::x86_64::_mm_sfence() };
    }

    fence(Ordering::SeqCst);
}

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn flush_line(line: *const u8) {
    // SAFETY: caller guarantees `line` is inside a live mapping.
    unsafe { std::arch::x86_64::_mm_clflush(line) };
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
unsafe fn flush_line(_line: *const u8) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_rounding() {
        assert_eq!(line_start(0), 0);
        assert_eq!(line_start(63), 0);
        assert_eq!(line_start(64), 64);
        assert_eq!(line_end(1), 64);
        assert_eq!(line_end(64), 64);
        assert_eq!(line_end(65), 128);
    }

    #[test]
    fn test_persist_heap_range() {
        let buf: Vec<u8> = vec![7u8; 300];

        // SAFETY: the range is the vector's own allocation.
        unsafe { persist_range(buf.as_ptr().wrapping_add(3), 200) };
        unsafe { persist_range(buf.as_ptr(), 0) };

        assert!(buf.iter().all(|&b| b == 7));
    }
}
