//! Persistent memory pool.
//!
//! A memory-mapped region (file-backed, or anonymous for volatile trees)
//! carved into fixed-size chunks, each chunk serving one block size class.
//! Blocks are addressed by [`PAddr`], a byte offset from the start of the
//! mapping, so addresses stay valid across remaps.
//!
//! # Layout
//!
//! ```text
//! 0        PoolHeader (magic, geometry, root, list head, thread counter)
//! 128      chunk class table: one byte per chunk, 0 = unassigned
//! 4096*k   data area: chunk_count chunks of CHUNK_SIZE bytes
//! ```
//!
//! Only the header and the class table are durable allocator state. Free
//! lists are transient: after a restart the tree walks itself, reports every
//! reachable block to an [`ExtentSink`], and [`PmemPool::rebuild_free_lists`]
//! turns everything else back into free space. A crash can therefore leak
//! nothing and double-allocate nothing.
//!
//! # Crash simulation
//!
//! With [`PoolConfig::crash_simulation`] the pool keeps a shadow copy of the
//! mapping that only [`PmemPool::persist`] updates. The shadow is what a
//! power failure would leave behind. [`PmemPool::arm_crash_point`] captures
//! it right after the N-th persist. Crash simulation is meant for
//! single-writer tests: the shadow copy reads bytes other threads may be
//! writing.

use std::collections::HashSet;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::persist::{self, line_end, line_start};
use crate::tracing_helpers::{debug_log, info_log};

// ============================================================================
//  Constants
// ============================================================================

/// Pool magic: "NVART_V1".
pub const POOL_MAGIC: u64 = 0x4e56_4152_545f_5631;

/// Persisted layout version.
pub const LAYOUT_VERSION: u64 = 1;

/// Bytes per chunk.
pub const CHUNK_SIZE: usize = 256 << 10;

/// Block size classes.
pub const SIZE_CLASSES: [usize; 9] = [64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384];

/// Largest block the pool hands out.
pub const MAX_BLOCK: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

const NUM_CLASSES: usize = SIZE_CLASSES.len();

/// Bytes reserved for [`PoolHeader`]; the class table follows.
const HEADER_FIXED: usize = 128;

const PAGE_SIZE: usize = 4096;

// ============================================================================
//  PAddr
// ============================================================================

/// Offset of a block inside the pool. `0` (inside the header) is null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PAddr(u64);

impl PAddr {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Wrap a raw pool offset.
    #[inline(always)]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Raw pool offset.
    #[inline(always)]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// True for [`PAddr::NULL`].
    #[inline(always)]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "PAddr(null)")
        } else {
            write!(f, "PAddr({:#x})", self.0)
        }
    }
}

// ============================================================================
//  Extent reporting
// ============================================================================

/// Receives the blocks a recovery walk finds reachable.
pub trait ExtentSink {
    /// Record one used block and its payload length.
    fn record(&mut self, addr: PAddr, len: usize);
}

/// The set of used blocks, fed to [`PmemPool::rebuild_free_lists`].
#[derive(Debug, Default)]
pub struct UsedExtents {
    blocks: HashSet<PAddr>,
    bytes: usize,
}

impl UsedExtents {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `addr` was recorded.
    #[must_use]
    pub fn contains(&self, addr: PAddr) -> bool {
        self.blocks.contains(&addr)
    }

    /// Number of recorded blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Sum of recorded payload lengths.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}

impl ExtentSink for UsedExtents {
    fn record(&mut self, addr: PAddr, len: usize) {
        if self.blocks.insert(addr) {
            self.bytes += len;
        }
    }
}

// ============================================================================
//  Header
// ============================================================================

#[repr(C)]
struct PoolHeader {
    magic: AtomicU64,
    layout_version: AtomicU64,
    pool_size: AtomicU64,
    chunk_size: AtomicU64,
    chunk_count: AtomicU64,
    data_offset: AtomicU64,
    root: AtomicU64,
    list_head: AtomicU64,
    registered_threads: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() <= HEADER_FIXED);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    pool_size: usize,
    chunk_count: usize,
    data_offset: usize,
}

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Smallest pool that holds a header page and one chunk.
pub const MIN_POOL_SIZE: usize = align_up(HEADER_FIXED + 1, PAGE_SIZE) + CHUNK_SIZE;

fn geometry(pool_size: usize) -> Result<Geometry, PoolError> {
    let too_small = PoolError::PoolTooSmall {
        size: pool_size,
        minimum: MIN_POOL_SIZE,
    };

    let mut chunk_count: usize = pool_size.saturating_sub(PAGE_SIZE) / CHUNK_SIZE;
    loop {
        if chunk_count == 0 {
            return Err(too_small);
        }
        let data_offset: usize = align_up(HEADER_FIXED + chunk_count, PAGE_SIZE);
        if data_offset + chunk_count * CHUNK_SIZE <= pool_size {
            return Ok(Geometry {
                pool_size,
                chunk_count,
                data_offset,
            });
        }
        chunk_count -= 1;
    }
}

fn class_for(size: usize) -> Result<usize, PoolError> {
    SIZE_CLASSES
        .iter()
        .position(|&class| class >= size)
        .ok_or(PoolError::RequestTooLarge {
            size,
            max: MAX_BLOCK,
        })
}

// ============================================================================
//  Allocator state
// ============================================================================

#[derive(Debug)]
struct AllocState {
    /// Per-class free blocks; popped from the back.
    free: [Vec<PAddr>; NUM_CLASSES],
    /// Unassigned chunk indices, highest first so the lowest pops first.
    unassigned: Vec<usize>,
    live_blocks: usize,
}

impl AllocState {
    fn empty() -> Self {
        Self {
            free: Default::default(),
            unassigned: Vec::new(),
            live_blocks: 0,
        }
    }
}

/// Allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Chunks in the data area.
    pub chunk_count: usize,
    /// Chunks serving a size class.
    pub chunks_assigned: usize,
    /// Blocks handed out and not freed.
    pub live_blocks: usize,
    /// Blocks on the free lists.
    pub free_blocks: usize,
}

#[derive(Debug)]
struct CrashSim {
    shadow: Mutex<Vec<u8>>,
    flushes: AtomicUsize,
    crash_at: AtomicUsize,
    captured: Mutex<Option<Vec<u8>>>,
}

// ============================================================================
//  PmemPool
// ============================================================================

/// The persistent pool.
pub struct PmemPool {
    mmap: MmapMut,
    base: *mut u8,
    geometry: Geometry,
    path: Option<PathBuf>,
    state: Mutex<AllocState>,
    crash: Option<CrashSim>,
}

// SAFETY: `base` points into `mmap`, which the pool owns for its whole
// lifetime. Shared mutation goes through atomics in the mapped structures or
// through the `state` mutex.
unsafe impl Send for PmemPool {}
// SAFETY: see `Send`.
unsafe impl Sync for PmemPool {}

impl fmt::Debug for PmemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmemPool")
            .field("path", &self.path)
            .field("geometry", &self.geometry)
            .field("crash_simulation", &self.crash.is_some())
            .finish_non_exhaustive()
    }
}

impl PmemPool {
    /// Create a fresh pool, truncating any existing backing file.
    ///
    /// # Errors
    /// [`PoolError::PoolTooSmall`] for an unusable size, [`PoolError::Io`] for
    /// file or mapping failures.
    pub fn create(config: &PoolConfig) -> Result<Self, PoolError> {
        let geometry: Geometry = geometry(config.size_bytes)?;

        let mmap: MmapMut = match &config.path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                file.set_len(geometry.pool_size as u64)?;
                // SAFETY: the file is owned by this pool for the mapping's
                // lifetime; concurrent external modification is unsupported.
                unsafe { MmapMut::map_mut(&file)? }
            }
            None => MmapMut::map_anon(geometry.pool_size)?,
        };

        let mut pool = Self::from_mapping(mmap, geometry, config.path.clone());
        pool.state.get_mut().unassigned = (0..geometry.chunk_count).rev().collect();

        let header: &PoolHeader = pool.header();
        header
            .layout_version
            .store(LAYOUT_VERSION, Ordering::Relaxed);
        header
            .pool_size
            .store(geometry.pool_size as u64, Ordering::Relaxed);
        header
            .chunk_size
            .store(CHUNK_SIZE as u64, Ordering::Relaxed);
        header
            .chunk_count
            .store(geometry.chunk_count as u64, Ordering::Relaxed);
        header
            .data_offset
            .store(geometry.data_offset as u64, Ordering::Relaxed);
        pool.persist_header();

        // Magic last: a torn create is not mistaken for a pool.
        pool.header().magic.store(POOL_MAGIC, Ordering::Release);
        pool.persist_header();
        pool.sync()?;

        if config.crash_simulation {
            pool.enable_crash_simulation();
        }

        info_log!(
            path = ?config.path,
            size = geometry.pool_size,
            chunks = geometry.chunk_count,
            "pool created"
        );

        Ok(pool)
    }

    /// Open an existing file-backed pool.
    ///
    /// Free lists start empty; call [`rebuild_free_lists`](Self::rebuild_free_lists)
    /// with the reachable blocks before allocating.
    ///
    /// # Errors
    /// [`PoolError::BadMagic`] / [`PoolError::LayoutMismatch`] for a file that
    /// is not a compatible pool, [`PoolError::Io`] otherwise.
    pub fn open(config: &PoolConfig) -> Result<Self, PoolError> {
        let path: &Path = config
            .path
            .as_deref()
            .ok_or_else(|| PoolError::LayoutMismatch {
                reason: "an anonymous pool cannot be reopened".to_string(),
            })?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = usize::try_from(file.metadata()?.len()).map_err(|_| {
            PoolError::LayoutMismatch {
                reason: "file larger than the address space".to_string(),
            }
        })?;
        let geometry: Geometry = geometry(file_len)?;

        // SAFETY: see `create`.
        let mmap: MmapMut = unsafe { MmapMut::map_mut(&file)? };
        let mut pool = Self::from_mapping(mmap, geometry, Some(path.to_path_buf()));

        pool.validate_header()?;

        // Unassigned chunks come from the table; free blocks come later from
        // the recovery walk.
        let unassigned: Vec<usize> = (0..geometry.chunk_count)
            .rev()
            .filter(|&chunk| pool.chunk_class(chunk).is_none())
            .collect();
        pool.state.get_mut().unassigned = unassigned;

        if config.crash_simulation {
            pool.enable_crash_simulation();
        }

        info_log!(path = ?path, size = geometry.pool_size, "pool opened");

        Ok(pool)
    }

    fn from_mapping(mut mmap: MmapMut, geometry: Geometry, path: Option<PathBuf>) -> Self {
        let base: *mut u8 = mmap.as_mut_ptr();
        Self {
            mmap,
            base,
            geometry,
            path,
            state: Mutex::new(AllocState::empty()),
            crash: None,
        }
    }

    fn validate_header(&self) -> Result<(), PoolError> {
        let header: &PoolHeader = self.header();

        let found: u64 = header.magic.load(Ordering::Acquire);
        if found != POOL_MAGIC {
            return Err(PoolError::BadMagic {
                expected: POOL_MAGIC,
                found,
            });
        }

        let mismatch = |what: &str, stored: u64, expected: u64| PoolError::LayoutMismatch {
            reason: format!("{what}: stored {stored}, expected {expected}"),
        };

        let checks: [(&str, &AtomicU64, u64); 5] = [
            ("layout version", &header.layout_version, LAYOUT_VERSION),
            ("pool size", &header.pool_size, self.geometry.pool_size as u64),
            ("chunk size", &header.chunk_size, CHUNK_SIZE as u64),
            ("chunk count", &header.chunk_count, self.geometry.chunk_count as u64),
            ("data offset", &header.data_offset, self.geometry.data_offset as u64),
        ];
        for (what, field, expected) in checks {
            let stored: u64 = field.load(Ordering::Relaxed);
            if stored != expected {
                return Err(mismatch(what, stored, expected));
            }
        }

        Ok(())
    }

    fn enable_crash_simulation(&mut self) {
        // SAFETY: the whole mapping is valid for reads.
        let image: Vec<u8> =
            unsafe { std::slice::from_raw_parts(self.base, self.geometry.pool_size) }.to_vec();

        self.crash = Some(CrashSim {
            shadow: Mutex::new(image),
            flushes: AtomicUsize::new(0),
            crash_at: AtomicUsize::new(0),
            captured: Mutex::new(None),
        });
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    #[inline]
    fn header(&self) -> &PoolHeader {
        // SAFETY: the mapping is at least one page, page-aligned, and the
        // header is all atomics.
        unsafe { &*self.base.cast::<PoolHeader>() }
    }

    /// Total mapped bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.geometry.pool_size
    }

    /// True for file-backed pools.
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Raw pointer to the block at `addr`.
    #[inline(always)]
    #[must_use]
    pub fn ptr(&self, addr: PAddr) -> *mut u8 {
        debug_assert!(!addr.is_null());
        debug_assert!((addr.get() as usize) < self.geometry.pool_size);
        // SAFETY: offset is inside the mapping (checked in debug builds).
        unsafe { self.base.add(addr.get() as usize) }
    }

    /// Typed view of the block at `addr`.
    ///
    /// # Safety
    /// `addr` must be a live block at least `size_of::<T>()` bytes long,
    /// suitably aligned, whose shared fields are atomics.
    #[inline(always)]
    #[must_use]
    pub unsafe fn get<T>(&self, addr: PAddr) -> &T {
        // SAFETY: forwarded to the caller.
        unsafe { &*self.ptr(addr).cast::<T>() }
    }

    /// Durable root node offset (null before the tree is initialized).
    #[must_use]
    pub fn root(&self) -> PAddr {
        PAddr(self.header().root.load(Ordering::Acquire))
    }

    /// Durable LeafArray list head offset.
    #[must_use]
    pub fn list_head(&self) -> PAddr {
        PAddr(self.header().list_head.load(Ordering::Acquire))
    }

    /// Record the root and list head in the header, then persist.
    pub fn set_roots(&self, root: PAddr, list_head: PAddr) {
        let header: &PoolHeader = self.header();
        header.list_head.store(list_head.get(), Ordering::Release);
        header.root.store(root.get(), Ordering::Release);
        self.persist_header();
    }

    /// Register a thread with the pool. Returns its durable id.
    pub fn register_thread(&self) -> u64 {
        let id: u64 = self
            .header()
            .registered_threads
            .fetch_add(1, Ordering::AcqRel);
        self.persist_header();
        id
    }

    /// Number of threads ever registered with this pool.
    #[must_use]
    pub fn registered_threads(&self) -> u64 {
        self.header().registered_threads.load(Ordering::Acquire)
    }

    // ========================================================================
    //  Persistence
    // ========================================================================

    /// Flush `[ptr, ptr + len)` and fence.
    ///
    /// `ptr` must point into this pool's mapping.
    #[inline]
    pub fn persist(&self, ptr: *const u8, len: usize) {
        // SAFETY: callers only pass ranges inside the mapping.
        unsafe { persist::persist_range(ptr, len) };

        if let Some(sim) = &self.crash {
            self.shadow_copy(sim, ptr, len);
        }
    }

    /// Persist `len` bytes of the block at `addr`.
    #[inline]
    pub fn persist_addr(&self, addr: PAddr, len: usize) {
        self.persist(self.ptr(addr), len);
    }

    /// Persist one mapped value.
    #[inline]
    pub fn persist_val<T>(&self, value: &T) {
        self.persist(ptr::from_ref(value).cast::<u8>(), std::mem::size_of::<T>());
    }

    fn persist_header(&self) {
        self.persist(self.base, HEADER_FIXED);
    }

    fn shadow_copy(&self, sim: &CrashSim, ptr: *const u8, len: usize) {
        let offset: usize = ptr as usize - self.base as usize;
        let start: usize = line_start(offset);
        let end: usize = line_end(offset + len).min(self.geometry.pool_size);

        let mut shadow = sim.shadow.lock();
        // SAFETY: `start..end` lies inside the mapping and inside the shadow
        // (same length); the two buffers never overlap.
        unsafe {
            ptr::copy_nonoverlapping(
                self.base.add(start),
                shadow.as_mut_ptr().add(start),
                end - start,
            );
        }

        let n: usize = sim.flushes.fetch_add(1, Ordering::AcqRel) + 1;
        if n == sim.crash_at.load(Ordering::Acquire) {
            *sim.captured.lock() = Some(shadow.clone());
            debug_log!(flush = n, "crash point reached");
        }
    }

    /// Capture the durable image right after the `n`-th persist from now.
    ///
    /// No-op unless crash simulation is enabled.
    pub fn arm_crash_point(&self, n: usize) {
        if let Some(sim) = &self.crash {
            *sim.captured.lock() = None;
            let now: usize = sim.flushes.load(Ordering::Acquire);
            sim.crash_at.store(now + n, Ordering::Release);
        }
    }

    /// Take the image captured at the armed crash point, if it was reached.
    #[must_use]
    pub fn take_crash_image(&self) -> Option<Vec<u8>> {
        self.crash.as_ref().and_then(|sim| sim.captured.lock().take())
    }

    /// Current durable image (what a crash right now would leave).
    #[must_use]
    pub fn durable_image(&self) -> Option<Vec<u8>> {
        self.crash.as_ref().map(|sim| sim.shadow.lock().clone())
    }

    /// Number of persists since crash simulation started.
    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.crash
            .as_ref()
            .map_or(0, |sim| sim.flushes.load(Ordering::Acquire))
    }

    /// msync the mapping (file-backed pools only).
    ///
    /// # Errors
    /// [`PoolError::Io`] if the kernel rejects the flush.
    pub fn sync(&self) -> Result<(), PoolError> {
        if self.is_persistent() {
            self.mmap.flush()?;
        }
        Ok(())
    }

    // ========================================================================
    //  Allocation
    // ========================================================================

    #[inline]
    fn table_entry(&self, chunk: usize) -> *mut u8 {
        debug_assert!(chunk < self.geometry.chunk_count);
        // SAFETY: the table spans `chunk_count` bytes after the header.
        unsafe { self.base.add(HEADER_FIXED + chunk) }
    }

    fn chunk_class(&self, chunk: usize) -> Option<usize> {
        // SAFETY: in-bounds table byte; written only under `state`.
        let raw: u8 = unsafe { self.table_entry(chunk).read() };
        match raw as usize {
            0 => None,
            c if c <= NUM_CLASSES => Some(c - 1),
            // A garbage byte means the chunk never finished assignment.
            _ => None,
        }
    }

    fn set_chunk_class(&self, chunk: usize, class: Option<usize>) {
        let raw: u8 = class.map_or(0, |c| (c + 1) as u8);
        let entry: *mut u8 = self.table_entry(chunk);
        // SAFETY: in-bounds table byte; caller holds `state`.
        unsafe { entry.write(raw) };
        self.persist(entry, 1);
    }

    #[inline]
    fn chunk_start(&self, chunk: usize) -> u64 {
        (self.geometry.data_offset + chunk * CHUNK_SIZE) as u64
    }

    /// Allocate a zeroed block of at least `size` bytes.
    ///
    /// # Errors
    /// [`PoolError::RequestTooLarge`] above [`MAX_BLOCK`],
    /// [`PoolError::OutOfSpace`] when no chunk is left.
    pub fn alloc(&self, size: usize) -> Result<PAddr, PoolError> {
        let class: usize = class_for(size)?;
        let block: usize = SIZE_CLASSES[class];

        let addr: PAddr = {
            let mut state = self.state.lock();

            if state.free[class].is_empty() {
                let chunk: usize = state
                    .unassigned
                    .pop()
                    .ok_or(PoolError::OutOfSpace { size })?;
                self.set_chunk_class(chunk, Some(class));

                let start: u64 = self.chunk_start(chunk);
                let blocks: usize = CHUNK_SIZE / block;
                state.free[class].extend(
                    (0..blocks)
                        .rev()
                        .map(|i| PAddr(start + (i * block) as u64)),
                );

                debug_log!(chunk, class_size = block, "chunk assigned");
            }

            let addr: PAddr = state.free[class]
                .pop()
                .ok_or(PoolError::OutOfSpace { size })?;
            state.live_blocks += 1;
            addr
        };

        // SAFETY: the block is ours until published; nobody else reads it.
        unsafe { ptr::write_bytes(self.ptr(addr), 0, block) };

        Ok(addr)
    }

    /// Return a block to its size-class free list (transient).
    ///
    /// # Errors
    /// [`PoolError::InvalidAddress`] if `addr` is not a block boundary inside
    /// an assigned chunk.
    pub fn free(&self, addr: PAddr) -> Result<(), PoolError> {
        let (_, class) = self.locate(addr)?;

        let mut state = self.state.lock();
        state.free[class].push(addr);
        state.live_blocks = state.live_blocks.saturating_sub(1);
        Ok(())
    }

    /// Usable size of the block at `addr`.
    ///
    /// # Errors
    /// [`PoolError::InvalidAddress`] as for [`free`](Self::free).
    pub fn block_size(&self, addr: PAddr) -> Result<usize, PoolError> {
        self.locate(addr).map(|(_, class)| SIZE_CLASSES[class])
    }

    fn locate(&self, addr: PAddr) -> Result<(usize, usize), PoolError> {
        let offset: usize = addr.get() as usize;
        let data_offset: usize = self.geometry.data_offset;
        let data_end: usize = data_offset + self.geometry.chunk_count * CHUNK_SIZE;

        if offset < data_offset || offset >= data_end {
            return Err(PoolError::InvalidAddress(addr));
        }

        let chunk: usize = (offset - data_offset) / CHUNK_SIZE;
        let class: usize = self
            .chunk_class(chunk)
            .ok_or(PoolError::InvalidAddress(addr))?;

        if (offset - data_offset) % SIZE_CLASSES[class] != 0 {
            return Err(PoolError::InvalidAddress(addr));
        }

        Ok((chunk, class))
    }

    /// Rebuild transient free lists from the set of reachable blocks.
    ///
    /// Every block of an assigned chunk not in `used` becomes free. Chunks
    /// with no used block are unassigned again.
    pub fn rebuild_free_lists(&self, used: &UsedExtents) {
        let mut state = self.state.lock();
        *state = AllocState::empty();

        for chunk in (0..self.geometry.chunk_count).rev() {
            let Some(class) = self.chunk_class(chunk) else {
                state.unassigned.push(chunk);
                continue;
            };

            let block: usize = SIZE_CLASSES[class];
            let start: u64 = self.chunk_start(chunk);
            let blocks: Vec<PAddr> = (0..CHUNK_SIZE / block)
                .map(|i| PAddr(start + (i * block) as u64))
                .collect();

            let in_use: usize = blocks.iter().filter(|a| used.contains(**a)).count();
            if in_use == 0 {
                self.set_chunk_class(chunk, None);
                state.unassigned.push(chunk);
                continue;
            }

            state.live_blocks += in_use;
            state.free[class].extend(blocks.into_iter().rev().filter(|a| !used.contains(*a)));
        }

        info_log!(
            live_blocks = state.live_blocks,
            unassigned_chunks = state.unassigned.len(),
            "free lists rebuilt"
        );
    }

    /// Allocator counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            chunk_count: self.geometry.chunk_count,
            chunks_assigned: self.geometry.chunk_count - state.unassigned.len(),
            live_blocks: state.live_blocks,
            free_blocks: state.free.iter().map(Vec::len).sum(),
        }
    }
}
