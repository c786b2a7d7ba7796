//! Epoch-based memory reclamation.
//!
//! Nodes unlinked from the tree may still be read by optimistic readers that
//! reached them before the unlink. A [`Collector`] defers freeing such items
//! until every thread that could hold a reference has moved on.
//!
//! # Protocol
//!
//! - A thread [`register`](Collector::register)s once and gets a
//!   [`LocalHandle`] (`!Send`).
//! - [`LocalHandle::pin`] records the current global epoch in the thread's
//!   participant slot and returns a [`Guard`]. Pins nest; dropping the
//!   outermost guard marks the participant inactive.
//! - [`Guard::retire`] stamps an unlinked item with the global epoch and puts
//!   it in the thread's garbage bag.
//! - A sweep frees every item whose stamp is strictly below the minimum epoch
//!   of the active participants (or below the global epoch when none are
//!   active).
//!
//! The stamp is read after the item was unlinked, and a pin re-checks the
//! global epoch after publishing its own. So a participant pinned at epoch
//! `e` started after every unlink stamped below `e`, and cannot reach those
//! items.
//!
//! Sweeps run when a bag crosses [`EpochConfig::collect_threshold`] at unpin,
//! on [`LocalHandle::collect`], from the background ticker (for orphaned
//! garbage left by exited threads), and when the collector shuts down.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::EpochConfig;
use crate::tracing_helpers::{debug_log, error_log, trace_log, warn_log};

#[cfg(all(test, not(loom)))]
mod shuttle_tests;

/// Participant epoch value meaning "not pinned".
const INACTIVE: u64 = u64::MAX;

/// Function that finally releases a retired item.
pub type ReclaimFn<T> = Box<dyn Fn(T) + Send + Sync>;

// ============================================================================
//  Shared state
// ============================================================================

#[derive(Debug)]
struct Participant {
    epoch: AtomicU64,
}

#[derive(Debug)]
struct Retired<T> {
    epoch: u64,
    item: T,
}

#[derive(Debug, Default)]
struct Registry {
    /// Every participant ever created. Slots are reused, never removed.
    all: Vec<Arc<Participant>>,
    /// Participants not owned by a live handle.
    idle: Vec<Arc<Participant>>,
}

struct Shared<T> {
    epoch: AtomicU64,
    registry: Mutex<Registry>,
    orphans: Mutex<Vec<Retired<T>>>,
    reclaim: ReclaimFn<T>,
    config: EpochConfig,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl<T> Shared<T> {
    /// Smallest epoch an item must be stamped below to be freed.
    fn safe_epoch(&self) -> u64 {
        let global: u64 = self.epoch.load(Ordering::SeqCst);
        let registry = self.registry.lock();

        registry
            .all
            .iter()
            .map(|p| p.epoch.load(Ordering::SeqCst))
            .filter(|&e| e != INACTIVE)
            .min()
            .map_or(global, |min| min.min(global))
    }

    fn advance(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Free what is safe in `bag`, keep the rest. Returns the freed count.
    fn sweep(&self, bag: &mut Vec<Retired<T>>) -> usize {
        if bag.is_empty() {
            return 0;
        }

        let safe: u64 = self.safe_epoch();
        let before: usize = bag.len();

        let (ready, keep): (Vec<_>, Vec<_>) = bag.drain(..).partition(|r| r.epoch < safe);
        *bag = keep;
        for retired in ready {
            (self.reclaim)(retired.item);
        }

        before - bag.len()
    }

    fn sweep_orphans(&self) -> usize {
        // Move the orphans out so `reclaim` never runs under the lock.
        let mut orphans: Vec<Retired<T>> = std::mem::take(&mut *self.orphans.lock());
        let freed: usize = self.sweep(&mut orphans);
        if !orphans.is_empty() {
            self.orphans.lock().append(&mut orphans);
        }
        freed
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // No handle is alive, so nothing can be pinned.
        let orphans: Vec<Retired<T>> = std::mem::take(self.orphans.get_mut());
        let count: usize = orphans.len();
        for retired in orphans {
            (self.reclaim)(retired.item);
        }
        if count > 0 {
            debug_log!(count, "collector dropped, orphans reclaimed");
        }
    }
}

// ============================================================================
//  Collector
// ============================================================================

/// The epoch service: global epoch, participant registry, orphaned garbage
/// and an optional background ticker thread.
pub struct Collector<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    ticker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> fmt::Debug for Collector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("epoch", &self.shared.epoch.load(Ordering::Relaxed))
            .field("ticker", &self.ticker.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Collector<T> {
    /// Start a collector that releases items with `reclaim`.
    ///
    /// Spawns the ticker thread when `config.background_ticker` is set.
    pub fn new(config: EpochConfig, reclaim: impl Fn(T) + Send + Sync + 'static) -> Self {
        let shared = Arc::new(Shared {
            epoch: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
            orphans: Mutex::new(Vec::new()),
            reclaim: Box::new(reclaim),
            config,
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });

        let ticker: Option<JoinHandle<()>> = if shared.config.background_ticker {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("nvart-epoch".to_string())
                .spawn(move || ticker_loop(&shared))
                .map_err(|_err| {
                    warn_log!(error = %_err, "epoch ticker not started");
                })
                .ok()
        } else {
            None
        };

        Self { shared, ticker }
    }

    /// Register the calling thread.
    #[must_use]
    pub fn register(&self) -> LocalHandle<T> {
        let participant: Arc<Participant> = {
            let mut registry = self.shared.registry.lock();
            registry.idle.pop().unwrap_or_else(|| {
                let p = Arc::new(Participant {
                    epoch: AtomicU64::new(INACTIVE),
                });
                registry.all.push(Arc::clone(&p));
                p
            })
        };

        LocalHandle {
            shared: Arc::clone(&self.shared),
            participant,
            pins: Cell::new(0),
            bag: RefCell::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    /// Current global epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    /// Advance the global epoch by one. Returns the new epoch.
    pub fn advance(&self) -> u64 {
        self.shared.advance()
    }

    /// Advance the epoch and sweep garbage left behind by dropped handles.
    pub fn collect_orphans(&self) -> usize {
        self.shared.advance();
        self.shared.sweep_orphans()
    }

    /// Retired items waiting in the orphan list.
    #[must_use]
    pub fn orphan_count(&self) -> usize {
        self.shared.orphans.lock().len()
    }
}

impl<T: Send + 'static> Drop for Collector<T> {
    fn drop(&mut self) {
        *self.shared.shutdown.lock() = true;
        self.shared.wake.notify_all();

        if let Some(ticker) = self.ticker.take() {
            if ticker.join().is_err() {
                error_log!("epoch ticker thread panicked");
            }
        }

        // Last chance while handles may still exist; whatever remains is
        // freed when the shared state drops.
        self.shared.advance();
        self.shared.sweep_orphans();
    }
}

fn ticker_loop<T>(shared: &Shared<T>) {
    let interval = Duration::from_millis(shared.config.tick_interval_ms.max(1));

    loop {
        {
            let mut stop = shared.shutdown.lock();
            if *stop {
                return;
            }
            let _ = shared.wake.wait_for(&mut stop, interval);
            if *stop {
                return;
            }
        }

        let _epoch: u64 = shared.advance();
        let _freed: usize = shared.sweep_orphans();
        trace_log!(epoch = _epoch, freed = _freed, "epoch tick");
    }
}

// ============================================================================
//  LocalHandle
// ============================================================================

/// A thread's membership in a [`Collector`].
///
/// `!Send` and `!Sync`: it owns the thread's participant slot and garbage
/// bag. Dropping it hands leftover garbage to the collector's orphan list.
pub struct LocalHandle<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    participant: Arc<Participant>,
    pins: Cell<usize>,
    bag: RefCell<Vec<Retired<T>>>,

    _marker: PhantomData<*mut ()>,
}

impl<T: Send + 'static> fmt::Debug for LocalHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalHandle")
            .field("pins", &self.pins.get())
            .field("garbage", &self.bag.borrow().len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> LocalHandle<T> {
    /// Enter a critical section (join).
    #[must_use]
    pub fn pin(&self) -> Guard<'_, T> {
        let pins: usize = self.pins.get();
        if pins == 0 {
            loop {
                let global: u64 = self.shared.epoch.load(Ordering::SeqCst);
                self.participant.epoch.store(global, Ordering::SeqCst);
                if self.shared.epoch.load(Ordering::SeqCst) == global {
                    break;
                }
            }
        }
        self.pins.set(pins + 1);

        Guard {
            handle: self,
            _marker: PhantomData,
        }
    }

    /// True while at least one guard is alive.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pins.get() > 0
    }

    /// Sweep this thread's bag. Returns the number of items freed.
    pub fn collect(&self) -> usize {
        self.shared.advance();
        let mut bag: Vec<Retired<T>> = std::mem::take(&mut *self.bag.borrow_mut());
        let freed: usize = self.shared.sweep(&mut bag);
        self.bag.borrow_mut().append(&mut bag);
        freed
    }

    /// Items retired by this thread and not yet freed.
    #[must_use]
    pub fn garbage_len(&self) -> usize {
        self.bag.borrow().len()
    }

    fn unpin(&self) {
        let pins: usize = self.pins.get() - 1;
        self.pins.set(pins);

        if pins == 0 {
            // leave
            self.participant.epoch.store(INACTIVE, Ordering::SeqCst);

            if self.bag.borrow().len() >= self.shared.config.collect_threshold {
                self.collect();
            }
        }
    }
}

impl<T: Send + 'static> Drop for LocalHandle<T> {
    fn drop(&mut self) {
        self.participant.epoch.store(INACTIVE, Ordering::SeqCst);

        let mut bag: Vec<Retired<T>> = std::mem::take(self.bag.get_mut());
        self.shared.sweep(&mut bag);
        if !bag.is_empty() {
            self.shared.orphans.lock().append(&mut bag);
        }

        self.shared
            .registry
            .lock()
            .idle
            .push(Arc::clone(&self.participant));
    }
}

// ============================================================================
//  Guard
// ============================================================================

/// Proof that the owning thread is pinned.
///
/// Anything reached through the tree while the guard lives stays allocated.
#[must_use = "dropping the guard unpins immediately"]
pub struct Guard<'h, T: Send + 'static> {
    handle: &'h LocalHandle<T>,
    _marker: PhantomData<*mut ()>,
}

impl<T: Send + 'static> fmt::Debug for Guard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("epoch", &self.handle.participant.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + 'static> Guard<'_, T> {
    /// Defer `item` until no pinned thread can still see it.
    ///
    /// The item must already be unreachable for threads that pin from now on.
    pub fn retire(&self, item: T) {
        let epoch: u64 = self.handle.shared.epoch.load(Ordering::SeqCst);
        self.handle.bag.borrow_mut().push(Retired { epoch, item });
    }

    /// The epoch this guard's thread is pinned at.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.handle.participant.epoch.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        self.handle.unpin();
    }
}
