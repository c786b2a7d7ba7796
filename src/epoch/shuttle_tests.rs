//! Shuttle tests for the epoch protocol.
//!
//! Shuttle explores randomized thread schedules. The collector itself uses
//! `parking_lot` and std atomics, which shuttle cannot schedule, so this
//! module models the pin / retire / sweep protocol with shuttle primitives,
//! keeping the same orderings and the same "stamp < min active epoch" rule.
//!
//! Run with: `cargo test --lib epoch::shuttle_tests`

use shuttle::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use shuttle::sync::{Arc, Mutex};
use shuttle::thread;

const INACTIVE: u64 = u64::MAX;
const ITEMS: usize = 4;

/// One published pointer, a pool of items with "freed" flags, and the
/// epoch state.
struct Model {
    global: AtomicU64,
    participants: Vec<AtomicU64>,
    current: AtomicUsize,
    freed: Vec<AtomicBool>,
    garbage: Mutex<Vec<(u64, usize)>>,
}

impl Model {
    fn new(readers: usize) -> Self {
        Self {
            global: AtomicU64::new(1),
            participants: (0..readers).map(|_| AtomicU64::new(INACTIVE)).collect(),
            current: AtomicUsize::new(0),
            freed: (0..ITEMS).map(|_| AtomicBool::new(false)).collect(),
            garbage: Mutex::new(Vec::new()),
        }
    }

    fn pin(&self, who: usize) {
        loop {
            let e = self.global.load(Ordering::SeqCst);
            self.participants[who].store(e, Ordering::SeqCst);
            if self.global.load(Ordering::SeqCst) == e {
                return;
            }
        }
    }

    fn unpin(&self, who: usize) {
        self.participants[who].store(INACTIVE, Ordering::SeqCst);
    }

    /// Publish `next` and retire the item it replaced.
    fn replace(&self, next: usize) {
        let old = self.current.swap(next, Ordering::SeqCst);
        let stamp = self.global.load(Ordering::SeqCst);
        self.garbage.lock().unwrap().push((stamp, old));
    }

    fn sweep(&self) {
        self.global.fetch_add(1, Ordering::SeqCst);
        let global = self.global.load(Ordering::SeqCst);
        let safe = self
            .participants
            .iter()
            .map(|p| p.load(Ordering::SeqCst))
            .filter(|&e| e != INACTIVE)
            .min()
            .map_or(global, |m| m.min(global));

        let mut garbage = self.garbage.lock().unwrap();
        garbage.retain(|&(stamp, item)| {
            if stamp < safe {
                self.freed[item].store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
    }
}

/// A pinned reader never dereferences an item that was freed.
#[test]
fn test_shuttle_reader_never_sees_freed_item() {
    shuttle::check_random(
        || {
            let model = Arc::new(Model::new(2));

            let readers: Vec<_> = (0..2)
                .map(|who| {
                    let m = Arc::clone(&model);
                    thread::spawn(move || {
                        for _ in 0..2 {
                            m.pin(who);
                            let item = m.current.load(Ordering::SeqCst);
                            thread::yield_now();
                            assert!(
                                !m.freed[item].load(Ordering::SeqCst),
                                "reader {who} observed freed item {item}"
                            );
                            m.unpin(who);
                        }
                    })
                })
                .collect();

            let m = Arc::clone(&model);
            let writer = thread::spawn(move || {
                for next in 1..ITEMS {
                    m.replace(next);
                    m.sweep();
                }
            });

            for r in readers {
                r.join().unwrap();
            }
            writer.join().unwrap();
        },
        500,
    );
}

/// With every reader gone, one sweep frees all retired items.
#[test]
fn test_shuttle_quiescent_sweep_frees_all() {
    shuttle::check_random(
        || {
            let model = Arc::new(Model::new(1));

            let m = Arc::clone(&model);
            let reader = thread::spawn(move || {
                m.pin(0);
                let _ = m.current.load(Ordering::SeqCst);
                m.unpin(0);
            });

            let m = Arc::clone(&model);
            let writer = thread::spawn(move || {
                m.replace(1);
                m.replace(2);
            });

            reader.join().unwrap();
            writer.join().unwrap();

            model.sweep();
            assert!(model.garbage.lock().unwrap().is_empty());
            assert!(model.freed[0].load(Ordering::SeqCst));
            assert!(model.freed[1].load(Ordering::SeqCst));
            assert!(!model.freed[2].load(Ordering::SeqCst));
        },
        200,
    );
}
