//! Completion barrier for a batch of tile jobs
//!
//! A batch of `n` tiles arms one barrier. Every tile arrives exactly once,
//! whether it was rendered, skipped or cancelled; the `n`-th arrival runs the
//! completion callback.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

type Completion = Box<dyn FnOnce() + Send>;

struct Inner {
    remaining: AtomicUsize,
    on_complete: Mutex<Option<Completion>>,
}

/// Counts down arrivals and fires a callback exactly once at zero.
///
/// Clones share the same counter, so each worker job can own a handle.
///
/// # Example
///
/// ```
/// use doctile_scheduler::CompletionBarrier;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = fired.clone();
/// let barrier = CompletionBarrier::new(2, move || flag.store(true, Ordering::SeqCst));
///
/// barrier.arrive();
/// assert!(!fired.load(Ordering::SeqCst));
/// barrier.arrive();
/// assert!(fired.load(Ordering::SeqCst));
/// ```
#[derive(Clone)]
pub struct CompletionBarrier {
    inner: Arc<Inner>,
}

impl CompletionBarrier {
    /// Arm a barrier expecting `count` arrivals.
    ///
    /// A zero count fires `on_complete` immediately.
    pub fn new<F>(count: usize, on_complete: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let barrier = Self {
            inner: Arc::new(Inner {
                remaining: AtomicUsize::new(count),
                on_complete: Mutex::new(Some(Box::new(on_complete))),
            }),
        };
        if count == 0 {
            barrier.fire();
        }
        barrier
    }

    /// Record one arrival.
    pub fn arrive(&self) {
        self.arrive_many(1);
    }

    /// Record `n` arrivals at once, e.g. for the tail of a cancelled range.
    pub fn arrive_many(&self, n: usize) {
        if n == 0 {
            return;
        }
        let previous = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(n)
            });

        match previous {
            Ok(previous) if previous == n => self.fire(),
            Ok(_) => {}
            Err(remaining) => {
                warn!(remaining, arrivals = n, "completion barrier over-arrived");
            }
        }
    }

    /// Arrivals still outstanding.
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    fn fire(&self) {
        let callback = self
            .inner
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl fmt::Debug for CompletionBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionBarrier")
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn counting_barrier(count: usize) -> (CompletionBarrier, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let barrier = CompletionBarrier::new(count, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (barrier, fired)
    }

    #[test]
    fn test_zero_count_fires_immediately() {
        let (barrier, fired) = counting_barrier(0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(barrier.remaining(), 0);
    }

    #[test]
    fn test_fires_on_last_arrival() {
        let (barrier, fired) = counting_barrier(3);

        barrier.arrive();
        barrier.arrive();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(barrier.remaining(), 1);

        barrier.arrive();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_arrive_many() {
        let (barrier, fired) = counting_barrier(10);

        barrier.arrive_many(4);
        barrier.arrive_many(0);
        assert_eq!(barrier.remaining(), 6);

        barrier.arrive_many(6);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_extra_arrivals_never_fire_twice() {
        let (barrier, fired) = counting_barrier(1);

        barrier.arrive();
        barrier.arrive();
        barrier.arrive_many(3);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(barrier.remaining(), 0);
    }

    #[test]
    fn test_fires_once_across_threads() {
        let (barrier, fired) = counting_barrier(400);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        barrier.arrive();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(barrier.remaining(), 0);
    }
}
