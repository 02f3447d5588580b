//! Cooperative cancellation flags
//!
//! A `CancelFlag` is a shared one-way boolean. Long-running loops poll it
//! between units of work and stop early once it is set; nothing is ever
//! preempted mid-unit.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared, reference-counted, one-shot cancellation flag.
///
/// Clones observe the same state. Once set, a flag never resets; a scheduler
/// that needs a fresh generation calls [`cancel_and_reset`](Self::cancel_and_reset),
/// which cancels everyone still holding the old flag and rebinds its own
/// handle to a new one.
///
/// # Example
///
/// ```
/// use doctile_cache::CancelFlag;
///
/// let mut flag = CancelFlag::new();
/// let in_flight = flag.clone();
///
/// flag.cancel_and_reset();
///
/// assert!(in_flight.is_cancelled());
/// assert!(!flag.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Create a new, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Idempotent; every clone observes it.
    pub fn set(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Set this flag and rebind the handle to a freshly created one.
    pub fn cancel_and_reset(&mut self) {
        self.set();
        *self = Self::new();
    }

    /// Whether both handles share the same underlying flag.
    pub fn same_flag(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_flag_starts_unset() {
        assert!(!CancelFlag::new().is_cancelled());
        assert!(!CancelFlag::default().is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = CancelFlag::new();
        let clone = flag.clone();

        clone.set();
        assert!(flag.is_cancelled());
        assert!(clone.same_flag(&flag));
    }

    #[test]
    fn test_set_is_idempotent() {
        let flag = CancelFlag::new();
        flag.set();
        flag.set();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_cancel_and_reset_rebinds() {
        let mut flag = CancelFlag::new();
        let held = flag.clone();

        flag.cancel_and_reset();

        assert!(held.is_cancelled());
        assert!(!flag.is_cancelled());
        assert!(!flag.same_flag(&held));
    }

    #[test]
    fn test_visible_across_threads() {
        let flag = CancelFlag::new();
        let worker = flag.clone();

        let handle = thread::spawn(move || {
            while !worker.is_cancelled() {
                thread::yield_now();
            }
        });

        flag.set();
        handle.join().unwrap();
    }
}
