//! Doctile Scheduler Library
//!
//! Paint scheduling for tiled document views.
//!
//! A [`PaintManager`] accepts viewport paint requests, coalesces them with
//! queued and in-flight work, and renders the requested tiles into a
//! [`TileBuffer`](doctile_cache::TileBuffer) on a pool of worker threads.
//! When every tile of a batch has been processed the client's container is
//! invalidated, unless the batch was superseded in the meantime.
//!
//! # Example
//!
//! ```
//! use doctile_scheduler::{CompletionBarrier, WorkerPool, WorkerPoolConfig};
//! use std::sync::mpsc;
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();
//! let (done_tx, done_rx) = mpsc::channel();
//!
//! // Three jobs, one notification
//! let barrier = CompletionBarrier::new(3, move || done_tx.send(()).unwrap());
//! for _ in 0..3 {
//!     let barrier = barrier.clone();
//!     pool.post(Box::new(move || barrier.arrive()));
//! }
//!
//! done_rx.recv().unwrap();
//! pool.shutdown();
//! ```

mod barrier;
mod paint_manager;
mod worker;

// Re-export public API
pub use barrier::CompletionBarrier;
pub use doctile_cache::CancelFlag;
pub use paint_manager::{PaintClient, PaintManager, PaintRequest, Task};
pub use worker::{Job, WorkerPool, WorkerPoolConfig};
