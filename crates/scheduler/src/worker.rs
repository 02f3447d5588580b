//! Paint worker pool for parallel tile rasterization.
//!
//! Workers run on named threads and pull boxed jobs from a shared channel.
//! Jobs are opaque closures; cancellation is the job's own business, checked
//! through the [`CancelFlag`](doctile_cache::CancelFlag) it captured.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

/// A unit of work posted to the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for the paint worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to spawn.
    /// Default: number of logical CPU cores.
    pub num_workers: usize,

    /// Maximum time a worker will wait for a job before checking shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Set the poll interval for workers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Thread pool executing posted jobs in FIFO order.
///
/// Dropping the pool signals shutdown without waiting; call
/// [`shutdown`](Self::shutdown) to join the workers.
///
/// # Example
///
/// ```
/// use doctile_scheduler::{WorkerPool, WorkerPoolConfig};
/// use std::sync::mpsc;
///
/// let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();
/// let (tx, rx) = mpsc::channel();
///
/// pool.post(Box::new(move || tx.send(42).unwrap()));
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    workers: Vec<Worker>,
    sender: Option<Sender<Job>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Create and start a new worker pool.
    ///
    /// # Errors
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(config: WorkerPoolConfig) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(config.num_workers.max(1));

        for id in 0..config.num_workers.max(1) {
            workers.push(Worker::new(
                id,
                receiver.clone(),
                shutdown.clone(),
                config.poll_interval,
            )?);
        }

        debug!(workers = workers.len(), "paint worker pool started");
        Ok(Self {
            workers,
            sender: Some(sender),
            shutdown,
        })
    }

    /// Queue a job. Jobs posted after shutdown are dropped.
    pub fn post(&self, job: Job) {
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                debug!("job posted to a stopped worker pool");
            }
        }
    }

    /// Get the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Check if the worker pool is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Shutdown the worker pool gracefully.
    ///
    /// Workers finish the job in hand and exit; queued jobs that were not
    /// picked up are dropped. Blocks until every worker has terminated.
    pub fn shutdown(mut self) {
        self.signal_shutdown();
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }

    fn signal_shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.sender.take();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

/// A single worker thread in the worker pool.
struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(
        id: usize,
        receiver: Arc<Mutex<Receiver<Job>>>,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("doctile-paint-worker-{}", id))
            .spawn(move || Self::run(id, receiver, shutdown, poll_interval))?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    /// Main worker loop.
    ///
    /// Waits up to `poll_interval` for a job, then re-checks the shutdown
    /// signal. Exits once shutdown is signalled or the channel closes. A
    /// panicking job is logged and the worker keeps serving the queue.
    fn run(
        id: usize,
        receiver: Arc<Mutex<Receiver<Job>>>,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) {
        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            let next = receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv_timeout(poll_interval);

            match next {
                Ok(job) => {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(worker = id, "paint job panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Wait for the worker thread to finish.
    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker = self.id, "paint worker panicked");
            }
        }
    }
}

/// Get the number of logical CPU cores.
///
/// This is used as the default number of worker threads.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert!(config.num_workers > 0);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(4).with_poll_interval(Duration::from_millis(50));
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_worker_pool_creation() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();
        assert_eq!(pool.num_workers(), 2);
        assert!(!pool.is_shutting_down());

        pool.shutdown();
    }

    #[test]
    fn test_zero_workers_still_spawns_one() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(0)).unwrap();
        assert_eq!(pool.num_workers(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_worker_pool_executes_jobs() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..5 {
            let executed = executed.clone();
            let done_tx = done_tx.clone();
            pool.post(Box::new(move || {
                executed.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                done_tx.send(()).unwrap();
            }));
        }

        for _ in 0..5 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 5);

        pool.shutdown();
    }

    #[test]
    fn test_worker_survives_panicking_job() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(1).with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();
        let (done_tx, done_rx) = mpsc::channel();

        pool.post(Box::new(|| panic!("render failed")));
        pool.post(Box::new(move || done_tx.send(()).unwrap()));

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_single_worker_runs_jobs_in_order() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(1)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = mpsc::channel();

        for i in 0..4 {
            let order = order.clone();
            let done_tx = done_tx.clone();
            pool.post(Box::new(move || {
                order.lock().unwrap().push(i);
                done_tx.send(()).unwrap();
            }));
        }
        for _ in 0..4 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        pool.shutdown();
    }

    #[test]
    fn test_worker_threads_are_named() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(1)).unwrap();
        let (tx, rx) = mpsc::channel();

        pool.post(Box::new(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        }));

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("doctile-paint-worker-0"));
        pool.shutdown();
    }

    #[test]
    fn test_worker_pool_shutdown() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();
        pool.post(Box::new(|| thread::sleep(Duration::from_millis(10))));

        pool.shutdown();
        // Shutdown is successful if this completes without hanging
    }

    #[test]
    fn test_num_cpus() {
        let cpus = num_cpus();
        assert!(cpus > 0);
        assert!(cpus <= 1024); // Sanity check
    }
}
