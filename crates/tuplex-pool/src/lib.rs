//! Tuplex-Pool: the worker pool behind the Tuplex dataflow runtime.
//!
//! The runtime never blocks a worker thread on missing data. A step instance
//! that cannot make progress simply returns, and is handed back to the pool
//! later by whichever producer supplies the missing value. The pool therefore
//! only needs one operation: fire-and-forget submission of a [`Job`].
//!
//! # Architecture
//!
//! - [`ThreadPool`]: a fixed set of worker threads with per-worker FIFO deques
//! - Global injector queues (one for urgent work, one for everything else)
//! - Per-worker mailboxes for jobs that carry an affinity hint
//! - Work stealing between workers when their own queues run dry
//!
//! Idle workers spin briefly with a [`crossbeam_utils::Backoff`] and then park
//! on a condition variable until new work is submitted.
//!
//! # Usage
//!
//! ```rust
//! use tuplex_pool::{Job, ThreadPool, WorkerPool};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = ThreadPool::new(2).unwrap();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let h = hits.clone();
//! pool.run(Job::new(move || { h.fetch_add(1, Ordering::SeqCst); }));
//! pool.shutdown();
//! ```

mod error;
mod job;
mod pool;
mod queue;

pub use error::PoolError;
pub use job::Job;
pub use pool::{current_worker, ThreadPool};

/// The submission interface the runtime schedules onto.
///
/// Implementations must accept jobs from any thread, including from inside a
/// running job, without blocking.
pub trait WorkerPool: Send + Sync {
    /// Submits a job for execution. Never blocks.
    fn run(&self, job: Job);

    /// Number of worker threads executing jobs.
    fn num_workers(&self) -> usize;

    /// Stops the workers. Jobs still queued are dropped without running.
    fn shutdown(&self);
}
