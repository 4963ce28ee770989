use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::deque::Worker;
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::queue::{Placed, Queues};
use crate::{Job, PoolError, WorkerPool};

/// How long a parked worker sleeps when jobs are queued that it cannot take
/// (another worker's mailbox, or a push that raced with its last lookup).
const RECHECK_INTERVAL: Duration = Duration::from_millis(1);

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the pool worker running on the calling thread, if any.
pub fn current_worker() -> Option<usize> {
    WORKER_INDEX.with(|idx| idx.get())
}

/// State shared between the pool handle and its worker threads.
struct Shared {
    queues: Queues,
    sleep: Mutex<()>,
    wake: Condvar,
    sleepers: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    fn notify(&self, placed: Placed) {
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.sleep.lock();
        match placed {
            Placed::Shared => {
                self.wake.notify_one();
            }
            // Condvars cannot target a specific thread.
            Placed::Mailbox(_) => {
                self.wake.notify_all();
            }
        }
    }
}

/// A fixed-size work-stealing thread pool.
///
/// Each worker owns a FIFO deque. Submissions land in a shared injector (or a
/// worker's mailbox when the job carries an affinity) and are pulled into the
/// local deques in batches; idle workers steal from their peers.
pub struct ThreadPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl ThreadPool {
    /// Creates a pool with `num_threads` workers named `tuplex-worker-<n>`.
    pub fn new(num_threads: usize) -> Result<Self, PoolError> {
        Self::with_name_prefix(num_threads, "tuplex-worker")
    }

    /// Creates a pool with one worker per available CPU.
    pub fn with_default_threads() -> Result<Self, PoolError> {
        Self::new(num_cpus::get())
    }

    pub fn with_name_prefix(num_threads: usize, prefix: &str) -> Result<Self, PoolError> {
        if num_threads == 0 {
            return Err(PoolError::NoWorkers);
        }

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(|w| w.stealer()).collect();
        let shared = Arc::new(Shared {
            queues: Queues::new(stealers),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            sleepers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let pool = ThreadPool {
            shared: shared.clone(),
            handles: Mutex::new(Vec::with_capacity(num_threads)),
            workers: num_threads,
        };

        for (index, local) in locals.into_iter().enumerate() {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{prefix}-{index}"))
                .spawn(move || worker_loop(shared, index, local))
                .map_err(|source| PoolError::Spawn { index, source })?;
            pool.handles.lock().push(handle);
        }

        log::info!("Worker pool started with {} threads", num_threads);
        Ok(pool)
    }

    /// Jobs submitted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.shared.queues.queued()
    }
}

impl WorkerPool for ThreadPool {
    fn run(&self, job: Job) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            log::warn!("Job submitted to a pool that is shutting down; dropping it");
            return;
        }
        let placed = self.shared.queues.push(job);
        self.shared.notify(placed);
    }

    fn num_workers(&self) -> usize {
        self.workers
    }

    fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.shared.sleep.lock();
            self.shared.wake.notify_all();
        }

        let me = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            // A job may drop the last handle to its own pool.
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                log::error!("Worker thread panicked before shutdown");
            }
        }

        let dropped = self.shared.queues.drain();
        if dropped > 0 {
            log::warn!("Worker pool shut down with {} queued jobs not run", dropped);
        }
        log::info!("Worker pool shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize, local: Worker<Job>) {
    WORKER_INDEX.with(|idx| idx.set(Some(index)));
    log::debug!("Worker {} entering run loop", index);

    let backoff = Backoff::new();
    while !shared.shutdown.load(Ordering::Acquire) {
        if let Some(job) = shared.queues.find(index, &local) {
            backoff.reset();
            job.run();
            continue;
        }

        if !backoff.is_completed() {
            backoff.snooze();
            continue;
        }

        let mut guard = shared.sleep.lock();
        shared.sleepers.fetch_add(1, Ordering::SeqCst);
        if !shared.shutdown.load(Ordering::Acquire) {
            if shared.queues.queued() == 0 {
                shared.wake.wait(&mut guard);
            } else {
                shared.wake.wait_for(&mut guard, RECHECK_INTERVAL);
            }
        }
        shared.sleepers.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        backoff.reset();
    }

    WORKER_INDEX.with(|idx| idx.set(None));
    log::debug!("Worker {} exiting run loop", index);
}
