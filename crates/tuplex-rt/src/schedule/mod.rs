//! The scheduler: prepares instances, hands runnable ones to the worker pool,
//! settles their outcomes and detects quiescence.
//!
//! # Lifecycle of an instance
//!
//! 1. [`SchedulerInner::spawn`] places it in the arena and returns its handle.
//! 2. [`SchedulerInner::prepare`] runs the dependency hook under a suspend
//!    guard. Missing items register the instance as a waiter.
//! 3. Once the suspend counter is zero the instance is dispatched to the pool
//!    (or to the sequentialize queue).
//! 4. `execute` either finishes it (retired from the arena) or parks it again,
//!    in which case the producer of the missing item resumes it.
//!
//! The scheduler holds a suspend guard across every prepare and execute call,
//! so a producer can never make a still-running instance runnable.

pub(crate) mod state;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use dashmap::DashSet;
use fxhash::FxBuildHasher;
use parking_lot::{Condvar, Mutex, RwLock};
use sharded_slab::Slab;
use tuplex_pool::{Job, WorkerPool};

pub(crate) use state::{InstanceCore, Outcome, Status};

use crate::config::Config;
use crate::dist::{Distributable, Message, MessageKind, Transport};
use crate::error::{fatal, DistError};
use crate::graph::HiddenGraph;
use crate::partition::Grain;
use crate::types::{CollectionId, InstanceId, Placement, ProcessId, Topology};

/// What an instance sees of the scheduler while it is prepared or executed.
pub(crate) struct Env<'a> {
    pub sched: &'a Arc<SchedulerInner>,
    pub id: InstanceId,
    /// Running from the sequentialize queue with nothing else in flight.
    pub exclusive: bool,
}

/// A unit of work the scheduler can prepare, run and retire.
pub(crate) trait Schedulable: Send + Sync {
    fn core(&self) -> &Arc<InstanceCore>;

    fn prepare(&self, env: &Env<'_>) -> Outcome;

    fn execute(&self, env: &Env<'_>) -> Outcome;

    fn priority(&self) -> i32 {
        0
    }

    fn affinity(&self) -> Option<usize> {
        None
    }

    fn placement(&self, _topology: &Topology) -> Placement {
        Placement::Local
    }

    /// Ships the instance to `to`, or to every peer when `None`.
    fn route_remote(
        &self,
        _transport: &dyn Transport,
        _to: Option<ProcessId>,
    ) -> Result<(), DistError> {
        Ok(())
    }

    fn is_sequential(&self) -> bool {
        false
    }

    /// Internal work such as message delivery; kept out of the statistics.
    fn is_service(&self) -> bool {
        false
    }

    fn describe(&self) -> String;
}

/// Snapshot of the scheduler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub created: u64,
    pub completed: u64,
    pub parked: u64,
    pub requeued: u64,
    pub sequentialized: u64,
    pub extra_wakes: u64,
    pub remote: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    completed: AtomicU64,
    parked: AtomicU64,
    requeued: AtomicU64,
    sequentialized: AtomicU64,
    extra_wakes: AtomicU64,
    remote: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// A closure run as an instance, used for message delivery.
struct ServiceTask {
    core: Arc<InstanceCore>,
    label: String,
    task: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Schedulable for ServiceTask {
    fn core(&self) -> &Arc<InstanceCore> {
        &self.core
    }

    fn prepare(&self, _env: &Env<'_>) -> Outcome {
        Outcome::Success
    }

    fn execute(&self, _env: &Env<'_>) -> Outcome {
        if let Some(task) = self.task.lock().take() {
            task();
        }
        Outcome::Done
    }

    fn priority(&self) -> i32 {
        1
    }

    fn is_service(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("service({})", self.label)
    }
}

pub(crate) struct SchedulerInner {
    pool: Arc<dyn WorkerPool>,
    transport: Arc<dyn Transport>,
    topology: Topology,
    arena: Slab<Box<dyn Schedulable>>,
    live: DashSet<InstanceId, FxBuildHasher>,
    /// Instances being prepared, queued in the pool, or running.
    in_flight: CachePadded<AtomicUsize>,
    idle_lock: Mutex<()>,
    idle: Condvar,
    pending: SegQueue<InstanceId>,
    sequential: SegQueue<InstanceId>,
    /// Bumped whenever an instance completes or a range element finishes.
    epoch: CachePadded<AtomicU64>,
    hidden: RwLock<Vec<Arc<dyn HiddenGraph>>>,
    waiting: Mutex<()>,
    counters: Counters,
    poll: Duration,
    max_stalled: u32,
    default_grain: Grain,
}

impl SchedulerInner {
    pub fn new(
        pool: Arc<dyn WorkerPool>,
        transport: Arc<dyn Transport>,
        config: &Config,
    ) -> Arc<Self> {
        let topology = transport.topology();
        log::debug!(
            "Scheduler for process {} of {} on {} workers",
            topology.local,
            topology.processes,
            pool.num_workers()
        );
        Arc::new(SchedulerInner {
            pool,
            transport,
            topology,
            arena: Slab::new(),
            live: DashSet::with_hasher(FxBuildHasher::default()),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            pending: SegQueue::new(),
            sequential: SegQueue::new(),
            epoch: CachePadded::new(AtomicU64::new(0)),
            hidden: RwLock::new(Vec::new()),
            waiting: Mutex::new(()),
            counters: Counters::default(),
            poll: config.wait_poll(),
            max_stalled: config.max_stalled_polls,
            default_grain: config.default_grain,
        })
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    pub fn default_grain(&self) -> Grain {
        self.default_grain
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn register_hidden_graph(&self, graph: Arc<dyn HiddenGraph>) {
        log::debug!("Registered hidden graph '{}'", graph.name());
        self.hidden.write().push(graph);
    }

    /// Places an instance in the arena.
    pub fn spawn(&self, instance: Box<dyn Schedulable>) -> InstanceId {
        match self.arena.insert(instance) {
            Some(key) => {
                let id = InstanceId(key);
                self.live.insert(id);
                id
            }
            None => fatal("spawn", "instance arena is full"),
        }
    }

    /// Runs `task` on the pool as a tracked instance, so `wait()` covers it.
    pub fn spawn_service<F>(self: &Arc<Self>, label: impl Into<String>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.spawn(Box::new(ServiceTask {
            core: Arc::default(),
            label: label.into(),
            task: Mutex::new(Some(Box::new(task))),
        }));
        self.prepare(id, false, true);
    }

    /// Prepares a freshly spawned instance. Returns false if it was routed to
    /// another process instead of being scheduled here.
    ///
    /// With `enqueue` false a runnable instance executes inline on the
    /// calling thread.
    pub fn prepare(self: &Arc<Self>, id: InstanceId, allow_remote: bool, enqueue: bool) -> bool {
        let Some(entry) = self.arena.get(id.0) else {
            return false;
        };
        let service = entry.is_service();
        if !service {
            bump(&self.counters.created);
        }

        if allow_remote && !service && self.topology.is_distributed() {
            let placement = entry.placement(&self.topology);
            if !self.topology.is_local(placement) {
                let to = match placement {
                    Placement::Process(p) => Some(p),
                    _ => None,
                };
                if let Err(e) = entry.route_remote(self.transport.as_ref(), to) {
                    fatal("routing step instance", e);
                }
                bump(&self.counters.remote);
                if to.is_some() {
                    log::trace!("{} routed to process {:?}", entry.describe(), to);
                    drop(entry);
                    self.retire(id, false);
                    return false;
                }
            }
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let core = entry.core().clone();
        core.suspend();
        let outcome = entry.prepare(&Env {
            sched: self,
            id,
            exclusive: false,
        });
        let sequential = entry.is_sequential();
        drop(entry);

        if outcome == Outcome::Done {
            self.retire(id, !service);
        } else {
            core.set_status(Status::Prepared);
            if core.unsuspend() {
                if core.try_queue() {
                    if enqueue || sequential {
                        self.dispatch(id);
                    } else {
                        self.in_flight.fetch_add(1, Ordering::SeqCst);
                        self.run(id, false);
                    }
                }
            } else {
                bump(&self.counters.parked);
                log::trace!("{} parked after prepare", id);
            }
        }
        self.finish_flight();
        true
    }

    /// Wake path: one dependency of `id` has arrived.
    pub fn resume(self: &Arc<Self>, id: InstanceId) {
        let Some(entry) = self.arena.get(id.0) else {
            log::trace!("Wake for retired instance {}", id);
            return;
        };
        let core = entry.core().clone();
        drop(entry);
        if core.unsuspend() && core.try_queue() {
            bump(&self.counters.requeued);
            self.dispatch(id);
        }
    }

    /// Hands a queued instance to the pool, or to the sequentialize queue.
    fn dispatch(self: &Arc<Self>, id: InstanceId) {
        let Some(entry) = self.arena.get(id.0) else {
            return;
        };
        if entry.is_sequential() {
            entry.core().set_status(Status::Sequentialized);
            self.sequential.push(id);
            return;
        }
        let priority = entry.priority();
        let affinity = entry.affinity();
        drop(entry);

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let sched = self.clone();
        self.pool.run(
            Job::new(move || sched.run(id, false))
                .with_priority(priority)
                .with_affinity(affinity),
        );
    }

    /// Executes a queued instance. The caller has counted it as in flight.
    fn run(self: &Arc<Self>, id: InstanceId, exclusive: bool) {
        let Some(entry) = self.arena.get(id.0) else {
            self.finish_flight();
            return;
        };
        let core = entry.core().clone();
        core.begin_run();
        core.take_waited();
        core.suspend();
        let outcome = entry.execute(&Env {
            sched: self,
            id,
            exclusive,
        });
        log::trace!("{} -> {:?}", entry.describe(), outcome);
        let service = entry.is_service();
        drop(entry);

        self.settle(id, &core, outcome, service);
        self.finish_flight();
    }

    fn settle(
        self: &Arc<Self>,
        id: InstanceId,
        core: &InstanceCore,
        outcome: Outcome,
        service: bool,
    ) {
        match outcome {
            Outcome::Done | Outcome::Success => {
                core.unsuspend();
                self.retire(id, !service);
            }
            Outcome::Unfinished if core.take_waited() => {
                let ready = core.unsuspend();
                bump(&self.counters.parked);
                if core.end_run() || (ready && core.try_queue()) {
                    bump(&self.counters.requeued);
                    self.dispatch(id);
                }
            }
            // No progress. Requeued now if every waiter it registered was
            // already woken, otherwise left for a pending retry.
            Outcome::Unfinished | Outcome::NeedsExtraWake => {
                let waited = core.take_waited();
                let ready = core.unsuspend();
                bump(&self.counters.extra_wakes);
                if core.end_run() || (waited && ready && core.try_queue()) {
                    bump(&self.counters.requeued);
                    self.dispatch(id);
                } else {
                    core.set_status(Status::Pending);
                    self.pending.push(id);
                }
            }
            Outcome::NeedsSequentialize => {
                core.unsuspend();
                bump(&self.counters.sequentialized);
                core.set_status(Status::Sequentialized);
                if core.end_run() || core.try_queue() {
                    self.sequential.push(id);
                }
            }
        }
    }

    fn retire(&self, id: InstanceId, completed: bool) {
        if let Some(entry) = self.arena.get(id.0) {
            entry.core().set_status(Status::Done);
        }
        self.live.remove(&id);
        self.arena.remove(id.0);
        if completed {
            bump(&self.counters.completed);
        }
        self.bump_epoch();
    }

    fn finish_flight(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut guard = self.idle_lock.lock();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            self.idle.wait_for(&mut guard, self.poll);
        }
    }

    /// Blocks until nothing is in flight, both side queues are drained and
    /// no hidden graph reports activity.
    ///
    /// Must not be called from inside a step.
    pub fn wait(self: &Arc<Self>) {
        let _serial = self.waiting.lock();
        let mut last_epoch = self.epoch();
        let mut stalled = 0u32;
        let mut retried = false;

        loop {
            self.wait_idle();

            if let Some(id) = self.sequential.pop() {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                self.run(id, true);
                continue;
            }

            // A hidden graph may only go idle once a pending instance runs.
            if self.hidden_active() {
                thread::sleep(self.poll);
                if !self.pending.is_empty() {
                    self.retry_pending();
                }
                continue;
            }

            if !self.pending.is_empty() {
                let epoch = self.epoch();
                if epoch != last_epoch {
                    last_epoch = epoch;
                    stalled = 0;
                } else if retried {
                    stalled += 1;
                }
                if stalled < self.max_stalled {
                    if stalled > 0 {
                        thread::sleep(self.poll);
                    }
                    self.retry_pending();
                    retried = true;
                    continue;
                }
            }

            if self.quiesce_hidden() {
                continue;
            }

            if !self.pending.is_empty() {
                log::warn!(
                    "{} instances made no progress after {} retries; leaving them parked",
                    self.pending.len(),
                    stalled
                );
            }
            break;
        }
    }

    fn retry_pending(self: &Arc<Self>) {
        let n = self.pending.len();
        log::debug!("Retrying {} pending instances", n);
        for _ in 0..n {
            let Some(id) = self.pending.pop() else {
                break;
            };
            let Some(entry) = self.arena.get(id.0) else {
                continue;
            };
            let core = entry.core().clone();
            drop(entry);
            if core.try_queue() {
                core.set_status(Status::Prepared);
                self.dispatch(id);
            }
        }
    }

    fn hidden_graphs(&self) -> Vec<Arc<dyn HiddenGraph>> {
        self.hidden.read().clone()
    }

    fn hidden_active(&self) -> bool {
        self.hidden_graphs().iter().any(|g| g.is_active())
    }

    fn quiesce_hidden(&self) -> bool {
        let mut did_work = false;
        for graph in self.hidden_graphs() {
            if graph.on_quiescence() {
                log::debug!("Hidden graph '{}' flushed at quiescence", graph.name());
                did_work = true;
            }
        }
        did_work
    }

    /// Descriptions of every instance still in the arena.
    pub fn unfinished(&self) -> Vec<String> {
        let ids: Vec<InstanceId> = self.live.iter().map(|id| *id.key()).collect();
        ids.into_iter()
            .filter_map(|id| {
                self.arena.get(id.0).map(|e| {
                    let core = e.core();
                    format!(
                        "{} [{:?}, {} outstanding]",
                        e.describe(),
                        core.status(),
                        core.suspend_count()
                    )
                })
            })
            .collect()
    }

    /// Drops every parked instance. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        self.wait_idle();
        while self.pending.pop().is_some() {}
        while self.sequential.pop().is_some() {}
        let ids: Vec<InstanceId> = self.live.iter().map(|id| *id.key()).collect();
        for id in &ids {
            self.live.remove(id);
            self.arena.remove(id.0);
        }
        if !ids.is_empty() {
            log::debug!("Cleanup dropped {} parked instances", ids.len());
        }
        ids.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        SchedulerStats {
            created: load(&c.created),
            completed: load(&c.completed),
            parked: load(&c.parked),
            requeued: load(&c.requeued),
            sequentialized: load(&c.sequentialized),
            extra_wakes: load(&c.extra_wakes),
            remote: load(&c.remote),
        }
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl Distributable for SchedulerInner {
    fn collection_id(&self) -> CollectionId {
        CollectionId::SCHEDULER
    }

    fn receive_message(&self, message: &Message) -> Result<(), DistError> {
        match message.kind {
            MessageKind::Cleanup => {
                self.cleanup();
                Ok(())
            }
            kind => Err(DistError::UnexpectedKind {
                collection: CollectionId::SCHEDULER,
                kind,
            }),
        }
    }
}

/// Read-only handle on a context's scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub(crate) fn new(inner: Arc<SchedulerInner>) -> Self {
        Scheduler { inner }
    }

    pub fn wait(&self) {
        self.inner.wait()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats()
    }

    pub fn topology(&self) -> Topology {
        self.inner.topology()
    }

    pub fn num_workers(&self) -> usize {
        self.inner.num_workers()
    }

    /// Instances being prepared, queued or running right now.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    /// Descriptions of instances that never completed.
    pub fn unfinished(&self) -> Vec<String> {
        self.inner.unfinished()
    }

    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use tuplex_pool::ThreadPool;

    use super::*;
    use crate::dist::LocalTransport;

    fn scheduler() -> Arc<SchedulerInner> {
        let pool = Arc::new(ThreadPool::new(2).unwrap());
        SchedulerInner::new(pool, Arc::new(LocalTransport), &Config::default())
    }

    /// Registers on an input during its first run and is woken before that
    /// run ends, without having made progress.
    struct WokenWhileRunning {
        core: Arc<InstanceCore>,
        runs: Arc<AtomicU32>,
    }

    impl Schedulable for WokenWhileRunning {
        fn core(&self) -> &Arc<InstanceCore> {
            &self.core
        }

        fn prepare(&self, _env: &Env<'_>) -> Outcome {
            Outcome::Success
        }

        fn execute(&self, env: &Env<'_>) -> Outcome {
            if self.runs.fetch_add(1, Ordering::SeqCst) > 0 {
                return Outcome::Done;
            }
            self.core.suspend();
            self.core.note_wait();
            env.sched.resume(env.id);
            Outcome::NeedsExtraWake
        }

        fn describe(&self) -> String {
            "woken-while-running".to_string()
        }
    }

    #[test]
    fn wake_absorbed_by_a_run_requeues_it() {
        let sched = scheduler();
        let runs = Arc::new(AtomicU32::new(0));
        let id = sched.spawn(Box::new(WokenWhileRunning {
            core: Arc::default(),
            runs: runs.clone(),
        }));
        assert!(sched.prepare(id, false, true));

        // No wait(): only the wake path may bring it back.
        sched.wait_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(sched.pending.is_empty());
        assert_eq!(sched.stats().completed, 1);
        assert!(sched.unfinished().is_empty());
        sched.shutdown();
    }

    #[test]
    fn unregistered_miss_goes_to_pending() {
        struct NoProgress {
            core: Arc<InstanceCore>,
        }

        impl Schedulable for NoProgress {
            fn core(&self) -> &Arc<InstanceCore> {
                &self.core
            }

            fn prepare(&self, _env: &Env<'_>) -> Outcome {
                Outcome::Success
            }

            fn execute(&self, _env: &Env<'_>) -> Outcome {
                Outcome::Unfinished
            }

            fn describe(&self) -> String {
                "no-progress".to_string()
            }
        }

        let sched = scheduler();
        let id = sched.spawn(Box::new(NoProgress { core: Arc::default() }));
        sched.prepare(id, false, true);
        sched.wait_idle();
        assert_eq!(sched.pending.len(), 1);
        assert_eq!(sched.stats().extra_wakes, 1);
        assert_eq!(sched.cleanup(), 1);
        sched.shutdown();
    }
}
