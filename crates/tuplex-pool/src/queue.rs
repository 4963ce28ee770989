//! Job queues shared by all workers of a [`ThreadPool`](crate::ThreadPool).
//!
//! Lookup order for a worker is: its own mailbox, its local deque, the urgent
//! injector, the global injector, and finally the other workers' deques.
//! Mailbox jobs are never stolen; that is what makes affinity a guarantee
//! rather than a preference.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam_queue::SegQueue;
use crossbeam_utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Job;

/// Number of full sweeps over the peers before a steal attempt gives up.
const STEAL_ROUNDS: u32 = 3;

pub(crate) struct Queues {
    /// Jobs with a positive priority.
    urgent: Injector<Job>,
    /// Everything else without an affinity.
    global: Injector<Job>,
    /// Handles onto every worker's local deque.
    stealers: Vec<Stealer<Job>>,
    /// Per-worker inboxes for jobs pinned to that worker.
    mailboxes: Vec<SegQueue<Job>>,
    /// Jobs submitted and not yet handed to a worker.
    queued: CachePadded<AtomicUsize>,
}

/// Where a submitted job ended up; tells the pool whom to wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placed {
    Shared,
    Mailbox(usize),
}

impl Queues {
    pub fn new(stealers: Vec<Stealer<Job>>) -> Self {
        let mailboxes = (0..stealers.len()).map(|_| SegQueue::new()).collect();
        Self {
            urgent: Injector::new(),
            global: Injector::new(),
            stealers,
            mailboxes,
            queued: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Number of jobs not yet picked up by any worker.
    #[inline]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn push(&self, job: Job) -> Placed {
        // Counted before it becomes visible so a parking worker never misses it.
        self.queued.fetch_add(1, Ordering::SeqCst);
        match job.affinity {
            Some(worker) => {
                let idx = worker % self.mailboxes.len();
                self.mailboxes[idx].push(job);
                Placed::Mailbox(idx)
            }
            None if job.priority > 0 => {
                self.urgent.push(job);
                Placed::Shared
            }
            None => {
                self.global.push(job);
                Placed::Shared
            }
        }
    }

    /// Finds the next job for worker `index`.
    pub fn find(&self, index: usize, local: &Worker<Job>) -> Option<Job> {
        let job = self.mailboxes[index]
            .pop()
            .or_else(|| local.pop())
            .or_else(|| Self::steal_from_injector(&self.urgent, local))
            .or_else(|| Self::steal_from_injector(&self.global, local))
            .or_else(|| self.steal_from_peers(index, local));
        if job.is_some() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        job
    }

    /// Drops every job that has not started yet. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        for mailbox in &self.mailboxes {
            while mailbox.pop().is_some() {
                dropped += 1;
            }
        }
        for injector in [&self.urgent, &self.global] {
            loop {
                match injector.steal() {
                    Steal::Success(_) => dropped += 1,
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        self.queued.fetch_sub(dropped, Ordering::SeqCst);
        dropped
    }

    fn steal_from_injector(injector: &Injector<Job>, local: &Worker<Job>) -> Option<Job> {
        let backoff = Backoff::new();
        loop {
            match injector.steal_batch_and_pop(local) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => {
                    if backoff.is_completed() {
                        return None;
                    }
                    backoff.spin();
                }
            }
        }
    }

    fn steal_from_peers(&self, index: usize, local: &Worker<Job>) -> Option<Job> {
        let n = self.stealers.len();
        if n < 2 {
            return None;
        }
        for _ in 0..STEAL_ROUNDS {
            let mut contended = false;
            // Start with the right-hand neighbour so victims are spread out.
            for offset in 1..n {
                let victim = &self.stealers[(index + offset) % n];
                if victim.is_empty() {
                    continue;
                }
                match victim.steal_batch_and_pop(local) {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => {}
                    Steal::Retry => contended = true,
                }
            }
            if !contended {
                break;
            }
        }
        None
    }
}
