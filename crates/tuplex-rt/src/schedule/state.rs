//! Per-instance bookkeeping shared by every schedulable unit.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::error::fatal;

/// Lifecycle of a step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Unprepared = 0,
    Prepared = 1,
    Done = 2,
    /// Parked in the pending queue for an extra wake.
    Pending = 3,
    /// Waiting in the sequentialize queue.
    Sequentialized = 4,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Unprepared,
            1 => Status::Prepared,
            2 => Status::Done,
            3 => Status::Pending,
            _ => Status::Sequentialized,
        }
    }
}

/// What a prepare or execute call asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Prepared; runnable once the suspend counter is zero.
    Success,
    /// Stopped on missing data; parked until a producer wakes it.
    Unfinished,
    /// Must run alone, from the sequentialize queue.
    NeedsSequentialize,
    /// Must be retried later even without a new event.
    NeedsExtraWake,
    /// Finished; retire it.
    Done,
}

const IDLE: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
const RUNNING_RERUN: u8 = 3;

/// Suspend counter, status and queue state of one instance.
///
/// The queue state guarantees an instance never executes concurrently with
/// itself: a wake that lands while it runs is folded into one rerun.
#[derive(Debug)]
pub struct InstanceCore {
    suspend_count: AtomicI32,
    /// A waiter was registered since the last `take_waited`.
    waited: AtomicBool,
    status: AtomicU8,
    queue: AtomicU8,
    canceled: AtomicBool,
}

impl Default for InstanceCore {
    fn default() -> Self {
        InstanceCore {
            suspend_count: AtomicI32::new(0),
            waited: AtomicBool::new(false),
            status: AtomicU8::new(Status::Unprepared as u8),
            queue: AtomicU8::new(IDLE),
            canceled: AtomicBool::new(false),
        }
    }
}

impl InstanceCore {
    pub fn suspend(&self) {
        self.suspend_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when the counter drops back to zero.
    pub fn unsuspend(&self) -> bool {
        let prev = self.suspend_count.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            fatal("unsuspend", format_args!("suspend counter was {}", prev));
        }
        prev == 1
    }

    pub fn suspend_count(&self) -> i32 {
        self.suspend_count.load(Ordering::SeqCst)
    }

    pub fn note_wait(&self) {
        self.waited.store(true, Ordering::SeqCst);
    }

    pub fn take_waited(&self) -> bool {
        self.waited.swap(false, Ordering::SeqCst)
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Claims the right to queue the instance. False if it is already queued,
    /// or running (a rerun is then recorded instead).
    pub fn try_queue(&self) -> bool {
        let mut cur = self.queue.load(Ordering::Acquire);
        loop {
            let next = match cur {
                IDLE => QUEUED,
                RUNNING => RUNNING_RERUN,
                _ => return false,
            };
            match self
                .queue
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == QUEUED,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn begin_run(&self) {
        self.queue.store(RUNNING, Ordering::Release);
    }

    /// Leaves the running state. Returns true if a rerun was requested, in
    /// which case the instance is already marked queued.
    pub fn end_run(&self) -> bool {
        match self
            .queue
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(_) => {
                self.queue.store(QUEUED, Ordering::Release);
                true
            }
        }
    }
}
