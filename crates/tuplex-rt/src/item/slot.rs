use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::{Decrement, Present};
use crate::types::{GetCount, InstanceId, ProcessId};

/// One entry of an item store, shared by both backends.
///
/// The value is written once. The get-count is stored before the value is
/// published, so any reader that sees the value also sees its count.
pub(crate) struct Slot<V> {
    value: OnceLock<V>,
    count: AtomicI64,
    owner: AtomicU32,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    waiters: Vec<InstanceId>,
    /// Unlinked from its store; registrations must look the key up again.
    closed: bool,
}

pub(crate) enum Fill {
    Filled(Vec<InstanceId>),
    Occupied,
    Closed,
}

pub(crate) enum Register<V> {
    Present(Present<V>),
    Registered,
    Closed,
}

impl<V: Clone> Slot<V> {
    pub fn empty() -> Self {
        Slot {
            value: OnceLock::new(),
            count: AtomicI64::new(GetCount::UNSET),
            owner: AtomicU32::new(0),
            state: Mutex::new(SlotState::default()),
        }
    }

    #[inline]
    pub fn present(&self) -> Option<Present<V>> {
        self.value.get().map(|v| Present {
            value: v.clone(),
            counted: self.count.load(Ordering::Acquire) >= 0,
        })
    }

    pub fn has_value(&self) -> bool {
        self.value.get().is_some()
    }

    /// Publishes `value` and hands back the instances waiting for it.
    pub fn fill(&self, value: V, count: GetCount, owner: ProcessId) -> Fill {
        let mut state = self.state.lock();
        if state.closed {
            return Fill::Closed;
        }
        if self.value.get().is_some() {
            return Fill::Occupied;
        }
        self.count.store(count.encode(), Ordering::Release);
        self.owner.store(owner, Ordering::Relaxed);
        if self.value.set(value).is_err() {
            return Fill::Occupied;
        }
        Fill::Filled(std::mem::take(&mut state.waiters))
    }

    /// Closes a slot that never got a value, returning its waiters.
    /// `None` if a value was published first.
    pub fn close_unfilled(&self) -> Option<Vec<InstanceId>> {
        let mut state = self.state.lock();
        if self.value.get().is_some() {
            return None;
        }
        state.closed = true;
        Some(std::mem::take(&mut state.waiters))
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Reads the value, or records `waiter` to be woken when it is filled.
    pub fn register(&self, waiter: InstanceId) -> Register<V> {
        if let Some(p) = self.present() {
            return Register::Present(p);
        }
        let mut state = self.state.lock();
        if let Some(p) = self.present() {
            return Register::Present(p);
        }
        if state.closed {
            return Register::Closed;
        }
        state.waiters.push(waiter);
        Register::Registered
    }

    /// Records one completed read.
    pub fn decrement(&self) -> Decrement {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c > 0 {
                    Some(c - 1)
                } else {
                    None
                }
            });
        match prev {
            Ok(1) => Decrement::Reclaimed,
            Ok(c) => Decrement::Remaining((c - 1) as u32),
            Err(c) if c < 0 => Decrement::Untracked,
            Err(_) => Decrement::Missing,
        }
    }

    pub fn value_ref(&self) -> Option<&V> {
        self.value.get()
    }

    /// Process that produced the value, once there is one.
    pub fn owner(&self) -> Option<ProcessId> {
        self.has_value().then(|| self.owner.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_wakes_registered_waiters_once() {
        let slot: Slot<u32> = Slot::empty();
        assert_eq!(slot.owner(), None);
        assert!(matches!(slot.register(InstanceId(1)), Register::Registered));
        assert!(matches!(slot.register(InstanceId(2)), Register::Registered));
        match slot.fill(7, GetCount::Count(1), 0) {
            Fill::Filled(w) => assert_eq!(w, vec![InstanceId(1), InstanceId(2)]),
            _ => panic!("expected fill"),
        }
        assert!(matches!(slot.fill(8, GetCount::Unset, 2), Fill::Occupied));
        assert_eq!(slot.owner(), Some(0));
        match slot.register(InstanceId(3)) {
            Register::Present(p) => {
                assert_eq!(p.value, 7);
                assert!(p.counted);
            }
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn decrement_counts_down_to_reclaim() {
        let slot: Slot<u32> = Slot::empty();
        let _ = slot.fill(1, GetCount::Count(2), 0);
        assert_eq!(slot.decrement(), Decrement::Remaining(1));
        assert_eq!(slot.decrement(), Decrement::Reclaimed);
        assert_eq!(slot.decrement(), Decrement::Missing);

        let unset: Slot<u32> = Slot::empty();
        let _ = unset.fill(1, GetCount::Unbounded, 0);
        assert_eq!(unset.decrement(), Decrement::Untracked);
        assert!(!unset.present().unwrap().counted);
    }

    #[test]
    fn closed_slot_refuses_registration() {
        let slot: Slot<u32> = Slot::empty();
        let _ = slot.register(InstanceId(4));
        assert_eq!(slot.close_unfilled(), Some(vec![InstanceId(4)]));
        assert!(matches!(slot.register(InstanceId(5)), Register::Closed));
        assert!(matches!(slot.fill(1, GetCount::Unset, 0), Fill::Closed));
    }
}
