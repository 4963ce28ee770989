use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use super::slot::{Fill, Register, Slot};
use super::{Decrement, ItemStore, Lookup, Present, PutOutcome};
use crate::error::fatal;
use crate::types::{GetCount, InstanceId, ProcessId, Tag, Value};

/// Keys usable with [`DenseStore`]: integers mapping onto array positions.
pub trait DenseIndex: Sized {
    fn to_index(&self) -> Option<usize>;
    fn from_index(index: usize) -> Self;
}

macro_rules! dense_index {
    ($($t:ty),* $(,)?) => {$(
        impl DenseIndex for $t {
            #[inline]
            fn to_index(&self) -> Option<usize> {
                usize::try_from(*self).ok()
            }

            #[inline]
            fn from_index(index: usize) -> Self {
                index as $t
            }
        }
    )*};
}

dense_index!(u8, u16, u32, u64, usize, i16, i32, i64, isize);

struct Cell<V> {
    slot: Atomic<Slot<V>>,
    /// Serialises linking and unlinking of `slot`; readers never take it.
    lock: Mutex<()>,
}

/// Indexed backend: a fixed array of slots with lock-free reads.
///
/// Slots are reclaimed through epoch-based garbage collection, so a reader
/// racing an erase still sees a valid slot.
pub struct DenseStore<K, V> {
    cells: Box<[Cell<V>]>,
    _key: PhantomData<fn(K) -> K>,
}

impl<K: Tag + DenseIndex, V: Value> DenseStore<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cells = (0..capacity)
            .map(|_| Cell {
                slot: Atomic::null(),
                lock: Mutex::new(()),
            })
            .collect();
        DenseStore {
            cells,
            _key: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    fn cell(&self, key: &K) -> &Cell<V> {
        match key.to_index().and_then(|i| self.cells.get(i)) {
            Some(cell) => cell,
            None => fatal(
                "dense item store",
                format_args!("key {:?} outside capacity {}", key, self.cells.len()),
            ),
        }
    }

    fn load<'g>(cell: &Cell<V>, guard: &'g Guard) -> Option<&'g Slot<V>> {
        // SAFETY: slots are only freed through `defer_destroy` after being
        // unlinked, and `guard` keeps the current epoch pinned.
        unsafe { cell.slot.load(Ordering::Acquire, guard).as_ref() }
    }

    fn load_or_create<'g>(cell: &Cell<V>, guard: &'g Guard) -> &'g Slot<V> {
        if let Some(slot) = Self::load(cell, guard) {
            return slot;
        }
        let _lock = cell.lock.lock();
        let current = cell.slot.load(Ordering::Acquire, guard);
        let shared = if current.is_null() {
            let fresh = Owned::new(Slot::empty()).into_shared(guard);
            cell.slot.store(fresh, Ordering::Release);
            fresh
        } else {
            current
        };
        // SAFETY: non-null, and protected by `guard` as above.
        unsafe { shared.deref() }
    }

    /// Unlinks `expected` if it is still the cell's slot.
    fn unlink(cell: &Cell<V>, expected: &Slot<V>, guard: &Guard) -> bool {
        let _lock = cell.lock.lock();
        let current = cell.slot.load(Ordering::Acquire, guard);
        if current.as_raw() != expected as *const Slot<V> {
            return false;
        }
        cell.slot.store(Shared::null(), Ordering::Release);
        // SAFETY: unlinked under the cell lock; no new reader can reach it.
        unsafe { guard.defer_destroy(current) };
        true
    }
}

impl<K: Tag + DenseIndex, V: Value> ItemStore<K, V> for DenseStore<K, V> {
    fn put(&self, key: K, value: V, count: GetCount, owner: ProcessId) -> PutOutcome {
        let cell = self.cell(&key);
        let guard = epoch::pin();
        loop {
            let slot = Self::load_or_create(cell, &guard);
            if count == GetCount::Count(0) {
                return match slot.close_unfilled() {
                    Some(woken) => {
                        Self::unlink(cell, slot, &guard);
                        PutOutcome {
                            inserted: true,
                            woken,
                        }
                    }
                    None => PutOutcome::default(),
                };
            }
            match slot.fill(value.clone(), count, owner) {
                Fill::Filled(woken) => {
                    return PutOutcome {
                        inserted: true,
                        woken,
                    }
                }
                Fill::Occupied => return PutOutcome::default(),
                Fill::Closed => {
                    Self::unlink(cell, slot, &guard);
                }
            }
        }
    }

    fn get(&self, key: &K) -> Option<Present<V>> {
        let guard = epoch::pin();
        Self::load(self.cell(key), &guard).and_then(|slot| slot.present())
    }

    fn get_or_register(&self, key: &K, waiter: InstanceId) -> Lookup<V> {
        let cell = self.cell(key);
        let guard = epoch::pin();
        loop {
            let slot = Self::load_or_create(cell, &guard);
            match slot.register(waiter) {
                Register::Present(p) => return Lookup::Present(p),
                Register::Registered => return Lookup::Absent,
                Register::Closed => {
                    Self::unlink(cell, slot, &guard);
                }
            }
        }
    }

    fn erase(&self, key: &K) -> Option<V> {
        let cell = self.cell(key);
        let guard = epoch::pin();
        let slot = Self::load(cell, &guard)?;
        let value = slot.value_ref()?.clone();
        if !Self::unlink(cell, slot, &guard) {
            return None;
        }
        slot.close();
        Some(value)
    }

    fn decrement(&self, key: &K) -> Decrement {
        let cell = self.cell(key);
        let guard = epoch::pin();
        let Some(slot) = Self::load(cell, &guard) else {
            return Decrement::Missing;
        };
        let d = slot.decrement();
        if d == Decrement::Reclaimed {
            slot.close();
            Self::unlink(cell, slot, &guard);
        }
        d
    }

    fn owner(&self, key: &K) -> Option<ProcessId> {
        let guard = epoch::pin();
        Self::load(self.cell(key), &guard).and_then(|slot| slot.owner())
    }

    fn len(&self) -> usize {
        let guard = epoch::pin();
        self.cells
            .iter()
            .filter(|c| Self::load(c, &guard).is_some_and(|s| s.has_value()))
            .count()
    }

    fn clear(&self) {
        let guard = epoch::pin();
        for cell in self.cells.iter() {
            if let Some(slot) = Self::load(cell, &guard) {
                slot.close();
                Self::unlink(cell, slot, &guard);
            }
        }
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        let guard = epoch::pin();
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let v = Self::load(c, &guard)?.value_ref()?.clone();
                Some((K::from_index(i), v))
            })
            .collect()
    }
}

impl<K, V> Drop for DenseStore<K, V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader can hold a slot reference.
        let guard = unsafe { epoch::unprotected() };
        for cell in self.cells.iter() {
            let shared = cell.slot.swap(Shared::null(), Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(unsafe { shared.into_owned() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn same_semantics_as_sparse() {
        let store: DenseStore<u32, u64> = DenseStore::new(16);
        assert_eq!(store.get_or_register(&5, InstanceId(1)), Lookup::Absent);
        let out = store.put(5, 42, GetCount::Count(2), 0);
        assert!(out.inserted);
        assert_eq!(out.woken, vec![InstanceId(1)]);
        assert!(!store.put(5, 0, GetCount::Unset, 0).inserted);
        assert_eq!(store.decrement(&5), Decrement::Remaining(1));
        assert_eq!(store.decrement(&5), Decrement::Reclaimed);
        assert!(store.get(&5).is_none());
        assert!(store.put(5, 7, GetCount::Unset, 3).inserted);
        assert_eq!(store.owner(&5), Some(3));
        assert_eq!(store.owner(&6), None);
        assert_eq!(store.snapshot(), vec![(5, 7)]);
        assert_eq!(store.erase(&5), Some(7));
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_fill_and_register() {
        let store = Arc::new(DenseStore::<usize, usize>::new(64));
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut woken = 0;
                    for k in (t..64).step_by(4) {
                        woken += store.put(k, k * 10, GetCount::Unset, 0).woken.len();
                    }
                    woken
                })
            })
            .collect();
        let mut registered = 0;
        for k in 0..64 {
            if store.get_or_register(&k, InstanceId(k)) == Lookup::Absent {
                registered += 1;
            }
        }
        let woken: usize = producers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(woken, registered);
        assert_eq!(store.len(), 64);
        for k in 0..64 {
            assert_eq!(store.get(&k).map(|p| p.value), Some(k * 10));
        }
    }
}
