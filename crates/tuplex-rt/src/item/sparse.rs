use std::sync::Arc;

use dashmap::DashMap;
use fxhash::FxBuildHasher;

use super::slot::{Fill, Register, Slot};
use super::{Decrement, ItemStore, Lookup, Present, PutOutcome};
use crate::types::{GetCount, InstanceId, ProcessId, Tag, Value};

/// Keyed backend: a sharded hash table of slots. Mutations lock one shard
/// only for the lookup; the slot does its own synchronisation.
pub struct SparseStore<K, V> {
    map: DashMap<K, Arc<Slot<V>>, FxBuildHasher>,
}

impl<K: Tag, V: Value> SparseStore<K, V> {
    pub fn new() -> Self {
        SparseStore {
            map: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    fn slot_for(&self, key: &K) -> Arc<Slot<V>> {
        if let Some(slot) = self.map.get(key) {
            return slot.value().clone();
        }
        self.map
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::empty()))
            .value()
            .clone()
    }

    fn unlink(&self, key: &K, slot: &Arc<Slot<V>>) {
        self.map.remove_if(key, |_, s| Arc::ptr_eq(s, slot));
    }
}

impl<K: Tag, V: Value> Default for SparseStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Tag, V: Value> ItemStore<K, V> for SparseStore<K, V> {
    fn put(&self, key: K, value: V, count: GetCount, owner: ProcessId) -> PutOutcome {
        loop {
            let slot = self.slot_for(&key);
            if count == GetCount::Count(0) {
                return match slot.close_unfilled() {
                    Some(woken) => {
                        self.unlink(&key, &slot);
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
                    self.unlink(&key, &slot);
                    continue;
                }
            }
        }
    }

    fn get(&self, key: &K) -> Option<Present<V>> {
        self.map.get(key).and_then(|slot| slot.value().present())
    }

    fn get_or_register(&self, key: &K, waiter: InstanceId) -> Lookup<V> {
        loop {
            let slot = self.slot_for(key);
            match slot.register(waiter) {
                Register::Present(p) => return Lookup::Present(p),
                Register::Registered => return Lookup::Absent,
                Register::Closed => self.unlink(key, &slot),
            }
        }
    }

    fn erase(&self, key: &K) -> Option<V> {
        let (_, slot) = self.map.remove_if(key, |_, s| s.has_value())?;
        slot.close();
        slot.value_ref().cloned()
    }

    fn decrement(&self, key: &K) -> Decrement {
        let Some(slot) = self.map.get(key).map(|s| s.value().clone()) else {
            return Decrement::Missing;
        };
        let d = slot.decrement();
        if d == Decrement::Reclaimed {
            slot.close();
            self.unlink(key, &slot);
        }
        d
    }

    fn owner(&self, key: &K) -> Option<ProcessId> {
        self.map.get(key).and_then(|slot| slot.value().owner())
    }

    fn len(&self) -> usize {
        self.map.iter().filter(|e| e.value().has_value()).count()
    }

    fn clear(&self) {
        for entry in self.map.iter() {
            entry.value().close();
        }
        self.map.clear();
    }

    fn snapshot(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .filter_map(|e| e.value().value_ref().map(|v| (e.key().clone(), v.clone())))
            .collect()
    }
}
