//! Item collections and their storage backends.
//!
//! Every backend implements [`ItemStore`] with the same observable semantics:
//! single assignment per key, a get-count that is visible no later than the
//! value, waiters recorded atomically with the "absent" answer, and
//! exactly-once reclamation when the count runs out.

mod collection;
mod dense;
mod slot;
mod sparse;

use std::marker::PhantomData;

pub use collection::ItemCollection;
pub use dense::{DenseIndex, DenseStore};
pub use sparse::SparseStore;

use crate::types::{GetCount, InstanceId, Placement, ProcessId, Tag, Topology, Value};

/// A stored value as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Present<V> {
    pub value: V,
    /// The item carries a get-count, so this read must be decremented.
    pub counted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Present(Present<V>),
    /// Not produced yet; the waiter has been recorded.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decrement {
    /// The item has no get-count.
    Untracked,
    Remaining(u32),
    /// That was the last read; the entry is gone.
    Reclaimed,
    /// No such entry, or its count was already exhausted.
    Missing,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// False if the key already held a value; the store is unchanged.
    pub inserted: bool,
    /// Instances that registered on this key and must be resumed.
    pub woken: Vec<InstanceId>,
}

pub trait ItemStore<K, V>: Send + Sync + 'static {
    fn put(&self, key: K, value: V, count: GetCount, owner: ProcessId) -> PutOutcome;

    /// Non-registering read.
    fn get(&self, key: &K) -> Option<Present<V>>;

    fn get_or_register(&self, key: &K, waiter: InstanceId) -> Lookup<V>;

    /// Removes a present entry and returns its value. Placeholders holding
    /// waiters are left alone.
    fn erase(&self, key: &K) -> Option<V>;

    fn decrement(&self, key: &K) -> Decrement;

    /// Process that produced the value under `key`.
    fn owner(&self, key: &K) -> Option<ProcessId>;

    /// Number of present values.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry, including pending waiters.
    fn clear(&self);

    fn snapshot(&self) -> Vec<(K, V)>;
}

/// Per-collection policy for item collections.
pub trait ItemTuner<K: Tag, V: Value>: Send + Sync + 'static {
    type Store: ItemStore<K, V>;

    fn new_store(&self) -> Self::Store;

    fn get_count(&self, _key: &K) -> GetCount {
        GetCount::Unset
    }

    /// Process that will read `key`; puts are shipped there.
    fn consumed_on(&self, _key: &K, _topology: &Topology) -> Placement {
        Placement::Local
    }
}

/// Sparse storage, no get-counts, everything local.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultItemTuner;

impl<K: Tag, V: Value> ItemTuner<K, V> for DefaultItemTuner {
    type Store = SparseStore<K, V>;

    fn new_store(&self) -> Self::Store {
        SparseStore::new()
    }
}

/// Dense storage for integer keys below `capacity`.
#[derive(Debug, Clone, Copy)]
pub struct DenseItemTuner {
    pub capacity: usize,
}

impl<K: Tag + DenseIndex, V: Value> ItemTuner<K, V> for DenseItemTuner {
    type Store = DenseStore<K, V>;

    fn new_store(&self) -> Self::Store {
        DenseStore::new(self.capacity)
    }
}

/// Sparse storage with a get-count computed per key.
pub struct WithGetCount<F> {
    count: F,
}

impl<F> WithGetCount<F> {
    pub fn new(count: F) -> Self {
        WithGetCount { count }
    }
}

impl<K, V, F> ItemTuner<K, V> for WithGetCount<F>
where
    K: Tag,
    V: Value,
    F: Fn(&K) -> GetCount + Send + Sync + 'static,
{
    type Store = SparseStore<K, V>;

    fn new_store(&self) -> Self::Store {
        SparseStore::new()
    }

    fn get_count(&self, key: &K) -> GetCount {
        (self.count)(key)
    }
}

/// Ships every item to a fixed process.
pub struct ConsumedOn<K> {
    process: ProcessId,
    _key: PhantomData<fn(&K)>,
}

impl<K> ConsumedOn<K> {
    pub fn new(process: ProcessId) -> Self {
        ConsumedOn {
            process,
            _key: PhantomData,
        }
    }
}

impl<K: Tag, V: Value> ItemTuner<K, V> for ConsumedOn<K> {
    type Store = SparseStore<K, V>;

    fn new_store(&self) -> Self::Store {
        SparseStore::new()
    }

    fn consumed_on(&self, _key: &K, _topology: &Topology) -> Placement {
        Placement::Process(self.process)
    }
}
