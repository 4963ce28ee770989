use std::sync::{Arc, Weak};

use super::{Decrement, ItemStore, ItemTuner, Lookup, Present, DefaultItemTuner};
use crate::dist::{Distributable, Message, MessageKind};
use crate::error::{fatal, DistError, NotReady};
use crate::schedule::{InstanceCore, SchedulerInner};
use crate::step::StepCx;
use crate::types::{CollectionId, GetCount, InstanceId, Placement, ProcessId, Tag, Value};

/// Payload of a [`MessageKind::PutItem`] message.
pub(crate) struct ItemPut<K, V> {
    pub key: K,
    pub value: V,
    pub count: GetCount,
    pub owner: ProcessId,
}

pub(crate) struct ItemInner<K, V, Tu>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    id: CollectionId,
    name: String,
    tuner: Tu,
    store: Tu::Store,
    sched: Weak<SchedulerInner>,
}

impl<K, V, Tu> ItemInner<K, V, Tu>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    fn scheduler(&self) -> Arc<SchedulerInner> {
        match self.sched.upgrade() {
            Some(s) => s,
            None => fatal("item put", format_args!("context of '{}' is gone", self.name)),
        }
    }

    fn store_local(
        &self,
        sched: &Arc<SchedulerInner>,
        key: K,
        value: V,
        count: GetCount,
        owner: ProcessId,
    ) -> bool {
        let outcome = self.store.put(key.clone(), value, count, owner);
        if !outcome.inserted {
            log::warn!("Item {:?} already present in '{}'; put ignored", key, self.name);
            return false;
        }
        sched.bump_epoch();
        for id in outcome.woken {
            sched.resume(id);
        }
        true
    }

    fn consume(&self, key: &K) {
        match self.store.decrement(key) {
            Decrement::Reclaimed => log::trace!("Item {:?} in '{}' reclaimed", key, self.name),
            Decrement::Missing => log::warn!(
                "Item {:?} in '{}' read more often than its get-count",
                key,
                self.name
            ),
            Decrement::Untracked | Decrement::Remaining(_) => {}
        }
    }
}

impl<K, V, Tu> Distributable for ItemInner<K, V, Tu>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    fn collection_id(&self) -> CollectionId {
        self.id
    }

    fn receive_message(&self, message: &Message) -> Result<(), DistError> {
        match message.kind {
            MessageKind::PutItem => {
                let put = message.payload::<ItemPut<K, V>>()?;
                let sched = self.scheduler();
                self.store_local(&sched, put.key.clone(), put.value.clone(), put.count, put.owner);
                Ok(())
            }
            MessageKind::Reset => {
                self.store.clear();
                Ok(())
            }
            kind => Err(DistError::UnexpectedKind {
                collection: self.id,
                kind,
            }),
        }
    }
}

/// A named, single-assignment map from keys to values.
///
/// Values may carry a get-count, after which many completed reads they are
/// reclaimed. Reads from inside a step never block: a missing value parks
/// the reading instance until it is put.
pub struct ItemCollection<K, V, Tu = DefaultItemTuner>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    inner: Arc<ItemInner<K, V, Tu>>,
}

impl<K, V, Tu> Clone for ItemCollection<K, V, Tu>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    fn clone(&self) -> Self {
        ItemCollection {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, Tu> ItemCollection<K, V, Tu>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    pub(crate) fn new(
        id: CollectionId,
        name: &str,
        tuner: Tu,
        sched: Weak<SchedulerInner>,
    ) -> Self {
        let store = tuner.new_store();
        ItemCollection {
            inner: Arc::new(ItemInner {
                id,
                name: name.to_string(),
                tuner,
                store,
                sched,
            }),
        }
    }

    pub(crate) fn distributable(&self) -> Arc<dyn Distributable> {
        self.inner.clone()
    }

    pub fn id(&self) -> CollectionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Puts with the get-count chosen by the tuner.
    pub fn put(&self, key: K, value: V) -> bool {
        let count = self.inner.tuner.get_count(&key);
        self.put_with_count(key, value, count)
    }

    /// Puts `value` and wakes every instance waiting on `key`. Returns false
    /// if the key already held a value; the original value is kept.
    pub fn put_with_count(&self, key: K, value: V, count: GetCount) -> bool {
        let inner = &self.inner;
        let sched = inner.scheduler();
        let topology = sched.topology();
        let placement = inner.tuner.consumed_on(&key, &topology);
        if topology.is_local(placement) {
            return inner.store_local(&sched, key, value, count, topology.local);
        }

        let message = Message::new(
            inner.id,
            MessageKind::PutItem,
            ItemPut {
                key: key.clone(),
                value: value.clone(),
                count,
                owner: topology.local,
            },
        );
        match placement {
            Placement::Process(p) => {
                if let Err(e) = sched.transport().send(message, p) {
                    fatal("item put", e);
                }
                true
            }
            _ => {
                if let Err(e) = sched.transport().broadcast(message) {
                    fatal("item broadcast", e);
                }
                inner.store_local(&sched, key, value, count, topology.local)
            }
        }
    }

    /// Non-blocking read from outside a step. Does not count as a read.
    pub fn try_get(&self, key: &K) -> Option<V> {
        self.inner.store.get(key).map(|p| p.value)
    }

    /// Read from inside a step. On success the read is charged against the
    /// item's get-count when the activation completes.
    pub fn get(&self, cx: &mut StepCx, key: &K) -> Result<V, NotReady> {
        cx.note_get();
        let present = match self.inner.store.get(key) {
            Some(p) => p,
            None => match self.wait_for(key, cx.id(), cx.core()) {
                Some(p) => p,
                None => {
                    cx.note_miss();
                    return Err(NotReady);
                }
            },
        };
        if present.counted {
            let inner = self.inner.clone();
            let key = key.clone();
            cx.on_success(Box::new(move || inner.consume(&key)));
        }
        Ok(present.value)
    }

    /// Process whose put stored the value under `key`.
    pub fn owner(&self, key: &K) -> Option<ProcessId> {
        self.inner.store.owner(key)
    }

    pub(crate) fn probe(&self, key: &K) -> bool {
        self.inner.store.get(key).is_some()
    }

    /// Reads `key`, or suspends `core` once and registers `waiter` on it.
    pub(crate) fn wait_for(
        &self,
        key: &K,
        waiter: InstanceId,
        core: &InstanceCore,
    ) -> Option<Present<V>> {
        core.suspend();
        match self.inner.store.get_or_register(key, waiter) {
            Lookup::Present(p) => {
                core.unsuspend();
                Some(p)
            }
            Lookup::Absent => {
                core.note_wait();
                None
            }
        }
    }

    /// Removes `key` regardless of its get-count.
    pub fn erase(&self, key: &K) -> Option<V> {
        self.inner.store.erase(key)
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Copy of every present entry, in no particular order.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.inner.store.snapshot()
    }

    pub fn for_each<F: FnMut(&K, &V)>(&self, mut f: F) {
        for (k, v) in self.snapshot() {
            f(&k, &v);
        }
    }

    /// Drops every item. Instances waiting on this collection stay parked.
    pub fn reset(&self) {
        self.inner.store.clear();
    }
}
