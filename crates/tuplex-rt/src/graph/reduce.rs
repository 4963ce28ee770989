use std::sync::Arc;

use dashmap::DashMap;
use fxhash::FxBuildHasher;

use super::HiddenGraph;
use crate::context::Context;
use crate::item::{ItemCollection, ItemTuner};
use crate::types::{Tag, Value};

struct Partial<V> {
    acc: Option<V>,
    seen: u64,
    expected: Option<u64>,
}

/// Per-key reduction into an item collection.
///
/// A key with an expected count is emitted as soon as that many values have
/// been contributed. Keys without a count are emitted once the context is
/// otherwise quiescent.
pub struct Reduction<K, V, Tu>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    name: String,
    op: Box<dyn Fn(V, V) -> V + Send + Sync>,
    partials: DashMap<K, Partial<V>, FxBuildHasher>,
    out: ItemCollection<K, V, Tu>,
}

impl<K, V, Tu> Reduction<K, V, Tu>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    /// Creates the reduction and registers it with `ctx`.
    pub fn new<F>(
        ctx: &Context,
        name: impl Into<String>,
        out: &ItemCollection<K, V, Tu>,
        op: F,
    ) -> Arc<Self>
    where
        F: Fn(V, V) -> V + Send + Sync + 'static,
    {
        let graph = Arc::new(Reduction {
            name: name.into(),
            op: Box::new(op),
            partials: DashMap::with_hasher(FxBuildHasher::default()),
            out: out.clone(),
        });
        ctx.register_hidden_graph(graph.clone());
        graph
    }

    /// Folds `value` into the partial result for `key`.
    pub fn contribute(&self, key: K, value: V) {
        let ready = {
            let mut entry = self.partials.entry(key.clone()).or_insert_with(|| Partial {
                acc: None,
                seen: 0,
                expected: None,
            });
            let p = entry.value_mut();
            p.acc = Some(match p.acc.take() {
                Some(acc) => (self.op)(acc, value),
                None => value,
            });
            p.seen += 1;
            p.expected.is_some_and(|n| p.seen >= n)
        };
        if ready {
            self.emit(&key);
        }
    }

    /// Declares how many contributions `key` will receive.
    pub fn set_count(&self, key: K, count: u64) {
        let ready = {
            let mut entry = self.partials.entry(key.clone()).or_insert_with(|| Partial {
                acc: None,
                seen: 0,
                expected: None,
            });
            let p = entry.value_mut();
            p.expected = Some(count);
            p.seen >= count
        };
        if ready {
            self.emit(&key);
        }
    }

    fn emit(&self, key: &K) {
        let Some((key, partial)) = self.partials.remove(key) else {
            return;
        };
        match partial.acc {
            Some(value) => {
                log::trace!("Reduction '{}' emits {:?}", self.name, key);
                self.out.put(key, value);
            }
            None => log::debug!("Reduction '{}' key {:?} closed with no values", self.name, key),
        }
    }
}

impl<K, V, Tu> HiddenGraph for Reduction<K, V, Tu>
where
    K: Tag,
    V: Value,
    Tu: ItemTuner<K, V>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.partials
            .iter()
            .any(|p| p.expected.is_some_and(|n| p.seen < n))
    }

    fn on_quiescence(&self) -> bool {
        let open: Vec<K> = self
            .partials
            .iter()
            .filter(|p| p.expected.is_none())
            .map(|p| p.key().clone())
            .collect();
        for key in &open {
            self.emit(key);
        }
        !open.is_empty()
    }
}
