use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use fxhash::FxBuildHasher;

use crate::item::{ItemCollection, ItemTuner};
use crate::partition::Grain;
use crate::schedule::InstanceCore;
use crate::types::{InstanceId, Placement, Tag, Topology, Value};

/// Per-collection policy for step collections. Every hook has a default.
pub trait StepTuner<T: Tag>: Send + Sync + 'static {
    /// Declares the items an instance for `tag` will read. Declared items are
    /// waited for before the body runs.
    fn depends(&self, _tag: &T, _deps: &mut Dependencies) {}

    /// Instances with a positive priority jump the pool's normal queue.
    fn priority(&self, _tag: &T) -> i32 {
        0
    }

    /// Preferred worker thread.
    fn affinity(&self, _tag: &T) -> Option<usize> {
        None
    }

    fn compute_on(&self, _tag: &T, _topology: &Topology) -> Placement {
        Placement::Local
    }

    /// Run the instance for `tag` alone, from the sequentialize queue.
    fn sequentialize(&self, _tag: &T) -> bool {
        false
    }

    /// Execute runnable instances inline during `put` instead of queueing.
    fn preschedule(&self) -> bool {
        false
    }

    /// Whether `depends` is consulted at all.
    fn check_deps(&self) -> bool {
        true
    }

    /// Polled at prepare time; a canceled instance skips its body.
    fn was_canceled(&self, _tag: &T) -> bool {
        false
    }

    /// Grain for ranges put into this step collection.
    fn grain(&self) -> Option<Grain> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTuner;

impl<T: Tag> StepTuner<T> for DefaultTuner {}

enum Mode {
    /// Only count what is missing.
    Probe,
    /// Register the instance as a waiter on what is missing.
    Register {
        id: InstanceId,
        core: Arc<InstanceCore>,
    },
}

/// Collects the dependencies an instance declares in [`StepTuner::depends`].
pub struct Dependencies {
    mode: Mode,
    missing: usize,
}

impl Dependencies {
    pub(crate) fn probe() -> Self {
        Dependencies {
            mode: Mode::Probe,
            missing: 0,
        }
    }

    pub(crate) fn register(id: InstanceId, core: Arc<InstanceCore>) -> Self {
        Dependencies {
            mode: Mode::Register { id, core },
            missing: 0,
        }
    }

    /// Declares that the instance reads `key` from `items`.
    pub fn require<K, V, Tu>(&mut self, items: &ItemCollection<K, V, Tu>, key: &K) -> &mut Self
    where
        K: Tag,
        V: Value,
        Tu: ItemTuner<K, V>,
    {
        let ready = match &self.mode {
            Mode::Probe => items.probe(key),
            Mode::Register { id, core } => items.wait_for(key, *id, core).is_some(),
        };
        if !ready {
            self.missing += 1;
        }
        self
    }

    /// Number of declared items not yet available.
    pub fn missing(&self) -> usize {
        self.missing
    }

    pub fn is_satisfied(&self) -> bool {
        self.missing == 0
    }
}

/// Cancellation state a tuner can consult from [`StepTuner::was_canceled`].
pub struct CancelSet<T: Tag> {
    tags: DashSet<T, FxBuildHasher>,
    all: AtomicBool,
}

impl<T: Tag> Default for CancelSet<T> {
    fn default() -> Self {
        CancelSet {
            tags: DashSet::with_hasher(FxBuildHasher::default()),
            all: AtomicBool::new(false),
        }
    }
}

impl<T: Tag> CancelSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, tag: T) {
        self.tags.insert(tag);
    }

    pub fn cancel_all(&self) {
        self.all.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.all.store(false, Ordering::Release);
        self.tags.clear();
    }

    pub fn is_canceled(&self, tag: &T) -> bool {
        self.all.load(Ordering::Acquire) || self.tags.contains(tag)
    }
}
