//! Steps, their tuners, and the instances that run them.
//!
//! A step is a function of a tag and a [`StepCx`]. It reads items with
//! [`StepCx::get`]; a read of a missing item returns [`NotReady`], which the
//! body propagates with `?`. The instance is then parked and re-run from the
//! top once the item is put, so a step body must be safe to restart.

mod instance;
mod launcher;
mod range;
mod tuner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) use launcher::LauncherInner;
pub use launcher::StepCollection;
pub use tuner::{CancelSet, DefaultTuner, Dependencies, StepTuner};

use crate::error::{NotReady, StepResult};
use crate::item::{ItemCollection, ItemTuner};
use crate::range::TagRange;
use crate::schedule::{Env, InstanceCore};
use crate::tag::TagCollection;
use crate::types::{InstanceId, Tag, Topology, Value};

pub trait Step<T>: Send + Sync + 'static {
    fn execute(&self, tag: &T, cx: &mut StepCx) -> StepResult;
}

impl<T, F> Step<T> for F
where
    F: Fn(&T, &mut StepCx) -> StepResult + Send + Sync + 'static,
{
    fn execute(&self, tag: &T, cx: &mut StepCx) -> StepResult {
        self(tag, cx)
    }
}

/// Accounting for the activation currently running on a [`StepCx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentInstance {
    pub id: InstanceId,
    pub step: String,
    pub gets: u32,
    pub puts: u32,
}

type Release = Box<dyn FnOnce() + Send>;

/// Handle a step body uses to talk to the runtime for one activation.
pub struct StepCx {
    id: InstanceId,
    core: Arc<InstanceCore>,
    topology: Topology,
    step: Arc<str>,
    hazard_reported: Arc<AtomicBool>,
    /// Get-count decrements, applied only if the activation succeeds.
    reads: Vec<Release>,
    gets: u32,
    puts: u32,
}

impl StepCx {
    pub(crate) fn new(
        env: &Env<'_>,
        core: Arc<InstanceCore>,
        step: Arc<str>,
        hazard_reported: Arc<AtomicBool>,
    ) -> Self {
        StepCx {
            id: env.id,
            core,
            topology: env.sched.topology(),
            step,
            hazard_reported,
            reads: Vec::new(),
            gets: 0,
            puts: 0,
        }
    }

    /// Reads `key`, or returns [`NotReady`] after registering this instance
    /// to be re-run when the item arrives.
    pub fn get<K, V, Tu>(
        &mut self,
        items: &ItemCollection<K, V, Tu>,
        key: &K,
    ) -> Result<V, NotReady>
    where
        K: Tag,
        V: Value,
        Tu: ItemTuner<K, V>,
    {
        items.get(self, key)
    }

    pub fn put<K, V, Tu>(&mut self, items: &ItemCollection<K, V, Tu>, key: K, value: V) -> bool
    where
        K: Tag,
        V: Value,
        Tu: ItemTuner<K, V>,
    {
        self.puts += 1;
        items.put(key, value)
    }

    pub fn put_tag<T: Tag>(&mut self, tags: &TagCollection<T>, tag: T) {
        self.puts += 1;
        tags.put(tag);
    }

    pub fn put_range<R: TagRange>(&mut self, tags: &TagCollection<R::Tag>, range: R) {
        self.puts += 1;
        tags.put_range(range);
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn current(&self) -> CurrentInstance {
        CurrentInstance {
            id: self.id,
            step: self.step.to_string(),
            gets: self.gets,
            puts: self.puts,
        }
    }

    pub(crate) fn id(&self) -> InstanceId {
        self.id
    }

    pub(crate) fn core(&self) -> &Arc<InstanceCore> {
        &self.core
    }

    pub(crate) fn note_get(&mut self) {
        self.gets += 1;
    }

    /// A get came back empty.
    pub(crate) fn note_miss(&mut self) {
        if self.puts > 0 && !self.hazard_reported.swap(true, Ordering::Relaxed) {
            log::warn!(
                "Step '{}' made {} puts before a get that was not ready; \
                 the puts are repeated when the step re-runs. Get before put.",
                self.step,
                self.puts
            );
        }
    }

    pub(crate) fn on_success(&mut self, release: Release) {
        self.reads.push(release);
    }

    /// The activation completed: apply the recorded reads.
    pub(crate) fn commit(&mut self) {
        for release in self.reads.drain(..) {
            release();
        }
    }

    /// The activation stopped on missing data; its reads do not count.
    pub(crate) fn abandon(&mut self) {
        self.reads.clear();
    }

    /// Starts a fresh activation on the same context.
    pub(crate) fn restart(&mut self) {
        self.reads.clear();
        self.gets = 0;
        self.puts = 0;
    }
}
