use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use super::instance::TagInstance;
use super::range::RangeInstance;
use super::{Step, StepTuner};
use crate::dist::{Distributable, Message, MessageKind};
use crate::error::{fatal, DistError};
use crate::partition::{Grain, Partitioner};
use crate::range::TagRange;
use crate::schedule::SchedulerInner;
use crate::types::{CollectionId, Tag};

/// A step body bound to its tuner; creates the instances for one step
/// collection.
pub(crate) struct LauncherInner<T: Tag> {
    id: CollectionId,
    name: Arc<str>,
    step: Box<dyn Step<T>>,
    tuner: Box<dyn StepTuner<T>>,
    hazard_reported: Arc<AtomicBool>,
    sched: Weak<SchedulerInner>,
}

impl<T: Tag> LauncherInner<T> {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn step(&self) -> &dyn Step<T> {
        self.step.as_ref()
    }

    pub fn tuner(&self) -> &dyn StepTuner<T> {
        self.tuner.as_ref()
    }

    pub fn hazard_flag(&self) -> &Arc<AtomicBool> {
        &self.hazard_reported
    }

    pub fn grain(&self) -> Option<Grain> {
        self.tuner.grain()
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    fn scheduler(&self) -> Arc<SchedulerInner> {
        match self.sched.upgrade() {
            Some(s) => s,
            None => fatal("launch", format_args!("context of '{}' is gone", self.name)),
        }
    }

    /// Creates and prepares the instance for `tag`.
    pub fn launch(self: &Arc<Self>, tag: T, allow_remote: bool) {
        let sched = self.scheduler();
        log::trace!("Launching {}({:?})", self.name, tag);
        let id = sched.spawn(Box::new(TagInstance::new(self.clone(), tag)));
        sched.prepare(id, allow_remote, !self.tuner.preschedule());
    }

    /// Creates the bulk instance covering `range`.
    pub fn launch_range<R>(self: &Arc<Self>, range: R, grain: Grain)
    where
        R: TagRange<Tag = T>,
    {
        let sched = self.scheduler();
        let partitioner = Partitioner::new(grain, sched.num_workers());
        let grain = partitioner.grain_for(range.size());
        log::debug!(
            "Range {:?} into '{}' with grain {}",
            range,
            self.name,
            grain
        );
        self.launch_piece(&sched, range, partitioner, grain);
    }

    pub(crate) fn launch_piece<R>(
        self: &Arc<Self>,
        sched: &Arc<SchedulerInner>,
        range: R,
        partitioner: Partitioner,
        grain: usize,
    ) where
        R: TagRange<Tag = T>,
    {
        let instance = RangeInstance::new(self.clone(), range, partitioner, grain);
        let id = sched.spawn(Box::new(instance));
        sched.prepare(id, false, true);
    }
}

/// A named step bound to its tuner. Prescribe it from a tag collection with
/// [`TagCollection::prescribes`](crate::TagCollection::prescribes).
pub struct StepCollection<T: Tag> {
    inner: Arc<LauncherInner<T>>,
}

impl<T: Tag> Clone for StepCollection<T> {
    fn clone(&self) -> Self {
        StepCollection {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Tag> StepCollection<T> {
    pub(crate) fn new<S, Tu>(
        id: CollectionId,
        name: &str,
        step: S,
        tuner: Tu,
        sched: Weak<SchedulerInner>,
    ) -> Self
    where
        S: Step<T>,
        Tu: StepTuner<T>,
    {
        StepCollection {
            inner: Arc::new(LauncherInner {
                id,
                name: Arc::from(name),
                step: Box::new(step),
                tuner: Box::new(tuner),
                hazard_reported: Arc::new(AtomicBool::new(false)),
                sched,
            }),
        }
    }

    pub(crate) fn launcher(&self) -> &Arc<LauncherInner<T>> {
        &self.inner
    }

    pub(crate) fn distributable(&self) -> Arc<dyn Distributable> {
        Arc::new(self.clone())
    }

    pub fn id(&self) -> CollectionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<T: Tag> Distributable for StepCollection<T> {
    fn collection_id(&self) -> CollectionId {
        self.inner.id
    }

    fn receive_message(&self, message: &Message) -> Result<(), DistError> {
        match message.kind {
            MessageKind::Launch => {
                let tag = message.payload::<T>()?.clone();
                self.inner.launch(tag, false);
                Ok(())
            }
            kind => Err(DistError::UnexpectedKind {
                collection: self.inner.id,
                kind,
            }),
        }
    }
}
