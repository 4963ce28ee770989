//! Tag collections: control tokens that prescribe step instances.

mod memo;

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::dist::{Distributable, Message, MessageKind};
use crate::error::{fatal, DistError, RuntimeError};
use crate::partition::Grain;
use crate::range::TagRange;
use crate::schedule::SchedulerInner;
use crate::step::{LauncherInner, StepCollection};
use crate::types::{CollectionId, Tag};

use memo::{mask, Claim, MemoTable, MAX_PRESCRIPTIONS};

/// Per-collection policy for tag collections.
pub trait TagTuner: Send + Sync + 'static {
    /// Remember tags so a repeated put launches nothing.
    fn memoize(&self) -> bool {
        true
    }

    /// Grain for `put_range`; `None` uses the context default.
    fn grain(&self) -> Option<Grain> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTagTuner;

impl TagTuner for DefaultTagTuner {}

/// A tag tuner configured by value.
#[derive(Debug, Clone, Copy)]
pub struct TagSettings {
    pub memoize: bool,
    pub grain: Option<Grain>,
}

impl Default for TagSettings {
    fn default() -> Self {
        TagSettings {
            memoize: true,
            grain: None,
        }
    }
}

impl TagTuner for TagSettings {
    fn memoize(&self) -> bool {
        self.memoize
    }

    fn grain(&self) -> Option<Grain> {
        self.grain
    }
}

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) struct TagInner<T: Tag> {
    id: CollectionId,
    name: String,
    memo: MemoTable<T>,
    memoize: bool,
    grain: Option<Grain>,
    launchers: RwLock<Vec<Arc<LauncherInner<T>>>>,
    observers: RwLock<Vec<Observer<T>>>,
    sched: Weak<SchedulerInner>,
}

impl<T: Tag> TagInner<T> {
    fn put(&self, tag: T) {
        let (claim, targets) = {
            let launchers = self.launchers.read();
            let all = mask(launchers.len());
            let claim = if self.memoize {
                self.memo.claim(&tag, all)
            } else {
                Claim {
                    fresh: true,
                    newly: all,
                }
            };
            let targets: Vec<Arc<LauncherInner<T>>> = launchers
                .iter()
                .enumerate()
                .filter(|(bit, _)| claim.newly & (1u64 << bit) != 0)
                .map(|(_, l)| l.clone())
                .collect();
            (claim, targets)
        };

        if claim.fresh {
            let observers = self.observers.read().clone();
            for observer in observers {
                observer(&tag);
            }
        } else if targets.is_empty() {
            log::trace!("Tag {:?} already put into '{}'", tag, self.name);
        }

        for launcher in targets {
            launcher.launch(tag.clone(), true);
        }
    }
}

impl<T: Tag> Distributable for TagInner<T> {
    fn collection_id(&self) -> CollectionId {
        self.id
    }

    fn receive_message(&self, message: &Message) -> Result<(), DistError> {
        match message.kind {
            MessageKind::PutTag => {
                self.put(message.payload::<T>()?.clone());
                Ok(())
            }
            MessageKind::Reset => {
                self.memo.clear();
                Ok(())
            }
            kind => Err(DistError::UnexpectedKind {
                collection: self.id,
                kind,
            }),
        }
    }
}

/// A named set of control tags.
///
/// Putting a tag launches one step instance per prescribed step collection,
/// at most once per tag when memoization is on.
pub struct TagCollection<T: Tag> {
    inner: Arc<TagInner<T>>,
}

impl<T: Tag> Clone for TagCollection<T> {
    fn clone(&self) -> Self {
        TagCollection {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Tag> TagCollection<T> {
    pub(crate) fn new<Tu: TagTuner>(
        id: CollectionId,
        name: &str,
        tuner: Tu,
        sched: Weak<SchedulerInner>,
    ) -> Self {
        TagCollection {
            inner: Arc::new(TagInner {
                id,
                name: name.to_string(),
                memo: MemoTable::new(),
                memoize: tuner.memoize(),
                grain: tuner.grain(),
                launchers: RwLock::new(Vec::new()),
                observers: RwLock::new(Vec::new()),
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

    /// Binds `steps` to this collection. Tags already put are replayed into
    /// the new step collection.
    pub fn prescribes(&self, steps: &StepCollection<T>) -> Result<(), RuntimeError> {
        let launcher = steps.launcher().clone();
        let replay = {
            let mut launchers = self.inner.launchers.write();
            if launchers.len() >= MAX_PRESCRIPTIONS {
                return Err(RuntimeError::TooManyPrescriptions {
                    tags: self.inner.name.clone(),
                    limit: MAX_PRESCRIPTIONS,
                });
            }
            let bit = 1u64 << launchers.len();
            launchers.push(launcher.clone());
            if self.inner.memoize {
                self.inner.memo.mark_all(bit)
            } else {
                Vec::new()
            }
        };
        log::debug!(
            "'{}' prescribes '{}' ({} tags replayed)",
            self.inner.name,
            launcher.name(),
            replay.len()
        );
        for tag in replay {
            launcher.launch(tag, true);
        }
        Ok(())
    }

    pub fn put(&self, tag: T) {
        self.inner.put(tag)
    }

    /// Puts every tag of `range` as one bulk instance per prescribed step
    /// collection. Bulk puts bypass the memo table and observers.
    pub fn put_range<R>(&self, range: R)
    where
        R: TagRange<Tag = T>,
    {
        let Some(sched) = self.inner.sched.upgrade() else {
            fatal("put_range", format_args!("context of '{}' is gone", self.inner.name));
        };
        let launchers = self.inner.launchers.read().clone();
        for launcher in launchers {
            let grain = launcher
                .grain()
                .or(self.inner.grain)
                .unwrap_or_else(|| sched.default_grain());
            launcher.launch_range(range.clone(), grain);
        }
    }

    /// Runs `observer` once for every tag put for the first time from now on.
    pub fn on_put<F>(&self, observer: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.observers.write().push(Arc::new(observer));
    }

    /// Number of distinct tags seen (memoized collections only).
    pub fn len(&self) -> usize {
        self.inner.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tags(&self) -> Vec<T> {
        self.inner.memo.tags()
    }

    /// Forgets every tag; a later put launches its steps again.
    pub fn reset(&self) {
        self.inner.memo.clear();
    }
}
