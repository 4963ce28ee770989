use std::sync::Arc;

use parking_lot::Mutex;

use super::instance::run_body;
use super::{Dependencies, LauncherInner, StepCx};
use crate::partition::Partitioner;
use crate::range::TagRange;
use crate::schedule::{Env, InstanceCore, Outcome, Schedulable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// Dependencies not known to be available.
    Unprepared,
    Prepared,
    Done,
}

struct RangeState<R> {
    range: R,
    split: bool,
    marks: Vec<Mark>,
    /// Every element before this index is done.
    first_unresolved: usize,
}

/// One activation of a step over a bulk range.
///
/// The first execution splits off pieces until the held range is within the
/// grain, then the remainder runs element by element. Marks make re-entry
/// after a suspension skip completed elements.
pub(crate) struct RangeInstance<R: TagRange> {
    core: Arc<InstanceCore>,
    launcher: Arc<LauncherInner<R::Tag>>,
    partitioner: Partitioner,
    grain: usize,
    state: Mutex<RangeState<R>>,
}

enum Pass {
    Complete,
    Unresolved { count: usize, sequential: bool },
}

impl<R: TagRange> RangeInstance<R> {
    pub fn new(
        launcher: Arc<LauncherInner<R::Tag>>,
        range: R,
        partitioner: Partitioner,
        grain: usize,
    ) -> Self {
        RangeInstance {
            core: Arc::default(),
            launcher,
            partitioner,
            grain,
            state: Mutex::new(RangeState {
                range,
                split: false,
                marks: Vec::new(),
                first_unresolved: 0,
            }),
        }
    }

    fn split(&self, env: &Env<'_>, state: &mut RangeState<R>) {
        loop {
            let divided = self.partitioner.divide(state.range.clone(), self.grain);
            state.range = divided.remainder;
            if let Some(piece) = divided.split_off {
                log::trace!("Split {:?} off '{}'", piece, self.launcher.name());
                self.launcher
                    .launch_piece(env.sched, piece, self.partitioner, self.grain);
            }
            if !divided.more {
                break;
            }
        }
        state.split = true;

        let tuner = self.launcher.tuner();
        let n = state.range.element_count();
        state.marks = (0..n)
            .map(|i| {
                let tag = state.range.element(i);
                if tuner.was_canceled(&tag) {
                    Mark::Done
                } else if !tuner.check_deps() {
                    Mark::Prepared
                } else {
                    let mut deps = Dependencies::probe();
                    tuner.depends(&tag, &mut deps);
                    if deps.is_satisfied() {
                        Mark::Prepared
                    } else {
                        Mark::Unprepared
                    }
                }
            })
            .collect();
    }

    fn pass(&self, env: &Env<'_>, state: &mut RangeState<R>, cx: &mut StepCx) -> Pass {
        let tuner = self.launcher.tuner();
        let mut unresolved = 0;
        let mut sequential = false;
        let mut first = None;

        for i in state.first_unresolved..state.marks.len() {
            if state.marks[i] == Mark::Done {
                continue;
            }
            let tag = state.range.element(i);

            let finished = if tuner.sequentialize(&tag) && !env.exclusive {
                sequential = true;
                false
            } else {
                if state.marks[i] == Mark::Unprepared {
                    let mut deps = Dependencies::register(env.id, self.core.clone());
                    tuner.depends(&tag, &mut deps);
                    if deps.is_satisfied() {
                        state.marks[i] = Mark::Prepared;
                    }
                }
                state.marks[i] == Mark::Prepared
                    && run_body(&self.launcher, &tag, cx) == Outcome::Done
            };

            if finished {
                state.marks[i] = Mark::Done;
                env.sched.bump_epoch();
            } else {
                unresolved += 1;
                first.get_or_insert(i);
            }
        }

        state.first_unresolved = first.unwrap_or(state.marks.len());
        if unresolved == 0 {
            Pass::Complete
        } else {
            Pass::Unresolved {
                count: unresolved,
                sequential,
            }
        }
    }
}

impl<R: TagRange> Schedulable for RangeInstance<R> {
    fn core(&self) -> &Arc<InstanceCore> {
        &self.core
    }

    fn prepare(&self, _env: &Env<'_>) -> Outcome {
        Outcome::Success
    }

    fn execute(&self, env: &Env<'_>) -> Outcome {
        let mut state = self.state.lock();
        if !state.split {
            self.split(env, &mut state);
        }

        let mut cx = StepCx::new(
            env,
            self.core.clone(),
            self.launcher.name().clone(),
            self.launcher.hazard_flag().clone(),
        );
        let mut last = usize::MAX;
        loop {
            match self.pass(env, &mut state, &mut cx) {
                Pass::Complete => return Outcome::Done,
                Pass::Unresolved { count, sequential } => {
                    if count < last {
                        last = count;
                        continue;
                    }
                    log::trace!(
                        "{}: {} elements unresolved",
                        self.describe_locked(&state),
                        count
                    );
                    // Sequentialize wins over an extra wake.
                    return if sequential {
                        Outcome::NeedsSequentialize
                    } else {
                        Outcome::NeedsExtraWake
                    };
                }
            }
        }
    }

    fn describe(&self) -> String {
        self.describe_locked(&self.state.lock())
    }
}

impl<R: TagRange> RangeInstance<R> {
    fn describe_locked(&self, state: &RangeState<R>) -> String {
        let done = state.marks.iter().filter(|m| **m == Mark::Done).count();
        format!(
            "{}[{:?}] ({}/{} done)",
            self.launcher.name(),
            state.range,
            done,
            state.marks.len()
        )
    }
}
