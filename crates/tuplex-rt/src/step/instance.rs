use std::sync::Arc;

use super::{Dependencies, LauncherInner, StepCx};
use crate::dist::{Message, MessageKind, Transport};
use crate::error::{fatal, DistError, StepError};
use crate::schedule::{Env, InstanceCore, Outcome, Schedulable};
use crate::types::{Placement, ProcessId, Tag, Topology};

/// One activation of a step for one tag.
pub(crate) struct TagInstance<T: Tag> {
    core: Arc<InstanceCore>,
    launcher: Arc<LauncherInner<T>>,
    tag: T,
}

impl<T: Tag> TagInstance<T> {
    pub fn new(launcher: Arc<LauncherInner<T>>, tag: T) -> Self {
        TagInstance {
            core: Arc::default(),
            launcher,
            tag,
        }
    }
}

/// Runs a step body once and maps its result onto an outcome. This is the
/// only place a [`NotReady`](crate::NotReady) signal is caught.
pub(crate) fn run_body<T: Tag>(launcher: &LauncherInner<T>, tag: &T, cx: &mut StepCx) -> Outcome {
    cx.restart();
    match launcher.step().execute(tag, cx) {
        Ok(()) => {
            cx.commit();
            Outcome::Done
        }
        Err(StepError::NotReady(_)) => {
            cx.abandon();
            Outcome::Unfinished
        }
        Err(StepError::Failed(reason)) => fatal(
            "step failed",
            format_args!("{}({:?}): {}", launcher.name(), tag, reason),
        ),
    }
}

impl<T: Tag> Schedulable for TagInstance<T> {
    fn core(&self) -> &Arc<InstanceCore> {
        &self.core
    }

    fn prepare(&self, env: &Env<'_>) -> Outcome {
        let tuner = self.launcher.tuner();
        if tuner.was_canceled(&self.tag) {
            log::debug!("{} canceled", self.describe());
            self.core.cancel();
            return Outcome::Success;
        }
        if tuner.check_deps() {
            let mut deps = Dependencies::register(env.id, self.core.clone());
            tuner.depends(&self.tag, &mut deps);
            if !deps.is_satisfied() {
                log::trace!("{} waits on {} items", self.describe(), deps.missing());
            }
        }
        Outcome::Success
    }

    fn execute(&self, env: &Env<'_>) -> Outcome {
        if self.core.is_canceled() {
            return Outcome::Done;
        }
        let mut cx = StepCx::new(
            env,
            self.core.clone(),
            self.launcher.name().clone(),
            self.launcher.hazard_flag().clone(),
        );
        run_body(&self.launcher, &self.tag, &mut cx)
    }

    fn priority(&self) -> i32 {
        self.launcher.tuner().priority(&self.tag)
    }

    fn affinity(&self) -> Option<usize> {
        self.launcher.tuner().affinity(&self.tag)
    }

    fn placement(&self, topology: &Topology) -> Placement {
        self.launcher.tuner().compute_on(&self.tag, topology)
    }

    fn route_remote(
        &self,
        transport: &dyn Transport,
        to: Option<ProcessId>,
    ) -> Result<(), DistError> {
        let message = Message::new(self.launcher.id(), MessageKind::Launch, self.tag.clone());
        match to {
            Some(p) => transport.send(message, p),
            None => transport.broadcast(message),
        }
    }

    fn is_sequential(&self) -> bool {
        self.launcher.tuner().sequentialize(&self.tag)
    }

    fn describe(&self) -> String {
        format!("{}({:?})", self.launcher.name(), self.tag)
    }
}
