//! Hidden graphs: producers and consumers that work outside the scheduler's
//! queues but still take part in quiescence detection.

mod join;
mod reduce;

use std::sync::atomic::{AtomicBool, Ordering};

pub use join::{join, Join};
pub use reduce::Reduction;

pub trait HiddenGraph: Send + Sync {
    fn name(&self) -> &str;

    /// True while the graph may still produce tags or items.
    fn is_active(&self) -> bool;

    /// Called once the context is otherwise quiescent. Returns true if it
    /// produced new work, in which case `wait()` keeps going.
    fn on_quiescence(&self) -> bool {
        false
    }
}

/// A hidden graph whose activity is reported explicitly, e.g. by a thread
/// feeding data into the context from outside.
#[derive(Debug)]
pub struct ActivityFlag {
    name: String,
    active: AtomicBool,
}

impl ActivityFlag {
    pub fn new(name: impl Into<String>, active: bool) -> Self {
        ActivityFlag {
            name: name.into(),
            active: AtomicBool::new(active),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl HiddenGraph for ActivityFlag {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
