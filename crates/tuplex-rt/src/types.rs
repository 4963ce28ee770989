use std::fmt::{self, Debug};
use std::hash::Hash;

/// Key type for tag collections, item collections and step instances.
///
/// Implemented for every type that is hashable, comparable, printable and
/// shareable across threads.
pub trait Tag: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Tag for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Payload type stored in item collections.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

/// Identifies a process in a distributed run.
pub type ProcessId = u32;

/// Identifies a collection within a [`Context`](crate::Context).
///
/// Ids are handed out in creation order, so contexts that build the same
/// graph agree on them. Id 0 is the scheduler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(pub(crate) u32);

impl CollectionId {
    pub const SCHEDULER: CollectionId = CollectionId(0);

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle of a step instance in the scheduler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub(crate) usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{:x}", self.0)
    }
}

/// Number of reads an item expects before it may be reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetCount {
    /// No count declared; the item lives until the collection is reset.
    #[default]
    Unset,
    /// Explicitly never reclaimed.
    Unbounded,
    /// Reclaimed after exactly this many completed reads.
    Count(u32),
}

impl GetCount {
    pub(crate) const UNSET: i64 = -1;
    pub(crate) const UNBOUNDED: i64 = -2;

    pub(crate) fn encode(self) -> i64 {
        match self {
            GetCount::Unset => Self::UNSET,
            GetCount::Unbounded => Self::UNBOUNDED,
            GetCount::Count(n) => i64::from(n),
        }
    }
}

/// Where a tag should be computed or an item consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Local,
    Process(ProcessId),
    /// Every process, including this one.
    All,
}

/// The shape of the process group a context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub local: ProcessId,
    pub processes: u32,
}

impl Topology {
    pub fn single() -> Self {
        Topology { local: 0, processes: 1 }
    }

    pub fn is_distributed(&self) -> bool {
        self.processes > 1
    }

    /// True when `placement` resolves to this process only.
    pub fn is_local(&self, placement: Placement) -> bool {
        match placement {
            Placement::Local => true,
            Placement::Process(p) => p == self.local,
            Placement::All => !self.is_distributed(),
        }
    }

    /// All processes except this one.
    pub fn peers(&self) -> impl Iterator<Item = ProcessId> + '_ {
        (0..self.processes).filter(move |p| *p != self.local)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_locality() {
        let topo = Topology { local: 1, processes: 3 };
        assert!(topo.is_local(Placement::Local));
        assert!(topo.is_local(Placement::Process(1)));
        assert!(!topo.is_local(Placement::Process(2)));
        assert!(!topo.is_local(Placement::All));
        assert!(Topology::single().is_local(Placement::All));
        assert_eq!(topo.peers().collect::<Vec<_>>(), vec![0, 2]);
    }
}
