//! Tuplex: a dataflow execution engine.
//!
//! A program is a graph of three kinds of collections living in a
//! [`Context`]:
//!
//! * **tag collections** hold control tokens. Putting a tag launches one
//!   step instance per step collection the tag collection prescribes.
//! * **item collections** are single-assignment maps. A value may carry a
//!   get-count and is reclaimed after that many completed reads.
//! * **step collections** hold the computation: a function of a tag that
//!   reads items and puts items and tags.
//!
//! # Architecture
//!
//! Instances live in an arena owned by the scheduler. A read of an item that
//! is not there yet registers the instance as a waiter and returns
//! [`NotReady`]; the body propagates it and the instance parks until the
//! producer's put wakes it. Bulk puts of a [`TagRange`] create one instance
//! that splits itself with a [`Partitioner`] and then walks its elements,
//! skipping those already done when it is re-run.
//!
//! [`Context::wait`] returns once nothing is in flight, the retry and
//! sequentialize queues are drained and every registered [`HiddenGraph`]
//! is idle.
//!
//! # Usage
//!
//! ```no_run
//! use tuplex_rt::{Context, StepCx, StepResult};
//!
//! let ctx = Context::builder().build().unwrap();
//! let tags = ctx.tag_collection::<u32>("n");
//! let squares = ctx.item_collection::<u32, u64>("squares");
//!
//! let out = squares.clone();
//! let step = ctx.step_collection("square", move |n: &u32, cx: &mut StepCx| -> StepResult {
//!     cx.put(&out, *n, u64::from(*n) * u64::from(*n));
//!     Ok(())
//! });
//! tags.prescribes(&step).unwrap();
//!
//! tags.put_range(0u32..100);
//! ctx.wait();
//! assert_eq!(squares.try_get(&9), Some(81));
//! ```

pub mod config;
pub mod context;
pub mod dist;
pub mod error;
pub mod graph;
pub mod item;
pub mod partition;
pub mod range;
pub mod schedule;
pub mod step;
pub mod tag;
pub mod types;

pub use config::Config;
pub use context::{Context, ContextBuilder};
pub use dist::{Distributable, LocalTransport, LoopbackNetwork, Message, MessageKind, Transport};
pub use error::{ConfigError, DistError, NotReady, RuntimeError, StepError, StepResult};
pub use graph::{join, ActivityFlag, HiddenGraph, Join, Reduction};
pub use item::{
    ConsumedOn, Decrement, DefaultItemTuner, DenseIndex, DenseItemTuner, DenseStore, ItemCollection,
    ItemStore, ItemTuner, Lookup, Present, PutOutcome, SparseStore, WithGetCount,
};
pub use partition::{Divided, Grain, Partitioner};
pub use range::{Blocked, TagRange};
pub use schedule::{Scheduler, SchedulerStats};
pub use step::{
    CancelSet, CurrentInstance, DefaultTuner, Dependencies, Step, StepCollection, StepCx, StepTuner,
};
pub use tag::{DefaultTagTuner, TagCollection, TagSettings, TagTuner};
pub use types::{CollectionId, GetCount, InstanceId, Placement, ProcessId, Tag, Topology, Value};
pub use tuplex_pool::{ThreadPool, WorkerPool};
