use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tuplex_pool::{ThreadPool, WorkerPool};

use crate::config::Config;
use crate::dist::{LocalTransport, Message, Router, Transport};
use crate::error::{DistError, RuntimeError};
use crate::graph::HiddenGraph;
use crate::item::{DefaultItemTuner, ItemCollection, ItemTuner};
use crate::partition::Grain;
use crate::schedule::{Scheduler, SchedulerInner, SchedulerStats};
use crate::step::{DefaultTuner, Step, StepCollection, StepTuner};
use crate::tag::{DefaultTagTuner, TagCollection, TagTuner};
use crate::types::{CollectionId, Tag, Topology, Value};

pub(crate) struct ContextInner {
    sched: Arc<SchedulerInner>,
    router: Router,
    config: Config,
    next_id: AtomicU32,
}

impl ContextInner {
    pub fn scheduler(&self) -> &Arc<SchedulerInner> {
        &self.sched
    }

    pub fn wait(&self) {
        self.sched.wait();
    }

    pub fn receive_message(&self, message: &Message) -> Result<(), DistError> {
        self.router.deliver(message)
    }

    fn next_id(&self) -> CollectionId {
        CollectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.sched.wait();
        let unfinished = self.sched.unfinished();
        if !unfinished.is_empty() {
            log::warn!("{} unfinished step instances at teardown", unfinished.len());
            for description in &unfinished {
                log::debug!("  unfinished: {}", description);
            }
        }
        self.sched.cleanup();
        self.sched.shutdown();
        log::info!("Context for process {} shut down", self.sched.topology().local);
    }
}

/// The engine context: owns the scheduler, the worker pool and the
/// collection registry. Collections created from it stay valid as long as
/// the context does.
///
/// Dropping the last handle waits for quiescence and stops the workers.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A context configured exactly by `config`; the environment is ignored.
    pub fn new(config: Config) -> Result<Self, RuntimeError> {
        ContextBuilder::new().config(config).ignore_env().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    fn weak_sched(&self) -> std::sync::Weak<SchedulerInner> {
        Arc::downgrade(&self.inner.sched)
    }

    pub fn tag_collection<T: Tag>(&self, name: &str) -> TagCollection<T> {
        self.tag_collection_with(name, DefaultTagTuner)
    }

    pub fn tag_collection_with<T, Tu>(&self, name: &str, tuner: Tu) -> TagCollection<T>
    where
        T: Tag,
        Tu: TagTuner,
    {
        let tags = TagCollection::new(self.inner.next_id(), name, tuner, self.weak_sched());
        self.inner.router.register(tags.distributable());
        log::debug!("Tag collection '{}' is {}", name, tags.id());
        tags
    }

    pub fn item_collection<K: Tag, V: Value>(&self, name: &str) -> ItemCollection<K, V> {
        self.item_collection_with(name, DefaultItemTuner)
    }

    pub fn item_collection_with<K, V, Tu>(&self, name: &str, tuner: Tu) -> ItemCollection<K, V, Tu>
    where
        K: Tag,
        V: Value,
        Tu: ItemTuner<K, V>,
    {
        let items = ItemCollection::new(self.inner.next_id(), name, tuner, self.weak_sched());
        self.inner.router.register(items.distributable());
        log::debug!("Item collection '{}' is {}", name, items.id());
        items
    }

    pub fn step_collection<T: Tag, S: Step<T>>(&self, name: &str, step: S) -> StepCollection<T> {
        self.step_collection_with(name, step, DefaultTuner)
    }

    pub fn step_collection_with<T, S, Tu>(
        &self,
        name: &str,
        step: S,
        tuner: Tu,
    ) -> StepCollection<T>
    where
        T: Tag,
        S: Step<T>,
        Tu: StepTuner<T>,
    {
        let steps = StepCollection::new(self.inner.next_id(), name, step, tuner, self.weak_sched());
        self.inner.router.register(steps.distributable());
        log::debug!("Step collection '{}' is {}", name, steps.id());
        steps
    }

    /// Blocks until the graph is quiescent: nothing in flight, the side
    /// queues drained and every hidden graph idle.
    pub fn wait(&self) {
        self.inner.wait();
    }

    pub fn register_hidden_graph(&self, graph: Arc<dyn HiddenGraph>) {
        self.inner.sched.register_hidden_graph(graph);
    }

    /// Replays a message from another process into this context.
    pub fn receive_message(&self, message: &Message) -> Result<(), DistError> {
        self.inner.receive_message(message)
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.inner.sched.clone())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.sched.stats()
    }

    /// Descriptions of step instances still parked.
    pub fn unfinished(&self) -> Vec<String> {
        self.inner.sched.unfinished()
    }

    pub fn topology(&self) -> Topology {
        self.inner.sched.topology()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

/// Builds a [`Context`]. Setters override environment variables, which
/// override the config file, which overrides the defaults.
#[derive(Default)]
pub struct ContextBuilder {
    config: Option<Config>,
    config_file: Option<PathBuf>,
    ignore_env: bool,
    num_threads: Option<usize>,
    grain: Option<Grain>,
    wait_poll_ms: Option<u64>,
    pool: Option<Arc<dyn WorkerPool>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base configuration, used instead of a config file.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Skip the `TUPLEX_*` environment variables.
    pub fn ignore_env(mut self) -> Self {
        self.ignore_env = true;
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    pub fn grain(mut self, grain: Grain) -> Self {
        self.grain = Some(grain);
        self
    }

    pub fn wait_poll_ms(mut self, ms: u64) -> Self {
        self.wait_poll_ms = Some(ms);
        self
    }

    /// Runs instances on `pool` instead of a pool owned by the context.
    pub fn pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Context, RuntimeError> {
        let mut config = match (self.config, self.config_file) {
            (Some(config), _) => config,
            (None, Some(path)) => Config::from_file(path)?,
            (None, None) => Config::default(),
        };
        if !self.ignore_env {
            config = config.apply_env()?;
        }
        if let Some(n) = self.num_threads {
            config.num_threads = n;
        }
        if let Some(g) = self.grain {
            config.default_grain = g;
        }
        if let Some(ms) = self.wait_poll_ms {
            config.wait_poll_ms = ms;
        }

        let pool: Arc<dyn WorkerPool> = match self.pool {
            Some(pool) => pool,
            None => Arc::new(ThreadPool::with_name_prefix(
                config.worker_threads(),
                &config.thread_name_prefix,
            )?),
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalTransport) as Arc<dyn Transport>);

        let sched = SchedulerInner::new(pool, transport, &config);
        let router = Router::default();
        router.register(sched.clone());

        log::info!(
            "Context started: process {} of {}, {} workers",
            sched.topology().local,
            sched.topology().processes,
            sched.num_workers()
        );
        Ok(Context {
            inner: Arc::new(ContextInner {
                sched,
                router,
                config,
                next_id: AtomicU32::new(1),
            }),
        })
    }
}
