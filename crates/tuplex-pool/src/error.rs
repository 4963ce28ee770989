use thiserror::Error;

/// Errors raised while bringing the pool up.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool needs at least one thread")]
    NoWorkers,

    #[error("Failed to spawn worker thread {index}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}
