use miette::Diagnostic;
use thiserror::Error;

use crate::dist::MessageKind;
use crate::types::{CollectionId, ProcessId};

/// Signal raised by an item read whose value has not been produced yet.
///
/// This is control flow, not failure: the instance that hit it is parked
/// and re-run once the missing item arrives. Propagate it with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("item not available yet")]
pub struct NotReady;

/// Result of one activation of a step body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error(transparent)]
    NotReady(#[from] NotReady),

    /// The step cannot complete. Fatal: the runtime never retries logic errors.
    #[error("step failed: {0}")]
    Failed(String),
}

impl StepError {
    pub fn failed(reason: impl Into<String>) -> Self {
        StepError::Failed(reason.into())
    }
}

pub type StepResult = Result<(), StepError>;

/// Errors raised while starting or wiring a context.
#[derive(Debug, Error, Diagnostic)]
pub enum RuntimeError {
    #[error("Failed to start the worker pool")]
    #[diagnostic(
        code(tuplex::runtime::pool),
        help("Check the configured thread count and the process thread limit")
    )]
    Pool(#[from] tuplex_pool::PoolError),

    #[error("Tag collection '{tags}' already prescribes {limit} step collections")]
    #[diagnostic(
        code(tuplex::runtime::prescriptions),
        help("Split the tag collection, or merge step collections that share a tuner")
    )]
    TooManyPrescriptions { tags: String, limit: usize },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dist(#[from] DistError),
}

/// Integrity errors on the distribution boundary.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum DistError {
    #[error("No collection with id {0} in this context")]
    #[diagnostic(
        code(tuplex::dist::unknown_collection),
        help("Every process must create its collections in the same order")
    )]
    UnknownCollection(CollectionId),

    #[error("Payload for collection {collection} is not a {expected}")]
    #[diagnostic(code(tuplex::dist::payload))]
    PayloadMismatch {
        collection: CollectionId,
        expected: &'static str,
    },

    #[error("Collection {collection} does not accept {kind:?} messages")]
    #[diagnostic(code(tuplex::dist::kind))]
    UnexpectedKind {
        collection: CollectionId,
        kind: MessageKind,
    },

    #[error("Process {0} is not part of this topology")]
    #[diagnostic(code(tuplex::dist::no_such_process))]
    NoSuchProcess(ProcessId),

    #[error("Process {0} has shut down")]
    #[diagnostic(code(tuplex::dist::disconnected))]
    Disconnected(ProcessId),
}

/// Errors raised while loading a [`Config`](crate::Config).
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("Failed to read config file {path}")]
    #[diagnostic(code(tuplex::config::read))]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    #[diagnostic(
        code(tuplex::config::parse),
        help("Accepted keys are the fields of tuplex_rt::Config")
    )]
    Parse(String),

    #[error("Invalid value '{value}' for {var}: {reason}")]
    #[diagnostic(code(tuplex::config::env))]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Logs a protocol violation or step failure and aborts the process.
///
/// Recovering from these would leave get-counts, suspend counters or
/// memoization state inconsistent.
#[cold]
pub(crate) fn fatal(context: &str, detail: impl std::fmt::Display) -> ! {
    log::error!("fatal: {}: {}", context, detail);
    std::process::abort()
}
