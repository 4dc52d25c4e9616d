use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::{DataTooLarge, WorkId};

/// Failures of the durable record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store snapshot could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("work {0} already exists")]
    DuplicateId(WorkId),

    #[error("work {0} does not exist")]
    Missing(WorkId),

    /// Test hook: a commit was told to fail.
    #[error("injected store failure")]
    Injected,
}

#[derive(Debug, Error)]
pub enum WorkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("work not found: {0}")]
    NotFound(WorkId),

    #[error("prerequisite not found: {0}")]
    PrerequisiteNotFound(WorkId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("input of work {id} is too large: {source}")]
    DataTooLarge {
        id: WorkId,
        #[source]
        source: DataTooLarge,
    },

    #[error("duplicate worker for name={0}")]
    DuplicateWorker(String),

    #[error("no tokio runtime available; build the manager from inside a runtime")]
    NoRuntime,

    #[error("missing workers: {0:?}. These workers were expected but not registered.")]
    MissingWorkers(Vec<String>),
}
