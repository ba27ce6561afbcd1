//! Error types for the run orchestrator.
//!
//! Component errors convert into `MonitorError` so a tick can use `?`
//! for the store, and decide per call site whether a blob or stats
//! failure is fatal for the tick or only logged.

use std::io;

use thiserror::Error;

use crate::external::{BlobError, QueueError, StoreError};
use crate::models::RunId;
use crate::stats::StatsError;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("Work queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Stats compilation failed: {0}")]
    Stats(#[from] StatsError),

    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid setting '{key}': {message}")]
    InvalidSetting { key: String, message: String },

    /// Another tick or retry holds the run.
    #[error("Run {0} is already being processed")]
    RunBusy(RunId),
}

impl MonitorError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_setting(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            message: message.into(),
        }
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;
