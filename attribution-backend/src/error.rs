//! Error types for the infrastructure around the engine.
//!
//! The engine pipeline itself never fails: storage and send problems are
//! folded into result statuses. These errors only exist at the edges.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid value: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{name} contains an unsuitable origin: {value:?}")]
    InvalidOrigin { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored value is invalid: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("aggregation service unavailable")]
    ServiceUnavailable,

    #[error("could not build assembly request: {0}")]
    InvalidRequest(String),

    #[error("assembly failed: {0}")]
    AssemblyFailed(String),
}

impl AssemblyError {
    /// Only a failure inside the aggregation service is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, AssemblyError::AssemblyFailed(_))
    }
}
