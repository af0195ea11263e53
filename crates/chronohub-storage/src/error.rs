//! Storage Error Types
//!
//! "Not found" is not an error anywhere in this crate: lookups return `Ok(None)` and queries
//! return an empty set. Errors fall into a few groups:
//!
//! - **Incomplete queries**: `QueryFailed` and `Timeout` mean at least one contributing store
//!   could not answer, so the caller cannot tell whether data exists.
//! - **Tier failures**: object store, filesystem and fast tier quorum errors. Background writers
//!   retry these; callers on the write path see them only when the fast tier itself fails.
//! - **Caller errors**: unknown channels, unsupported operations and invalid requests.
//! - **Corruption**: stored bytes that fail validation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Query {operation} incomplete: {failed} of {expected} stores failed")]
    QueryFailed {
        operation: String,
        failed: usize,
        expected: usize,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No fast tier servers for channel {0}")]
    NoServers(String),

    #[error("Unknown fast tier node: {0}")]
    UnknownNode(String),

    #[error("Fast tier quorum not reached: {acked} of {required} acknowledgements")]
    QuorumNotReached { required: usize, acked: usize },

    #[error("Operation not supported by {store}: {operation}")]
    Unsupported {
        store: &'static str,
        operation: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Content error: {0}")]
    Core(#[from] chronohub_core::Error),

    #[error("Cluster error: {0}")]
    Cluster(#[from] chronohub_cluster::ClusterError),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn unsupported(store: &'static str, operation: &'static str) -> Self {
        Error::Unsupported { store, operation }
    }

    /// True when the caller cannot tell whether the data exists.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::QueryFailed { .. } | Error::Timeout(_))
    }
}
