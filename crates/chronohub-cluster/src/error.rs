//! Error types for chronohub cluster coordination

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Lock {name} is held by {holder}")]
    LockHeld { name: String, holder: String },

    #[error("Invalid cluster event: {0}")]
    InvalidEvent(String),

    #[error("Coordination service error: {0}")]
    Coordination(String),
}
