use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid content key: {0}")]
    InvalidKey(String),

    #[error("Invalid large payload index: {0}")]
    InvalidIndex(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
