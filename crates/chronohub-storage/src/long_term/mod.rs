//! Long-term tier: durable object storage.
//!
//! | Store | Layout |
//! |-------|--------|
//! | [`S3SingleContentDao`] | `{channel}/{key url}` |
//! | [`S3BatchContentDao`] | `{channel}Batch/items/{minute}` + `{channel}Batch/index/{minute}` |
//! | [`S3LargeContentDao`] | `{channel}Large/{key url}` |
//!
//! All three go through [`ObjectClient`], which adds retries to any `object_store` backend.

pub mod batch;
pub mod large;
pub mod object;
pub mod single;

pub use batch::{BatchIndex, S3BatchContentDao};
pub use large::S3LargeContentDao;
pub use object::ObjectClient;
pub use single::S3SingleContentDao;
