//! Chronohub Core
//!
//! Shared types for the chronohub tiered storage engine.
//!
//! Every item stored in a channel is identified by a [`ContentKey`]: a millisecond timestamp
//! plus a short disambiguating hash. Keys are totally ordered by `(time, hash)` and render to a
//! fixed-width path segment that doubles as the storage location in every tier:
//!
//! ```text
//!   2024/01/01/00/00/00/000/abc
//!   ─┬── ─┬ ─┬ ─┬ ─┬ ─┬ ─┬─ ─┬─
//!    │    │  │  │  │  │  │   └── hash
//!    │    │  │  │  │  │  └────── millis
//!    │    │  │  │  │  └───────── second   (SECONDS bucket ends here)
//!    │    │  │  │  └──────────── minute   (MINUTES bucket, batch granularity)
//!    │    │  │  └─────────────── hour
//!    │    │  └────────────────── day
//!    └────┴───────────────────── year / month
//! ```
//!
//! [`TimePath`] names a whole bucket of that tree, and the query types describe what callers ask
//! the storage layer for.

pub mod channel;
pub mod content;
pub mod error;
pub mod key;
pub mod path;
pub mod query;
pub mod time;

pub use channel::{ChannelConfig, StorageMode};
pub use content::{Content, LargeIndex, LARGE_INDEX_CONTENT_TYPE};
pub use error::{Error, Result};
pub use key::{ChannelContentKey, ContentKey};
pub use path::{segment_range, TimePath, TimeUnit};
pub use query::{DirectionQuery, Epoch, Location, QueryResult, TimeQuery};
