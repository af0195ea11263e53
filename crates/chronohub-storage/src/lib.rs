//! Chronohub Storage Engine
//!
//! Tiered storage for the chronohub event hub: where each item lives over its lifetime, how it
//! gets there, and how every read finds it again.
//!
//! ## Tiers
//!
//! ```text
//!             insert
//!               │
//!               ▼
//! ┌──────────────────────────┐   write queue (async copy)   ┌──────────────────────┐
//! │  Fast tier ("spoke")     │ ───────────────────────────► │  Long-term single    │
//! │  - replicated on a ring  │                              │  one object per item │
//! │  - quorum writes         │   batch archiver (minutes)   ├──────────────────────┤
//! │  - TTL bounded           │ ───────────────────────────► │  Long-term batch     │
//! └────────────┬─────────────┘                              │  archive + index     │
//!              │                                            ├──────────────────────┤
//!              │ verifier: finds keys missing from single   │  Long-term large     │
//!              └──────────── and resubmits them             │  oversized payloads  │
//!                                                           └──────────────────────┘
//! ```
//!
//! Every item is written to the fast tier first and acknowledged once a majority of its ring
//! owners have it. Channels in SINGLE or BOTH mode are then copied item by item to the single
//! store by the [`WriteQueue`]; BATCH channels are archived a whole minute at a time by the
//! [`BatchArchiver`]. The [`Verifier`] compares the fast tier against the single store and
//! repairs whatever the queue dropped, so long-term storage converges even when the queue
//! overflows or a node restarts.
//!
//! ## Reads
//!
//! [`ClusterContentService`] routes each call: recent keys come from the fast tier, older keys
//! from the long-term layout the channel uses. Queries that span tiers fan out concurrently and
//! fail closed; a store that times out or errors makes the whole query fail instead of
//! returning a silently short answer.
//!
//! ## Main Components
//!
//! - [`spoke`]: fast tier stores, ring routing and TTL enforcement
//! - [`long_term`]: object store DAOs for the single, batch and large layouts
//! - [`codec`]: the item and minute archive formats
//! - [`write_queue`], [`verifier`], [`batch_archiver`]: background movement between tiers
//! - [`latest_cache`]: latest key per channel
//! - [`runtime`]: builds and runs all of the above for one node

pub mod batch_archiver;
pub mod channels;
pub mod codec;
pub mod config;
pub mod dao;
pub mod error;
pub mod fanout;
pub mod latest_cache;
pub mod long_term;
pub mod runtime;
pub mod service;
pub mod spoke;
pub mod verifier;
pub mod write_queue;

#[cfg(test)]
mod testing;

pub use batch_archiver::BatchArchiver;
pub use channels::{ChannelConfigProvider, InMemoryChannelRegistry};
pub use config::{
    BatchConfig, ClusterConfig, ContentConfig, HubConfig, S3Config, SpokeConfig, VerifierConfig,
    WriteQueueConfig,
};
pub use dao::{BatchContentDao, ContentDao};
pub use error::{Error, Result};
pub use latest_cache::{InMemoryLatestCache, LatestContentCache};
pub use long_term::{ObjectClient, S3BatchContentDao, S3LargeContentDao, S3SingleContentDao};
pub use runtime::{object_store_from_config, StorageRuntime};
pub use service::{ClusterContentService, ContentTiers};
pub use spoke::{FileSpokeStore, LocalSpokeNode, SpokeContentDao, SpokeNode, SpokeNodes, SpokeTtlEnforcer};
pub use verifier::{InMemoryWatermarks, Verifier, VerifierRange, VerifierState, WatermarkStore};
pub use write_queue::{WriteQueue, WriteQueueStats};
