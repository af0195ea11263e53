//! Fast tier: TTL-bounded local stores replicated across the ring.
//!
//! - [`FileSpokeStore`]: the on-disk store of one node.
//! - [`SpokeNode`]: how the DAO reaches a node's store.
//! - [`SpokeContentDao`]: ring routing, write quorum and fail-closed queries.
//! - [`SpokeTtlEnforcer`]: periodic expiry.

pub mod content_dao;
pub mod node;
pub mod store;
pub mod ttl;

pub use content_dao::SpokeContentDao;
pub use node::{LocalSpokeNode, SpokeNode, SpokeNodes};
pub use store::FileSpokeStore;
pub use ttl::{SpokeTtlEnforcer, TtlPass};
