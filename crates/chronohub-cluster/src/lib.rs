//! Chronohub Cluster
//!
//! Membership and coordination for the nodes that share the fast tier.
//!
//! ## Spoke rings
//!
//! Every node writes recent items to the fast tier ("spoke") of a handful of peers. Which peers
//! own a channel is decided by hashing the channel name onto the ring of live members:
//!
//! ```text
//!            A
//!         .     .
//!       E    ●────── hash("orders") lands here, owners = next 3 clockwise: B, C, D
//!       .         B
//!         D     C
//! ```
//!
//! Membership changes over time, so [`SpokeRings`] keeps one ring per membership epoch, rebuilt
//! from the [`ClusterEvent`] log. A query for a past instant (or range) consults the ring(s) that
//! were active then, which is what lets readers and the verifier find items written before a
//! rolling restart.
//!
//! ## Leadership
//!
//! [`Leadership`] binds a [`LeaderTask`] to a [`DistributedLock`]. The task runs only while the
//! lease is held and is cancelled through its token when the lease is lost or the node shuts down.

pub mod error;
pub mod event;
pub mod leader;
pub mod ring;
pub mod state;

pub use error::{ClusterError, Result};
pub use event::{ClusterEvent, ClusterEventKind};
pub use leader::{DistributedLock, InMemoryLock, LeaderTask, Leadership};
pub use ring::{SpokeRing, SpokeRings, DEFAULT_REPLICAS};
pub use state::ClusterState;
