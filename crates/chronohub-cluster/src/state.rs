//! Node-local view of cluster membership.

use chrono::Duration;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use chronohub_core::time;

use crate::event::ClusterEvent;
use crate::ring::SpokeRings;

/// Holds the membership event log and the ring history derived from it.
///
/// Readers take an `Arc` snapshot of the rings and never wait on a recompute.
pub struct ClusterState {
    server_id: String,
    replicas: usize,
    spoke_ttl: Duration,
    events: RwLock<BTreeSet<ClusterEvent>>,
    rings: RwLock<Arc<SpokeRings>>,
}

impl ClusterState {
    pub fn new(server_id: impl Into<String>, replicas: usize, spoke_ttl: Duration) -> Self {
        Self {
            server_id: server_id.into(),
            replicas,
            spoke_ttl,
            events: RwLock::new(BTreeSet::new()),
            rings: RwLock::new(Arc::new(SpokeRings::new(replicas, spoke_ttl))),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub async fn rings(&self) -> Arc<SpokeRings> {
        self.rings.read().await.clone()
    }

    pub async fn events(&self) -> Vec<ClusterEvent> {
        self.events.read().await.iter().cloned().collect()
    }

    /// Appends events from the membership feed, recomputes the rings and prunes the log.
    pub async fn record(&self, new_events: impl IntoIterator<Item = ClusterEvent>) {
        let mut events = self.events.write().await;
        events.extend(new_events);

        let mut rings = SpokeRings::new(self.replicas, self.spoke_ttl);
        let kept = rings.process(events.iter().cloned());
        let pruned = events.len() - kept.len();
        *events = kept.into_iter().collect();

        let servers = rings.all_servers();
        *self.rings.write().await = Arc::new(rings);

        debug!(
            server_id = %self.server_id,
            members = servers.len(),
            pruned,
            "Cluster rings recomputed"
        );
    }

    /// Announces this node as a member.
    pub async fn register(&self) {
        info!(server_id = %self.server_id, "Registering with cluster");
        self.record([ClusterEvent::added(self.server_id.clone(), time::now())])
            .await;
    }

    pub async fn deregister(&self) {
        info!(server_id = %self.server_id, "Leaving cluster");
        self.record([ClusterEvent::removed(self.server_id.clone(), time::now())])
            .await;
    }
}
