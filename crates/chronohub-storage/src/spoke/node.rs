//! Transport seam between the ring-routed DAO and the stores on each node.
//!
//! The DAO only speaks [`SpokeNode`]. In a single process every node is a [`LocalSpokeNode`];
//! a networked deployment registers remote implementations under the same server ids the ring
//! hands out.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use chronohub_core::ContentKey;

use super::store::FileSpokeStore;
use crate::error::Result;

#[async_trait]
pub trait SpokeNode: Send + Sync {
    fn server_id(&self) -> &str;

    async fn write(&self, channel: &str, key: &ContentKey, bytes: Bytes) -> Result<()>;

    async fn read(&self, channel: &str, key: &ContentKey) -> Result<Option<Bytes>>;

    async fn query(
        &self,
        channel: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>>;

    async fn next(
        &self,
        channel: &str,
        start_key: &ContentKey,
        count: usize,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>>;

    async fn previous(
        &self,
        channel: &str,
        start_key: &ContentKey,
        count: usize,
        earliest: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>>;

    async fn latest(&self, channel: &str, limit: &ContentKey) -> Result<Option<ContentKey>>;

    async fn delete(&self, channel: &str, key: &ContentKey) -> Result<()>;

    async fn delete_channel(&self, channel: &str) -> Result<()>;
}

/// A node whose store lives in this process.
pub struct LocalSpokeNode {
    server_id: String,
    store: Arc<FileSpokeStore>,
}

impl LocalSpokeNode {
    pub fn new(server_id: impl Into<String>, store: Arc<FileSpokeStore>) -> Self {
        Self {
            server_id: server_id.into(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<FileSpokeStore> {
        &self.store
    }
}

#[async_trait]
impl SpokeNode for LocalSpokeNode {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn write(&self, channel: &str, key: &ContentKey, bytes: Bytes) -> Result<()> {
        self.store.write(channel, key, &bytes).await
    }

    async fn read(&self, channel: &str, key: &ContentKey) -> Result<Option<Bytes>> {
        self.store.read(channel, key).await
    }

    async fn query(
        &self,
        channel: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>> {
        self.store.query(channel, start, end).await
    }

    async fn next(
        &self,
        channel: &str,
        start_key: &ContentKey,
        count: usize,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>> {
        self.store.next(channel, start_key, count, end).await
    }

    async fn previous(
        &self,
        channel: &str,
        start_key: &ContentKey,
        count: usize,
        earliest: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>> {
        self.store.previous(channel, start_key, count, earliest).await
    }

    async fn latest(&self, channel: &str, limit: &ContentKey) -> Result<Option<ContentKey>> {
        self.store.latest(channel, limit).await
    }

    async fn delete(&self, channel: &str, key: &ContentKey) -> Result<()> {
        self.store.delete(channel, key).await
    }

    async fn delete_channel(&self, channel: &str) -> Result<()> {
        self.store.delete_channel(channel).await
    }
}

/// Server id to node lookup.
#[derive(Default)]
pub struct SpokeNodes {
    nodes: DashMap<String, Arc<dyn SpokeNode>>,
}

impl SpokeNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<dyn SpokeNode>) {
        self.nodes.insert(node.server_id().to_string(), node);
    }

    pub fn remove(&self, server_id: &str) -> Option<Arc<dyn SpokeNode>> {
        self.nodes.remove(server_id).map(|(_, node)| node)
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<dyn SpokeNode>> {
        self.nodes.get(server_id).map(|node| node.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<dyn SpokeNode>> {
        self.nodes.iter().map(|node| node.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
