//! Fixtures shared by the unit tests.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use object_store::memory::InMemory;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use chronohub_cluster::{ClusterEvent, ClusterState};
use chronohub_core::{time, Content, ContentKey, DirectionQuery, TimeQuery};

use crate::dao::ContentDao;
use crate::error::{Error, Result};
use crate::long_term::{ObjectClient, S3BatchContentDao, S3SingleContentDao};
use crate::spoke::{FileSpokeStore, LocalSpokeNode, SpokeContentDao, SpokeNodes};

/// One-node fast tier over a temp directory. The node joined five minutes ago.
pub(crate) async fn create_spoke(ttl_minutes: u32) -> (Arc<SpokeContentDao>, Arc<FileSpokeStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSpokeStore::new("write", dir.path()));
    let nodes = Arc::new(SpokeNodes::new());
    nodes.register(Arc::new(LocalSpokeNode::new("node-1", store.clone())));
    let cluster = Arc::new(ClusterState::new(
        "node-1",
        3,
        ChronoDuration::minutes(ttl_minutes as i64),
    ));
    cluster
        .record([ClusterEvent::added("node-1", time::now() - ChronoDuration::minutes(5))])
        .await;
    let dao = SpokeContentDao::new("spoke_write", cluster, nodes, ttl_minutes, Duration::from_secs(2));
    (Arc::new(dao), store, dir)
}

pub(crate) fn create_client() -> ObjectClient {
    ObjectClient::new(Arc::new(InMemory::new()), 3)
}

pub(crate) fn create_single() -> Arc<S3SingleContentDao> {
    Arc::new(S3SingleContentDao::new(create_client(), 1000, 31))
}

pub(crate) fn create_batch() -> Arc<S3BatchContentDao> {
    Arc::new(S3BatchContentDao::new(create_client(), 1000, 31))
}

/// Fails the first `failures` calls of every operation, then delegates.
pub(crate) struct FlakyDao {
    inner: Arc<dyn ContentDao>,
    failures: AtomicU32,
}

impl FlakyDao {
    pub(crate) fn new(inner: Arc<dyn ContentDao>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }

    fn check(&self) -> Result<()> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(Error::Timeout("flaky store".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ContentDao for FlakyDao {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn insert(&self, channel: &str, content: Content) -> Result<ContentKey> {
        self.check()?;
        self.inner.insert(channel, content).await
    }

    async fn get(&self, channel: &str, key: &ContentKey) -> Result<Option<Content>> {
        self.check()?;
        self.inner.get(channel, key).await
    }

    async fn query_by_time(&self, query: &TimeQuery) -> Result<BTreeSet<ContentKey>> {
        self.check()?;
        self.inner.query_by_time(query).await
    }

    async fn query_direction(&self, query: &DirectionQuery) -> Result<BTreeSet<ContentKey>> {
        self.check()?;
        self.inner.query_direction(query).await
    }

    async fn delete_channel(&self, channel: &str) -> Result<()> {
        self.check()?;
        self.inner.delete_channel(channel).await
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub(crate) async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
