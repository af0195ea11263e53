//! Integration tests for routing between the fast tier and long-term storage

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration as ChronoDuration;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use chronohub_cluster::{ClusterEvent, ClusterState, InMemoryLock};
use chronohub_core::{
    time, ChannelConfig, Content, ContentKey, DirectionQuery, StorageMode, TimePath, TimeQuery,
    TimeUnit,
};
use chronohub_storage::{
    BatchArchiver, BatchConfig, ClusterContentService, ContentConfig, ContentDao, ContentTiers,
    Error, FileSpokeStore, InMemoryChannelRegistry, InMemoryLatestCache, InMemoryWatermarks,
    LatestContentCache, LocalSpokeNode, ObjectClient, Result, S3BatchContentDao,
    S3LargeContentDao, S3SingleContentDao, SpokeContentDao, SpokeNodes, WriteQueue,
    WriteQueueConfig,
};

struct Hub {
    service: ClusterContentService,
    spoke_write: Arc<SpokeContentDao>,
    single: Arc<S3SingleContentDao>,
    batch: Arc<S3BatchContentDao>,
    queue: Arc<WriteQueue>,
    registry: Arc<InMemoryChannelRegistry>,
    _dir: TempDir,
}

async fn create_spoke(dir: &TempDir, name: &'static str) -> Arc<SpokeContentDao> {
    let store = Arc::new(FileSpokeStore::new(name, dir.path().join(name)));
    let nodes = Arc::new(SpokeNodes::new());
    nodes.register(Arc::new(LocalSpokeNode::new("node-1", store)));
    let cluster = Arc::new(ClusterState::new("node-1", 3, ChronoDuration::minutes(60)));
    cluster
        .record([ClusterEvent::added("node-1", time::now() - ChronoDuration::minutes(5))])
        .await;
    let label = if name == "write" { "spoke_write" } else { "spoke_read" };
    Arc::new(SpokeContentDao::new(label, cluster, nodes, 60, Duration::from_secs(2)))
}

async fn create_hub_with(single: Option<Arc<dyn ContentDao>>) -> Hub {
    let dir = TempDir::new().unwrap();
    let spoke_write = create_spoke(&dir, "write").await;
    let spoke_read = create_spoke(&dir, "read").await;

    let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let client = ObjectClient::new(object_store, 3);
    let s3_single = Arc::new(S3SingleContentDao::new(client.clone(), 1000, 31));
    let batch = Arc::new(S3BatchContentDao::new(client.clone(), 1000, 31));
    let single = single.unwrap_or_else(|| s3_single.clone() as Arc<dyn ContentDao>);

    let queue_config = WriteQueueConfig {
        initial_backoff_ms: 10,
        poll_timeout_ms: 20,
        ..WriteQueueConfig::default()
    };
    let queue = Arc::new(WriteQueue::new(queue_config, spoke_write.clone(), single.clone()));
    let registry = Arc::new(InMemoryChannelRegistry::new());

    let tiers = ContentTiers {
        spoke_write: spoke_write.clone(),
        spoke_read,
        single,
        batch: batch.clone(),
        large: Arc::new(S3LargeContentDao::new(client)),
    };
    let service = ClusterContentService::new(
        ContentConfig::default(),
        60,
        registry.clone(),
        tiers,
        queue.clone(),
        Arc::new(InMemoryLatestCache::new()),
        Arc::new(InMemoryWatermarks::new()),
    );

    Hub {
        service,
        spoke_write,
        single: s3_single,
        batch,
        queue,
        registry,
        _dir: dir,
    }
}

async fn create_hub() -> Hub {
    create_hub_with(None).await
}

async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn create_archiver(hub: &Hub) -> BatchArchiver {
    BatchArchiver::new(
        BatchConfig::default(),
        60,
        hub.spoke_write.clone(),
        hub.batch.clone(),
        Arc::new(InMemoryWatermarks::new()),
        Arc::new(InMemoryLock::new()),
        "node-1",
        Duration::from_secs(10),
    )
}

/// Always fails, standing in for an unreachable long-term store.
struct UnavailableDao;

#[async_trait]
impl ContentDao for UnavailableDao {
    fn name(&self) -> &'static str {
        "unavailable"
    }
    async fn insert(&self, _: &str, _: Content) -> Result<ContentKey> {
        Err(Error::Timeout("unavailable".to_string()))
    }
    async fn get(&self, _: &str, _: &ContentKey) -> Result<Option<Content>> {
        Err(Error::Timeout("unavailable".to_string()))
    }
    async fn query_by_time(&self, _: &TimeQuery) -> Result<BTreeSet<ContentKey>> {
        Err(Error::Timeout("unavailable".to_string()))
    }
    async fn query_direction(&self, _: &DirectionQuery) -> Result<BTreeSet<ContentKey>> {
        Err(Error::Timeout("unavailable".to_string()))
    }
    async fn delete_channel(&self, _: &str) -> Result<()> {
        Err(Error::Timeout("unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_both_mode_read_falls_through_tiers() {
    let hub = create_hub().await;
    hub.registry.upsert(
        ChannelConfig::new("both")
            .with_storage(StorageMode::Both)
            .with_spoke_ttl_minutes(10),
    );
    let key = ContentKey::from_url("2024/01/01/00/00/00/000/abc").unwrap();
    let payload = Bytes::from_static(b"first event of 2024");

    hub.service
        .insert("both", Content::new(payload.clone()).with_key(key.clone()))
        .await
        .unwrap();
    let content = hub.service.get("both", &key, false).await.unwrap().unwrap();
    assert_eq!(content.data(), &payload);
    assert!(hub.service.get("both", &key, true).await.unwrap().is_none());

    hub.queue.start().await.unwrap();
    let single = hub.single.clone();
    assert!(
        wait_for(|| {
            let single = single.clone();
            let key = key.clone();
            async move { matches!(single.get("both", &key).await, Ok(Some(_))) }
        })
        .await
    );

    // expire it from the fast tier
    hub.spoke_write.delete("both", &key).await.unwrap();
    let content = hub.service.get("both", &key, false).await.unwrap().unwrap();
    assert_eq!(content.data(), &payload);
    assert_eq!(content.key(), Some(&key));

    hub.queue.shutdown().await;
}

#[tokio::test]
async fn test_single_write_is_idempotent() {
    let hub = create_hub().await;
    let key = ContentKey::with_time(time::now() - ChronoDuration::hours(3));

    hub.single
        .insert("orders", Content::new("v1").with_key(key.clone()))
        .await
        .unwrap();
    hub.single
        .insert("orders", Content::new("v1").with_key(key.clone()))
        .await
        .unwrap();

    let keys = hub
        .single
        .query_by_time(&TimeQuery::new("orders", key.time(), TimeUnit::Minutes))
        .await
        .unwrap();
    assert_eq!(keys, BTreeSet::from([key.clone()]));
    let content = hub.single.get("orders", &key).await.unwrap().unwrap();
    assert_eq!(content.data().as_ref(), b"v1");
}

#[tokio::test]
async fn test_batch_seconds_query_filters_minute() {
    let hub = create_hub().await;
    hub.registry
        .upsert(ChannelConfig::new("metrics").with_storage(StorageMode::Batch));

    let minute = TimePath::minute(time::now() - ChronoDuration::minutes(5));
    let keys: Vec<ContentKey> = [10, 20, 30]
        .iter()
        .map(|s| ContentKey::with_time(minute.start() + ChronoDuration::seconds(*s)))
        .collect();
    for key in &keys {
        hub.spoke_write
            .insert("metrics", Content::new("sample").with_key(key.clone()))
            .await
            .unwrap();
    }
    assert_eq!(create_archiver(&hub).archive_minute("metrics", &minute).await.unwrap(), 3);

    let second = TimeQuery::new("metrics", keys[1].time(), TimeUnit::Seconds);
    assert_eq!(
        hub.batch.query_by_time(&second).await.unwrap(),
        BTreeSet::from([keys[1].clone()])
    );
    let whole = TimeQuery::new("metrics", minute.start(), TimeUnit::Minutes);
    assert_eq!(hub.batch.query_by_time(&whole).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_get_many_streams_archived_minute() {
    let hub = create_hub().await;
    hub.registry.upsert(
        ChannelConfig::new("metrics")
            .with_storage(StorageMode::Batch)
            .with_spoke_ttl_minutes(1),
    );
    let minute = TimePath::minute(time::now() - ChronoDuration::minutes(5));
    let mut keys = BTreeSet::new();
    for (i, s) in [5, 15, 25].iter().enumerate() {
        let key = ContentKey::with_time(minute.start() + ChronoDuration::seconds(*s));
        hub.spoke_write
            .insert("metrics", Content::new(format!("item-{i}")).with_key(key.clone()))
            .await
            .unwrap();
        keys.insert(key);
    }
    create_archiver(&hub).archive_minute("metrics", &minute).await.unwrap();
    hub.spoke_write.delete_channel("metrics").await.unwrap();

    let mut seen = Vec::new();
    hub.service
        .get_many("metrics", &keys, true, |content| {
            seen.push(String::from_utf8_lossy(content.data()).into_owned())
        })
        .await
        .unwrap();
    assert_eq!(seen, vec!["item-2", "item-1", "item-0"]);
}

#[tokio::test]
async fn test_query_fails_closed_when_store_fails() {
    let hub = create_hub_with(Some(Arc::new(UnavailableDao))).await;
    hub.registry.upsert(ChannelConfig::new("orders"));
    hub.service.insert("orders", Content::new("recent")).await.unwrap();

    let old = TimeQuery::new("orders", time::now() - ChronoDuration::days(2), TimeUnit::Hours);
    let err = hub.service.query_by_time(&old).await.unwrap_err();
    assert!(err.is_incomplete());

    let previous = DirectionQuery::new("orders", ContentKey::last_key(time::now()), 10, false);
    assert!(hub.service.query_direction(&previous).await.unwrap_err().is_incomplete());

    // the fast tier alone still answers
    let recent = TimeQuery::new("orders", time::now(), TimeUnit::Minutes)
        .with_stable(false)
        .with_location(chronohub_core::Location::Cache);
    assert!(hub.service.query_by_time(&recent).await.is_ok());
}

#[tokio::test]
async fn test_latest_cache_only_moves_forward() {
    let cache = Arc::new(InMemoryLatestCache::new());
    let now = time::now();
    let keys: Vec<ContentKey> = (0..50)
        .map(|i| ContentKey::with_time(now - ChronoDuration::seconds(i)))
        .collect();
    let newest = keys[0].clone();

    let mut handles = Vec::new();
    for key in keys.into_iter().rev() {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.set_if_after("orders", key).await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(cache.get_latest("orders").await, Some(newest.clone()));
    assert!(!cache.set_if_after("orders", ContentKey::with_time(now - ChronoDuration::hours(1))).await);
    assert_eq!(cache.get_latest("orders").await, Some(newest));
}
