//! Wiring for one storage node.
//!
//! [`StorageRuntime`] builds every tier from a [`HubConfig`], owns the background work (write
//! queue workers, TTL enforcers, the verifier leadership loop and batch archival) and tears it
//! down in order on shutdown: the write queue drains first so accepted writes still reach
//! long-term storage.

use chrono::Duration as ChronoDuration;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chronohub_cluster::{ClusterState, DistributedLock, LeaderTask, Leadership};
use chronohub_core::ChannelConfig;
use chronohub_observability::metrics::RING_MEMBERS;

use crate::batch_archiver::BatchArchiver;
use crate::channels::ChannelConfigProvider;
use crate::config::{HubConfig, S3Config};
use crate::error::{Error, Result};
use crate::latest_cache::InMemoryLatestCache;
use crate::long_term::{ObjectClient, S3BatchContentDao, S3LargeContentDao, S3SingleContentDao};
use crate::service::{ClusterContentService, ContentTiers};
use crate::spoke::{FileSpokeStore, LocalSpokeNode, SpokeContentDao, SpokeNode, SpokeNodes, SpokeTtlEnforcer};
use crate::verifier::{InMemoryWatermarks, Verifier, WatermarkStore};
use crate::write_queue::WriteQueue;

/// Object store for the long-term tier: a local directory when `local_path` is set, S3 otherwise.
pub fn object_store_from_config(config: &S3Config) -> Result<Arc<dyn ObjectStore>> {
    if let Some(path) = &config.local_path {
        std::fs::create_dir_all(path)?;
        info!(path = %path.display(), "Using local long-term storage");
        return Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?));
    }

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&config.bucket)
        .with_region(&config.region);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.with_endpoint(endpoint).with_allow_http(true);
    }
    info!(bucket = %config.bucket, region = %config.region, "Using S3 long-term storage");
    Ok(Arc::new(builder.build()?))
}

pub struct StorageRuntime {
    config: HubConfig,
    cluster: Arc<ClusterState>,
    lock: Arc<dyn DistributedLock>,
    channels: Arc<dyn ChannelConfigProvider>,
    write_store: Arc<FileSpokeStore>,
    read_store: Arc<FileSpokeStore>,
    write_nodes: Arc<SpokeNodes>,
    read_nodes: Arc<SpokeNodes>,
    write_queue: Arc<WriteQueue>,
    verifier: Arc<Verifier>,
    archiver: Option<Arc<BatchArchiver>>,
    service: Arc<ClusterContentService>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StorageRuntime {
    pub fn new(
        config: HubConfig,
        object_store: Arc<dyn ObjectStore>,
        channels: Arc<dyn ChannelConfigProvider>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        let server_id = config.cluster.server_id.clone();
        let cluster = Arc::new(ClusterState::new(
            server_id.clone(),
            config.spoke.replicas,
            ChronoDuration::minutes(config.spoke.write_ttl_minutes as i64),
        ));

        let write_store = Arc::new(FileSpokeStore::new("write", &config.spoke.write_path));
        let read_store = Arc::new(FileSpokeStore::new("read", &config.spoke.read_path));
        let write_nodes = Arc::new(SpokeNodes::new());
        write_nodes.register(Arc::new(LocalSpokeNode::new(server_id.clone(), write_store.clone())));
        let read_nodes = Arc::new(SpokeNodes::new());
        read_nodes.register(Arc::new(LocalSpokeNode::new(server_id.clone(), read_store.clone())));

        let spoke_write = Arc::new(SpokeContentDao::new(
            "spoke_write",
            cluster.clone(),
            write_nodes.clone(),
            config.spoke.write_ttl_minutes,
            config.spoke.timeout(),
        ));
        let spoke_read = Arc::new(SpokeContentDao::new(
            "spoke_read",
            cluster.clone(),
            read_nodes.clone(),
            config.spoke.read_ttl_minutes,
            config.spoke.timeout(),
        ));

        let client = ObjectClient::new(object_store, config.s3.request_retries);
        let single = Arc::new(S3SingleContentDao::new(
            client.clone(),
            config.s3.max_query_items,
            config.s3.max_scan_days,
        ));
        let batch = Arc::new(S3BatchContentDao::new(
            client.clone(),
            config.s3.max_query_items,
            config.s3.max_scan_days,
        ));
        let large = Arc::new(S3LargeContentDao::new(client));

        let write_queue = Arc::new(WriteQueue::new(
            config.write_queue.clone(),
            spoke_write.clone(),
            single.clone(),
        ));
        let watermarks: Arc<dyn WatermarkStore> = Arc::new(InMemoryWatermarks::new());
        let verifier = Arc::new(Verifier::new(
            config.verifier.clone(),
            config.spoke.write_ttl_minutes,
            channels.clone(),
            spoke_write.clone(),
            single.clone(),
            write_queue.clone(),
            watermarks.clone(),
        ));

        let lease_ttl = Duration::from_secs(config.cluster.lease_ttl_secs);
        let archiver = config.batch.enabled.then(|| {
            Arc::new(BatchArchiver::new(
                config.batch.clone(),
                config.spoke.write_ttl_minutes,
                spoke_write.clone(),
                batch.clone(),
                Arc::new(InMemoryWatermarks::new()),
                lock.clone(),
                server_id.clone(),
                lease_ttl,
            ))
        });

        let tiers = ContentTiers {
            spoke_write,
            spoke_read,
            single,
            batch,
            large,
        };
        let mut service = ClusterContentService::new(
            config.content.clone(),
            config.spoke.write_ttl_minutes,
            channels.clone(),
            tiers,
            write_queue.clone(),
            Arc::new(InMemoryLatestCache::new()),
            watermarks,
        );
        if let Some(archiver) = &archiver {
            service = service.with_archiver(archiver.clone());
        }

        Self {
            config,
            cluster,
            lock,
            channels,
            write_store,
            read_store,
            write_nodes,
            read_nodes,
            write_queue,
            verifier,
            archiver,
            service: Arc::new(service),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &Arc<ClusterContentService> {
        &self.service
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    pub fn archiver(&self) -> Option<&Arc<BatchArchiver>> {
        self.archiver.as_ref()
    }

    /// Makes a peer's fast tier stores reachable. The peer joins the rings through
    /// [`ClusterState::record`].
    pub fn register_peer(&self, write: Arc<dyn SpokeNode>, read: Arc<dyn SpokeNode>) {
        self.write_nodes.register(write);
        self.read_nodes.register(read);
    }

    pub fn remove_peer(&self, server_id: &str) {
        self.write_nodes.remove(server_id);
        self.read_nodes.remove(server_id);
    }

    /// Joins the cluster and starts background work.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        self.cluster.register().await;
        RING_MEMBERS.set(self.cluster.rings().await.all_servers().len() as i64);
        self.write_queue.start().await?;

        let interval = Duration::from_secs(self.config.spoke.ttl_enforcer_interval_secs);
        let mut tasks = self.tasks.lock().await;
        tasks.push(
            Arc::new(SpokeTtlEnforcer::new(
                self.write_store.clone(),
                self.channels.clone(),
                self.config.spoke.write_ttl_minutes,
                interval,
            ))
            .start(self.shutdown.child_token()),
        );
        tasks.push(
            Arc::new(
                SpokeTtlEnforcer::new(
                    self.read_store.clone(),
                    self.channels.clone(),
                    self.config.spoke.read_ttl_minutes,
                    interval,
                )
                .by_file_age(),
            )
            .start(self.shutdown.child_token()),
        );

        if self.config.verifier.enabled {
            let leadership = Leadership::new(
                self.lock.clone(),
                "verifier",
                self.cluster.server_id(),
                Duration::from_secs(self.config.cluster.lease_ttl_secs),
            );
            let task: Arc<dyn LeaderTask> = self.verifier.clone();
            let token = self.shutdown.child_token();
            tasks.push(tokio::spawn(async move { leadership.run(task, token).await }));
        }

        let mut archived = 0;
        if let Some(archiver) = &self.archiver {
            for config in self.channels.list_channels().await? {
                if config.writes_batch() {
                    archiver.start_channel(&config.name);
                    archived += 1;
                }
            }
        }

        info!(
            server_id = self.cluster.server_id(),
            verifier = self.config.verifier.enabled,
            batch_channels = archived,
            "Storage runtime started"
        );
        Ok(())
    }

    /// Forwards a channel config change to the service.
    pub async fn notify(&self, new: &ChannelConfig, old: Option<&ChannelConfig>) -> Result<()> {
        self.service.notify(new, old).await
    }

    /// Drains the write queue, stops background work and leaves the cluster.
    pub async fn shutdown(&self) {
        info!(
            pending = self.write_queue.len(),
            "Storage runtime shutting down"
        );
        self.write_queue.shutdown().await;
        if let Some(archiver) = &self.archiver {
            archiver.shutdown().await;
        }

        self.shutdown.cancel();
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.cluster.deregister().await;
        RING_MEMBERS.set(self.cluster.rings().await.all_servers().len() as i64);
        info!(server_id = self.cluster.server_id(), "Storage runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::InMemoryChannelRegistry;
    use crate::testing::eventually;
    use chronohub_cluster::InMemoryLock;
    use chronohub_core::{Content, StorageMode};
    use object_store::memory::InMemory;

    fn create_config(dir: &tempfile::TempDir) -> HubConfig {
        let mut config = HubConfig::default();
        config.cluster.server_id = "node-1".to_string();
        config.spoke.write_path = dir.path().join("write");
        config.spoke.read_path = dir.path().join("read");
        config.write_queue.poll_timeout_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_start_write_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryChannelRegistry::new());
        registry.upsert(ChannelConfig::new("orders"));
        let runtime = StorageRuntime::new(
            create_config(&dir),
            Arc::new(InMemory::new()),
            registry,
            Arc::new(InMemoryLock::new()),
        );
        runtime.start().await.unwrap();
        assert!(matches!(runtime.start().await, Err(Error::AlreadyStarted)));

        let key = runtime
            .service()
            .insert("orders", Content::new("hello"))
            .await
            .unwrap();
        let single = runtime.service().tiers().single.clone();
        let copied = eventually(Duration::from_secs(5), || {
            let single = single.clone();
            let key = key.clone();
            async move { matches!(single.get("orders", &key).await, Ok(Some(_))) }
        })
        .await;
        assert!(copied);

        runtime.shutdown().await;
        assert!(runtime.cluster().rings().await.all_servers().is_empty());
    }

    #[tokio::test]
    async fn test_batch_channels_archived_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryChannelRegistry::new());
        registry.upsert(ChannelConfig::new("orders").with_storage(StorageMode::Batch));
        registry.upsert(ChannelConfig::new("events"));
        let mut config = create_config(&dir);
        config.batch.enabled = true;
        let runtime = StorageRuntime::new(
            config,
            Arc::new(InMemory::new()),
            registry,
            Arc::new(InMemoryLock::new()),
        );
        runtime.start().await.unwrap();

        let archiver = runtime.archiver().unwrap();
        assert!(archiver.is_running("orders"));
        assert!(!archiver.is_running("events"));

        runtime.shutdown().await;
    }
}
