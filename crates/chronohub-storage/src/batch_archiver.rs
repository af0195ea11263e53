//! Packs stable minutes of the fast tier into batch archives for BATCH channels.
//!
//! Each channel gets its own task, guarded by a lock named `batch/{channel}` so only one node
//! archives a channel at a time. The task walks minutes forward from its watermark and stops at
//! the first minute that fails, so a failed minute is retried on the next tick rather than
//! skipped. Rewriting a minute replaces it with the same contents.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chronohub_cluster::{DistributedLock, LeaderTask, Leadership};
use chronohub_core::{time, TimePath, TimeQuery, TimeUnit};
use chronohub_observability::metrics::BATCH_MINUTES_TOTAL;

use crate::codec::BatchArchiveWriter;
use crate::config::BatchConfig;
use crate::dao::{BatchContentDao, ContentDao};
use crate::error::Result;
use crate::verifier::WatermarkStore;

struct ChannelTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BatchArchiver {
    config: BatchConfig,
    lookback: ChronoDuration,
    spoke: Arc<dyn ContentDao>,
    batch: Arc<dyn BatchContentDao>,
    watermarks: Arc<dyn WatermarkStore>,
    lock: Arc<dyn DistributedLock>,
    server_id: String,
    lease_ttl: Duration,
    tasks: DashMap<String, ChannelTask>,
    shutdown: CancellationToken,
}

impl BatchArchiver {
    /// `lookback_minutes` bounds how far back a channel without a watermark starts archiving,
    /// normally the fast tier TTL.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BatchConfig,
        lookback_minutes: u32,
        spoke: Arc<dyn ContentDao>,
        batch: Arc<dyn BatchContentDao>,
        watermarks: Arc<dyn WatermarkStore>,
        lock: Arc<dyn DistributedLock>,
        server_id: impl Into<String>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            config,
            lookback: ChronoDuration::minutes(lookback_minutes as i64),
            spoke,
            batch,
            watermarks,
            lock,
            server_id: server_id.into(),
            lease_ttl,
            tasks: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Archives one minute of `channel`. Returns the number of items written.
    pub async fn archive_minute(&self, channel: &str, minute: &TimePath) -> Result<usize> {
        let query = TimeQuery::new(channel, minute.start(), TimeUnit::Minutes).with_stable(false);
        let keys = self.spoke.query_by_time(&query).await?;
        if keys.is_empty() {
            BATCH_MINUTES_TOTAL.with_label_values(&["empty"]).inc();
            return Ok(0);
        }

        let mut writer = BatchArchiveWriter::new();
        for key in &keys {
            match self.spoke.get(channel, key).await? {
                Some(content) => writer.add(&content)?,
                None => warn!(channel, key = %key, "Item expired before it was archived"),
            }
        }
        let archived = writer.keys();
        let count = archived.len();
        self.batch
            .write_batch(channel, minute, &archived, writer.finish())
            .await?;

        BATCH_MINUTES_TOTAL.with_label_values(&["archived"]).inc();
        debug!(channel, minute = %minute, count, "Minute archived");
        Ok(count)
    }

    /// Archives every stable minute after the channel's watermark. Returns the minutes done.
    pub async fn archive_pending(&self, channel: &str) -> Result<usize> {
        let now = time::now();
        let stable = now - ChronoDuration::seconds(self.config.stable_lag_secs as i64);
        let mut minute = match self.watermarks.get(channel).await {
            Some(last) => last.next(),
            None => TimePath::minute(now - self.lookback),
        };

        let mut done = 0;
        while minute.end() <= stable {
            if let Err(e) = self.archive_minute(channel, &minute).await {
                BATCH_MINUTES_TOTAL.with_label_values(&["failed"]).inc();
                warn!(channel, minute = %minute, error = %e, "Minute archive failed, will retry");
                return Err(e);
            }
            self.watermarks.update_increase(channel, minute).await;
            minute = minute.next();
            done += 1;
        }
        Ok(done)
    }

    /// Starts archiving `channel`. Does nothing if it is already running.
    pub fn start_channel(self: &Arc<Self>, channel: &str) {
        if self.tasks.contains_key(channel) {
            return;
        }
        let cancel = self.shutdown.child_token();
        let leadership = Leadership::new(
            self.lock.clone(),
            format!("batch/{}", channel),
            self.server_id.clone(),
            self.lease_ttl,
        );
        let task: Arc<dyn LeaderTask> = Arc::new(ChannelArchiveTask {
            archiver: self.clone(),
            channel: channel.to_string(),
            name: format!("batch-archiver/{}", channel),
        });
        let token = cancel.clone();
        let handle = tokio::spawn(async move { leadership.run(task, token).await });

        info!(channel, "Batch archiving started");
        self.tasks
            .insert(channel.to_string(), ChannelTask { cancel, handle });
    }

    pub fn stop_channel(&self, channel: &str) {
        if let Some((_, task)) = self.tasks.remove(channel) {
            task.cancel.cancel();
            info!(channel, "Batch archiving stopped");
        }
    }

    /// Stops archiving `channel` and forgets its watermark, so a channel recreated under the same
    /// name starts again from the lookback window.
    pub async fn delete_channel(&self, channel: &str) {
        if let Some((_, task)) = self.tasks.remove(channel) {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(channel, error = %e, "Batch archiver task did not stop cleanly");
            }
        }
        self.watermarks.delete(channel).await;
        info!(channel, "Batch archiving state removed");
    }

    pub fn is_running(&self, channel: &str) -> bool {
        self.tasks.contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<_> = self.tasks.iter().map(|t| t.key().clone()).collect();
        channels.sort();
        channels
    }

    /// Stops every channel task and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let channels = self.channels();
        for channel in channels {
            if let Some((_, task)) = self.tasks.remove(&channel) {
                if let Err(e) = task.handle.await {
                    warn!(channel = %channel, error = %e, "Batch archiver task did not stop cleanly");
                }
            }
        }
    }
}

struct ChannelArchiveTask {
    archiver: Arc<BatchArchiver>,
    channel: String,
    name: String,
}

#[async_trait]
impl LeaderTask for ChannelArchiveTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn take_leadership(&self, leadership: CancellationToken) {
        let period = Duration::from_secs(self.archiver.config.interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = leadership.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = leadership.cancelled() => break,
                result = self.archiver.archive_pending(&self.channel) => {
                    if let Ok(minutes) = result {
                        if minutes > 0 {
                            debug!(channel = %self.channel, minutes, "Archived pending minutes");
                        }
                    }
                }
            }
        }
    }
}
