//! Anti-entropy between the fast tier and long-term single storage.
//!
//! One node at a time (the [`Leadership`](chronohub_cluster::Leadership) holder) runs the
//! verifier every `offset_minutes`:
//!
//! ```text
//!   Idle ──► Scanning ──────────────────────► Repairing ──► Idle
//!            per SINGLE/BOTH channel:         resubmit missing keys to the write queue,
//!            fast tier keys − single keys     advance each scanned channel's watermark
//! ```
//!
//! A channel's watermark only moves after both of its queries succeeded, and never moves
//! backwards, so a failed or timed out scan is simply repeated on the next cycle.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chronohub_cluster::LeaderTask;
use chronohub_core::{time, ChannelConfig, ContentKey, TimePath, TimeQuery, TimeUnit};
use chronohub_observability::metrics::{VERIFIER_MISSING_TOTAL, VERIFIER_RUNS_TOTAL};

use crate::channels::ChannelConfigProvider;
use crate::config::VerifierConfig;
use crate::dao::ContentDao;
use crate::error::{Error, Result};
use crate::write_queue::WriteQueue;

/// Last minute verified per channel.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, channel: &str) -> Option<TimePath>;

    /// Stores `minute` if it is later than the current watermark. Returns whether it moved.
    async fn update_increase(&self, channel: &str, minute: TimePath) -> bool;

    async fn delete(&self, channel: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryWatermarks {
    minutes: DashMap<String, TimePath>,
}

impl InMemoryWatermarks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarks {
    async fn get(&self, channel: &str) -> Option<TimePath> {
        self.minutes.get(channel).map(|m| *m.value())
    }

    async fn update_increase(&self, channel: &str, minute: TimePath) -> bool {
        match self.minutes.entry(channel.to_string()) {
            Entry::Occupied(mut entry) if minute > *entry.get() => {
                entry.insert(minute);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(minute);
                true
            }
        }
    }

    async fn delete(&self, channel: &str) {
        self.minutes.remove(channel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierState {
    Idle,
    Scanning,
    Repairing,
}

/// Minutes `start..=end` of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierRange {
    pub channel: String,
    pub start: TimePath,
    pub end: TimePath,
}

impl VerifierRange {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn query(&self) -> TimeQuery {
        TimeQuery::new(self.channel.as_str(), self.start.start(), TimeUnit::Minutes)
            .with_limit_key(self.end.last_key())
            .with_stable(false)
    }
}

/// Summary of one verifier cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifierRun {
    pub channels: usize,
    pub verified: usize,
    pub failed: usize,
    pub missing: usize,
}

pub struct Verifier {
    config: VerifierConfig,
    default_spoke_ttl_minutes: u32,
    channels: Arc<dyn ChannelConfigProvider>,
    spoke: Arc<dyn ContentDao>,
    single: Arc<dyn ContentDao>,
    write_queue: Arc<WriteQueue>,
    watermarks: Arc<dyn WatermarkStore>,
    state: watch::Sender<VerifierState>,
}

impl Verifier {
    pub fn new(
        config: VerifierConfig,
        default_spoke_ttl_minutes: u32,
        channels: Arc<dyn ChannelConfigProvider>,
        spoke: Arc<dyn ContentDao>,
        single: Arc<dyn ContentDao>,
        write_queue: Arc<WriteQueue>,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> Self {
        let (state, _) = watch::channel(VerifierState::Idle);
        Self {
            config,
            default_spoke_ttl_minutes,
            channels,
            spoke,
            single,
            write_queue,
            watermarks,
            state,
        }
    }

    pub fn state(&self) -> VerifierState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<VerifierState> {
        self.state.subscribe()
    }

    pub fn watermarks(&self) -> &Arc<dyn WatermarkStore> {
        &self.watermarks
    }

    /// Window to verify for `config` at `now`.
    ///
    /// Ends at the minute before last, starts at the watermark (or `offset_minutes` before the
    /// end), and for live channels never starts before the fast tier's TTL horizon.
    pub fn verifier_range(
        &self,
        now: DateTime<Utc>,
        config: &ChannelConfig,
        watermark: Option<TimePath>,
    ) -> VerifierRange {
        let end = TimePath::minute(now - ChronoDuration::minutes(1));
        let mut start = watermark.unwrap_or_else(|| {
            TimePath::minute(end.start() - ChronoDuration::minutes(self.config.offset_minutes as i64))
        });
        if !config.is_historical() {
            let ttl = config.spoke_ttl(self.default_spoke_ttl_minutes);
            let horizon = TimePath::minute(now - ttl + ChronoDuration::minutes(2));
            start = start.max(horizon);
        }
        VerifierRange {
            channel: config.name.clone(),
            start,
            end,
        }
    }

    /// Fast tier keys in `range` that long-term single storage does not have.
    pub async fn find_missing(&self, range: &VerifierRange) -> Result<BTreeSet<ContentKey>> {
        let query = range.query();
        let (spoke, single) = tokio::join!(
            self.spoke.query_by_time(&query),
            self.single.query_by_time(&query)
        );
        let (spoke, single) = (spoke?, single?);
        Ok(spoke.difference(&single).cloned().collect())
    }

    /// One full cycle over every channel that writes to single storage.
    pub async fn run_once(&self) -> Result<VerifierRun> {
        self.state.send_replace(VerifierState::Scanning);
        let result = self.scan_and_repair().await;
        self.state.send_replace(VerifierState::Idle);
        result
    }

    async fn scan_and_repair(&self) -> Result<VerifierRun> {
        let now = time::now();
        let mut ranges = Vec::new();
        for config in self.channels.list_channels().await? {
            if !config.writes_single() {
                continue;
            }
            let watermark = self.watermarks.get(&config.name).await;
            let range = self.verifier_range(now, &config, watermark);
            if !range.is_empty() {
                ranges.push(range);
            }
        }

        let mut run = VerifierRun {
            channels: ranges.len(),
            ..Default::default()
        };
        let timeout = Duration::from_secs(self.config.base_timeout_minutes as u64 * 60);
        let scans = stream::iter(ranges)
            .map(|range| async move {
                let missing = self.find_missing(&range).await;
                (range, missing)
            })
            .buffer_unordered(self.config.channel_threads.max(1))
            .collect::<Vec<_>>();
        let scanned = tokio::time::timeout(timeout, scans)
            .await
            .map_err(|_| Error::Timeout("verifier".to_string()))?;

        self.state.send_replace(VerifierState::Repairing);
        for (range, missing) in scanned {
            match missing {
                Ok(missing) => {
                    let rejected = missing
                        .iter()
                        .filter(|key| !self.write_queue.add(&range.channel, key))
                        .count();
                    if !missing.is_empty() {
                        VERIFIER_MISSING_TOTAL
                            .with_label_values(&[&range.channel])
                            .inc_by(missing.len() as u64);
                        warn!(
                            channel = %range.channel,
                            start = %range.start,
                            end = %range.end,
                            missing = missing.len(),
                            "Resubmitted items missing from long-term storage"
                        );
                    }
                    if rejected > 0 {
                        // rescan the same window once the queue has room
                        VERIFIER_RUNS_TOTAL.with_label_values(&["queue_full"]).inc();
                        warn!(channel = %range.channel, rejected, "Write queue full, keeping watermark");
                        run.failed += 1;
                        continue;
                    }
                    self.watermarks.update_increase(&range.channel, range.end).await;
                    VERIFIER_RUNS_TOTAL.with_label_values(&["verified"]).inc();
                    run.verified += 1;
                    run.missing += missing.len();
                }
                Err(e) => {
                    VERIFIER_RUNS_TOTAL.with_label_values(&["failed"]).inc();
                    warn!(channel = %range.channel, error = %e, "Verification failed, will rescan next cycle");
                    run.failed += 1;
                }
            }
        }
        Ok(run)
    }
}

#[async_trait]
impl LeaderTask for Verifier {
    fn name(&self) -> &str {
        "verifier"
    }

    async fn take_leadership(&self, leadership: CancellationToken) {
        let period = Duration::from_secs(self.config.offset_minutes.max(1) as u64 * 60);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "Verifier leading");

        loop {
            tokio::select! {
                _ = leadership.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = leadership.cancelled() => break,
                result = self.run_once() => match result {
                    Ok(run) => info!(
                        channels = run.channels,
                        verified = run.verified,
                        failed = run.failed,
                        missing = run.missing,
                        "Verifier cycle complete"
                    ),
                    Err(e) => warn!(error = %e, "Verifier cycle failed"),
                },
            }
        }

        self.state.send_replace(VerifierState::Idle);
        debug!("Verifier stopped leading");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::InMemoryChannelRegistry;
    use crate::config::WriteQueueConfig;
    use crate::testing::{create_single, create_spoke, FlakyDao};
    use chronohub_core::{Content, StorageMode};

    struct Fixture {
        verifier: Verifier,
        spoke: Arc<dyn ContentDao>,
        single: Arc<dyn ContentDao>,
        queue: Arc<WriteQueue>,
        _dir: tempfile::TempDir,
    }

    async fn create_verifier(single: Option<Arc<dyn ContentDao>>) -> Fixture {
        let (spoke, _store, dir) = create_spoke(60).await;
        let spoke: Arc<dyn ContentDao> = spoke;
        let single = single.unwrap_or_else(|| create_single() as Arc<dyn ContentDao>);
        let registry = Arc::new(InMemoryChannelRegistry::new());
        registry.upsert(ChannelConfig::new("orders"));
        registry.upsert(ChannelConfig::new("archive").with_storage(StorageMode::Batch));
        let queue = Arc::new(WriteQueue::new(
            WriteQueueConfig {
                poll_timeout_ms: 20,
                ..WriteQueueConfig::default()
            },
            spoke.clone(),
            single.clone(),
        ));
        let verifier = Verifier::new(
            VerifierConfig::default(),
            60,
            registry,
            spoke.clone(),
            single.clone(),
            queue.clone(),
            Arc::new(InMemoryWatermarks::new()),
        );
        Fixture {
            verifier,
            spoke,
            single,
            queue,
            _dir: dir,
        }
    }

    async fn insert_at(spoke: &Arc<dyn ContentDao>, channel: &str, minutes_ago: i64) -> ContentKey {
        let key = ContentKey::with_time(time::now() - ChronoDuration::minutes(minutes_ago));
        spoke
            .insert(channel, Content::new("payload").with_key(key.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_watermark_only_increases() {
        let watermarks = InMemoryWatermarks::new();
        let minute = TimePath::minute(time::now());
        assert!(watermarks.update_increase("orders", minute).await);
        assert!(!watermarks.update_increase("orders", minute.previous()).await);
        assert!(!watermarks.update_increase("orders", minute).await);
        assert!(watermarks.update_increase("orders", minute.next()).await);
        assert_eq!(watermarks.get("orders").await, Some(minute.next()));
    }

    #[tokio::test]
    async fn test_range_bounds() {
        let fixture = create_verifier(None).await;
        let now = time::now();
        let config = ChannelConfig::new("orders");

        let range = fixture.verifier.verifier_range(now, &config, None);
        assert_eq!(range.end, TimePath::minute(now - ChronoDuration::minutes(1)));
        assert_eq!(range.start, TimePath::minute(range.end.start() - ChronoDuration::minutes(15)));

        let stale = TimePath::minute(now - ChronoDuration::hours(5));
        let bounded = fixture.verifier.verifier_range(now, &config, Some(stale));
        assert_eq!(bounded.start, TimePath::minute(now - ChronoDuration::minutes(58)));

        let historical = ChannelConfig::new("history").with_mutable_time(now - ChronoDuration::days(1));
        let unbounded = fixture.verifier.verifier_range(now, &historical, Some(stale));
        assert_eq!(unbounded.start, stale);
    }

    #[tokio::test]
    async fn test_cycle_resubmits_missing_items() {
        let fixture = create_verifier(None).await;
        let missing = insert_at(&fixture.spoke, "orders", 3).await;
        let copied = insert_at(&fixture.spoke, "orders", 4).await;
        let content = fixture.spoke.get("orders", &copied).await.unwrap().unwrap();
        fixture.single.insert("orders", content).await.unwrap();
        insert_at(&fixture.spoke, "archive", 3).await;

        let run = fixture.verifier.run_once().await.unwrap();
        assert_eq!(run.channels, 1);
        assert_eq!(run.missing, 1);
        assert_eq!(fixture.queue.len(), 1);
        assert_eq!(fixture.verifier.state(), VerifierState::Idle);

        fixture.queue.start().await.unwrap();
        fixture.queue.shutdown().await;
        assert!(fixture.single.get("orders", &missing).await.unwrap().is_some());

        let watermark = fixture.verifier.watermarks().get("orders").await.unwrap();
        assert!(watermark > TimePath::minute(missing.time()));
    }

    #[tokio::test]
    async fn test_failed_scan_keeps_watermark() {
        let single: Arc<dyn ContentDao> = Arc::new(FlakyDao::new(create_single(), 1));
        let fixture = create_verifier(Some(single)).await;
        insert_at(&fixture.spoke, "orders", 3).await;

        let run = fixture.verifier.run_once().await.unwrap();
        assert_eq!(run.failed, 1);
        assert!(fixture.queue.is_empty());
        assert!(fixture.verifier.watermarks().get("orders").await.is_none());

        let run = fixture.verifier.run_once().await.unwrap();
        assert_eq!((run.verified, run.missing), (1, 1));
    }
}
