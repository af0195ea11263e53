//! The storage engine's entry point.
//!
//! [`ClusterContentService`] decides which tiers serve each call:
//!
//! | Call | Tiers |
//! |------|-------|
//! | `insert` | fast tier (large payloads to the large store first), then the write queue |
//! | `get` | fast tier while the key is inside its TTL, then by storage mode (see below) |
//! | `query_*` | fast tier and/or long-term stores by [`Location`], concurrently, fail closed |
//! | `get_latest` | latest cache for immutable data, live backward query otherwise |
//!
//! Long-term reads by storage mode:
//!
//! ```text
//!   SINGLE:  single
//!   BATCH:   read cache ─► batch (whole minute copied into the read cache)
//!   BOTH:    read cache ─► batch ─► single
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use chronohub_core::{
    time, ChannelConfig, Content, ContentKey, DirectionQuery, Epoch, LargeIndex, Location,
    StorageMode, TimePath, TimeQuery,
};

use crate::batch_archiver::BatchArchiver;
use crate::channels::ChannelConfigProvider;
use crate::config::ContentConfig;
use crate::dao::{BatchContentDao, ContentDao};
use crate::error::{Error, Result};
use crate::fanout::{self, StoreFuture};
use crate::latest_cache::{read_cached_latest, CachedLatest, LatestContentCache};
use crate::verifier::WatermarkStore;
use crate::write_queue::WriteQueue;

/// Every store the service routes between.
#[derive(Clone)]
pub struct ContentTiers {
    pub spoke_write: Arc<dyn ContentDao>,
    pub spoke_read: Arc<dyn ContentDao>,
    pub single: Arc<dyn ContentDao>,
    pub batch: Arc<dyn BatchContentDao>,
    pub large: Arc<dyn ContentDao>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    SpokeWrite,
    SpokeRead,
    Single,
    Batch,
}

fn long_term_tiers(config: &ChannelConfig) -> Vec<Tier> {
    let mut tiers = Vec::with_capacity(2);
    if config.writes_single() {
        tiers.push(Tier::Single);
    }
    if config.reads_batch() {
        tiers.push(Tier::Batch);
    }
    tiers
}

fn route(location: Location, config: &ChannelConfig, in_cache: bool, outside_cache: bool) -> Vec<Tier> {
    match location {
        Location::All => {
            let mut tiers = Vec::with_capacity(3);
            if in_cache {
                tiers.push(Tier::SpokeWrite);
            }
            if outside_cache {
                tiers.extend(long_term_tiers(config));
            }
            tiers
        }
        Location::Cache => vec![Tier::SpokeWrite, Tier::SpokeRead],
        Location::CacheWrite => vec![Tier::SpokeWrite],
        Location::CacheRead => vec![Tier::SpokeRead],
        Location::LongTerm => long_term_tiers(config),
        Location::LongTermSingle => vec![Tier::Single],
        Location::LongTermBatch => vec![Tier::Batch],
    }
}

fn time_task<D>(dao: Arc<D>, query: TimeQuery) -> StoreFuture<BTreeSet<ContentKey>>
where
    D: ContentDao + ?Sized + 'static,
{
    async move { dao.query_by_time(&query).await }.boxed()
}

fn direction_task<D>(dao: Arc<D>, query: DirectionQuery) -> StoreFuture<BTreeSet<ContentKey>>
where
    D: ContentDao + ?Sized + 'static,
{
    async move { dao.query_direction(&query).await }.boxed()
}

fn check_key(key: &ContentKey) -> Result<()> {
    if key.is_valid() {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("invalid key hash {:?}", key.hash())))
    }
}

/// Smallest key after every key at or before `time`.
fn after(time: DateTime<Utc>) -> ContentKey {
    ContentKey::first_key(time + ChronoDuration::milliseconds(1))
}

pub struct ClusterContentService {
    config: ContentConfig,
    spoke_ttl_minutes: u32,
    channels: Arc<dyn ChannelConfigProvider>,
    tiers: ContentTiers,
    write_queue: Arc<WriteQueue>,
    latest: Arc<dyn LatestContentCache>,
    watermarks: Arc<dyn WatermarkStore>,
    archiver: Option<Arc<BatchArchiver>>,
}

impl ClusterContentService {
    pub fn new(
        config: ContentConfig,
        spoke_ttl_minutes: u32,
        channels: Arc<dyn ChannelConfigProvider>,
        tiers: ContentTiers,
        write_queue: Arc<WriteQueue>,
        latest: Arc<dyn LatestContentCache>,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> Self {
        Self {
            config,
            spoke_ttl_minutes,
            channels,
            tiers,
            write_queue,
            latest,
            watermarks,
            archiver: None,
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<BatchArchiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn channels(&self) -> &Arc<dyn ChannelConfigProvider> {
        &self.channels
    }

    pub fn tiers(&self) -> &ContentTiers {
        &self.tiers
    }

    pub fn write_queue(&self) -> &Arc<WriteQueue> {
        &self.write_queue
    }

    pub fn latest_cache(&self) -> &Arc<dyn LatestContentCache> {
        &self.latest
    }

    /// Oldest instant the fast tier serves for `config`. Historical channels never keep their
    /// mutable part in the fast tier.
    fn cache_start(&self, config: &ChannelConfig, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl_start = now - config.spoke_ttl(self.spoke_ttl_minutes);
        match config.mutable_time {
            Some(mutable_time) => ttl_start.max(mutable_time),
            None => ttl_start,
        }
    }

    fn stable_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        time::stable(now, self.config.stable_seconds)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub async fn insert(&self, channel: &str, content: Content) -> Result<ContentKey> {
        let config = self.channels.require(channel).await?;
        let mut content = content.with_large_threshold(self.config.large_payload_bytes);
        let key = content.key_or_assign();
        check_key(&key)?;
        if !config.is_immutable(&key) {
            return Err(Error::InvalidRequest(format!(
                "{} is in the mutable range of {}, use a historical insert",
                key, channel
            )));
        }

        let content = if content.is_large() {
            self.write_large(channel, content).await?
        } else {
            content
        };
        let key = self.tiers.spoke_write.insert(channel, content).await?;

        if config.writes_single() {
            self.write_queue.add(channel, &key);
        }
        self.latest.set_if_after(channel, key.clone()).await;
        debug!(channel, key = %key, "Content inserted");
        Ok(key)
    }

    pub async fn insert_bulk(&self, channel: &str, contents: Vec<Content>) -> Result<Vec<ContentKey>> {
        let mut keys = Vec::with_capacity(contents.len());
        for content in contents {
            keys.push(self.insert(channel, content).await?);
        }
        Ok(keys)
    }

    /// Writes a back-dated item into the mutable range of a historical channel, straight to
    /// long-term single storage.
    pub async fn insert_historical(&self, channel: &str, content: Content) -> Result<ContentKey> {
        let config = self.channels.require(channel).await?;
        let Some(key) = content.key().cloned() else {
            return Err(Error::InvalidRequest(
                "historical inserts need a key".to_string(),
            ));
        };
        check_key(&key)?;
        if config.is_immutable(&key) {
            return Err(Error::InvalidRequest(format!(
                "{} is not in the mutable range of {}",
                key, channel
            )));
        }

        let content = content.with_large_threshold(self.config.large_payload_bytes);
        let content = if content.is_large() {
            let index = LargeIndex::index_content(&content)?;
            self.tiers.large.insert_historical(channel, content).await?;
            index
        } else {
            content
        };
        let key = self.tiers.single.insert_historical(channel, content).await?;
        debug!(channel, key = %key, "Historical content inserted");
        Ok(key)
    }

    async fn write_large(&self, channel: &str, content: Content) -> Result<Content> {
        let index = LargeIndex::index_content(&content)?;
        self.tiers.large.insert(channel, content).await?;
        Ok(index)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Looks up one item. `remote_only` skips the fast tier.
    pub async fn get(&self, channel: &str, key: &ContentKey, remote_only: bool) -> Result<Option<Content>> {
        let config = self.channels.require(channel).await?;
        let now = time::now();
        let in_cache = key.time() >= now - config.spoke_ttl(self.spoke_ttl_minutes);

        if !remote_only && in_cache {
            if let Some(content) = self.get_spoke_write(channel, key).await {
                return self.resolve_large(channel, content).await;
            }
        }

        let found = match config.storage {
            StorageMode::Single => self.tiers.single.get(channel, key).await?,
            StorageMode::Batch => self.get_batch(channel, key).await?,
            StorageMode::Both => match self.get_batch(channel, key).await {
                Ok(Some(content)) => Some(content),
                Ok(None) => self.tiers.single.get(channel, key).await?,
                Err(e) => {
                    warn!(channel, key = %key, error = %e, "Batch read failed, trying single");
                    match self.tiers.single.get(channel, key).await? {
                        Some(content) => Some(content),
                        None => return Err(e),
                    }
                }
            },
        };

        // items the write queue has not delivered yet
        let found = match found {
            Some(content) => Some(content),
            None if !remote_only && !in_cache => self.get_spoke_write(channel, key).await,
            None => None,
        };

        match found {
            Some(content) => self.resolve_large(channel, content).await,
            None => Ok(None),
        }
    }

    async fn get_spoke_write(&self, channel: &str, key: &ContentKey) -> Option<Content> {
        match self.tiers.spoke_write.get(channel, key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(channel, key = %key, error = %e, "Fast tier read failed, trying long-term");
                None
            }
        }
    }

    async fn get_batch(&self, channel: &str, key: &ContentKey) -> Result<Option<Content>> {
        match self.tiers.spoke_read.get(channel, key).await {
            Ok(Some(content)) => return Ok(Some(content)),
            Ok(None) => {}
            Err(e) => debug!(channel, key = %key, error = %e, "Read cache unavailable"),
        }
        let minute = self.tiers.batch.read_batch(channel, key).await?;
        let found = minute.get(key).cloned();
        if found.is_some() {
            self.populate_read_cache(channel, minute);
        }
        Ok(found)
    }

    fn populate_read_cache(&self, channel: &str, minute: BTreeMap<ContentKey, Content>) {
        let spoke_read = self.tiers.spoke_read.clone();
        let channel = channel.to_string();
        tokio::spawn(
            async move {
                let count = minute.len();
                match spoke_read.insert_bulk(&channel, minute.into_values().collect()).await {
                    Ok(_) => debug!(channel = %channel, count, "Read cache populated"),
                    Err(e) => warn!(channel = %channel, error = %e, "Read cache population failed"),
                }
            }
            .in_current_span(),
        );
    }

    async fn resolve_large(&self, channel: &str, content: Content) -> Result<Option<Content>> {
        if !content.is_large_index() {
            return Ok(Some(content));
        }
        let index = LargeIndex::from_content(&content)?;
        match self.tiers.large.get(channel, &index.key).await? {
            Some(payload) => Ok(Some(index.resolve(payload))),
            None => {
                warn!(channel, key = %index.key, "Large payload missing for index");
                Ok(None)
            }
        }
    }

    /// Feeds the items for `keys` to `callback` in key order.
    ///
    /// Minutes past the fast tier TTL are read from their batch archive in one request when the
    /// channel reads batch storage; everything else, and keys an archive does not hold, goes
    /// through [`get`](Self::get).
    pub async fn get_many<F>(
        &self,
        channel: &str,
        keys: &BTreeSet<ContentKey>,
        descending: bool,
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(Content) + Send,
    {
        let config = self.channels.require(channel).await?;
        let cache_start = self.cache_start(&config, time::now());

        let mut minutes: BTreeMap<TimePath, BTreeSet<ContentKey>> = BTreeMap::new();
        for key in keys {
            minutes
                .entry(TimePath::minute(key.time()))
                .or_default()
                .insert(key.clone());
        }
        let minutes: Vec<_> = if descending {
            minutes.into_iter().rev().collect()
        } else {
            minutes.into_iter().collect()
        };

        for (minute, minute_keys) in minutes {
            let mut archived = BTreeMap::new();
            if config.reads_batch() && minute.end() <= cache_start {
                let mut found = Vec::new();
                self.tiers
                    .batch
                    .stream_minute(channel, &minute, &minute_keys, descending, &mut |content| {
                        found.push(content)
                    })
                    .await?;
                archived = found
                    .into_iter()
                    .filter_map(|content| content.key().cloned().map(|key| (key, content)))
                    .collect();
            }

            let ordered: Vec<&ContentKey> = if descending {
                minute_keys.iter().rev().collect()
            } else {
                minute_keys.iter().collect()
            };
            for key in ordered {
                let content = match archived.remove(key) {
                    Some(content) => self.resolve_large(channel, content).await?,
                    None => self.get(channel, key, false).await?,
                };
                if let Some(content) = content {
                    callback(content);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn filter(
        &self,
        config: &ChannelConfig,
        keys: BTreeSet<ContentKey>,
        epoch: Epoch,
        stable: bool,
        now: DateTime<Utc>,
    ) -> BTreeSet<ContentKey> {
        let stable_time = self.stable_time(now);
        keys.into_iter()
            .filter(|key| epoch.includes(config, key))
            .filter(|key| !stable || key.time() <= stable_time)
            .collect()
    }

    fn tier_task_time(&self, tier: Tier, query: TimeQuery) -> StoreFuture<BTreeSet<ContentKey>> {
        match tier {
            Tier::SpokeWrite => time_task(self.tiers.spoke_write.clone(), query),
            Tier::SpokeRead => time_task(self.tiers.spoke_read.clone(), query),
            Tier::Single => time_task(self.tiers.single.clone(), query),
            Tier::Batch => time_task(self.tiers.batch.clone(), query),
        }
    }

    fn tier_task_direction(&self, tier: Tier, query: DirectionQuery) -> StoreFuture<BTreeSet<ContentKey>> {
        match tier {
            Tier::SpokeWrite => direction_task(self.tiers.spoke_write.clone(), query),
            Tier::SpokeRead => direction_task(self.tiers.spoke_read.clone(), query),
            Tier::Single => direction_task(self.tiers.single.clone(), query),
            Tier::Batch => direction_task(self.tiers.batch.clone(), query),
        }
    }

    /// Keys in a time bucket (or up to a limit key), merged across the routed tiers.
    pub async fn query_by_time(&self, query: &TimeQuery) -> Result<BTreeSet<ContentKey>> {
        let config = self.channels.require(&query.channel).await?;
        let now = time::now();
        let cache_start = self.cache_start(&config, now);
        let tiers = route(
            query.location,
            &config,
            query.end() >= cache_start,
            query.outside_of_cache(cache_start),
        );

        let tasks = tiers
            .into_iter()
            .map(|tier| self.tier_task_time(tier, query.clone()))
            .collect();
        let keys = fanout::query_keys("query_by_time", tasks, self.config.query_timeout()).await?;
        Ok(self.filter(&config, keys, query.epoch, query.stable, now))
    }

    /// Up to `count` keys after or before the start key, merged across the routed tiers.
    pub async fn query_direction(&self, query: &DirectionQuery) -> Result<BTreeSet<ContentKey>> {
        let config = self.channels.require(&query.channel).await?;
        let now = time::now();
        let cache_start = self.cache_start(&config, now);
        let query = self.bound_direction(&config, query, now);

        let in_cache = query.next || query.start_key.time() >= cache_start;
        let tiers = route(
            query.location,
            &config,
            in_cache,
            query.outside_of_cache(cache_start),
        );
        let tasks = tiers
            .into_iter()
            .map(|tier| self.tier_task_direction(tier, query.clone()))
            .collect();
        let keys = fanout::query_keys("query_direction", tasks, self.config.query_timeout()).await?;
        let keys = self.filter(&config, keys, query.epoch, query.stable, now);
        Ok(query.trim(keys))
    }

    /// Moves the start key and earliest time of `query` inside the requested epoch, retention and
    /// stability bounds, so per-tier results are not spent on keys the filter would drop.
    fn bound_direction(&self, config: &ChannelConfig, query: &DirectionQuery, now: DateTime<Utc>) -> DirectionQuery {
        let mut query = query.clone();
        let mutable_time = config.mutable_time;

        let ttl_time = config.ttl_time(now);
        if query.next {
            let retained = ContentKey::last_key(ttl_time - ChronoDuration::milliseconds(1));
            query.start_key = query.start_key.max(retained);
            if let (Epoch::Immutable, Some(mutable_time)) = (query.epoch, mutable_time) {
                query.start_key = query.start_key.max(ContentKey::last_key(mutable_time));
            }
            return query;
        }

        let mut earliest = ttl_time;
        if let Some(t) = query.earliest_time {
            earliest = earliest.max(t);
        }
        if let Some(mutable_time) = mutable_time {
            match query.epoch {
                Epoch::Immutable => earliest = earliest.max(mutable_time),
                Epoch::Mutable => query.start_key = query.start_key.min(after(mutable_time)),
                Epoch::All => {}
            }
        }
        if query.stable {
            query.start_key = query.start_key.min(after(self.stable_time(now)));
        }
        query.earliest_time = Some(earliest);
        query
    }

    /// Latest key strictly before `query.start_key`, within the query's epoch and stability.
    pub async fn get_latest(&self, query: &DirectionQuery) -> Result<Option<ContentKey>> {
        let config = self.channels.require(&query.channel).await?;
        let now = time::now();
        let mut limit = query.start_key.clone();
        if query.stable {
            limit = limit.min(after(self.stable_time(now)));
        }

        match query.epoch {
            Epoch::Immutable => self.latest_immutable(&config, limit, now).await,
            Epoch::Mutable => self.latest_live(&config, limit, Epoch::Mutable).await,
            // every immutable key sorts after every mutable one
            Epoch::All => match self.latest_immutable(&config, limit.clone(), now).await? {
                Some(key) => Ok(Some(key)),
                None => self.latest_live(&config, limit, Epoch::All).await,
            },
        }
    }

    async fn latest_immutable(
        &self,
        config: &ChannelConfig,
        limit: ContentKey,
        now: DateTime<Utc>,
    ) -> Result<Option<ContentKey>> {
        match read_cached_latest(self.latest.as_ref(), config, now).await {
            CachedLatest::Empty => return Ok(None),
            CachedLatest::Key(key) if key < limit => return Ok(Some(key)),
            CachedLatest::Key(_) => return self.latest_live(config, limit, Epoch::Immutable).await,
            CachedLatest::Missing => {}
        }

        // Only an unbounded scan may seed the cache. Every later insert advances it.
        let newest = self
            .latest_live(config, ContentKey::last_key(now), Epoch::Immutable)
            .await?;
        self.latest
            .set_if_after(&config.name, newest.clone().unwrap_or_else(ContentKey::none))
            .await;
        match newest {
            Some(key) if key < limit => Ok(Some(key)),
            Some(_) => self.latest_live(config, limit, Epoch::Immutable).await,
            None => Ok(None),
        }
    }

    async fn latest_live(
        &self,
        config: &ChannelConfig,
        limit: ContentKey,
        epoch: Epoch,
    ) -> Result<Option<ContentKey>> {
        let query = DirectionQuery::new(config.name.as_str(), limit, 1, false)
            .with_epoch(epoch)
            .with_stable(false);
        Ok(self.query_direction(&query).await?.into_iter().next_back())
    }

    // ------------------------------------------------------------------------
    // Deletes and channel changes
    // ------------------------------------------------------------------------

    /// Removes a channel from every tier, its latest cache entry, verifier watermark and
    /// archival task. Every tier is attempted; the first failure is returned.
    pub async fn delete(&self, channel: &str) -> Result<()> {
        if let Some(archiver) = &self.archiver {
            archiver.delete_channel(channel).await;
        }
        let results = join_all([
            self.tiers.spoke_write.delete_channel(channel),
            self.tiers.spoke_read.delete_channel(channel),
            self.tiers.single.delete_channel(channel),
            self.tiers.batch.delete_channel(channel),
            self.tiers.large.delete_channel(channel),
        ])
        .await;
        self.latest.delete_cache(channel).await;
        self.watermarks.delete(channel).await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                warn!(channel, error = %e, "Channel delete failed on a tier");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(channel, "Channel deleted from every tier");
                Ok(())
            }
        }
    }

    /// Removes one item. Batch archives are immutable and keep their copy.
    pub async fn delete_key(&self, channel: &str, key: &ContentKey) -> Result<()> {
        self.channels.require(channel).await?;
        let results = join_all([
            self.tiers.spoke_write.delete(channel, key),
            self.tiers.spoke_read.delete(channel, key),
            self.tiers.single.delete(channel, key),
            self.tiers.large.delete(channel, key),
        ])
        .await;
        if self.latest.get_latest(channel).await.as_ref() == Some(key) {
            self.latest.delete_cache(channel).await;
        }
        results.into_iter().collect::<Result<Vec<_>>>()?;
        debug!(channel, key = %key, "Content deleted");
        Ok(())
    }

    /// Removes every long-term item strictly before `limit`.
    pub async fn delete_before(&self, channel: &str, limit: &ContentKey) -> Result<()> {
        let config = self.channels.require(channel).await?;
        if config.writes_single() {
            self.tiers.single.delete_before(channel, limit).await?;
        }
        if config.reads_batch() {
            self.tiers.batch.delete_before(channel, limit).await?;
        }
        self.tiers.large.delete_before(channel, limit).await?;
        if matches!(self.latest.get_latest(channel).await, Some(cached) if cached < *limit) {
            self.latest.delete_cache(channel).await;
        }
        info!(channel, limit = %limit, "Deleted content before limit");
        Ok(())
    }

    /// Reacts to a channel config change.
    ///
    /// Moving into or out of BATCH starts or stops minute archival. Moving the mutable time
    /// changes which keys count as immutable, so the cached latest key is rebuilt.
    pub async fn notify(&self, new: &ChannelConfig, old: Option<&ChannelConfig>) -> Result<()> {
        let was_batch = old.is_some_and(|o| o.writes_batch());
        if let Some(archiver) = &self.archiver {
            if new.writes_batch() && !was_batch {
                archiver.start_channel(&new.name);
            } else if !new.writes_batch() && was_batch {
                archiver.stop_channel(&new.name);
            }
        }

        if let Some(old) = old {
            if old.mutable_time != new.mutable_time {
                info!(
                    channel = %new.name,
                    old = ?old.mutable_time,
                    new = ?new.mutable_time,
                    "Mutable time changed, rebuilding latest"
                );
                self.latest.delete_cache(&new.name).await;
                let query = DirectionQuery::new(new.name.as_str(), ContentKey::last_key(time::now()), 1, false)
                    .with_stable(false);
                self.get_latest(&query).await?;
            }
        }
        Ok(())
    }
}
