//! Long-term store with one archive per channel minute.
//!
//! ```text
//! {channel}Batch/items/2024/01/01/00/05   archive of every item in the minute
//! {channel}Batch/index/2024/01/01/00/05   {"id": "2024/01/01/00/05", "items": ["2024/01/01/00/05/01/000/abc", ...]}
//! ```
//!
//! Queries read indexes, never archives. Indexes only have minute granularity, so every result is
//! filtered to the exact requested window afterwards. Directional scans list one day of index
//! objects at a time and read the minutes in order until enough keys are found.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use chronohub_core::{time, Content, ContentKey, DirectionQuery, TimePath, TimeQuery, TimeUnit};

use super::object::ObjectClient;
use crate::codec::BatchArchive;
use crate::dao::{instrumented, BatchContentDao, ContentDao};
use crate::error::{Error, Result};

const TIER: &str = "s3_batch";
const INDEX_READ_CONCURRENCY: usize = 16;

/// The JSON index written next to each archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchIndex {
    pub id: String,
    pub items: Vec<String>,
}

impl BatchIndex {
    pub fn new(minute: &TimePath, keys: &BTreeSet<ContentKey>) -> Self {
        Self {
            id: minute.to_url(),
            items: keys.iter().map(ContentKey::to_url).collect(),
        }
    }

    /// Member keys. Entries that do not parse are skipped.
    pub fn keys(&self) -> BTreeSet<ContentKey> {
        self.items
            .iter()
            .filter_map(|item| ContentKey::from_url(item))
            .collect()
    }
}

pub struct S3BatchContentDao {
    client: ObjectClient,
    max_query_items: usize,
    max_scan_days: i64,
}

impl S3BatchContentDao {
    pub fn new(client: ObjectClient, max_query_items: usize, max_scan_days: u32) -> Self {
        Self {
            client,
            max_query_items,
            max_scan_days: max_scan_days as i64,
        }
    }

    fn index_root(channel: &str) -> String {
        format!("{}Batch/index", channel)
    }

    pub fn index_path(channel: &str, minute: &TimePath) -> Path {
        Path::from(format!("{}/{}", Self::index_root(channel), minute.to_url()))
    }

    pub fn items_path(channel: &str, minute: &TimePath) -> Path {
        Path::from(format!("{}Batch/items/{}", channel, minute.to_url()))
    }

    pub async fn read_index(&self, channel: &str, minute: &TimePath) -> Result<Option<BatchIndex>> {
        match self.client.get(&Self::index_path(channel, minute)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_archive(&self, channel: &str, minute: &TimePath) -> Result<Option<BatchArchive>> {
        match self.client.get(&Self::items_path(channel, minute)).await? {
            Some(bytes) => BatchArchive::parse(bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn keys_for_minute(&self, channel: &str, minute: &TimePath) -> Result<BTreeSet<ContentKey>> {
        Ok(self
            .read_index(channel, minute)
            .await?
            .map(|index| index.keys())
            .unwrap_or_default())
    }

    async fn keys_for_minutes(
        &self,
        channel: &str,
        minutes: impl IntoIterator<Item = TimePath>,
    ) -> Result<BTreeSet<ContentKey>> {
        let sets: Vec<BTreeSet<ContentKey>> = stream::iter(minutes)
            .map(|minute| async move { self.keys_for_minute(channel, &minute).await })
            .buffer_unordered(INDEX_READ_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(sets.into_iter().flatten().collect())
    }

    /// Minutes with an index under `{channel}Batch/index/{prefix}`.
    async fn list_minutes(&self, channel: &str, prefix: &str) -> Result<BTreeSet<TimePath>> {
        let root = Self::index_root(channel);
        let locations = self
            .client
            .list(&Path::from(format!("{}/{}", root, prefix)))
            .await?;
        Ok(locations
            .iter()
            .filter_map(|location| {
                location
                    .as_ref()
                    .strip_prefix(root.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .and_then(|url| TimePath::from_url(url, TimeUnit::Minutes))
            })
            .collect())
    }

    async fn next(&self, query: &DirectionQuery, count: usize) -> Result<BTreeSet<ContentKey>> {
        let end = time::now();
        let start = &query.start_key;
        let mut found = BTreeSet::new();
        let mut day = TimePath::new(start.time().max(self.scan_floor(None)), TimeUnit::Days);

        while day.start() <= end {
            for minute in self.list_minutes(&query.channel, &day.to_url()).await? {
                if minute.end() <= start.time() {
                    continue;
                }
                let keys = self.keys_for_minute(&query.channel, &minute).await?;
                found.extend(keys.into_iter().filter(|k| k > start && k.time() <= end));
                if found.len() >= count {
                    return Ok(found);
                }
            }
            day = day.next();
        }
        Ok(found)
    }

    async fn previous(&self, query: &DirectionQuery, count: usize) -> Result<BTreeSet<ContentKey>> {
        let earliest = self.scan_floor(query.earliest_time);
        let start = &query.start_key;
        let mut found = BTreeSet::new();
        let mut day = TimePath::new(start.time(), TimeUnit::Days);

        while day.end() > earliest {
            let minutes = self.list_minutes(&query.channel, &day.to_url()).await?;
            for minute in minutes.into_iter().rev() {
                if minute.start() > start.time() {
                    continue;
                }
                let keys = self.keys_for_minute(&query.channel, &minute).await?;
                found.extend(keys.into_iter().filter(|k| k < start && k.time() >= earliest));
                if found.len() >= count {
                    return Ok(found);
                }
            }
            day = day.previous();
        }
        Ok(found)
    }

    fn scan_floor(&self, earliest: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let bound = time::now() - ChronoDuration::days(self.max_scan_days);
        earliest.map_or(bound, |t| t.max(bound))
    }

    /// The minute an `index/...` or `items/...` object belongs to.
    fn object_minute(channel: &str, location: &Path) -> Option<TimePath> {
        let rest = location
            .as_ref()
            .strip_prefix(channel)?
            .strip_prefix("Batch/")?;
        let url = rest
            .strip_prefix("index/")
            .or_else(|| rest.strip_prefix("items/"))?;
        TimePath::from_url(url, TimeUnit::Minutes)
    }
}

#[async_trait]
impl ContentDao for S3BatchContentDao {
    fn name(&self) -> &'static str {
        TIER
    }

    /// Batch content is only written a whole minute at a time.
    async fn insert(&self, _channel: &str, _content: Content) -> Result<ContentKey> {
        Err(Error::unsupported(TIER, "insert"))
    }

    async fn get(&self, channel: &str, key: &ContentKey) -> Result<Option<Content>> {
        instrumented(TIER, "get", async {
            match self.read_archive(channel, &TimePath::minute(key.time())).await? {
                Some(archive) => archive.get(key),
                None => Ok(None),
            }
        })
        .await
    }

    async fn query_by_time(&self, query: &TimeQuery) -> Result<BTreeSet<ContentKey>> {
        instrumented(TIER, "query_by_time", async {
            let channel = query.channel.as_str();
            let mut keys = if query.limit_key.is_none() && query.unit <= TimeUnit::Minutes {
                self.keys_for_minute(channel, &TimePath::minute(query.start()))
                    .await?
            } else if query.limit_key.is_none() {
                let minutes = self
                    .list_minutes(channel, &query.time_path().to_url())
                    .await?;
                self.keys_for_minutes(channel, minutes).await?
            } else {
                let (start, end) = (query.start(), query.end());
                let mut minutes = BTreeSet::new();
                for hour in TimePath::buckets(start, end, TimeUnit::Hours) {
                    minutes.extend(
                        self.list_minutes(channel, &hour.to_url())
                            .await?
                            .into_iter()
                            .filter(|m| m.end() > start && m.start() <= end),
                    );
                }
                self.keys_for_minutes(channel, minutes).await?
            };
            keys.retain(|k| query.contains(k));
            Ok(keys)
        })
        .await
    }

    async fn query_direction(&self, query: &DirectionQuery) -> Result<BTreeSet<ContentKey>> {
        let count = query.count.min(self.max_query_items);
        instrumented(TIER, "query_direction", async {
            let keys = if query.next {
                self.next(query, count).await?
            } else {
                self.previous(query, count).await?
            };
            Ok(query.trim(keys))
        })
        .await
    }

    async fn delete_channel(&self, channel: &str) -> Result<()> {
        let locations = self
            .client
            .list(&Path::from(format!("{}Batch", channel)))
            .await?;
        let deleted = self.client.delete_all(&locations).await?;
        info!(channel, deleted, "Deleted channel from long-term batch store");
        Ok(())
    }

    /// Deletes whole minutes that end at or before the limit's time.
    async fn delete_before(&self, channel: &str, limit: &ContentKey) -> Result<()> {
        let locations: Vec<Path> = self
            .client
            .list(&Path::from(format!("{}Batch", channel)))
            .await?
            .into_iter()
            .filter(|location| {
                matches!(Self::object_minute(channel, location), Some(m) if m.end() <= limit.time())
            })
            .collect();
        let deleted = self.client.delete_all(&locations).await?;
        info!(channel, limit = %limit, deleted, "Deleted batch minutes before limit");
        Ok(())
    }
}

#[async_trait]
impl BatchContentDao for S3BatchContentDao {
    async fn write_batch(
        &self,
        channel: &str,
        minute: &TimePath,
        keys: &BTreeSet<ContentKey>,
        archive: Bytes,
    ) -> Result<()> {
        instrumented(TIER, "write_batch", async {
            let archive_size = archive.len();
            self.client
                .put(&Self::items_path(channel, minute), archive)
                .await?;
            let index = serde_json::to_vec(&BatchIndex::new(minute, keys))?;
            self.client
                .put(&Self::index_path(channel, minute), Bytes::from(index))
                .await?;
            debug!(channel, minute = %minute, keys = keys.len(), archive_size, "Batch written");
            Ok(())
        })
        .await
    }

    async fn read_batch(
        &self,
        channel: &str,
        key: &ContentKey,
    ) -> Result<BTreeMap<ContentKey, Content>> {
        match self.read_archive(channel, &TimePath::minute(key.time())).await? {
            Some(archive) => archive.contents(),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn stream_minute(
        &self,
        channel: &str,
        minute: &TimePath,
        keys: &BTreeSet<ContentKey>,
        descending: bool,
        callback: &mut (dyn FnMut(Content) + Send),
    ) -> Result<bool> {
        let Some(archive) = self.read_archive(channel, minute).await? else {
            return Ok(false);
        };
        let ordered: Box<dyn Iterator<Item = &ContentKey> + Send> = if descending {
            Box::new(keys.iter().rev())
        } else {
            Box::new(keys.iter())
        };
        for key in ordered {
            if let Some(content) = archive.get(key)? {
                callback(content);
            }
        }
        Ok(true)
    }
}
