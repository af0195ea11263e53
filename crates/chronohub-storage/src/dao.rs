//! The contract every storage tier implements.
//!
//! Operations a tier cannot perform return [`Error::Unsupported`] from the default methods, so
//! the facade can route uniformly and a misrouted call fails loudly instead of silently.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Instant;

use chronohub_core::{Content, ContentKey, DirectionQuery, TimePath, TimeQuery};
use chronohub_observability::metrics::{TIER_ERRORS_TOTAL, TIER_LATENCY};

use crate::error::{Error, Result};

#[async_trait]
pub trait ContentDao: Send + Sync {
    /// Short tier name, used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Stores `content` and returns its key, assigning one if the content has none.
    async fn insert(&self, channel: &str, content: Content) -> Result<ContentKey>;

    /// Stores several items. Fails on the first item that cannot be written.
    async fn insert_bulk(&self, channel: &str, contents: Vec<Content>) -> Result<Vec<ContentKey>> {
        let mut keys = Vec::with_capacity(contents.len());
        for content in contents {
            keys.push(self.insert(channel, content).await?);
        }
        Ok(keys)
    }

    /// Stores content whose key lies in the channel's mutable past.
    async fn insert_historical(&self, _channel: &str, _content: Content) -> Result<ContentKey> {
        Err(Error::unsupported(self.name(), "insert_historical"))
    }

    async fn get(&self, channel: &str, key: &ContentKey) -> Result<Option<Content>>;

    async fn query_by_time(&self, query: &TimeQuery) -> Result<BTreeSet<ContentKey>>;

    async fn query_direction(&self, query: &DirectionQuery) -> Result<BTreeSet<ContentKey>>;

    /// Greatest key strictly before `limit`, if the tier holds one.
    async fn get_latest(&self, channel: &str, limit: &ContentKey) -> Result<Option<ContentKey>> {
        let query = DirectionQuery::new(channel, limit.clone(), 1, false);
        Ok(self.query_direction(&query).await?.into_iter().next_back())
    }

    async fn delete_channel(&self, channel: &str) -> Result<()>;

    async fn delete(&self, _channel: &str, _key: &ContentKey) -> Result<()> {
        Err(Error::unsupported(self.name(), "delete"))
    }

    /// Removes every item strictly before `limit`.
    async fn delete_before(&self, _channel: &str, _limit: &ContentKey) -> Result<()> {
        Err(Error::unsupported(self.name(), "delete_before"))
    }
}

/// Stores that hold whole minutes of a channel in one archive.
#[async_trait]
pub trait BatchContentDao: ContentDao {
    /// Writes the archive for `minute` and the index listing `keys`.
    async fn write_batch(
        &self,
        channel: &str,
        minute: &TimePath,
        keys: &BTreeSet<ContentKey>,
        archive: Bytes,
    ) -> Result<()>;

    /// Every item in the minute holding `key`.
    async fn read_batch(&self, channel: &str, key: &ContentKey)
        -> Result<BTreeMap<ContentKey, Content>>;

    /// Feeds the items of `minute` named in `keys` to `callback` in key order.
    ///
    /// Returns false when no archive exists for the minute.
    async fn stream_minute(
        &self,
        channel: &str,
        minute: &TimePath,
        keys: &BTreeSet<ContentKey>,
        descending: bool,
        callback: &mut (dyn FnMut(Content) + Send),
    ) -> Result<bool>;
}

/// Runs a tier operation, recording its latency and failures.
pub(crate) async fn instrumented<T, F>(tier: &str, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = fut.await;
    TIER_LATENCY
        .with_label_values(&[tier, operation])
        .observe(start.elapsed().as_secs_f64());
    if result.is_err() {
        TIER_ERRORS_TOTAL.with_label_values(&[tier, operation]).inc();
    }
    result
}
