//! Long-term store with one object per item at `{channel}/{key url}`.
//!
//! Listings are issued per time bucket (the query's own bucket, hours for windows, days for
//! directional scans) and sorted locally, so correctness does not depend on the backend returning
//! keys in order.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::try_join_all;
use object_store::path::Path;
use std::collections::BTreeSet;
use tracing::{debug, info};

use chronohub_core::{time, Content, ContentKey, DirectionQuery, TimePath, TimeQuery, TimeUnit};

use super::object::ObjectClient;
use crate::codec::{decode_item, encode_item};
use crate::dao::{instrumented, ContentDao};
use crate::error::Result;

const TIER: &str = "s3_single";

pub struct S3SingleContentDao {
    client: ObjectClient,
    max_query_items: usize,
    max_scan_days: i64,
}

impl S3SingleContentDao {
    pub fn new(client: ObjectClient, max_query_items: usize, max_scan_days: u32) -> Self {
        Self {
            client,
            max_query_items,
            max_scan_days: max_scan_days as i64,
        }
    }

    pub fn item_path(channel: &str, key: &ContentKey) -> Path {
        Path::from(format!("{}/{}", channel, key.to_url()))
    }

    /// Keys stored under `{channel}/{prefix}`.
    async fn list_keys(&self, channel: &str, prefix: &str) -> Result<BTreeSet<ContentKey>> {
        let locations = self
            .client
            .list(&Path::from(format!("{}/{}", channel, prefix)))
            .await?;
        Ok(locations
            .iter()
            .filter_map(|location| parse_location(channel, location))
            .collect())
    }

    async fn list_buckets(
        &self,
        channel: &str,
        buckets: impl Iterator<Item = TimePath>,
    ) -> Result<BTreeSet<ContentKey>> {
        let listings = try_join_all(buckets.map(|b| {
            let prefix = b.to_url();
            async move { self.list_keys(channel, &prefix).await }
        }))
        .await?;
        Ok(listings.into_iter().flatten().collect())
    }

    async fn write(&self, channel: &str, mut content: Content) -> Result<ContentKey> {
        let key = content.key_or_assign();
        let bytes = encode_item(&content)?;
        self.client.put(&Self::item_path(channel, &key), bytes).await?;
        Ok(key)
    }

    async fn next(&self, query: &DirectionQuery, count: usize) -> Result<BTreeSet<ContentKey>> {
        let end = time::now();
        let start = query.start_key.time().max(self.scan_floor(None));
        let mut found = BTreeSet::new();
        let mut day = TimePath::new(start, TimeUnit::Days);
        while day.start() <= end && found.len() < count {
            let keys = self.list_keys(&query.channel, &day.to_url()).await?;
            found.extend(
                keys.into_iter()
                    .filter(|k| *k > query.start_key && k.time() <= end),
            );
            day = day.next();
        }
        Ok(found)
    }

    async fn previous(&self, query: &DirectionQuery, count: usize) -> Result<BTreeSet<ContentKey>> {
        let earliest = self.scan_floor(query.earliest_time);
        let mut found = BTreeSet::new();
        let mut day = TimePath::new(query.start_key.time(), TimeUnit::Days);
        while day.end() > earliest && found.len() < count {
            let keys = self.list_keys(&query.channel, &day.to_url()).await?;
            found.extend(
                keys.into_iter()
                    .filter(|k| *k < query.start_key && k.time() >= earliest),
            );
            day = day.previous();
        }
        Ok(found)
    }

    /// Scans stop at the query's earliest time, and never look further back than
    /// `max_scan_days`.
    fn scan_floor(&self, earliest: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let bound = time::now() - ChronoDuration::days(self.max_scan_days);
        earliest.map_or(bound, |t| t.max(bound))
    }
}

fn parse_location(channel: &str, location: &Path) -> Option<ContentKey> {
    location
        .as_ref()
        .strip_prefix(channel)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(ContentKey::from_url)
}

#[async_trait]
impl ContentDao for S3SingleContentDao {
    fn name(&self) -> &'static str {
        TIER
    }

    async fn insert(&self, channel: &str, content: Content) -> Result<ContentKey> {
        instrumented(TIER, "insert", self.write(channel, content)).await
    }

    async fn insert_historical(&self, channel: &str, content: Content) -> Result<ContentKey> {
        let key = instrumented(TIER, "insert_historical", self.write(channel, content)).await?;
        debug!(channel, key = %key, "Historical item written");
        Ok(key)
    }

    async fn get(&self, channel: &str, key: &ContentKey) -> Result<Option<Content>> {
        instrumented(TIER, "get", async {
            match self.client.get(&Self::item_path(channel, key)).await? {
                Some(bytes) => decode_item(&bytes, key.clone()).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn query_by_time(&self, query: &TimeQuery) -> Result<BTreeSet<ContentKey>> {
        instrumented(TIER, "query_by_time", async {
            let mut keys = if query.limit_key.is_none() {
                self.list_keys(&query.channel, &query.time_path().to_url()).await?
            } else {
                let buckets = TimePath::buckets(query.start(), query.end(), TimeUnit::Hours);
                self.list_buckets(&query.channel, buckets).await?
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
        let locations = self.client.list(&Path::from(channel)).await?;
        let deleted = self.client.delete_all(&locations).await?;
        info!(channel, deleted, "Deleted channel from long-term single store");
        Ok(())
    }

    async fn delete(&self, channel: &str, key: &ContentKey) -> Result<()> {
        instrumented(TIER, "delete", self.client.delete(&Self::item_path(channel, key))).await
    }

    async fn delete_before(&self, channel: &str, limit: &ContentKey) -> Result<()> {
        let locations: Vec<Path> = self
            .client
            .list(&Path::from(channel))
            .await?
            .into_iter()
            .filter(|location| matches!(parse_location(channel, location), Some(k) if k < *limit))
            .collect();
        let deleted = self.client.delete_all(&locations).await?;
        info!(channel, limit = %limit, deleted, "Deleted long-term single items before limit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use std::sync::Arc;

    fn create_dao() -> (S3SingleContentDao, Arc<InMemory>) {
        let store = Arc::new(InMemory::new());
        let client = ObjectClient::new(store.clone(), 3);
        (S3SingleContentDao::new(client, 1000, 31), store)
    }

    fn key(url: &str) -> ContentKey {
        ContentKey::from_url(url).unwrap()
    }

    #[tokio::test]
    async fn test_object_layout() {
        let (dao, store) = create_dao();
        let k = key("2024/01/01/00/00/00/000/abc");
        dao.insert("orders", Content::new("payload").with_key(k.clone()))
            .await
            .unwrap();

        let raw = store
            .get(&Path::from("orders/2024/01/01/00/00/00/000/abc"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(decode_item(&raw, k).unwrap().data().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_time_query_filters_window() {
        let (dao, _store) = create_dao();
        for url in [
            "2024/01/01/00/59/59/999/a",
            "2024/01/01/01/00/00/000/b",
            "2024/01/01/01/30/00/000/c",
            "2024/01/01/02/00/00/000/d",
        ] {
            dao.insert("orders", Content::new("x").with_key(key(url)))
                .await
                .unwrap();
        }
        let start = key("2024/01/01/01/00/00/000/b").time();

        let hour = TimeQuery::new("orders", start, TimeUnit::Hours);
        assert_eq!(dao.query_by_time(&hour).await.unwrap().len(), 2);

        let window = TimeQuery::new("orders", key("2024/01/01/00/59/00/000/a").time(), TimeUnit::Minutes)
            .with_limit_key(key("2024/01/01/01/30/00/000/c"));
        let keys: Vec<_> = dao
            .query_by_time(&window)
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.hash().to_string())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_direction_queries_cross_days() {
        let (dao, _store) = create_dao();
        let base = time::now() - ChronoDuration::days(3);
        let mut keys = Vec::new();
        for i in 0..6 {
            let k = ContentKey::new(base + ChronoDuration::hours(12 * i), "k");
            dao.insert("orders", Content::new("x").with_key(k.clone()))
                .await
                .unwrap();
            keys.push(k);
        }

        let next = DirectionQuery::new("orders", keys[1].clone(), 3, true);
        assert_eq!(
            dao.query_direction(&next).await.unwrap().into_iter().collect::<Vec<_>>(),
            keys[2..5].to_vec()
        );

        let previous = DirectionQuery::new("orders", keys[5].clone(), 2, false);
        assert_eq!(
            dao.query_direction(&previous).await.unwrap().into_iter().collect::<Vec<_>>(),
            keys[3..5].to_vec()
        );

        let latest = dao
            .get_latest("orders", &ContentKey::last_key(time::now()))
            .await
            .unwrap();
        assert_eq!(latest, Some(keys[5].clone()));
    }

    #[tokio::test]
    async fn test_next_from_earliest_lists_bounded_days() {
        use chronohub_observability::metrics::TIER_LATENCY;

        let (dao, _store) = create_dao();
        let recent = ContentKey::with_time(time::now() - ChronoDuration::hours(3));
        dao.insert("forward", Content::new("x").with_key(recent.clone()))
            .await
            .unwrap();

        let lists = TIER_LATENCY.with_label_values(&["s3", "list"]);
        let before = lists.get_sample_count();
        let query = DirectionQuery::new("forward", ContentKey::none(), 1, true);
        let keys = dao.query_direction(&query).await.unwrap();

        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![recent]);
        assert!(lists.get_sample_count() - before < 500);
    }

    #[tokio::test]
    async fn test_delete_before() {
        let (dao, _store) = create_dao();
        let old = key("2024/01/01/00/00/00/000/old");
        let new = key("2024/01/02/00/00/00/000/new");
        for k in [&old, &new] {
            dao.insert("orders", Content::new("x").with_key(k.clone()))
                .await
                .unwrap();
        }
        dao.delete_before("orders", &new).await.unwrap();
        assert!(dao.get("orders", &old).await.unwrap().is_none());
        assert!(dao.get("orders", &new).await.unwrap().is_some());

        dao.delete_channel("orders").await.unwrap();
        assert!(dao.get("orders", &new).await.unwrap().is_none());
    }
}
