//! Out-of-line store for payloads above the large-payload threshold, at `{channel}Large/{key url}`.
//!
//! Only the fast tier and long-term indexes refer to these objects (through a
//! [`LargeIndex`](chronohub_core::LargeIndex)), so the store answers point lookups and deletes
//! but no queries.

use async_trait::async_trait;
use object_store::path::Path;
use std::collections::BTreeSet;
use tracing::{debug, info};

use chronohub_core::{Content, ContentKey, DirectionQuery, TimeQuery};

use super::object::ObjectClient;
use crate::codec::{decode_item, encode_item};
use crate::dao::{instrumented, ContentDao};
use crate::error::{Error, Result};

const TIER: &str = "s3_large";

pub struct S3LargeContentDao {
    client: ObjectClient,
}

impl S3LargeContentDao {
    pub fn new(client: ObjectClient) -> Self {
        Self { client }
    }

    fn root(channel: &str) -> Path {
        Path::from(format!("{}Large", channel))
    }

    pub fn item_path(channel: &str, key: &ContentKey) -> Path {
        Path::from(format!("{}Large/{}", channel, key.to_url()))
    }

    async fn write(&self, channel: &str, mut content: Content) -> Result<ContentKey> {
        let key = content.key_or_assign();
        let size = content.size();
        let bytes = encode_item(&content)?;
        self.client.put(&Self::item_path(channel, &key), bytes).await?;
        debug!(channel, key = %key, size, "Large payload written");
        Ok(key)
    }
}

#[async_trait]
impl ContentDao for S3LargeContentDao {
    fn name(&self) -> &'static str {
        TIER
    }

    async fn insert(&self, channel: &str, content: Content) -> Result<ContentKey> {
        instrumented(TIER, "insert", self.write(channel, content)).await
    }

    async fn insert_historical(&self, channel: &str, content: Content) -> Result<ContentKey> {
        instrumented(TIER, "insert_historical", self.write(channel, content)).await
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

    async fn query_by_time(&self, _query: &TimeQuery) -> Result<BTreeSet<ContentKey>> {
        Err(Error::unsupported(TIER, "query_by_time"))
    }

    async fn query_direction(&self, _query: &DirectionQuery) -> Result<BTreeSet<ContentKey>> {
        Err(Error::unsupported(TIER, "query_direction"))
    }

    async fn get_latest(&self, _channel: &str, _limit: &ContentKey) -> Result<Option<ContentKey>> {
        Err(Error::unsupported(TIER, "get_latest"))
    }

    async fn delete_channel(&self, channel: &str) -> Result<()> {
        let locations = self.client.list(&Self::root(channel)).await?;
        let deleted = self.client.delete_all(&locations).await?;
        info!(channel, deleted, "Deleted channel from large payload store");
        Ok(())
    }

    async fn delete(&self, channel: &str, key: &ContentKey) -> Result<()> {
        self.client.delete(&Self::item_path(channel, key)).await
    }

    async fn delete_before(&self, channel: &str, limit: &ContentKey) -> Result<()> {
        let prefix = format!("{}Large/", channel);
        let locations: Vec<Path> = self
            .client
            .list(&Self::root(channel))
            .await?
            .into_iter()
            .filter(|location| {
                matches!(
                    location.as_ref().strip_prefix(prefix.as_str()).and_then(ContentKey::from_url),
                    Some(key) if key < *limit
                )
            })
            .collect();
        let deleted = self.client.delete_all(&locations).await?;
        info!(channel, limit = %limit, deleted, "Deleted large payloads before limit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::sync::Arc;

    fn create_dao() -> S3LargeContentDao {
        S3LargeContentDao::new(ObjectClient::new(Arc::new(InMemory::new()), 3))
    }

    fn key(url: &str) -> ContentKey {
        ContentKey::from_url(url).unwrap()
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let dao = create_dao();
        let k = key("2024/01/01/00/00/00/000/big");
        let payload = Content::new(vec![9u8; 64 * 1024])
            .with_key(k.clone())
            .with_content_type("application/octet-stream");
        dao.insert("video", payload.clone()).await.unwrap();

        let stored = dao.get("video", &k).await.unwrap().unwrap();
        assert_eq!(stored.data(), payload.data());
        assert_eq!(stored.content_type(), Some("application/octet-stream"));

        dao.delete("video", &k).await.unwrap();
        assert!(dao.get("video", &k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_large_objects_are_separate_from_single_items() {
        let dao = create_dao();
        let k = key("2024/01/01/00/00/00/000/big");
        dao.insert("video", Content::new("x").with_key(k.clone()))
            .await
            .unwrap();
        assert_eq!(
            S3LargeContentDao::item_path("video", &k).as_ref(),
            "videoLarge/2024/01/01/00/00/00/000/big"
        );
        assert!(dao
            .client
            .list(&Path::from("video"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_before() {
        let dao = create_dao();
        let old = key("2024/01/01/00/00/00/000/old");
        let new = key("2024/01/02/00/00/00/000/new");
        for k in [&old, &new] {
            dao.insert("video", Content::new("x").with_key(k.clone()))
                .await
                .unwrap();
        }
        dao.delete_before("video", &new).await.unwrap();
        assert!(dao.get("video", &old).await.unwrap().is_none());
        assert!(dao.get("video", &new).await.unwrap().is_some());

        dao.delete_channel("video").await.unwrap();
        assert!(dao.get("video", &new).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queries_are_unsupported() {
        let dao = create_dao();
        let query = DirectionQuery::new("video", ContentKey::new_now(), 1, false);
        assert!(matches!(
            dao.query_direction(&query).await,
            Err(Error::Unsupported { .. })
        ));
    }
}
