//! Ring-routed fast tier.
//!
//! Writes go to the channel's current owners and succeed once a majority acknowledges. Reads
//! ask the owners at the key's time in turn. Queries ask every node that owned the channel at any
//! point in the window, so items written before a membership change are still found; if any of
//! those nodes fails to answer, the query fails.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use chronohub_cluster::ClusterState;
use chronohub_core::{time, Content, ContentKey, DirectionQuery, QueryResult, TimeQuery};

use super::node::{SpokeNode, SpokeNodes};
use crate::codec::{decode_item, encode_item};
use crate::dao::{instrumented, ContentDao};
use crate::error::{Error, Result};
use crate::fanout::{self, StoreFuture};

pub struct SpokeContentDao {
    name: &'static str,
    cluster: Arc<ClusterState>,
    nodes: Arc<SpokeNodes>,
    ttl: ChronoDuration,
    timeout: Duration,
}

impl SpokeContentDao {
    pub fn new(
        name: &'static str,
        cluster: Arc<ClusterState>,
        nodes: Arc<SpokeNodes>,
        ttl_minutes: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            cluster,
            nodes,
            ttl: ChronoDuration::minutes(ttl_minutes as i64),
            timeout,
        }
    }

    pub fn ttl(&self) -> ChronoDuration {
        self.ttl
    }

    /// Oldest instant the tier still holds data for.
    pub fn ttl_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.ttl
    }

    pub fn nodes(&self) -> &Arc<SpokeNodes> {
        &self.nodes
    }

    fn node(&self, server_id: &str) -> Result<Arc<dyn SpokeNode>> {
        self.nodes
            .get(server_id)
            .ok_or_else(|| Error::UnknownNode(server_id.to_string()))
    }

    async fn servers_between(
        &self,
        channel: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BTreeSet<String> {
        self.cluster
            .rings()
            .await
            .get_servers_between(channel, start, end)
    }

    async fn write_quorum(&self, channel: &str, key: &ContentKey, content: &Content) -> Result<()> {
        let servers = self.cluster.rings().await.get_servers(channel);
        if servers.is_empty() {
            return Err(Error::NoServers(channel.to_string()));
        }
        let required = servers.len() / 2 + 1;
        let bytes = encode_item(content)?;

        let tasks: Vec<StoreFuture<()>> = servers
            .iter()
            .map(|server| {
                let node = self.node(server);
                let channel = channel.to_string();
                let key = key.clone();
                let bytes = bytes.clone();
                async move { node?.write(&channel, &key, bytes).await }.boxed()
            })
            .collect();

        let mut acked = 0;
        for result in fanout::run_all("spoke_insert", tasks, self.timeout).await {
            match result {
                Ok(()) => acked += 1,
                Err(e) => warn!(store = self.name, channel, key = %key, error = %e, "Spoke replica write failed"),
            }
        }

        if acked < required {
            return Err(Error::QuorumNotReached { required, acked });
        }
        debug!(store = self.name, channel, key = %key, acked, "Spoke write acknowledged");
        Ok(())
    }
}

#[async_trait]
impl ContentDao for SpokeContentDao {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn insert(&self, channel: &str, mut content: Content) -> Result<ContentKey> {
        let key = content.key_or_assign();
        instrumented(self.name, "insert", self.write_quorum(channel, &key, &content)).await?;
        Ok(key)
    }

    async fn get(&self, channel: &str, key: &ContentKey) -> Result<Option<Content>> {
        instrumented(self.name, "get", async {
            let rings = self.cluster.rings().await;
            let mut servers = rings.get_servers_at(channel, key.time());
            if servers.is_empty() {
                servers = rings.get_servers(channel);
            }

            let mut answered = false;
            let mut last_error = None;
            for server in &servers {
                let node = match self.node(server) {
                    Ok(node) => node,
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                };
                match node.read(channel, key).await {
                    Ok(Some(bytes)) => return decode_item(&bytes, key.clone()).map(Some),
                    Ok(None) => answered = true,
                    Err(e) => {
                        debug!(store = self.name, server = %server, key = %key, error = %e, "Spoke read failed");
                        last_error = Some(e);
                    }
                }
            }

            match last_error {
                Some(e) if !answered => Err(e),
                _ => Ok(None),
            }
        })
        .await
    }

    async fn query_by_time(&self, query: &TimeQuery) -> Result<BTreeSet<ContentKey>> {
        let (start, end) = (query.start(), query.end());
        let servers = self.servers_between(&query.channel, start, end).await;
        let tasks: Vec<StoreFuture<BTreeSet<ContentKey>>> = servers
            .iter()
            .map(|server| {
                let node = self.node(server);
                let channel = query.channel.clone();
                async move { node?.query(&channel, start, end).await }.boxed()
            })
            .collect();

        let mut keys =
            instrumented(self.name, "query_by_time", fanout::query_keys("spoke_query_by_time", tasks, self.timeout))
                .await?;
        keys.retain(|key| query.contains(key));
        Ok(keys)
    }

    async fn query_direction(&self, query: &DirectionQuery) -> Result<BTreeSet<ContentKey>> {
        let now = time::now();
        let count = query.count;
        let start_key = query.start_key.clone();

        let tasks: Vec<StoreFuture<BTreeSet<ContentKey>>> = if query.next {
            let servers = self
                .servers_between(&query.channel, start_key.time(), now)
                .await;
            servers
                .iter()
                .map(|server| {
                    let node = self.node(server);
                    let channel = query.channel.clone();
                    let start_key = start_key.clone();
                    async move { node?.next(&channel, &start_key, count, now).await }.boxed()
                })
                .collect()
        } else {
            let earliest = query
                .earliest_time
                .map_or(self.ttl_cutoff(now), |t| t.max(self.ttl_cutoff(now)));
            let servers = self
                .servers_between(&query.channel, earliest, start_key.time())
                .await;
            servers
                .iter()
                .map(|server| {
                    let node = self.node(server);
                    let channel = query.channel.clone();
                    let start_key = start_key.clone();
                    async move { node?.previous(&channel, &start_key, count, earliest).await }.boxed()
                })
                .collect()
        };

        let keys = instrumented(
            self.name,
            "query_direction",
            fanout::query_keys("spoke_query_direction", tasks, self.timeout),
        )
        .await?;
        Ok(query.trim(keys))
    }

    async fn get_latest(&self, channel: &str, limit: &ContentKey) -> Result<Option<ContentKey>> {
        let earliest = self.ttl_cutoff(time::now());
        let servers = self.servers_between(channel, earliest, limit.time()).await;
        let tasks: Vec<StoreFuture<Option<ContentKey>>> = servers
            .iter()
            .map(|server| {
                let node = self.node(server);
                let channel = channel.to_string();
                let limit = limit.clone();
                async move { node?.latest(&channel, &limit).await }.boxed()
            })
            .collect();

        let mut result = QueryResult::new(tasks.len());
        for outcome in fanout::run_all("spoke_latest", tasks, self.timeout).await {
            match outcome {
                Ok(latest) => result.add_keys(latest),
                Err(e) => {
                    warn!(store = self.name, channel, error = %e, "Spoke latest failed");
                    result.add_failure();
                }
            }
        }
        Ok(fanout::complete("spoke_latest", result)?.into_iter().next_back())
    }

    async fn delete_channel(&self, channel: &str) -> Result<()> {
        let tasks: Vec<StoreFuture<()>> = self
            .nodes
            .all()
            .into_iter()
            .map(|node| {
                let channel = channel.to_string();
                async move { node.delete_channel(&channel).await }.boxed()
            })
            .collect();
        fanout::run_all("spoke_delete_channel", tasks, self.timeout)
            .await
            .into_iter()
            .collect()
    }

    async fn delete(&self, channel: &str, key: &ContentKey) -> Result<()> {
        let tasks: Vec<StoreFuture<()>> = self
            .nodes
            .all()
            .into_iter()
            .map(|node| {
                let channel = channel.to_string();
                let key = key.clone();
                async move { node.delete(&channel, &key).await }.boxed()
            })
            .collect();
        fanout::run_all("spoke_delete", tasks, self.timeout)
            .await
            .into_iter()
            .collect()
    }
}
