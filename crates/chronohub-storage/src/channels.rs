//! Channel configuration lookup.
//!
//! Channel CRUD lives outside the storage engine; the engine only reads configs through
//! [`ChannelConfigProvider`] and is told about changes through `ClusterContentService::notify`.

use async_trait::async_trait;
use dashmap::DashMap;

use chronohub_core::ChannelConfig;

use crate::error::{Error, Result};

#[async_trait]
pub trait ChannelConfigProvider: Send + Sync {
    async fn get_channel_config(&self, name: &str) -> Result<Option<ChannelConfig>>;

    async fn list_channels(&self) -> Result<Vec<ChannelConfig>>;

    /// Like `get_channel_config`, but a missing channel is an error.
    async fn require(&self, name: &str) -> Result<ChannelConfig> {
        self.get_channel_config(name)
            .await?
            .ok_or_else(|| Error::ChannelNotFound(name.to_string()))
    }
}

/// Process-local registry, for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryChannelRegistry {
    channels: DashMap<String, ChannelConfig>,
}

impl InMemoryChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `config` and returns the config it replaced.
    pub fn upsert(&self, config: ChannelConfig) -> Option<ChannelConfig> {
        self.channels.insert(config.name.clone(), config)
    }

    pub fn remove(&self, name: &str) -> Option<ChannelConfig> {
        self.channels.remove(name).map(|(_, config)| config)
    }
}

#[async_trait]
impl ChannelConfigProvider for InMemoryChannelRegistry {
    async fn get_channel_config(&self, name: &str) -> Result<Option<ChannelConfig>> {
        Ok(self.channels.get(name).map(|c| c.value().clone()))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelConfig>> {
        let mut channels: Vec<_> = self.channels.iter().map(|c| c.value().clone()).collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }
}
