//! Periodic fast tier cleanup.

use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chronohub_core::time;
use chronohub_observability::metrics::{SPOKE_EVICTED, SPOKE_OLDEST_AGE_SECONDS};

use super::store::FileSpokeStore;
use crate::channels::ChannelConfigProvider;
use crate::error::Result;

/// Outcome of one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TtlPass {
    pub evicted: u64,
    pub removed_channels: Vec<String>,
    pub oldest_age_secs: Option<i64>,
}

/// Deletes expired items from one fast tier store, and whole directories of channels that no
/// longer exist.
pub struct SpokeTtlEnforcer {
    store: Arc<FileSpokeStore>,
    channels: Arc<dyn ChannelConfigProvider>,
    default_ttl_minutes: u32,
    interval: Duration,
    by_file_age: bool,
}

impl SpokeTtlEnforcer {
    pub fn new(
        store: Arc<FileSpokeStore>,
        channels: Arc<dyn ChannelConfigProvider>,
        default_ttl_minutes: u32,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            channels,
            default_ttl_minutes,
            interval,
            by_file_age: false,
        }
    }

    /// Expires items by how long ago they were written rather than by key time.
    pub fn by_file_age(mut self) -> Self {
        self.by_file_age = true;
        self
    }

    pub async fn run_once(&self) -> Result<TtlPass> {
        let now = time::now();
        let configured: HashMap<String, _> = self
            .channels
            .list_channels()
            .await?
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect();

        let mut pass = TtlPass::default();
        let mut oldest = None;
        for channel in self.store.channels().await? {
            let Some(config) = configured.get(&channel) else {
                match self.store.delete_channel(&channel).await {
                    Ok(()) => {
                        info!(store = self.store.name(), channel = %channel, "Removed unconfigured channel");
                        pass.removed_channels.push(channel);
                    }
                    Err(e) => warn!(store = self.store.name(), channel = %channel, error = %e, "Channel removal failed"),
                }
                continue;
            };

            // one minute of slack past the TTL
            let ttl = config.spoke_ttl(self.default_ttl_minutes) + ChronoDuration::minutes(1);
            let enforced = if self.by_file_age {
                self.store
                    .enforce_age(&channel, ttl.to_std().unwrap_or_default())
                    .await
            } else {
                self.store.enforce_ttl(&channel, now - ttl).await
            };
            match enforced {
                Ok(evicted) => pass.evicted += evicted,
                Err(e) => {
                    warn!(store = self.store.name(), channel = %channel, error = %e, "TTL enforcement failed");
                    continue;
                }
            }
            if let Ok(Some(key)) = self.store.oldest_key(&channel).await {
                oldest = Some(match oldest {
                    Some(t) if t < key.time() => t,
                    _ => key.time(),
                });
            }
        }

        pass.oldest_age_secs = oldest.map(|t| (now - t).num_seconds());
        SPOKE_EVICTED
            .with_label_values(&[self.store.name()])
            .set(pass.evicted as i64);
        SPOKE_OLDEST_AGE_SECONDS
            .with_label_values(&[self.store.name()])
            .set(pass.oldest_age_secs.unwrap_or(0));

        debug!(
            store = self.store.name(),
            evicted = pass.evicted,
            removed_channels = pass.removed_channels.len(),
            "Spoke TTL pass complete"
        );
        Ok(pass)
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                store = self.store.name(),
                interval_secs = self.interval.as_secs(),
                "Spoke TTL enforcer started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(store = self.store.name(), error = %e, "Spoke TTL pass failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!(store = self.store.name(), "Spoke TTL enforcer stopped");
                        break;
                    }
                }
            }
        })
    }
}
