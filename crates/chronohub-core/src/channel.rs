//! Channel configuration as seen by the storage engine.
//!
//! Channel CRUD lives outside the engine; these values arrive through a provider and change
//! notifications and are never written back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::key::ContentKey;
use crate::time;

/// Which long-term layout a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageMode {
    /// One object per item.
    #[default]
    Single,
    /// One archive plus index per minute.
    Batch,
    /// Single writes, reads from both layouts.
    Both,
}

fn default_ttl_days() -> u32 {
    120
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,

    #[serde(default)]
    pub storage: StorageMode,

    /// Retention of the long-term tier.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,

    #[serde(default)]
    pub keep_forever: bool,

    /// Items at or before this instant are mutable (historical channels only).
    #[serde(default)]
    pub mutable_time: Option<DateTime<Utc>>,

    /// Overrides the node-wide fast tier TTL.
    #[serde(default)]
    pub spoke_ttl_minutes: Option<u32>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageMode::default(),
            ttl_days: default_ttl_days(),
            keep_forever: false,
            mutable_time: None,
            spoke_ttl_minutes: None,
        }
    }

    pub fn with_storage(mut self, storage: StorageMode) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_ttl_days(mut self, ttl_days: u32) -> Self {
        self.ttl_days = ttl_days;
        self
    }

    pub fn with_keep_forever(mut self) -> Self {
        self.keep_forever = true;
        self
    }

    pub fn with_mutable_time(mut self, mutable_time: DateTime<Utc>) -> Self {
        self.mutable_time = Some(time::truncate_millis(mutable_time));
        self
    }

    pub fn with_spoke_ttl_minutes(mut self, minutes: u32) -> Self {
        self.spoke_ttl_minutes = Some(minutes);
        self
    }

    pub fn is_single(&self) -> bool {
        self.storage == StorageMode::Single
    }

    pub fn is_batch(&self) -> bool {
        self.storage == StorageMode::Batch
    }

    pub fn is_both(&self) -> bool {
        self.storage == StorageMode::Both
    }

    /// True when items are copied to the single store.
    pub fn writes_single(&self) -> bool {
        self.storage != StorageMode::Batch
    }

    /// True when minutes are archived to the batch store.
    ///
    /// BOTH channels write new items to the single store only, so each key lands in exactly one
    /// long-term store; they still read batch archives written while the channel was BATCH.
    pub fn writes_batch(&self) -> bool {
        self.storage == StorageMode::Batch
    }

    /// True when reads consult the batch store.
    pub fn reads_batch(&self) -> bool {
        self.storage != StorageMode::Single
    }

    pub fn is_historical(&self) -> bool {
        self.mutable_time.is_some()
    }

    /// Oldest instant still retained by the long-term tier.
    pub fn ttl_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.keep_forever || self.is_historical() {
            time::earliest()
        } else {
            now - Duration::days(self.ttl_days as i64)
        }
    }

    /// Fast tier TTL for this channel.
    pub fn spoke_ttl(&self, default_minutes: u32) -> Duration {
        Duration::minutes(self.spoke_ttl_minutes.unwrap_or(default_minutes) as i64)
    }

    /// True when `key` lies in the immutable part of the channel.
    pub fn is_immutable(&self, key: &ContentKey) -> bool {
        match self.mutable_time {
            Some(mutable_time) => key.time() > mutable_time,
            None => true,
        }
    }
}
