//! Query descriptions and the fan-out result accumulator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::channel::ChannelConfig;
use crate::key::ContentKey;
use crate::path::{TimePath, TimeUnit};

/// Which tier(s) a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Location {
    #[default]
    All,
    Cache,
    CacheWrite,
    CacheRead,
    LongTerm,
    LongTermSingle,
    LongTermBatch,
}

/// Which side of a historical channel's mutable boundary a query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Epoch {
    #[default]
    Immutable,
    Mutable,
    All,
}

impl Epoch {
    pub fn includes(&self, config: &ChannelConfig, key: &ContentKey) -> bool {
        match self {
            Epoch::All => true,
            Epoch::Immutable => config.is_immutable(key),
            Epoch::Mutable => !config.is_immutable(key),
        }
    }
}

/// Keys in one time bucket, or from a bucket's start up to `limit_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeQuery {
    pub channel: String,
    pub start_time: DateTime<Utc>,
    pub unit: TimeUnit,
    pub location: Location,
    pub stable: bool,
    pub epoch: Epoch,
    pub limit_key: Option<ContentKey>,
}

impl TimeQuery {
    pub fn new(channel: impl Into<String>, start_time: DateTime<Utc>, unit: TimeUnit) -> Self {
        Self {
            channel: channel.into(),
            start_time,
            unit,
            location: Location::All,
            stable: true,
            epoch: Epoch::Immutable,
            limit_key: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_stable(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }

    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_limit_key(mut self, limit_key: ContentKey) -> Self {
        self.limit_key = Some(limit_key);
        self
    }

    pub fn time_path(&self) -> TimePath {
        TimePath::new(self.start_time, self.unit)
    }

    /// First instant covered.
    pub fn start(&self) -> DateTime<Utc> {
        self.unit.round(self.start_time)
    }

    /// Last instant covered, inclusive.
    pub fn end(&self) -> DateTime<Utc> {
        match &self.limit_key {
            Some(limit) => limit.time(),
            None => self.time_path().end() - Duration::milliseconds(1),
        }
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        if key.time() < self.start() {
            return false;
        }
        match &self.limit_key {
            Some(limit) => key <= limit,
            None => self.time_path().contains(key),
        }
    }

    pub fn outside_of_cache(&self, cache_time: DateTime<Utc>) -> bool {
        self.start() < cache_time
    }
}

/// Up to `count` keys after (`next`) or before a start key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionQuery {
    pub channel: String,
    pub start_key: ContentKey,
    pub count: usize,
    pub next: bool,
    pub location: Location,
    pub stable: bool,
    pub epoch: Epoch,
    /// Lower bound for backward scans.
    pub earliest_time: Option<DateTime<Utc>>,
}

impl DirectionQuery {
    pub fn new(channel: impl Into<String>, start_key: ContentKey, count: usize, next: bool) -> Self {
        Self {
            channel: channel.into(),
            start_key,
            count,
            next,
            location: Location::All,
            stable: true,
            epoch: Epoch::Immutable,
            earliest_time: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_stable(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }

    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_earliest_time(mut self, earliest: DateTime<Utc>) -> Self {
        self.earliest_time = Some(earliest);
        self
    }

    pub fn with_start_key(mut self, start_key: ContentKey) -> Self {
        self.start_key = start_key;
        self
    }

    pub fn outside_of_cache(&self, cache_time: DateTime<Utc>) -> bool {
        !self.next || self.start_key.time() < cache_time
    }

    /// Keeps the `count` keys nearest the start key.
    pub fn trim(&self, keys: BTreeSet<ContentKey>) -> BTreeSet<ContentKey> {
        if keys.len() <= self.count {
            return keys;
        }
        if self.next {
            keys.into_iter().take(self.count).collect()
        } else {
            let skip = keys.len() - self.count;
            keys.into_iter().skip(skip).collect()
        }
    }
}

/// Merged keys from N stores queried in parallel.
///
/// A result is complete only when every expected store reported success; one failure makes
/// the whole result unusable, however many keys the others returned.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    expected: usize,
    successes: usize,
    failures: usize,
    keys: BTreeSet<ContentKey>,
}

impl QueryResult {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            ..Default::default()
        }
    }

    pub fn add_keys(&mut self, keys: impl IntoIterator<Item = ContentKey>) {
        self.successes += 1;
        self.keys.extend(keys);
    }

    pub fn add_failure(&mut self) {
        self.failures += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.failures == 0 && self.successes == self.expected
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn keys(&self) -> &BTreeSet<ContentKey> {
        &self.keys
    }

    pub fn into_keys(self) -> BTreeSet<ContentKey> {
        self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(mi: u32, s: u32, ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, mi, s).unwrap() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_seconds_query_bounds() {
        let query = TimeQuery::new("c", at(1, 30, 400), TimeUnit::Seconds);
        assert!(query.contains(&ContentKey::new(at(1, 30, 0), "a")));
        assert!(query.contains(&ContentKey::new(at(1, 30, 999), "a")));
        assert!(!query.contains(&ContentKey::new(at(1, 31, 0), "a")));
        assert!(!query.contains(&ContentKey::new(at(1, 29, 999), "a")));
        assert_eq!(query.end(), at(1, 30, 999));
    }

    #[test]
    fn test_limit_key_extends_window() {
        let limit = ContentKey::last_key(at(5, 0, 0));
        let query = TimeQuery::new("c", at(1, 0, 0), TimeUnit::Minutes).with_limit_key(limit);
        assert!(query.contains(&ContentKey::new(at(4, 59, 0), "a")));
        assert!(query.contains(&ContentKey::new(at(5, 0, 0), "a")));
        assert!(!query.contains(&ContentKey::new(at(5, 0, 1), "a")));
        assert_eq!(query.end(), at(5, 0, 0));
    }

    #[test]
    fn test_direction_trim() {
        let keys: BTreeSet<_> = (0..5).map(|i| ContentKey::new(at(0, i, 0), "a")).collect();
        let next = DirectionQuery::new("c", ContentKey::none(), 2, true);
        let previous = DirectionQuery::new("c", ContentKey::none(), 2, false);
        let first: Vec<_> = next.trim(keys.clone()).into_iter().collect();
        let last: Vec<_> = previous.trim(keys.clone()).into_iter().collect();
        assert_eq!(first, keys.iter().take(2).cloned().collect::<Vec<_>>());
        assert_eq!(last, keys.iter().skip(3).cloned().collect::<Vec<_>>());
    }

    #[test]
    fn test_query_result_fails_closed() {
        let mut result = QueryResult::new(2);
        result.add_keys(vec![ContentKey::new_now()]);
        assert!(!result.is_complete());
        result.add_failure();
        assert!(!result.is_complete());
        assert_eq!(result.keys().len(), 1);

        let mut ok = QueryResult::new(2);
        ok.add_keys(vec![]);
        ok.add_keys(vec![]);
        assert!(ok.is_complete());
    }

    #[test]
    fn test_outside_of_cache() {
        let cache_time = at(10, 0, 0);
        let old = DirectionQuery::new("c", ContentKey::new(at(5, 0, 0), "a"), 1, true);
        let recent = DirectionQuery::new("c", ContentKey::new(at(15, 0, 0), "a"), 1, true);
        assert!(old.outside_of_cache(cache_time));
        assert!(!recent.outside_of_cache(cache_time));
        let backward = DirectionQuery::new("c", ContentKey::new(at(15, 0, 0), "a"), 1, false);
        assert!(backward.outside_of_cache(cache_time));
    }
}
