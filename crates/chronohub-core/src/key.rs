//! Content keys.
//!
//! A [`ContentKey`] is immutable once assigned. Two keys at the same millisecond are ordered by
//! their hash, so ordering between writers racing inside one millisecond is arbitrary but total.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::time::{self, truncate_millis};

const HASH_LEN: usize = 6;
const NONE_HASH: &str = "none";
const FIRST_HASH: &str = "0";
const LAST_HASH: &str = "~ZZZZZZZZZ";

/// Ordered `(time, hash)` identifier for an item in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey {
    time: DateTime<Utc>,
    hash: String,
}

impl ContentKey {
    pub fn new(time: DateTime<Utc>, hash: impl Into<String>) -> Self {
        Self {
            time: truncate_millis(time),
            hash: hash.into(),
        }
    }

    /// New key at `time` with a random hash.
    pub fn with_time(time: DateTime<Utc>) -> Self {
        Self::new(time, random_hash())
    }

    pub fn new_now() -> Self {
        Self::with_time(time::now())
    }

    /// Sentinel meaning "this channel is known to be empty".
    pub fn none() -> Self {
        Self::new(time::earliest() + chrono::Duration::milliseconds(1), NONE_HASH)
    }

    pub fn is_none(&self) -> bool {
        *self == Self::none()
    }

    /// Smallest key at `time`.
    pub fn first_key(time: DateTime<Utc>) -> Self {
        Self::new(time, FIRST_HASH)
    }

    /// Largest key at `time`, used as an inclusive upper bound.
    pub fn last_key(time: DateTime<Utc>) -> Self {
        Self::new(time, LAST_HASH)
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn millis(&self) -> i64 {
        self.time.timestamp_millis()
    }

    /// `yyyy/MM/dd/HH/mm/ss/SSS/hash`
    pub fn to_url(&self) -> String {
        format!("{}/{}", format_time_segments(&self.time, 7), self.hash)
    }

    /// Parses a url segment. Malformed input yields `None`.
    pub fn from_url(url: &str) -> Option<Self> {
        let url = url.trim_start_matches('/');
        let parts: Vec<&str> = url.splitn(8, '/').collect();
        if parts.len() != 8 {
            return None;
        }
        let time = parse_time_segments(&parts[..7])?;
        let hash = parts[7];
        if !valid_hash(hash) {
            return None;
        }
        Some(Self::new(time, hash))
    }

    /// True when the key survives a `to_url` / `from_url` round trip.
    pub fn is_valid(&self) -> bool {
        valid_hash(&self.hash)
    }
}

fn valid_hash(hash: &str) -> bool {
    !hash.is_empty() && !hash.contains('/') && !hash.chars().any(char::is_whitespace)
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl Serialize for ContentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_url())
    }
}

impl<'de> Deserialize<'de> for ContentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let url = String::deserialize(deserializer)?;
        ContentKey::from_url(&url)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid content key {url}")))
    }
}

/// A write intent: `channel` has `key` in the fast tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelContentKey {
    pub channel: String,
    pub key: ContentKey,
}

impl ChannelContentKey {
    pub fn new(channel: impl Into<String>, key: ContentKey) -> Self {
        Self {
            channel: channel.into(),
            key,
        }
    }
}

impl fmt::Display for ChannelContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.key)
    }
}

pub(crate) fn random_hash() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(HASH_LEN)
        .map(char::from)
        .collect()
}

const SEGMENT_WIDTHS: [usize; 7] = [4, 2, 2, 2, 2, 2, 3];

/// Parses leading `yyyy/MM/dd/HH/mm/ss/SSS` segments. Missing trailing segments default to
/// the start of the unit.
pub(crate) fn parse_time_segments(segments: &[&str]) -> Option<DateTime<Utc>> {
    if segments.is_empty() || segments.len() > SEGMENT_WIDTHS.len() {
        return None;
    }
    let mut values = [0u32, 1, 1, 0, 0, 0, 0];
    for (i, segment) in segments.iter().enumerate() {
        if segment.len() != SEGMENT_WIDTHS[i] || !segment.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        values[i] = segment.parse().ok()?;
    }
    let [year, month, day, hour, minute, second, millis] = values;
    let base = Utc
        .with_ymd_and_hms(year as i32, month, day, hour, minute, second)
        .single()?;
    Some(base + chrono::Duration::milliseconds(millis as i64))
}

/// Renders the first `depth` segments of `time`.
pub(crate) fn format_time_segments(time: &DateTime<Utc>, depth: usize) -> String {
    let fields = [
        format!("{:04}", time.year()),
        format!("{:02}", time.month()),
        format!("{:02}", time.day()),
        format!("{:02}", time.hour()),
        format!("{:02}", time.minute()),
        format!("{:02}", time.second()),
        format!("{:03}", time.timestamp_subsec_millis()),
    ];
    fields[..depth.min(fields.len())].join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap() + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn test_url_round_trip() {
        let key = ContentKey::new(at(2024, 1, 1, 0, 0, 0, 0), "abc");
        assert_eq!(key.to_url(), "2024/01/01/00/00/00/000/abc");
        assert_eq!(ContentKey::from_url(&key.to_url()), Some(key));

        for _ in 0..50 {
            let key = ContentKey::new_now();
            assert_eq!(ContentKey::from_url(&key.to_url()), Some(key));
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(ContentKey::from_url(""), None);
        assert_eq!(ContentKey::from_url("2024/01/01/00/00/00/000"), None);
        assert_eq!(ContentKey::from_url("2024/01/01/00/00/00/000/"), None);
        assert_eq!(ContentKey::from_url("2024/13/01/00/00/00/000/abc"), None);
        assert_eq!(ContentKey::from_url("2024/1/01/00/00/00/000/abc"), None);
        assert_eq!(ContentKey::from_url("2024/01/01/00/00/00/0a0/abc"), None);
        assert_eq!(ContentKey::from_url("2024/01/01/00/00/00/000/a/b"), None);
    }

    #[test]
    fn test_unparseable_hashes_are_invalid() {
        let t = at(2024, 1, 1, 0, 0, 0, 0);
        assert!(ContentKey::new(t, "abc").is_valid());
        assert!(ContentKey::with_time(t).is_valid());
        for hash in ["", "a/b", "a b", "tab\t"] {
            let key = ContentKey::new(t, hash);
            assert!(!key.is_valid());
            assert_eq!(ContentKey::from_url(&key.to_url()), None);
        }
    }

    #[test]
    fn test_leading_slash_is_accepted() {
        let key = ContentKey::from_url("/2014/11/18/00/57/24/015/1").unwrap();
        assert_eq!(key.hash(), "1");
        assert_eq!(key.millis() % 1000, 15);
    }

    #[test]
    fn test_ordering_is_time_then_hash() {
        let t = at(2024, 1, 1, 0, 0, 0, 0);
        let a = ContentKey::new(t, "b");
        let b = ContentKey::new(t + chrono::Duration::milliseconds(1), "a");
        let c = ContentKey::new(t, "c");
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn test_first_and_last_bound_random_keys() {
        let t = at(2020, 6, 1, 12, 30, 45, 999);
        for _ in 0..50 {
            let k = ContentKey::with_time(t);
            assert!(ContentKey::first_key(t) < k);
            assert!(k < ContentKey::last_key(t));
        }
    }

    #[test]
    fn test_none_sorts_before_real_keys() {
        let none = ContentKey::none();
        assert!(none.is_none());
        assert!(none < ContentKey::new(at(1970, 1, 1, 0, 0, 0, 2), "a"));
        assert!(!ContentKey::new_now().is_none());
    }

    #[test]
    fn test_serde_uses_url() {
        let key = ContentKey::new(at(2024, 1, 1, 0, 0, 0, 0), "abc");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2024/01/01/00/00/00/000/abc\"");
        let back: ContentKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
