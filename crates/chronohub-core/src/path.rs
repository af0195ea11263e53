//! Time buckets.
//!
//! A [`TimePath`] is a whole unit of the key tree: `2024/01/01/00/05` is the MINUTES bucket that
//! holds every key from `00:05:00.000` up to (not including) `00:06:00.000`. Minute paths are the
//! granularity of batch storage and of verifier scan windows.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::key::{format_time_segments, parse_time_segments, ContentKey};
use crate::time::from_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Millis,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn duration(self) -> Duration {
        match self {
            TimeUnit::Millis => Duration::milliseconds(1),
            TimeUnit::Seconds => Duration::seconds(1),
            TimeUnit::Minutes => Duration::minutes(1),
            TimeUnit::Hours => Duration::hours(1),
            TimeUnit::Days => Duration::days(1),
        }
    }

    /// Number of url segments a bucket of this unit spans.
    pub fn depth(self) -> usize {
        match self {
            TimeUnit::Millis => 7,
            TimeUnit::Seconds => 6,
            TimeUnit::Minutes => 5,
            TimeUnit::Hours => 4,
            TimeUnit::Days => 3,
        }
    }

    /// Rounds `time` down to this unit's boundary.
    pub fn round(self, time: DateTime<Utc>) -> DateTime<Utc> {
        let unit = self.duration().num_milliseconds();
        let millis = time.timestamp_millis();
        from_millis(millis - millis.rem_euclid(unit)).unwrap_or(time)
    }

    /// Path prefix of the bucket holding `time`, e.g. `2024/01/01/00` for HOURS.
    pub fn format(self, time: DateTime<Utc>) -> String {
        format_time_segments(&self.round(time), self.depth())
    }
}

/// A whole-unit bucket in the key tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimePath {
    time: DateTime<Utc>,
    unit: TimeUnit,
}

impl TimePath {
    pub fn new(time: DateTime<Utc>, unit: TimeUnit) -> Self {
        Self {
            time: unit.round(time),
            unit,
        }
    }

    pub fn second(time: DateTime<Utc>) -> Self {
        Self::new(time, TimeUnit::Seconds)
    }

    pub fn minute(time: DateTime<Utc>) -> Self {
        Self::new(time, TimeUnit::Minutes)
    }

    pub fn hour(time: DateTime<Utc>) -> Self {
        Self::new(time, TimeUnit::Hours)
    }

    pub fn from_url(url: &str, unit: TimeUnit) -> Option<Self> {
        let segments: Vec<&str> = url.trim_matches('/').split('/').collect();
        if segments.len() != unit.depth() {
            return None;
        }
        parse_time_segments(&segments).map(|time| Self::new(time, unit))
    }

    pub fn to_url(&self) -> String {
        self.unit.format(self.time)
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// First instant in the bucket.
    pub fn start(&self) -> DateTime<Utc> {
        self.time
    }

    /// First instant after the bucket.
    pub fn end(&self) -> DateTime<Utc> {
        self.time + self.unit.duration()
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        key.time() >= self.start() && key.time() < self.end()
    }

    pub fn next(&self) -> Self {
        Self::new(self.end(), self.unit)
    }

    pub fn previous(&self) -> Self {
        Self::new(self.time - self.unit.duration(), self.unit)
    }

    pub fn first_key(&self) -> ContentKey {
        ContentKey::first_key(self.start())
    }

    /// Largest key the bucket can hold.
    pub fn last_key(&self) -> ContentKey {
        ContentKey::last_key(self.end() - Duration::milliseconds(1))
    }

    /// Every bucket of `unit` that overlaps `[start, end]`, oldest first.
    pub fn buckets(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        unit: TimeUnit,
    ) -> impl Iterator<Item = TimePath> {
        let first = TimePath::new(start, unit);
        std::iter::successors(Some(first), |p| Some(p.next())).take_while(move |p| p.start() <= end)
    }
}

/// Time range `[start, end)` covered by a partial url such as `2024/01` or `2024/01/01/05`.
pub fn segment_range(segments: &[&str]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = parse_time_segments(segments)?;
    let end = match segments.len() {
        1 => start.checked_add_months(Months::new(12))?,
        2 => start.checked_add_months(Months::new(1))?,
        3 => start + TimeUnit::Days.duration(),
        4 => start + TimeUnit::Hours.duration(),
        5 => start + TimeUnit::Minutes.duration(),
        6 => start + TimeUnit::Seconds.duration(),
        _ => start + TimeUnit::Millis.duration(),
    };
    Some((start, end))
}

impl fmt::Display for TimePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, mi: u32, s: u32, ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, mi, s).unwrap() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_round_down() {
        let t = at(10, 37, 42, 512);
        assert_eq!(TimeUnit::Seconds.round(t), at(10, 37, 42, 0));
        assert_eq!(TimeUnit::Minutes.round(t), at(10, 37, 0, 0));
        assert_eq!(TimeUnit::Hours.round(t), at(10, 0, 0, 0));
        assert_eq!(TimeUnit::Days.round(t), at(0, 0, 0, 0));
        assert_eq!(TimeUnit::Millis.round(t), t);
    }

    #[test]
    fn test_format_prefix() {
        let t = at(10, 37, 42, 512);
        assert_eq!(TimeUnit::Days.format(t), "2024/01/01");
        assert_eq!(TimeUnit::Minutes.format(t), "2024/01/01/10/37");
        assert_eq!(TimeUnit::Seconds.format(t), "2024/01/01/10/37/42");
    }

    #[test]
    fn test_minute_path_contains() {
        let path = TimePath::minute(at(0, 5, 30, 0));
        assert_eq!(path.to_url(), "2024/01/01/00/05");
        assert!(path.contains(&ContentKey::new(at(0, 5, 0, 0), "a")));
        assert!(path.contains(&ContentKey::new(at(0, 5, 59, 999), "a")));
        assert!(!path.contains(&ContentKey::new(at(0, 6, 0, 0), "a")));
        assert!(!path.contains(&ContentKey::new(at(0, 4, 59, 999), "a")));
        assert!(path.last_key() < ContentKey::first_key(at(0, 6, 0, 0)));
    }

    #[test]
    fn test_from_url_round_trip() {
        let path = TimePath::minute(at(23, 59, 0, 0));
        assert_eq!(TimePath::from_url(&path.to_url(), TimeUnit::Minutes), Some(path));
        assert_eq!(TimePath::from_url("2024/01/01/23", TimeUnit::Minutes), None);
    }

    #[test]
    fn test_next_crosses_day() {
        let path = TimePath::minute(at(23, 59, 0, 0));
        assert_eq!(path.next().to_url(), "2024/01/02/00/00");
        assert_eq!(path.next().previous(), path);
    }

    #[test]
    fn test_segment_range() {
        let (start, end) = segment_range(&["2024", "02"]).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        let (start, end) = segment_range(&["2024", "01", "01", "00", "05"]).unwrap();
        assert_eq!(end - start, Duration::minutes(1));
        assert!(segment_range(&["2024", "1"]).is_none());
        assert!(segment_range(&["tmp"]).is_none());
    }

    #[test]
    fn test_buckets_cover_range() {
        let buckets: Vec<_> =
            TimePath::buckets(at(0, 58, 30, 0), at(1, 1, 0, 0), TimeUnit::Minutes).collect();
        let urls: Vec<_> = buckets.iter().map(|p| p.to_url()).collect();
        assert_eq!(
            urls,
            vec![
                "2024/01/01/00/58",
                "2024/01/01/00/59",
                "2024/01/01/01/00",
                "2024/01/01/01/01"
            ]
        );
    }
}
