//! Membership events.
//!
//! Events are stored by the coordination service under names of the form
//! `{created_millis}|{server}|{ADDED|REMOVED}`; the event time is the instant the entry was
//! written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use chronohub_core::time;

use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterEventKind {
    Added,
    Removed,
}

impl fmt::Display for ClusterEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEventKind::Added => f.write_str("ADDED"),
            ClusterEventKind::Removed => f.write_str("REMOVED"),
        }
    }
}

/// A node joined or left the fast tier at `time`. Ordered by time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub time: DateTime<Utc>,
    pub server_id: String,
    pub kind: ClusterEventKind,
}

impl ClusterEvent {
    pub fn added(server_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            time: time::truncate_millis(time),
            server_id: server_id.into(),
            kind: ClusterEventKind::Added,
        }
    }

    pub fn removed(server_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            time: time::truncate_millis(time),
            server_id: server_id.into(),
            kind: ClusterEventKind::Removed,
        }
    }

    pub fn is_added(&self) -> bool {
        self.kind == ClusterEventKind::Added
    }

    /// Name used when storing the event in the coordination service.
    pub fn to_name(&self, created: DateTime<Utc>) -> String {
        format!("{}|{}|{}", created.timestamp_millis(), self.server_id, self.kind)
    }

    /// Rebuilds an event from its stored name and modification time.
    pub fn from_name(name: &str, modified: DateTime<Utc>) -> Result<Self> {
        let name = name.rsplit('/').next().unwrap_or(name);
        let parts: Vec<&str> = name.split('|').collect();
        let [_, server, kind] = parts.as_slice() else {
            return Err(ClusterError::InvalidEvent(name.to_string()));
        };
        if server.is_empty() {
            return Err(ClusterError::InvalidEvent(name.to_string()));
        }
        match *kind {
            "ADDED" => Ok(Self::added(*server, modified)),
            "REMOVED" => Ok(Self::removed(*server, modified)),
            _ => Err(ClusterError::InvalidEvent(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_name_round_trip() {
        let created = Utc.timestamp_millis_opt(1_000).unwrap();
        let modified = Utc.timestamp_millis_opt(5_000).unwrap();
        let event = ClusterEvent::removed("10.0.0.1", modified);
        let name = event.to_name(created);
        assert_eq!(name, "1000|10.0.0.1|REMOVED");
        assert_eq!(ClusterEvent::from_name(&format!("/SCE/{name}"), modified).unwrap(), event);
    }

    #[test]
    fn test_invalid_names() {
        let now = time::now();
        assert!(ClusterEvent::from_name("1000|A", now).is_err());
        assert!(ClusterEvent::from_name("1000||ADDED", now).is_err());
        assert!(ClusterEvent::from_name("1000|A|GONE", now).is_err());
    }

    #[test]
    fn test_ordered_by_time() {
        let t = Utc.timestamp_millis_opt(10_000).unwrap();
        let later = ClusterEvent::added("A", t + chrono::Duration::seconds(1));
        let earlier = ClusterEvent::added("Z", t);
        assert!(earlier < later);
    }
}
