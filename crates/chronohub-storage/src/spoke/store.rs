//! File-backed fast tier store.
//!
//! ## Layout
//!
//! ```text
//! {root}/{channel}/2024/01/01/00/05/30000abc
//!                  └─ minute dir ─┘ └┬┘└┬┘└┬┘
//!                                   ss SSS hash
//! ```
//!
//! Directory names are zero padded, so a lexicographic walk is a chronological walk. Every scan
//! prunes directories by the time range their name covers and never lists a subtree that cannot
//! hold a matching key.
//!
//! Writes go to a dot-prefixed temporary file in the minute directory and are renamed into place,
//! so readers and scans never see a partial item.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;

use chronohub_core::{segment_range, time, ContentKey};

use crate::error::{Error, Result};

const MINUTE_DEPTH: usize = 5;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Ascending,
    Descending,
}

/// One fast tier store on the local filesystem (the write cache or the read cache).
#[derive(Debug, Clone)]
pub struct FileSpokeStore {
    name: &'static str,
    root: PathBuf,
}

impl FileSpokeStore {
    pub fn new(name: &'static str, root: impl Into<PathBuf>) -> Self {
        Self {
            name,
            root: root.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel: &str) -> Result<PathBuf> {
        validate_channel(channel)?;
        Ok(self.root.join(channel))
    }

    fn item_path(&self, channel: &str, key: &ContentKey) -> Result<PathBuf> {
        let url = key.to_url();
        let parts: Vec<&str> = url.splitn(8, '/').collect();
        if parts.len() != 8 || parts[7].contains('/') {
            return Err(Error::InvalidRequest(format!("unusable key {}", url)));
        }
        let mut path = self.channel_dir(channel)?;
        for part in &parts[..MINUTE_DEPTH] {
            path.push(part);
        }
        path.push(format!("{}{}{}", parts[5], parts[6], parts[7]));
        Ok(path)
    }

    pub async fn write(&self, channel: &str, key: &ContentKey, bytes: &[u8]) -> Result<()> {
        let path = self.item_path(channel, key)?;
        let dir = path
            .parent()
            .ok_or_else(|| Error::InvalidRequest(format!("no parent for {}", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            file_name,
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(store = self.name, channel, key = %key, size = bytes.len(), "Spoke item written");
        Ok(())
    }

    pub async fn read(&self, channel: &str, key: &ContentKey) -> Result<Option<Bytes>> {
        let path = self.item_path(channel, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, channel: &str, key: &ContentKey) -> Result<()> {
        let path = self.item_path(channel, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_channel(&self, channel: &str) -> Result<()> {
        let dir = self.channel_dir(channel)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Channel directories present in the store.
    pub async fn channels(&self) -> Result<Vec<String>> {
        let mut channels = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(channels),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    channels.push(name.to_string());
                }
            }
        }
        channels.sort();
        Ok(channels)
    }

    /// Keys with `start <= time <= end`.
    pub async fn query(
        &self,
        channel: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>> {
        let mut found = BTreeSet::new();
        self.walk_minutes(channel, start, end, Order::Ascending, |keys| {
            found.extend(
                keys.into_iter()
                    .filter(|k| k.time() >= start && k.time() <= end),
            );
            true
        })
        .await?;
        Ok(found)
    }

    /// Up to `count` keys after `start_key`, none newer than `end`.
    pub async fn next(
        &self,
        channel: &str,
        start_key: &ContentKey,
        count: usize,
        end: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>> {
        let mut found = BTreeSet::new();
        self.walk_minutes(channel, start_key.time(), end, Order::Ascending, |keys| {
            found.extend(
                keys.into_iter()
                    .filter(|k| k > start_key && k.time() <= end),
            );
            found.len() < count
        })
        .await?;
        Ok(found.into_iter().take(count).collect())
    }

    /// Up to `count` keys before `start_key`, none older than `earliest`.
    pub async fn previous(
        &self,
        channel: &str,
        start_key: &ContentKey,
        count: usize,
        earliest: DateTime<Utc>,
    ) -> Result<BTreeSet<ContentKey>> {
        let mut found = BTreeSet::new();
        self.walk_minutes(channel, earliest, start_key.time(), Order::Descending, |keys| {
            found.extend(
                keys.into_iter()
                    .filter(|k| k < start_key && k.time() >= earliest),
            );
            found.len() < count
        })
        .await?;
        let skip = found.len().saturating_sub(count);
        Ok(found.into_iter().skip(skip).collect())
    }

    /// Greatest key strictly before `limit`.
    ///
    /// The walk starts at the directory holding `limit` and backtracks across minute, hour, day
    /// and month boundaries until a non-empty minute yields a key below the limit.
    pub async fn latest(&self, channel: &str, limit: &ContentKey) -> Result<Option<ContentKey>> {
        Ok(self
            .previous(channel, limit, 1, time::earliest())
            .await?
            .into_iter()
            .next_back())
    }

    pub async fn oldest_key(&self, channel: &str) -> Result<Option<ContentKey>> {
        let mut oldest = None;
        self.walk_minutes(
            channel,
            time::earliest(),
            DateTime::<Utc>::MAX_UTC,
            Order::Ascending,
            |keys| {
                oldest = keys.into_iter().next();
                oldest.is_none()
            },
        )
        .await?;
        Ok(oldest)
    }

    /// Deletes every item older than `cutoff` and returns how many were removed.
    ///
    /// Subtrees whose whole range is before the cutoff are removed at once. Minute directories
    /// straddling the cutoff are pruned file by file, so an item newer than the cutoff is never
    /// touched.
    pub async fn enforce_ttl(&self, channel: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        let mut stack: Vec<(PathBuf, Vec<String>)> = vec![(self.channel_dir(channel)?, Vec::new())];

        while let Some((dir, segments)) = stack.pop() {
            let names = list_dir(&dir).await?;
            if segments.len() == MINUTE_DEPTH {
                for name in names {
                    if let Some(key) = parse_item_name(&segments, &name) {
                        if key.time() < cutoff && remove_file(&dir.join(&name)).await? {
                            removed += 1;
                        }
                    }
                }
                continue;
            }

            for name in names {
                let mut child = segments.clone();
                child.push(name.clone());
                let refs: Vec<&str> = child.iter().map(String::as_str).collect();
                let Some((start, end)) = segment_range(&refs) else {
                    continue;
                };
                let path = dir.join(&name);
                if end <= cutoff {
                    removed += count_files(&path).await?;
                    match tokio::fs::remove_dir_all(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                } else if start < cutoff {
                    stack.push((path, child));
                }
            }
        }

        if removed > 0 {
            debug!(store = self.name, channel, removed, cutoff = %cutoff, "Spoke TTL enforced");
        }
        Ok(removed)
    }

    /// Deletes items whose file was written more than `max_age` ago, whatever their key time.
    ///
    /// The read cache holds old keys fetched back from long-term storage, so it expires by file
    /// age instead of by key time.
    pub async fn enforce_age(&self, channel: &str, max_age: std::time::Duration) -> Result<u64> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        let mut stack = vec![(self.channel_dir(channel)?, 0)];

        while let Some((dir, depth)) = stack.pop() {
            for name in list_dir(&dir).await? {
                let path = dir.join(&name);
                if depth < MINUTE_DEPTH {
                    stack.push((path, depth + 1));
                    continue;
                }
                if name.starts_with('.') {
                    continue;
                }
                let modified = match tokio::fs::metadata(&path).await {
                    Ok(metadata) => metadata.modified()?,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if modified < cutoff && remove_file(&path).await? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(store = self.name, channel, removed, "Spoke items expired by age");
        }
        Ok(removed)
    }

    /// Visits the keys of each minute directory overlapping `[start, end]` in `order`.
    /// The walk stops when `visit` returns false.
    async fn walk_minutes<F>(
        &self,
        channel: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        order: Order,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(BTreeSet<ContentKey>) -> bool,
    {
        let mut stack: Vec<(PathBuf, Vec<String>)> = vec![(self.channel_dir(channel)?, Vec::new())];

        while let Some((dir, segments)) = stack.pop() {
            let names = list_dir(&dir).await?;
            if segments.len() == MINUTE_DEPTH {
                let keys: BTreeSet<ContentKey> = names
                    .iter()
                    .filter_map(|name| parse_item_name(&segments, name))
                    .collect();
                if !keys.is_empty() && !visit(keys) {
                    return Ok(());
                }
                continue;
            }

            let mut children = Vec::new();
            for name in names {
                let mut child = segments.clone();
                child.push(name.clone());
                let refs: Vec<&str> = child.iter().map(String::as_str).collect();
                if let Some((child_start, child_end)) = segment_range(&refs) {
                    if child_end > start && child_start <= end {
                        children.push((dir.join(&name), child));
                    }
                }
            }
            // the stack pops from the back
            if order == Order::Ascending {
                children.reverse();
            }
            stack.extend(children);
        }
        Ok(())
    }
}

fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty()
        || channel.starts_with('.')
        || channel.contains(['/', '\\'])
        || channel.chars().any(char::is_whitespace)
    {
        return Err(Error::InvalidRequest(format!("invalid channel name {:?}", channel)));
    }
    Ok(())
}

/// Parses `{ss}{SSS}{hash}` inside a minute directory.
fn parse_item_name(segments: &[String], name: &str) -> Option<ContentKey> {
    if name.starts_with('.') {
        return None;
    }
    let seconds = name.get(..2)?;
    let millis = name.get(2..5)?;
    let hash = name.get(5..)?;
    if hash.is_empty() {
        return None;
    }
    ContentKey::from_url(&format!(
        "{}/{}/{}/{}",
        segments.join("/"),
        seconds,
        millis,
        hash
    ))
}

/// Sorted entry names, or nothing if the directory is gone.
async fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

async fn remove_file(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn count_files(dir: &Path) -> Result<u64> {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}
