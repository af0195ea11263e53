//! Consistent-hash rings over fast tier membership.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use chronohub_core::time;

use crate::event::ClusterEvent;

/// Replica count used when none is configured.
pub const DEFAULT_REPLICAS: usize = 3;

/// Stable 64-bit position on the ring.
fn hash_string(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Ring membership active during `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpokeRing {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    servers: BTreeSet<String>,
    positions: Vec<(u64, String)>,
}

impl SpokeRing {
    fn new(start: DateTime<Utc>, servers: BTreeSet<String>) -> Self {
        let mut positions: Vec<(u64, String)> = servers
            .iter()
            .map(|server| (hash_string(server), server.clone()))
            .collect();
        positions.sort();
        Self {
            start,
            end: None,
            servers,
            positions,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    pub fn servers(&self) -> &BTreeSet<String> {
        &self.servers
    }

    pub fn is_active_at(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && self.end.map_or(true, |end| time < end)
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= end && self.end.map_or(true, |ring_end| ring_end > start)
    }

    /// The `replicas` servers found clockwise from the channel's position. With fewer live
    /// servers than `replicas`, every server owns the channel.
    pub fn owners(&self, channel: &str, replicas: usize) -> BTreeSet<String> {
        if self.positions.len() <= replicas {
            return self.servers.clone();
        }
        let point = hash_string(channel);
        let first = self
            .positions
            .iter()
            .position(|(position, _)| *position >= point)
            .unwrap_or(0);
        self.positions
            .iter()
            .cycle()
            .skip(first)
            .take(replicas)
            .map(|(_, server)| server.clone())
            .collect()
    }
}

/// Ring history rebuilt from the membership event log.
#[derive(Debug, Clone)]
pub struct SpokeRings {
    replicas: usize,
    ttl: Duration,
    rings: Vec<SpokeRing>,
}

impl SpokeRings {
    /// `ttl` is the fast tier TTL: events older than that no longer describe live data.
    pub fn new(replicas: usize, ttl: Duration) -> Self {
        Self {
            replicas: replicas.max(1),
            ttl,
            rings: Vec::new(),
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Rebuilds the history from `events` and returns the events still worth keeping.
    ///
    /// Replaying the same log twice yields the same rings; duplicates are ignored.
    pub fn process(&mut self, events: impl IntoIterator<Item = ClusterEvent>) -> Vec<ClusterEvent> {
        self.process_at(events, time::now())
    }

    pub fn process_at(
        &mut self,
        events: impl IntoIterator<Item = ClusterEvent>,
        now: DateTime<Utc>,
    ) -> Vec<ClusterEvent> {
        let events: BTreeSet<ClusterEvent> = events.into_iter().collect();
        let cutoff = now - self.ttl;

        let mut rings: Vec<SpokeRing> = Vec::new();
        let mut members: BTreeSet<String> = BTreeSet::new();
        let mut live_at_cutoff: Vec<ClusterEvent> = Vec::new();
        let mut relevant: Vec<ClusterEvent> = Vec::new();

        for event in &events {
            if event.time < cutoff {
                live_at_cutoff.retain(|e| e.server_id != event.server_id);
                if event.is_added() {
                    live_at_cutoff.push(event.clone());
                }
            } else {
                relevant.push(event.clone());
            }

            let changed = if event.is_added() {
                members.insert(event.server_id.clone())
            } else {
                members.remove(&event.server_id)
            };
            if !changed {
                continue;
            }
            if let Some(last) = rings.last_mut() {
                if last.start == event.time {
                    *last = SpokeRing::new(event.time, members.clone());
                    continue;
                }
                last.end = Some(event.time);
            }
            rings.push(SpokeRing::new(event.time, members.clone()));
        }

        self.rings = rings;
        live_at_cutoff.extend(relevant);
        live_at_cutoff.sort();
        live_at_cutoff
    }

    pub fn rings(&self) -> &[SpokeRing] {
        &self.rings
    }

    /// Current members.
    pub fn all_servers(&self) -> BTreeSet<String> {
        self.rings
            .last()
            .map(|ring| ring.servers.clone())
            .unwrap_or_default()
    }

    /// Current owners of `channel`.
    pub fn get_servers(&self, channel: &str) -> BTreeSet<String> {
        self.rings
            .last()
            .map(|ring| ring.owners(channel, self.replicas))
            .unwrap_or_default()
    }

    /// Owners of `channel` at `time`.
    pub fn get_servers_at(&self, channel: &str, time: DateTime<Utc>) -> BTreeSet<String> {
        self.rings
            .iter()
            .rev()
            .find(|ring| ring.is_active_at(time))
            .map(|ring| ring.owners(channel, self.replicas))
            .unwrap_or_default()
    }

    /// Every node that owned `channel` at any instant in `[start, end]`.
    pub fn get_servers_between(
        &self,
        channel: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BTreeSet<String> {
        self.rings
            .iter()
            .filter(|ring| ring.overlaps(start, end))
            .flat_map(|ring| ring.owners(channel, self.replicas))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const STEP: i64 = 10;

    fn steps() -> Vec<DateTime<Utc>> {
        let start = time::now() - Duration::seconds(100 * STEP);
        (0..100).map(|i| start + Duration::seconds(STEP * i)).collect()
    }

    fn half(t: DateTime<Utc>) -> DateTime<Utc> {
        t + Duration::seconds(STEP / 2)
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn rings() -> SpokeRings {
        SpokeRings::new(DEFAULT_REPLICAS, Duration::minutes(60))
    }

    fn five_nodes(steps: &[DateTime<Utc>]) -> Vec<ClusterEvent> {
        ["A", "B", "C", "D", "E"]
            .iter()
            .enumerate()
            .map(|(i, s)| ClusterEvent::added(*s, steps[i]))
            .collect()
    }

    fn rolling_restart(steps: &[DateTime<Utc>]) -> Vec<ClusterEvent> {
        let mut events = five_nodes(steps);
        for (i, server) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            events.push(ClusterEvent::removed(*server, steps[5 + 2 * i]));
            events.push(ClusterEvent::added(*server, steps[6 + 2 * i]));
        }
        events
    }

    #[test]
    fn test_three_nodes_own_everything() {
        let steps = steps();
        let mut rings = rings();
        rings.process(five_nodes(&steps).into_iter().take(3));

        assert_eq!(rings.get_servers("test1"), set(&["A", "B", "C"]));
        assert_eq!(rings.get_servers_at("channel2", steps[0]), set(&["A"]));
        assert_eq!(rings.get_servers_at("channel2", steps[1]), set(&["A", "B"]));
        assert_eq!(rings.get_servers_at("channel2", steps[2]), set(&["A", "B", "C"]));
        assert_eq!(
            rings.get_servers_between("channel2", steps[0], steps[2]),
            set(&["A", "B", "C"])
        );
    }

    #[test]
    fn test_replica_count_with_five_nodes() {
        let steps = steps();
        let mut rings = rings();
        rings.process(five_nodes(&steps));

        let all = set(&["A", "B", "C", "D", "E"]);
        for channel in ["test1", "channel2", "other", "name", "test3"] {
            let owners = rings.get_servers(channel);
            assert_eq!(owners.len(), DEFAULT_REPLICAS, "channel {channel}");
            assert!(owners.is_subset(&all));
            assert_eq!(rings.get_servers_at(channel, half(steps[4])), owners);
        }
    }

    #[test]
    fn test_range_unions_membership_changes() {
        let steps = steps();
        let mut rings = rings();
        rings.process(five_nodes(&steps));

        let whole = rings.get_servers_between("other", steps[0], steps[4]);
        let mut expected = BTreeSet::new();
        for step in &steps[..5] {
            expected.extend(rings.get_servers_at("other", *step));
        }
        assert_eq!(whole, expected);

        // A range starting at the last change sees only the final ring.
        assert_eq!(
            rings.get_servers_between("other", steps[4], steps[6]),
            rings.get_servers("other")
        );
    }

    #[test]
    fn test_time_before_first_event_is_empty() {
        let steps = steps();
        let mut rings = rings();
        rings.process(five_nodes(&steps));
        assert!(rings
            .get_servers_at("other", steps[0] - Duration::seconds(1))
            .is_empty());
    }

    #[test]
    fn test_rolling_restart_keeps_elapsed_windows() {
        let steps = steps();
        let events = rolling_restart(&steps);

        let mut partial = rings();
        partial.process(events.iter().take(8).cloned());
        let window = (half(steps[2]), half(steps[4]));
        let before = partial.get_servers_between("other", window.0, window.1);
        let at_three = partial.get_servers_at("other", half(steps[3]));

        let mut full = rings();
        full.process(events.clone());
        assert_eq!(full.get_servers_between("other", window.0, window.1), before);
        assert_eq!(full.get_servers_at("other", half(steps[3])), at_three);

        for step in 5..15 {
            let owners = full.get_servers_at("other", half(steps[step]));
            assert_eq!(owners.len(), DEFAULT_REPLICAS, "step {step}");
        }
        // While A is down it owns nothing.
        assert!(!full.get_servers_at("other", half(steps[5])).contains("A"));
        assert_eq!(full.get_servers("other"), {
            let mut r = rings();
            r.process(five_nodes(&steps));
            r.get_servers("other")
        });
    }

    #[test]
    fn test_process_is_idempotent() {
        let steps = steps();
        let events = rolling_restart(&steps);
        let mut once = rings();
        let kept_once = once.process(events.clone());
        let mut twice = rings();
        let doubled: Vec<_> = events.iter().chain(events.iter()).cloned().collect();
        let kept_twice = twice.process(doubled);
        assert_eq!(kept_once, kept_twice);
        assert_eq!(once.rings(), twice.rings());
    }

    #[test]
    fn test_process_returns_relevant_events() {
        let steps = steps();
        let ttl = Duration::minutes(60);
        let before = steps[0] - ttl - Duration::minutes(100);

        let a_added = ClusterEvent::added("A", before);
        let a_removed = ClusterEvent::removed("A", half(before));
        let b_added = ClusterEvent::added("B", before + Duration::seconds(STEP));
        let b_removed = ClusterEvent::removed("B", half(before + Duration::seconds(STEP)));
        let z_added = ClusterEvent::added("Z", before + Duration::seconds(2 * STEP));

        let mut events = vec![
            a_added.clone(),
            a_removed.clone(),
            b_added.clone(),
            b_removed.clone(),
            z_added.clone(),
        ];
        events.extend(rolling_restart(&steps));

        let mut rings = SpokeRings::new(DEFAULT_REPLICAS, ttl);
        let kept = rings.process(events.clone());

        assert!(!kept.contains(&a_added));
        assert!(!kept.contains(&a_removed));
        assert!(!kept.contains(&b_added));
        assert!(!kept.contains(&b_removed));
        // Z joined before the cutoff and never left.
        assert!(kept.contains(&z_added));
        assert_eq!(kept.len(), rolling_restart(&steps).len() + 1);

        // Replaying only the kept events gives the same current ring.
        let mut pruned = SpokeRings::new(DEFAULT_REPLICAS, ttl);
        pruned.process(kept);
        assert_eq!(pruned.all_servers(), rings.all_servers());
        assert_eq!(pruned.get_servers("other"), rings.get_servers("other"));
    }

    #[test]
    fn test_ring_owners_are_stable() {
        let t = Utc.timestamp_millis_opt(0).unwrap();
        let ring = SpokeRing::new(t, set(&["A", "B", "C", "D", "E"]));
        assert_eq!(ring.owners("orders", 3), ring.owners("orders", 3));
        assert_eq!(ring.owners("orders", 3).len(), 3);
        assert_eq!(ring.owners("orders", 10).len(), 5);
    }
}
