// Peer registry
//
// Single owner of peer records and reputation. Reliability is a rolling
// success ratio over a trailing window; the failed-peer memory is a
// short-lived derived cache used to suppress sends to peers that just
// failed, cleared on any success.

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use stratos_common::time::{get_current_time_in_seconds, TimestampSeconds};

use crate::config::{
    ACTIVE_REPUTATION_THRESHOLD, DEFAULT_RELIABILITY, FAILED_PEER_BACKOFF_FACTOR,
    FAILED_PEER_FORGET_SECS, INITIAL_REPUTATION,
};

// reliability counters roll over every hour
const RELIABILITY_WINDOW_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub protocol: String,
    pub domain: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl PeerMetadata {
    /// Compose the peer URL, omitting default ports.
    pub fn url(&self) -> String {
        match self.port {
            Some(port) if !self.is_default_port(port) => {
                format!("{}://{}:{}", self.protocol, self.domain, port)
            }
            _ => format!("{}://{}", self.protocol, self.domain),
        }
    }

    fn is_default_port(&self, port: u16) -> bool {
        matches!(
            (self.protocol.as_str(), port),
            ("http", 80) | ("https", 443)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub url: String,
    pub reputation: u8,
    pub last_seen: TimestampSeconds,
    pub metadata: Option<PeerMetadata>,
}

impl PeerRecord {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        PeerRecord {
            id: id.into(),
            url: url.into(),
            reputation: INITIAL_REPUTATION,
            last_seen: get_current_time_in_seconds(),
            metadata: None,
        }
    }

    pub fn from_metadata(id: impl Into<String>, metadata: PeerMetadata) -> Self {
        let url = metadata.url();
        PeerRecord {
            id: id.into(),
            url,
            reputation: INITIAL_REPUTATION,
            last_seen: get_current_time_in_seconds(),
            metadata: Some(metadata),
        }
    }
}

struct PeerEntry {
    record: PeerRecord,
    successful_events: u32,
    failed_events: u32,
    window_start: TimestampSeconds,
    // exponential moving average of observed response times
    latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct FailedPeerEntry {
    count: u32,
    suppressed_until: TimestampSeconds,
    last_failure: TimestampSeconds,
}

/// Read view of one peer handed out to the balancer and the propagators.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: String,
    pub url: String,
    pub reputation: u8,
    pub last_seen: TimestampSeconds,
    pub reliability: f64,
    pub latency_ms: Option<f64>,
}

pub struct PeerRegistry {
    peers: DashMap<String, PeerEntry>,
    failed: DashMap<String, FailedPeerEntry>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry {
            peers: DashMap::new(),
            failed: DashMap::new(),
        }
    }

    pub fn add_peer(&self, record: PeerRecord) {
        debug!("registering peer {} at {}", record.id, record.url);
        self.peers.insert(
            record.id.clone(),
            PeerEntry {
                record,
                successful_events: 0,
                failed_events: 0,
                window_start: get_current_time_in_seconds(),
                latency_ms: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer(&self, id: &str) -> Option<PeerSnapshot> {
        self.peers.get(id).map(|entry| snapshot(entry.value()))
    }

    /// Peers eligible for sync work: reputation at or above the active
    /// threshold, best first.
    pub fn active_peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .filter(|entry| entry.value().record.reputation >= ACTIVE_REPUTATION_THRESHOLD)
            .map(|entry| snapshot(entry.value()))
            .collect();
        peers.sort_by(|a, b| b.reputation.cmp(&a.reputation).then(a.id.cmp(&b.id)));
        peers
    }

    pub fn all_peers(&self) -> Vec<PeerSnapshot> {
        self.peers.iter().map(|entry| snapshot(entry.value())).collect()
    }

    /// Fraction of known peers currently active. Feeds auto recovery.
    pub fn connectivity_ratio(&self) -> f64 {
        let total = self.peers.len();
        if total == 0 {
            return 0.0;
        }
        let active = self
            .peers
            .iter()
            .filter(|entry| entry.value().record.reputation >= ACTIVE_REPUTATION_THRESHOLD)
            .count();
        active as f64 / total as f64
    }

    pub fn reliability(&self, id: &str) -> f64 {
        self.peers
            .get(id)
            .map(|entry| reliability_of(entry.value()))
            .unwrap_or(DEFAULT_RELIABILITY)
    }

    /// Record a successful exchange: refresh last_seen, bump reputation,
    /// count toward reliability and clear the failed-peer memory.
    pub fn record_success(&self, id: &str) {
        let now = get_current_time_in_seconds();
        if let Some(mut entry) = self.peers.get_mut(id) {
            let entry = entry.value_mut();
            roll_window(entry, now);
            entry.successful_events += 1;
            entry.record.last_seen = now;
            entry.record.reputation = entry.record.reputation.saturating_add(1).min(100);
        }
        self.failed.remove(id);
    }

    /// Fold one observed response time into the peer's latency average.
    pub fn record_latency(&self, id: &str, millis: u64) {
        if let Some(mut entry) = self.peers.get_mut(id) {
            let entry = entry.value_mut();
            entry.latency_ms = Some(match entry.latency_ms {
                Some(current) => current * 0.8 + millis as f64 * 0.2,
                None => millis as f64,
            });
        }
    }

    pub fn record_failure(&self, id: &str) {
        let now = get_current_time_in_seconds();
        if let Some(mut entry) = self.peers.get_mut(id) {
            let entry = entry.value_mut();
            roll_window(entry, now);
            entry.failed_events += 1;
            entry.record.reputation = entry.record.reputation.saturating_sub(2);
        }
    }

    /// Demote peers not heard from within the dead-node threshold.
    /// Returns the ids demoted in this pass.
    pub fn prune_dead(&self, dead_node_threshold_secs: u64) -> Vec<String> {
        let now = get_current_time_in_seconds();
        let mut demoted = Vec::new();
        for mut entry in self.peers.iter_mut() {
            let peer = entry.value_mut();
            let silent = now.saturating_sub(peer.record.last_seen);
            if silent > dead_node_threshold_secs
                && peer.record.reputation >= ACTIVE_REPUTATION_THRESHOLD
            {
                info!(
                    "peer {} silent for {}s, marking inactive",
                    peer.record.id, silent
                );
                peer.record.reputation = ACTIVE_REPUTATION_THRESHOLD - 10;
                demoted.push(peer.record.id.clone());
            }
        }
        demoted
    }

    // --- failed-peer memory (short-lived, derived) ---

    /// Note a propagation failure; the peer is suppressed for
    /// count * base * 1.5 seconds.
    pub fn note_send_failure(&self, id: &str, base_secs: u64) {
        let now = get_current_time_in_seconds();
        let mut entry = self.failed.entry(id.to_string()).or_insert(FailedPeerEntry {
            count: 0,
            suppressed_until: 0,
            last_failure: now,
        });
        let value = entry.value_mut();
        value.count += 1;
        value.last_failure = now;
        let suppress_secs =
            (value.count as f64 * base_secs as f64 * FAILED_PEER_BACKOFF_FACTOR) as u64;
        value.suppressed_until = now + suppress_secs;
        warn!(
            "peer {} temporarily failed ({} times), suppressed for {}s",
            id, value.count, suppress_secs
        );
    }

    pub fn is_suppressed(&self, id: &str) -> bool {
        let now = get_current_time_in_seconds();
        self.failed
            .get(id)
            .map(|entry| entry.value().suppressed_until > now)
            .unwrap_or(false)
    }

    /// Forget failure entries older than an hour.
    pub fn clear_stale_failures(&self) {
        let now = get_current_time_in_seconds();
        self.failed
            .retain(|_, entry| now.saturating_sub(entry.last_failure) <= FAILED_PEER_FORGET_SECS);
    }

    // --- disk cache ---

    pub fn save_to_disk(&self, path: &Path) -> std::io::Result<()> {
        let records: Vec<PeerRecord> = self
            .peers
            .iter()
            .map(|entry| entry.value().record.clone())
            .collect();
        let raw = serde_json::to_vec_pretty(&records)?;
        std::fs::write(path, raw)
    }

    pub fn load_from_disk(&self, path: &Path) -> std::io::Result<usize> {
        let raw = std::fs::read(path)?;
        let records: Vec<PeerRecord> = serde_json::from_slice(&raw)?;
        let count = records.len();
        for record in records {
            self.add_peer(record);
        }
        Ok(count)
    }
}

fn roll_window(entry: &mut PeerEntry, now: TimestampSeconds) {
    if now.saturating_sub(entry.window_start) >= RELIABILITY_WINDOW_SECS {
        entry.successful_events = 0;
        entry.failed_events = 0;
        entry.window_start = now;
    }
}

fn reliability_of(entry: &PeerEntry) -> f64 {
    let total = entry.successful_events + entry.failed_events;
    if total == 0 {
        return DEFAULT_RELIABILITY;
    }
    entry.successful_events as f64 / total as f64
}

fn snapshot(entry: &PeerEntry) -> PeerSnapshot {
    PeerSnapshot {
        id: entry.record.id.clone(),
        url: entry.record.url.clone(),
        reputation: entry.record.reputation,
        last_seen: entry.record.last_seen,
        reliability: reliability_of(entry),
        latency_ms: entry.latency_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_composition_omits_default_ports() {
        let https = PeerMetadata {
            protocol: "https".to_string(),
            domain: "node.example.org".to_string(),
            port: Some(443),
        };
        assert_eq!(https.url(), "https://node.example.org");

        let custom = PeerMetadata {
            protocol: "http".to_string(),
            domain: "10.0.0.4".to_string(),
            port: Some(9345),
        };
        assert_eq!(custom.url(), "http://10.0.0.4:9345");

        let bare = PeerMetadata {
            protocol: "http".to_string(),
            domain: "node.example.org".to_string(),
            port: None,
        };
        assert_eq!(bare.url(), "http://node.example.org");
    }

    #[test]
    fn test_active_peers_sorted_by_reputation() {
        let registry = PeerRegistry::new();
        let mut weak = PeerRecord::new("weak", "http://a");
        weak.reputation = 30;
        registry.add_peer(weak);
        let mut strong = PeerRecord::new("strong", "http://b");
        strong.reputation = 95;
        registry.add_peer(strong);
        let mut middle = PeerRecord::new("middle", "http://c");
        middle.reputation = 70;
        registry.add_peer(middle);

        let active: Vec<String> = registry
            .active_peers()
            .into_iter()
            .map(|peer| peer.id)
            .collect();
        assert_eq!(active, vec!["strong", "middle"]);
    }

    #[test]
    fn test_reliability_defaults_then_tracks() {
        let registry = PeerRegistry::new();
        registry.add_peer(PeerRecord::new("peer-a", "http://a"));
        assert!((registry.reliability("peer-a") - DEFAULT_RELIABILITY).abs() < f64::EPSILON);

        for _ in 0..9 {
            registry.record_success("peer-a");
        }
        registry.record_failure("peer-a");
        assert!((registry.reliability("peer-a") - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_failed_memory_suppression_and_reset() {
        let registry = PeerRegistry::new();
        registry.add_peer(PeerRecord::new("peer-a", "http://a"));

        registry.note_send_failure("peer-a", 10);
        assert!(registry.is_suppressed("peer-a"));

        // any success clears the memory
        registry.record_success("peer-a");
        assert!(!registry.is_suppressed("peer-a"));
    }

    #[test]
    fn test_connectivity_ratio() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.connectivity_ratio(), 0.0);

        registry.add_peer(PeerRecord::new("a", "http://a"));
        let mut dead = PeerRecord::new("b", "http://b");
        dead.reputation = 10;
        registry.add_peer(dead);
        assert!((registry.connectivity_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
