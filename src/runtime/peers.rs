//! Shared peer table.
//!
//! One map holds everything the node knows about its siblings: operator
//! membership, discovery sightings, and the live status cache written by the
//! ingest workers. Readers (allocator, HTTP handlers) take cloned snapshots;
//! writers hold the lock only for the field updates themselves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use super::protocol::PeerStatus;

/// Case-insensitive map key for a host.
pub fn host_key(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}

/// Everything known about one sibling charger.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Host as the operator entered it (or as discovered).
    pub host: String,
    /// Stable id reported by the peer; empty until the first status arrives.
    pub device_id: String,
    /// Last observed address.
    pub ip: Option<String>,
    /// Within the heartbeat window.
    pub online: bool,
    /// Member of the operator-configured group.
    pub joined: bool,
    /// Seen in the last discovery snapshot.
    pub discovered: bool,
    /// Instant of the last successfully parsed message. Survives stream
    /// disconnects; cleared only by process restart.
    pub last_seen: Option<Instant>,
    /// Cached status snapshot; retained while the peer is offline.
    pub status: Option<PeerStatus>,
}

impl PeerRecord {
    fn new(host: &str) -> Self {
        Self {
            host: host.trim().to_string(),
            device_id: String::new(),
            ip: None,
            online: false,
            joined: false,
            discovered: false,
            last_seen: None,
            status: None,
        }
    }

}

/// Thread-safe peer map, keyed by lower-cased host.
#[derive(Default)]
pub struct PeerTable {
    inner: RwLock<BTreeMap<String, PeerRecord>>,
}

pub type SharedPeers = Arc<PeerTable>;

impl PeerTable {
    pub fn new() -> SharedPeers {
        Arc::new(Self::default())
    }

    /// Mark `host` as a configured group member, creating the record if the
    /// peer has never been seen.
    pub fn set_joined(&self, host: &str) {
        let key = host_key(host);
        let mut map = self.inner.write();
        map.entry(key).or_insert_with(|| PeerRecord::new(host)).joined = true;
    }

    /// Operator removal drops the record entirely; discovery may re-create
    /// it later as a non-member sighting.
    pub fn remove(&self, host: &str) -> bool {
        self.inner.write().remove(&host_key(host)).is_some()
    }

    /// Record a discovery sighting. Never removes anything; a peer missing
    /// from one browse window keeps its record and its membership.
    pub fn mark_discovered(&self, host: &str, ip: Option<String>) {
        let key = host_key(host);
        let mut map = self.inner.write();
        let record = map.entry(key).or_insert_with(|| PeerRecord::new(host));
        record.discovered = true;
        if ip.is_some() {
            record.ip = ip;
        }
    }

    /// Clear the `discovered` flag on records absent from the latest
    /// snapshot. Membership and cached status are untouched.
    pub fn retain_discovered(&self, present: &[String]) {
        let mut map = self.inner.write();
        for (key, record) in map.iter_mut() {
            record.discovered = present.iter().any(|h| host_key(h) == *key);
        }
    }

    /// Apply a successfully parsed status message: refresh the cache, stamp
    /// `last_seen`, and flip the peer online. Returns `true` when this
    /// message brought the peer back online.
    pub fn record_message(&self, host: &str, status: PeerStatus) -> bool {
        let key = host_key(host);
        let mut map = self.inner.write();
        let record = map.entry(key).or_insert_with(|| PeerRecord::new(host));
        if !status.device_id.is_empty() {
            record.device_id = status.device_id.clone();
        }
        record.status = Some(status);
        record.last_seen = Some(Instant::now());
        let came_online = !record.online;
        record.online = true;
        came_online
    }

    /// Flip a peer offline after heartbeat loss. The cached snapshot is
    /// retained but the allocator will treat it as stale. Returns `true`
    /// when the peer was online before.
    pub fn mark_offline(&self, host: &str) -> bool {
        let mut map = self.inner.write();
        match map.get_mut(&host_key(host)) {
            Some(record) if record.online => {
                record.online = false;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, host: &str) -> Option<PeerRecord> {
        self.inner.read().get(&host_key(host)).cloned()
    }

    /// Consistent snapshot of every record.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.inner.read().values().cloned().collect()
    }

    /// Hosts currently flagged as group members.
    pub fn joined_hosts(&self) -> Vec<String> {
        self.inner
            .read()
            .values()
            .filter(|r| r.joined)
            .map(|r| r.host.clone())
            .collect()
    }

    /// (online, offline) counts over joined peers only.
    pub fn joined_counts(&self) -> (usize, usize) {
        let map = self.inner.read();
        let mut online = 0;
        let mut offline = 0;
        for record in map.values().filter(|r| r.joined) {
            if record.online {
                online += 1;
            } else {
                offline += 1;
            }
        }
        (online, offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_keys_are_case_insensitive() {
        let table = PeerTable::new();
        table.set_joined("EVSE-Garage.Local");
        assert!(table.get("evse-garage.local").is_some());
        assert!(table.remove("EVSE-GARAGE.LOCAL"));
        assert!(table.get("evse-garage.local").is_none());
    }

    #[test]
    fn discovery_disappearance_keeps_membership() {
        let table = PeerTable::new();
        table.set_joined("a.local");
        table.mark_discovered("a.local", Some("10.0.0.7".into()));
        table.retain_discovered(&[]);
        let record = table.get("a.local").unwrap();
        assert!(record.joined);
        assert!(!record.discovered);
        assert_eq!(record.ip.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn message_brings_peer_online_and_offline_keeps_cache() {
        let table = PeerTable::new();
        table.set_joined("a.local");
        let status = PeerStatus {
            amp: 12.0,
            device_id: "evse-1".into(),
            ..Default::default()
        };
        assert!(table.record_message("a.local", status));
        assert!(!table.record_message("a.local", PeerStatus::default()));

        assert!(table.mark_offline("a.local"));
        assert!(!table.mark_offline("a.local"));
        let record = table.get("a.local").unwrap();
        assert!(record.status.is_some());
        assert_eq!(record.device_id, "evse-1");
    }
}
