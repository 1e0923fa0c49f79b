//! Joined-peer registry.
//!
//! The operator-declared group membership, persisted to
//! `loadsharing_peers.json`. Discovery only enriches this set — membership is
//! ground truth and changes exclusively through [`PeerRegistry::add`] and
//! [`PeerRegistry::remove`] (or wholesale through a config adoption).
//!
//! Writes are write-through: the in-memory mutation is applied first and
//! stands even when the disk write fails; the failure is handed back so the
//! operator learns their change is volatile.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{atomic_write_json, read_json};

use super::peers::{host_key, PeerRecord, SharedPeers};

/// File name of the persisted membership document.
pub const PEERS_FILE: &str = "loadsharing_peers.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PeersDocument {
    peers: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("host must contain at least one '.' or ':'")]
    InvalidHost,
    #[error("peer is already joined")]
    Duplicate,
    #[error("refusing to add this node's own host")]
    OwnHost,
    #[error("no such peer")]
    Unknown,
}

pub struct PeerRegistry {
    path: PathBuf,
    /// Lower-cased names this node answers to; adds matching one are refused.
    own_hosts: Vec<String>,
    peers: SharedPeers,
    joined: RwLock<Vec<String>>,
    degraded: AtomicBool,
}

impl PeerRegistry {
    /// Load membership from `dir`. A missing or corrupted document is an
    /// empty set with a warning; the node still starts.
    pub fn open(dir: &Path, own_hosts: Vec<String>, peers: SharedPeers) -> Self {
        let path = dir.join(PEERS_FILE);
        let doc: PeersDocument = read_json(&path).unwrap_or_default();
        for host in &doc.peers {
            peers.set_joined(host);
        }
        Self {
            path,
            own_hosts: own_hosts.iter().map(|h| host_key(h)).collect(),
            peers,
            joined: RwLock::new(doc.peers),
            degraded: AtomicBool::new(false),
        }
    }

    /// Add a host to the group.
    ///
    /// On success returns the persistence warning, if any — `Some(reason)`
    /// means the change is applied in memory but not on disk.
    pub fn add(&self, host: &str) -> Result<Option<String>, RegistryError> {
        let trimmed = host.trim();
        if trimmed.is_empty()
            || trimmed.contains(char::is_whitespace)
            || !(trimmed.contains('.') || trimmed.contains(':'))
        {
            return Err(RegistryError::InvalidHost);
        }
        let key = host_key(trimmed);
        if self.own_hosts.contains(&key) {
            return Err(RegistryError::OwnHost);
        }

        let mut joined = self.joined.write();
        if joined.iter().any(|h| host_key(h) == key) {
            return Err(RegistryError::Duplicate);
        }
        joined.push(trimmed.to_string());
        self.peers.set_joined(trimmed);
        Ok(self.persist(&joined))
    }

    /// Remove a host by exact case-insensitive match.
    pub fn remove(&self, host: &str) -> Result<Option<String>, RegistryError> {
        let key = host_key(host);
        let mut joined = self.joined.write();
        let before = joined.len();
        joined.retain(|h| host_key(h) != key);
        if joined.len() == before {
            return Err(RegistryError::Unknown);
        }
        self.peers.remove(host);
        Ok(self.persist(&joined))
    }

    /// Replace the whole membership, used when adopting a peer's config.
    /// The node's own names are filtered out of the incoming list.
    pub fn replace(&self, hosts: &[String]) -> Option<String> {
        let mut joined = self.joined.write();
        for host in joined.iter() {
            self.peers.remove(host);
        }
        joined.clear();
        for host in hosts {
            let key = host_key(host);
            if self.own_hosts.contains(&key) || joined.iter().any(|h| host_key(h) == key) {
                continue;
            }
            joined.push(host.trim().to_string());
            self.peers.set_joined(host);
        }
        self.persist(&joined)
    }

    pub fn hosts(&self) -> Vec<String> {
        self.joined.read().clone()
    }

    /// The member list hashed into the config fingerprint: the joined hosts
    /// plus this node's own primary name, so every node in a converged group
    /// hashes the same set.
    pub fn members_for_hash(&self, own_host: &str) -> Vec<String> {
        let mut members: Vec<String> = self.joined.read().iter().map(|h| host_key(h)).collect();
        members.push(host_key(own_host));
        members.sort();
        members.dedup();
        members
    }

    /// Unified peer view: configured members, discovered sightings, or both.
    pub fn list(&self, include_discovered: bool, include_configured: bool) -> Vec<PeerRecord> {
        self.peers
            .snapshot()
            .into_iter()
            .filter(|r| (include_configured && r.joined) || (include_discovered && r.discovered))
            .collect()
    }

    /// Whether any membership write has failed since startup; surfaced on
    /// the diagnostic status resource.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn persist(&self, joined: &[String]) -> Option<String> {
        let doc = PeersDocument {
            peers: joined.to_vec(),
        };
        match atomic_write_json(&self.path, &doc) {
            Ok(()) => None,
            Err(err) => {
                log::error!("failed to persist {}: {}", self.path.display(), err);
                self.degraded.store(true, Ordering::Relaxed);
                Some(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::peers::PeerTable;

    fn registry(dir: &Path) -> PeerRegistry {
        PeerRegistry::open(dir, vec!["self.local".into()], PeerTable::new())
    }

    #[test]
    fn add_validates_host_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert_eq!(reg.add("garage"), Err(RegistryError::InvalidHost));
        assert_eq!(reg.add("bad host.local"), Err(RegistryError::InvalidHost));
        assert_eq!(reg.add(""), Err(RegistryError::InvalidHost));
        assert!(reg.add("garage.local").is_ok());
        assert!(reg.add("10.0.0.9:8080").is_ok());
    }

    #[test]
    fn add_rejects_duplicates_and_own_host() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.add("a.local").unwrap();
        assert_eq!(reg.add("A.LOCAL"), Err(RegistryError::Duplicate));
        assert_eq!(reg.add("self.local"), Err(RegistryError::OwnHost));
    }

    #[test]
    fn remove_requires_existing_member() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert_eq!(reg.remove("a.local"), Err(RegistryError::Unknown));
        reg.add("a.local").unwrap();
        assert!(reg.remove("A.local").is_ok());
        assert!(reg.hosts().is_empty());
    }

    #[test]
    fn add_then_remove_restores_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.add("a.local").unwrap();
        let before = reg.hosts();
        reg.add("b.local").unwrap();
        reg.remove("b.local").unwrap();
        assert_eq!(reg.hosts(), before);
    }

    #[test]
    fn membership_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = registry(dir.path());
            reg.add("a.local").unwrap();
            reg.add("b.local").unwrap();
        }
        let reopened = registry(dir.path());
        assert_eq!(reopened.hosts(), vec!["a.local", "b.local"]);
    }

    #[test]
    fn corrupted_document_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PEERS_FILE), b"][").unwrap();
        let reg = registry(dir.path());
        assert!(reg.hosts().is_empty());
    }

    #[test]
    fn members_for_hash_includes_self_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.add("b.local").unwrap();
        reg.add("A.local").unwrap();
        assert_eq!(
            reg.members_for_hash("Self.local"),
            vec!["a.local", "b.local", "self.local"]
        );
    }
}
