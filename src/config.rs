//! Group configuration document.
//!
//! One JSON file (`loadsharing_config.json`) holds the operator-editable
//! group settings. Every mutation — operator edit or adoption of a peer's
//! newer config — goes through [`ConfigStore`], which linearizes the
//! `config_version` increment and persists with the temp-file-then-rename
//! idiom so a power loss can never leave a half-written document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// File name of the persisted group config document.
pub const GROUP_CONFIG_FILE: &str = "loadsharing_config.json";

/// Upper bound accepted for any configured current (A).
const MAX_REASONABLE_CURRENT_A: f64 = 1000.0;

// ────────────────────────────────────────────────────────────────────────────
// Document
// ────────────────────────────────────────────────────────────────────────────

/// What the node does when the failsafe engages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeMode {
    /// Stop charging entirely.
    Disable,
    /// Fall back to a configured safe floor.
    SafeCurrent,
}

fn default_enabled() -> bool {
    true
}

fn default_group_id() -> String {
    "default".to_string()
}

fn default_safety_factor() -> f64 {
    1.0
}

fn default_min_charge_current_a() -> f64 {
    6.0
}

fn default_heartbeat_timeout_s() -> u64 {
    30
}

fn default_failsafe_mode() -> FailsafeMode {
    FailsafeMode::Disable
}

fn default_assumed_current_a() -> f64 {
    6.0
}

/// Operator-editable group settings, persisted as a flat JSON document.
///
/// `config_version` is monotonic and read-only from the operator's point of
/// view; [`ConfigStore`] bumps it on every accepted local mutation.
/// `priority` is node-local and never replicated to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub group_max_current_a: f64,
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    #[serde(default = "default_min_charge_current_a")]
    pub min_charge_current_a: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_node_max_current_a: Option<f64>,
    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: u64,
    #[serde(default = "default_failsafe_mode")]
    pub failsafe_mode: FailsafeMode,
    #[serde(default)]
    pub failsafe_safe_current_a: f64,
    #[serde(default = "default_assumed_current_a")]
    pub failsafe_peer_assumed_current_a: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub config_version: u64,
    #[serde(default)]
    pub config_updated_at: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            group_id: default_group_id(),
            group_max_current_a: 32.0,
            safety_factor: default_safety_factor(),
            min_charge_current_a: default_min_charge_current_a(),
            per_node_max_current_a: None,
            heartbeat_timeout_s: default_heartbeat_timeout_s(),
            failsafe_mode: default_failsafe_mode(),
            failsafe_safe_current_a: 6.0,
            failsafe_peer_assumed_current_a: default_assumed_current_a(),
            priority: 0,
            config_version: 0,
            config_updated_at: 0,
        }
    }
}

impl GroupConfig {
    /// Range checks applied to every inbound document, whether it comes from
    /// the operator or from a peer. Rejects leave local state untouched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::Invalid("group_id must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.safety_factor) {
            return Err(ConfigError::Invalid("safety_factor must be within [0, 1]"));
        }
        if self.heartbeat_timeout_s < 5 {
            return Err(ConfigError::Invalid("heartbeat_timeout_s must be at least 5"));
        }
        for (name, value) in [
            ("group_max_current_a", self.group_max_current_a),
            ("min_charge_current_a", self.min_charge_current_a),
            ("failsafe_safe_current_a", self.failsafe_safe_current_a),
            (
                "failsafe_peer_assumed_current_a",
                self.failsafe_peer_assumed_current_a,
            ),
        ] {
            if !value.is_finite() || value < 0.0 || value > MAX_REASONABLE_CURRENT_A {
                return Err(ConfigError::InvalidCurrent(name));
            }
        }
        if let Some(cap) = self.per_node_max_current_a {
            if !cap.is_finite() || cap < 0.0 || cap > MAX_REASONABLE_CURRENT_A {
                return Err(ConfigError::InvalidCurrent("per_node_max_current_a"));
            }
        }
        Ok(())
    }

    /// SHA-256 fingerprint over the replicated fields.
    ///
    /// Canonical form is JSON with lexicographically ordered keys, no
    /// whitespace, and the members array sorted — identical inputs hash
    /// identically on every node regardless of member ordering.
    pub fn fingerprint(&self, members: &[String]) -> String {
        let mut sorted: Vec<String> = members.iter().map(|m| m.to_ascii_lowercase()).collect();
        sorted.sort();
        sorted.dedup();
        // serde_json's map is a BTreeMap, so key order is already canonical.
        let canonical = serde_json::json!({
            "group_id": self.group_id,
            "group_max_current_a": self.group_max_current_a,
            "members": sorted,
            "safety_factor": self.safety_factor,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid group config: {0}")]
    Invalid(&'static str),
    #[error("invalid group config: {0} must be a finite current within range")]
    InvalidCurrent(&'static str),
}

// ────────────────────────────────────────────────────────────────────────────
// Store
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of an accepted config mutation. The in-memory state is always
/// authoritative; a persistence failure is reported, not fatal.
pub struct Applied {
    pub config: GroupConfig,
    pub persist_error: Option<String>,
}

/// Owns the live group config and its on-disk document.
///
/// A single write lock spans validation, the version bump, and the persist,
/// so operator edits and config-sync adoptions can never interleave their
/// `config_version` increments.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<GroupConfig>,
}

impl ConfigStore {
    /// Load the document from `dir`, falling back to defaults on a missing
    /// or corrupted file. The node never refuses to start over bad config.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(GROUP_CONFIG_FILE);
        let config = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<GroupConfig>(&raw) {
                Ok(cfg) => match cfg.validate() {
                    Ok(()) => cfg,
                    Err(err) => {
                        log::warn!("{} failed validation ({}), using defaults", path.display(), err);
                        GroupConfig::default()
                    }
                },
                Err(err) => {
                    log::warn!("{} is corrupted ({}), using defaults", path.display(), err);
                    GroupConfig::default()
                }
            },
            Err(_) => GroupConfig::default(),
        };
        Self {
            path,
            inner: RwLock::new(config),
        }
    }

    pub fn get(&self) -> GroupConfig {
        self.inner.read().clone()
    }

    /// Apply an operator edit: validate, bump `config_version`, stamp
    /// `config_updated_at`, persist.
    pub fn apply_operator(&self, mut new: GroupConfig) -> Result<Applied, ConfigError> {
        new.validate()?;
        let mut guard = self.inner.write();
        new.config_version = guard.config_version + 1;
        new.config_updated_at = epoch_secs();
        *guard = new.clone();
        let persist_error = self.persist(&new);
        Ok(Applied {
            config: new,
            persist_error,
        })
    }

    /// Adopt a peer's config during sync. The peer's version is taken as-is
    /// (it is already ahead of ours), `config_updated_at` becomes the max of
    /// both sides, and the node-local `priority` is preserved.
    pub fn adopt_remote(&self, remote: &GroupConfig) -> Result<Applied, ConfigError> {
        remote.validate()?;
        let mut guard = self.inner.write();
        let mut adopted = remote.clone();
        adopted.priority = guard.priority;
        adopted.config_updated_at = guard.config_updated_at.max(remote.config_updated_at);
        *guard = adopted.clone();
        let persist_error = self.persist(&adopted);
        Ok(Applied {
            config: adopted,
            persist_error,
        })
    }

    fn persist(&self, config: &GroupConfig) -> Option<String> {
        match atomic_write_json(&self.path, config) {
            Ok(()) => None,
            Err(err) => {
                log::error!("failed to persist {}: {}", self.path.display(), err);
                Some(err.to_string())
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

/// Serialize `value` to a sibling temp file, then rename over `path`.
/// The rename is atomic against power loss on POSIX filesystems.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Read and parse a JSON document, distinguishing "absent" from "corrupt"
/// only by log message; both yield `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("{} is corrupted ({}), ignoring", path.display(), err);
            None
        }
    }
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn fingerprint_invariant_under_member_order() {
        let cfg = GroupConfig::default();
        let a = cfg.fingerprint(&members(&["evse-a.local", "evse-b.local", "evse-c.local"]));
        let b = cfg.fingerprint(&members(&["evse-c.local", "evse-a.local", "evse-b.local"]));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_ignores_member_case() {
        let cfg = GroupConfig::default();
        let a = cfg.fingerprint(&members(&["EVSE-A.local"]));
        let b = cfg.fingerprint(&members(&["evse-a.LOCAL"]));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_tracks_replicated_fields_only() {
        let cfg = GroupConfig::default();
        let mut other = cfg.clone();
        other.priority = 99;
        other.heartbeat_timeout_s = 60;
        assert_eq!(
            cfg.fingerprint(&members(&["a.local"])),
            other.fingerprint(&members(&["a.local"]))
        );

        other.group_max_current_a = 48.0;
        assert_ne!(
            cfg.fingerprint(&members(&["a.local"])),
            other.fingerprint(&members(&["a.local"]))
        );
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let mut cfg = GroupConfig::default();
        cfg.safety_factor = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = GroupConfig::default();
        cfg.heartbeat_timeout_s = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = GroupConfig::default();
        cfg.group_max_current_a = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = GroupConfig::default();
        cfg.group_id = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn operator_edits_bump_version_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path());
        assert_eq!(store.get().config_version, 0);

        let mut edit = store.get();
        edit.group_max_current_a = 40.0;
        let applied = store.apply_operator(edit).unwrap();
        assert!(applied.persist_error.is_none());
        assert_eq!(applied.config.config_version, 1);

        let mut edit = store.get();
        edit.group_max_current_a = 50.0;
        assert_eq!(store.apply_operator(edit).unwrap().config.config_version, 2);
    }

    #[test]
    fn adoption_takes_remote_version_and_keeps_local_priority() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path());
        let mut edit = store.get();
        edit.priority = 7;
        store.apply_operator(edit).unwrap();
        let local_stamp = store.get().config_updated_at;

        let mut remote = GroupConfig::default();
        remote.config_version = 9;
        remote.config_updated_at = local_stamp + 100;
        remote.group_max_current_a = 25.0;
        remote.priority = 1;

        let adopted = store.adopt_remote(&remote).unwrap().config;
        assert_eq!(adopted.config_version, 9);
        assert_eq!(adopted.group_max_current_a, 25.0);
        assert_eq!(adopted.priority, 7);
        assert_eq!(adopted.config_updated_at, local_stamp + 100);

        // A stale remote timestamp never rolls the local one back.
        let mut stale = remote.clone();
        stale.config_version = 10;
        stale.config_updated_at = 0;
        let adopted = store.adopt_remote(&stale).unwrap().config;
        assert_eq!(adopted.config_version, 10);
        assert_eq!(adopted.config_updated_at, local_stamp + 100);
    }

    #[test]
    fn persisted_config_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ConfigStore::open(dir.path());
            let mut edit = store.get();
            edit.group_max_current_a = 63.0;
            edit.group_id = "garage".into();
            store.apply_operator(edit).unwrap();
        }
        let reopened = ConfigStore::open(dir.path());
        assert_eq!(reopened.get().group_max_current_a, 63.0);
        assert_eq!(reopened.get().group_id, "garage");
        assert_eq!(reopened.get().config_version, 1);
    }

    #[test]
    fn corrupted_document_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(GROUP_CONFIG_FILE), b"{ not json").unwrap();
        let store = ConfigStore::open(dir.path());
        assert_eq!(store.get().group_id, "default");
    }
}
