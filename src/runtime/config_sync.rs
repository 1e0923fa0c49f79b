//! Group-config convergence.
//!
//! Every status message carries the sender's `(config_version, config_hash)`
//! fingerprint. The ingest workers forward any mismatch here, and this
//! worker converges the group without a consensus protocol: pull from a
//! peer that is ahead, push to one that is behind, and break equal-version
//! divergence by `config_updated_at`, then by the lexicographically greater
//! device id.
//!
//! While any divergence is outstanding the allocator runs against the
//! smallest `group_max_current_a` observed anywhere in the group, so a
//! disagreement can never overcommit the breaker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, GroupConfig};

use super::peers::host_key;
use super::registry::PeerRegistry;

/// Raised by an ingest worker when a peer's fingerprint disagrees with ours.
#[derive(Debug, Clone)]
pub struct SyncSignal {
    pub host: String,
    pub peer_version: u64,
    pub peer_hash: String,
}

/// An unresolved disagreement, surfaced on the diagnostic API.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigDivergence {
    pub host: String,
    pub peer_version: u64,
    pub peer_hash: String,
    /// The peer's group maximum, once a fetch has revealed it. Feeds the
    /// conservative clamp.
    pub observed_group_max_a: Option<f64>,
}

pub type Divergences = Arc<RwLock<BTreeMap<String, ConfigDivergence>>>;

/// The group config as it travels between nodes: the document itself plus
/// the sender's member list and identity (needed for the tiebreak).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPayload {
    #[serde(flatten)]
    pub config: GroupConfig,
    pub members: Vec<String>,
    pub device_id: String,
    pub config_hash: String,
}

impl ConfigPayload {
    pub fn build(config: GroupConfig, members: Vec<String>, device_id: String) -> Self {
        let config_hash = config.fingerprint(&members);
        Self {
            config,
            members,
            device_id,
            config_hash,
        }
    }
}

/// Shared dependencies of the sync worker and the inbound-push handler.
pub struct SyncContext {
    pub config: Arc<ConfigStore>,
    pub registry: Arc<PeerRegistry>,
    pub http: reqwest::Client,
    pub own_host: String,
    pub own_device_id: String,
    pub recompute: Arc<Notify>,
    pub divergences: Divergences,
}

impl SyncContext {
    fn local_payload(&self) -> ConfigPayload {
        ConfigPayload::build(
            self.config.get(),
            self.registry.members_for_hash(&self.own_host),
            self.own_device_id.clone(),
        )
    }

    fn local_hash(&self) -> String {
        self.config
            .get()
            .fingerprint(&self.registry.members_for_hash(&self.own_host))
    }

    fn record_divergence(&self, signal: &SyncSignal, observed_group_max_a: Option<f64>) {
        let mut map = self.divergences.write();
        let entry = map
            .entry(host_key(&signal.host))
            .or_insert_with(|| ConfigDivergence {
                host: signal.host.clone(),
                peer_version: signal.peer_version,
                peer_hash: signal.peer_hash.clone(),
                observed_group_max_a: None,
            });
        entry.peer_version = signal.peer_version;
        entry.peer_hash = signal.peer_hash.clone();
        if observed_group_max_a.is_some() {
            entry.observed_group_max_a = observed_group_max_a;
        }
    }

    fn clear_divergence(&self, host: &str) {
        self.divergences.write().remove(&host_key(host));
    }

    /// Decide an inbound push (peer POSTed its config to us). Applies the
    /// same winner rule as the worker and returns the applied config, or an
    /// explanation for the rejection.
    pub fn accept_push(&self, payload: &ConfigPayload) -> Result<GroupConfig, &'static str> {
        let recomputed = payload.config.fingerprint(&payload.members);
        if recomputed != payload.config_hash {
            return Err("config hash does not match payload");
        }
        let local = self.config.get();
        if !remote_wins(&local, &self.own_device_id, &payload.config, &payload.device_id) {
            return Err("local config is newer");
        }
        self.adopt(payload).map_err(|_| "config failed validation")
    }

    fn adopt(&self, payload: &ConfigPayload) -> Result<GroupConfig, ()> {
        match self.config.adopt_remote(&payload.config) {
            Ok(applied) => {
                if let Some(warning) = self.registry.replace(&payload.members) {
                    log::warn!("membership adopted but not persisted: {}", warning);
                }
                if let Some(warning) = applied.persist_error {
                    log::warn!("config adopted but not persisted: {}", warning);
                }
                log::info!(
                    "adopted group config v{} from {}",
                    applied.config.config_version,
                    payload.device_id
                );
                self.recompute.notify_one();
                Ok(applied.config)
            }
            Err(err) => {
                log::warn!("rejected config from {}: {}", payload.device_id, err);
                Err(())
            }
        }
    }
}

/// Winner rule between two config records.
pub fn remote_wins(
    local: &GroupConfig,
    local_device_id: &str,
    remote: &GroupConfig,
    remote_device_id: &str,
) -> bool {
    if remote.config_version != local.config_version {
        return remote.config_version > local.config_version;
    }
    if remote.config_updated_at != local.config_updated_at {
        return remote.config_updated_at > local.config_updated_at;
    }
    remote_device_id > local_device_id
}

/// The group maximum the allocator must honor: the local value, lowered to
/// the smallest maximum observed among divergent peers.
pub fn effective_group_max_a(local: &GroupConfig, divergences: &Divergences) -> f64 {
    let mut max = local.group_max_current_a;
    for divergence in divergences.read().values() {
        if let Some(observed) = divergence.observed_group_max_a {
            if observed >= 0.0 && observed < max {
                max = observed;
            }
        }
    }
    max
}

// ────────────────────────────────────────────────────────────────────────────
// Worker
// ────────────────────────────────────────────────────────────────────────────

pub async fn run_config_sync(
    ctx: Arc<SyncContext>,
    mut signals: mpsc::Receiver<SyncSignal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        handle_signal(&ctx, &signal, &cancel).await;
    }
    log::debug!("config sync worker stopped");
}

async fn handle_signal(ctx: &SyncContext, signal: &SyncSignal, cancel: &CancellationToken) {
    let local = ctx.config.get();

    if signal.peer_version == local.config_version && signal.peer_hash == ctx.local_hash() {
        ctx.clear_divergence(&signal.host);
        return;
    }
    ctx.record_divergence(signal, None);

    if signal.peer_version > local.config_version {
        pull(ctx, signal).await;
    } else if signal.peer_version < local.config_version {
        push(ctx, signal, cancel).await;
    } else {
        // Equal version, different hash: concurrent divergent edits. The
        // peer's full record decides the winner.
        match fetch_config(ctx, &signal.host).await {
            Ok(payload) => {
                ctx.record_divergence(signal, Some(payload.config.group_max_current_a));
                if remote_wins(
                    &local,
                    &ctx.own_device_id,
                    &payload.config,
                    &payload.device_id,
                ) {
                    if ctx.adopt(&payload).is_ok() {
                        ctx.clear_divergence(&signal.host);
                    }
                } else {
                    push(ctx, signal, cancel).await;
                }
            }
            Err(err) => log::debug!("config fetch from {} failed: {}", signal.host, err),
        }
    }
}

async fn pull(ctx: &SyncContext, signal: &SyncSignal) {
    match fetch_config(ctx, &signal.host).await {
        Ok(payload) => {
            ctx.record_divergence(signal, Some(payload.config.group_max_current_a));
            if ctx.adopt(&payload).is_ok() {
                ctx.clear_divergence(&signal.host);
            }
        }
        Err(err) => log::debug!("config pull from {} failed: {}", signal.host, err),
    }
}

/// Push the local config; retried at 1, 2, 4 s, then deferred until the
/// peer's next status message re-raises the mismatch.
async fn push(ctx: &SyncContext, signal: &SyncSignal, cancel: &CancellationToken) {
    let payload = ctx.local_payload();
    let url = format!("http://{}/config", signal.host);

    for delay in [0u64, 1, 2, 4] {
        if delay > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(Duration::from_secs(delay)) => {}
            }
        }
        let result = ctx.http.post(&url).json(&payload).send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                log::info!(
                    "pushed group config v{} to {}",
                    payload.config.config_version,
                    signal.host
                );
                return;
            }
            Ok(response) => {
                log::debug!("config push to {} rejected: {}", signal.host, response.status());
                // A reject is final for this signal; the peer thinks it is
                // newer and will push to us instead.
                return;
            }
            Err(err) => log::debug!("config push to {} failed: {}", signal.host, err),
        }
    }
}

async fn fetch_config(ctx: &SyncContext, host: &str) -> anyhow::Result<ConfigPayload> {
    let url = format!("http://{}/config", host);
    let payload: ConfigPayload = ctx
        .http
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(version: u64, updated_at: u64) -> GroupConfig {
        GroupConfig {
            config_version: version,
            config_updated_at: updated_at,
            ..GroupConfig::default()
        }
    }

    #[test]
    fn higher_version_wins() {
        assert!(remote_wins(&cfg(1, 10), "a", &cfg(2, 5), "b"));
        assert!(!remote_wins(&cfg(3, 10), "a", &cfg(2, 99), "b"));
    }

    #[test]
    fn equal_version_resolves_by_timestamp_then_device_id() {
        assert!(remote_wins(&cfg(2, 10), "a", &cfg(2, 11), "b"));
        assert!(!remote_wins(&cfg(2, 11), "a", &cfg(2, 10), "b"));
        assert!(remote_wins(&cfg(2, 10), "alpha", &cfg(2, 10), "beta"));
        assert!(!remote_wins(&cfg(2, 10), "beta", &cfg(2, 10), "alpha"));
    }

    #[test]
    fn conservative_clamp_takes_observed_minimum() {
        let divergences: Divergences = Arc::new(RwLock::new(BTreeMap::new()));
        let mut local = GroupConfig::default();
        local.group_max_current_a = 50.0;
        assert_eq!(effective_group_max_a(&local, &divergences), 50.0);

        divergences.write().insert(
            "b.local".into(),
            ConfigDivergence {
                host: "b.local".into(),
                peer_version: 3,
                peer_hash: "x".into(),
                observed_group_max_a: Some(40.0),
            },
        );
        divergences.write().insert(
            "c.local".into(),
            ConfigDivergence {
                host: "c.local".into(),
                peer_version: 3,
                peer_hash: "y".into(),
                observed_group_max_a: None,
            },
        );
        assert_eq!(effective_group_max_a(&local, &divergences), 40.0);
    }

    #[test]
    fn payload_hash_covers_members_in_any_order() {
        let a = ConfigPayload::build(
            GroupConfig::default(),
            vec!["a.local".into(), "b.local".into()],
            "n1".into(),
        );
        let b = ConfigPayload::build(
            GroupConfig::default(),
            vec!["b.local".into(), "a.local".into()],
            "n2".into(),
        );
        assert_eq!(a.config_hash, b.config_hash);
    }
}
