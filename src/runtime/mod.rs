//! Coordination runtime.
//!
//! Ties the workers together around one shared state:
//!
//! ```text
//!  discovery ──► peer table ◄── ingest workers ◄── joined set (registry)
//!                    │                │
//!                    ▼                ▼
//!               evaluator ◄─── heartbeat supervisor
//!            (allocator → failsafe → enforcement bridge)
//!                    │
//!               config sync ◄── fingerprint mismatches from ingest
//! ```
//!
//! Every worker runs as an independent task on a shared
//! [`CancellationToken`]; [`AgentTasks::shutdown`] cancels them all and
//! waits within the flush budget.

pub mod allocator;
pub mod config_sync;
pub mod discovery;
pub mod enforce;
pub mod failsafe;
pub mod ingest;
pub mod peers;
pub mod protocol;
pub mod registry;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::{epoch_secs, ConfigStore};

use allocator::{AllocLimits, AllocationTable, MemberView};
use config_sync::{Divergences, SyncContext, SyncSignal};
use discovery::{DiscoveryState, SharedDiscovery};
use enforce::{ChargerPort, EnforcementBridge, SelfStatus};
use ingest::IngestContext;
use peers::{host_key, PeerRecord, PeerTable, SharedPeers};
use protocol::{
    EvseState, EVALUATE_FALLBACK_SECS, HTTP_CONNECT_TIMEOUT_SECS, HTTP_READ_TIMEOUT_SECS,
    SHUTDOWN_BUDGET_SECS,
};
use registry::PeerRegistry;

// ────────────────────────────────────────────────────────────────────────────
// Identity
// ────────────────────────────────────────────────────────────────────────────

/// Who this node is on the LAN.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Stable lexicographic identity used by the allocator tiebreak.
    pub device_id: String,
    /// The name peers and the registry know us by.
    pub host: String,
    pub http_port: u16,
}

impl NodeIdentity {
    /// Resolve from overrides, falling back to the OS hostname and, failing
    /// even that, a generated id.
    pub fn resolve(device_id: Option<String>, host: Option<String>, http_port: u16) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty());
        let host = host
            .or_else(|| hostname.clone().map(|h| format!("{h}.local")))
            .unwrap_or_else(|| format!("loadshare-{}.local", &uuid::Uuid::new_v4().to_string()[..8]));
        let device_id = device_id
            .or(hostname)
            .unwrap_or_else(|| host.trim_end_matches(".local").to_string());
        Self {
            device_id,
            host,
            http_port,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

pub struct SharedState {
    pub identity: NodeIdentity,
    pub config: Arc<ConfigStore>,
    pub peers: SharedPeers,
    pub registry: Arc<PeerRegistry>,
    pub discovery: SharedDiscovery,
    pub divergences: Divergences,
    pub sync: Arc<SyncContext>,
    pub port: Arc<dyn ChargerPort>,
    pub recompute: Arc<Notify>,
    pub last_allocation: RwLock<Option<AllocationTable>>,
    pub computed_at: RwLock<Option<u64>>,
    pub failsafe_active: AtomicBool,
    sync_tx: mpsc::Sender<SyncSignal>,
}

impl SharedState {
    /// Build the state tree and load both persisted documents from
    /// `data_dir`. Returns the receiver half of the config-sync channel for
    /// [`start_agent`].
    pub fn new(
        data_dir: &Path,
        identity: NodeIdentity,
        port: Arc<dyn ChargerPort>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SyncSignal>)> {
        let config = Arc::new(ConfigStore::open(data_dir));
        let peers = PeerTable::new();
        let own_hosts = vec![
            identity.host.clone(),
            format!("{}:{}", identity.host, identity.http_port),
        ];
        let registry = Arc::new(PeerRegistry::open(data_dir, own_hosts, peers.clone()));

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_READ_TIMEOUT_SECS))
            .build()
            .context("building HTTP client")?;

        let recompute = Arc::new(Notify::new());
        let divergences: Divergences = Arc::new(RwLock::new(Default::default()));
        let sync = Arc::new(SyncContext {
            config: config.clone(),
            registry: registry.clone(),
            http: http.clone(),
            own_host: identity.host.clone(),
            own_device_id: identity.device_id.clone(),
            recompute: recompute.clone(),
            divergences: divergences.clone(),
        });

        let (sync_tx, sync_rx) = mpsc::channel(64);

        let state = Arc::new(Self {
            identity,
            config,
            peers,
            registry,
            discovery: DiscoveryState::new(),
            divergences,
            sync,
            port,
            recompute,
            last_allocation: RwLock::new(None),
            computed_at: RwLock::new(None),
            failsafe_active: AtomicBool::new(false),
            sync_tx,
        });
        Ok((state, sync_rx))
    }

    fn ingest_context(&self) -> Arc<IngestContext> {
        Arc::new(IngestContext {
            peers: self.peers.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            http: self.sync.http.clone(),
            own_host: self.identity.host.clone(),
            recompute: self.recompute.clone(),
            sync_tx: self.sync_tx.clone(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Task set
// ────────────────────────────────────────────────────────────────────────────

/// Handles to every running worker, for orderly teardown.
pub struct AgentTasks {
    pub cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl AgentTasks {
    /// Cancel all workers and wait for them within the shutdown budget;
    /// whatever is still running afterwards is aborted.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(SHUTDOWN_BUDGET_SECS), async {
            for handle in self.handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if joined.is_err() {
            log::warn!("shutdown budget exceeded, aborting remaining workers");
            for handle in &self.handles {
                handle.abort();
            }
        }
    }
}

/// Spawn every worker. The caller keeps the returned task set and the
/// shared state; the HTTP surface is served separately by the binary.
pub fn start_agent(state: Arc<SharedState>, sync_rx: mpsc::Receiver<SyncSignal>) -> AgentTasks {
    let cancel = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // ── 1. Discovery ─────────────────────────────────────────────────────
    {
        let st = state.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            discovery::run_discovery(
                st.discovery.clone(),
                st.peers.clone(),
                st.identity.host.clone(),
                protocol::DISCOVERY_INTERVAL_SECS,
                ct,
            )
            .await;
        }));
    }

    // ── 2. Ingest manager ────────────────────────────────────────────────
    {
        let ctx = state.ingest_context();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            ingest::run_ingest_manager(ctx, ct).await;
        }));
    }

    // ── 3. Heartbeat supervisor ──────────────────────────────────────────
    {
        let st = state.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            ingest::run_heartbeat_supervisor(
                st.peers.clone(),
                st.config.clone(),
                st.recompute.clone(),
                ct,
            )
            .await;
        }));
    }

    // ── 4. Config sync ───────────────────────────────────────────────────
    {
        let ctx = state.sync.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            config_sync::run_config_sync(ctx, sync_rx, ct).await;
        }));
    }

    // ── 5. Evaluator ─────────────────────────────────────────────────────
    {
        let st = state.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_evaluator(st, ct).await;
        }));
    }

    log::info!(
        "load sharing agent started (device_id={}, host={})",
        state.identity.device_id,
        state.identity.host
    );
    AgentTasks { cancel, handles }
}

// ────────────────────────────────────────────────────────────────────────────
// Evaluator
// ────────────────────────────────────────────────────────────────────────────

/// Allocator → failsafe → enforcement, re-run on every status change signal
/// and on a fallback tick.
async fn run_evaluator(state: Arc<SharedState>, cancel: CancellationToken) {
    let bridge = EnforcementBridge::new(state.port.clone());
    let mut tick = interval(Duration::from_secs(EVALUATE_FALLBACK_SECS));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = state.recompute.notified() => {}
            _ = tick.tick() => {}
        }
        evaluate_once(&state, &bridge);
    }
    log::debug!("evaluator stopped");
}

/// One full evaluation pass. Synchronous and lock-light: reads snapshots,
/// runs the pure pipeline, publishes the result.
pub fn evaluate_once(state: &SharedState, bridge: &EnforcementBridge<dyn ChargerPort>) {
    let cfg = state.config.get();
    let self_status = state.port.self_status();
    let snapshot = state.peers.snapshot();

    if !cfg.enabled {
        // Sharing off: the node keeps its full permitted budget and no
        // failsafe semantics apply.
        let limits = AllocLimits::from_config(&cfg, cfg.group_max_current_a);
        state.failsafe_active.store(false, Ordering::Relaxed);
        *state.last_allocation.write() = None;
        *state.computed_at.write() = Some(epoch_secs());
        bridge.emit(limits.budget_da(), false, &[], self_status.as_ref());
        return;
    }

    let effective_max = config_sync::effective_group_max_a(&cfg, &state.divergences);
    let limits = AllocLimits::from_config(&cfg, effective_max);
    let members = member_views(state, self_status.as_ref(), &snapshot);
    let table = allocator::allocate(&limits, &members);

    let joined: Vec<&PeerRecord> = snapshot.iter().filter(|r| r.joined).collect();
    let offline = joined.iter().filter(|r| !r.online).count();
    let decision = failsafe::evaluate(
        &cfg,
        joined.len(),
        offline,
        self_status.is_some(),
        table.self_target_da(),
        table.budget_da,
    );

    let was_engaged = state.failsafe_active.swap(decision.engaged, Ordering::Relaxed);
    if decision.engaged && !was_engaged {
        log::warn!("failsafe engaged ({:?})", decision.cause);
    } else if !decision.engaged && was_engaged {
        log::info!("failsafe cleared");
    }

    let changed = {
        let mut last = state.last_allocation.write();
        let changed = last
            .as_ref()
            .map(|prev| table.differs_from(prev))
            .unwrap_or(true);
        *last = Some(table);
        changed
    };
    if changed {
        log::debug!("allocation recomputed ({} member(s))", members.len());
    }
    *state.computed_at.write() = Some(epoch_secs());

    bridge.emit(
        decision.self_target_da,
        decision.engaged,
        &snapshot,
        self_status.as_ref(),
    );
}

/// Assemble the allocator's member list: self plus every joined peer.
fn member_views(
    state: &SharedState,
    self_status: Option<&SelfStatus>,
    snapshot: &[PeerRecord],
) -> Vec<MemberView> {
    let mut members = Vec::with_capacity(snapshot.len() + 1);

    members.push(MemberView {
        id: state.identity.device_id.clone(),
        host: state.identity.host.clone(),
        is_self: true,
        online: true,
        vehicle: self_status.map(|s| s.vehicle == 1).unwrap_or(false),
        state: self_status
            .map(|s| EvseState::from_code(s.state))
            .unwrap_or(EvseState::Other(0)),
        pilot_da: self_status
            .map(|s| s.pilot)
            .filter(|p| *p > 0.0)
            .map(allocator::deci_amps),
    });

    for record in snapshot.iter().filter(|r| r.joined) {
        let status = record.status.as_ref();
        members.push(MemberView {
            id: if record.device_id.is_empty() {
                host_key(&record.host)
            } else {
                record.device_id.clone()
            },
            host: record.host.clone(),
            is_self: false,
            online: record.online,
            vehicle: status.map(|s| s.vehicle == 1).unwrap_or(false),
            state: status
                .map(|s| s.evse_state())
                .unwrap_or(EvseState::Other(0)),
            pilot_da: status
                .map(|s| s.pilot)
                .filter(|p| *p > 0.0)
                .map(allocator::deci_amps),
        });
    }

    members
}
