//! HTTP surface.
//!
//! Two groups of routes share one router:
//!
//! * `/loadsharing/*` — the operator-facing diagnostic and management API.
//! * `/status`, `/config`, `/ws` — the peer-facing endpoints every node in
//!   the group consumes from every other node. `/ws` sends a full status
//!   snapshot on connect and full refresh frames afterwards (receivers
//!   treat frames as deltas, so full frames are always valid).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::GroupConfig;
use crate::runtime::allocator::amps;
use crate::runtime::config_sync::ConfigPayload;
use crate::runtime::peers::PeerRecord;
use crate::runtime::registry::RegistryError;
use crate::runtime::SharedState;

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        // Diagnostic / management API
        .route(
            "/loadsharing/peers",
            get(list_peers).post(add_peer),
        )
        .route("/loadsharing/peers/:host", axum::routing::delete(remove_peer))
        .route("/loadsharing/discover", post(trigger_discovery))
        .route("/loadsharing/status", get(loadsharing_status))
        .route(
            "/loadsharing/config",
            get(get_config).post(operator_config),
        )
        // Peer-facing endpoints
        .route("/status", get(self_status))
        .route("/config", get(get_config).post(peer_config_push))
        .route("/ws", get(status_stream))
        .with_state(state)
}

// ────────────────────────────────────────────────────────────────────────────
// Peer management
// ────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PeerEntry {
    id: String,
    name: String,
    host: String,
    ip: Option<String>,
    online: bool,
    joined: bool,
}

impl From<&PeerRecord> for PeerEntry {
    fn from(record: &PeerRecord) -> Self {
        let name = if record.device_id.is_empty() {
            record
                .host
                .split('.')
                .next()
                .unwrap_or(&record.host)
                .to_string()
        } else {
            record.device_id.clone()
        };
        Self {
            id: record.device_id.clone(),
            name,
            host: record.host.clone(),
            ip: record.ip.clone(),
            online: record.online,
            joined: record.joined,
        }
    }
}

async fn list_peers(State(state): State<Arc<SharedState>>) -> Json<Vec<PeerEntry>> {
    let entries = state
        .registry
        .list(true, true)
        .iter()
        .map(PeerEntry::from)
        .collect();
    Json(entries)
}

#[derive(Deserialize)]
struct AddPeerBody {
    host: String,
}

async fn add_peer(
    State(state): State<Arc<SharedState>>,
    Json(body): Json<AddPeerBody>,
) -> Response {
    match state.registry.add(&body.host) {
        Ok(warning) => {
            state.recompute.notify_one();
            done(warning)
        }
        Err(err) => registry_error(err),
    }
}

async fn remove_peer(
    State(state): State<Arc<SharedState>>,
    Path(host): Path<String>,
) -> Response {
    match state.registry.remove(&host) {
        Ok(warning) => {
            state.recompute.notify_one();
            done(warning)
        }
        Err(err) => registry_error(err),
    }
}

async fn trigger_discovery(State(state): State<Arc<SharedState>>) -> Response {
    state.discovery.trigger();
    done(None)
}

fn done(warning: Option<String>) -> Response {
    match warning {
        None => Json(json!({ "msg": "done" })).into_response(),
        Some(warning) => Json(json!({
            "msg": "done",
            "warning": format!("change applied but not persisted: {warning}"),
        }))
        .into_response(),
    }
}

fn registry_error(err: RegistryError) -> Response {
    let code = match err {
        RegistryError::Unknown => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (code, Json(json!({ "msg": err.to_string() }))).into_response()
}

// ────────────────────────────────────────────────────────────────────────────
// Diagnostic status
// ────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusPeerEntry {
    #[serde(flatten)]
    entry: PeerEntry,
    last_seen_s: Option<u64>,
    amp: Option<f64>,
    state: Option<u8>,
}

async fn loadsharing_status(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    let cfg = state.config.get();
    let (online, offline) = state.peers.joined_counts();
    let divergences: Vec<_> = state.divergences.read().values().cloned().collect();

    let discovery = state.discovery.snapshot();
    let discovered: Vec<serde_json::Value> = discovery
        .services
        .iter()
        .map(|service| {
            let txt: serde_json::Map<String, serde_json::Value> = service
                .txt
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            json!({
                "hostname": service.hostname,
                "instance": service.instance,
                "ip": service.ip,
                "port": service.port,
                "txt": txt,
            })
        })
        .collect();

    let peers: Vec<StatusPeerEntry> = state
        .peers
        .snapshot()
        .iter()
        .map(|record| StatusPeerEntry {
            entry: PeerEntry::from(record),
            last_seen_s: record.last_seen.map(|seen| seen.elapsed().as_secs()),
            amp: record.status.as_ref().map(|s| s.amp),
            state: record.status.as_ref().map(|s| s.state),
        })
        .collect();

    let allocations: Vec<serde_json::Value> = state
        .last_allocation
        .read()
        .as_ref()
        .map(|table| {
            table
                .entries
                .iter()
                .map(|entry| {
                    json!({
                        "id": entry.id,
                        "host": entry.host,
                        "self": entry.is_self,
                        "target_current_a": amps(entry.target_da),
                        "reason": entry.reason,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Json(json!({
        "enabled": cfg.enabled,
        "group_id": cfg.group_id,
        "computed_at": *state.computed_at.read(),
        "failsafe_active": state.failsafe_active.load(Ordering::Relaxed),
        "online_count": online,
        "offline_count": offline,
        "config_consistent": divergences.is_empty(),
        "config_issues": divergences,
        "storage_degraded": state.registry.is_degraded(),
        "discovery": {
            "stale": discovery.is_stale(),
            "services": discovered,
        },
        "peers": peers,
        "allocations": allocations,
    }))
}

// ────────────────────────────────────────────────────────────────────────────
// Config endpoints
// ────────────────────────────────────────────────────────────────────────────

async fn get_config(State(state): State<Arc<SharedState>>) -> Json<ConfigPayload> {
    let payload = ConfigPayload::build(
        state.config.get(),
        state.registry.members_for_hash(&state.identity.host),
        state.identity.device_id.clone(),
    );
    Json(payload)
}

/// Operator edit: validated, version-bumped, persisted.
async fn operator_config(
    State(state): State<Arc<SharedState>>,
    Json(new): Json<GroupConfig>,
) -> Response {
    match state.config.apply_operator(new) {
        Ok(applied) => {
            state.recompute.notify_one();
            done(applied.persist_error)
        }
        Err(err) => (StatusCode::BAD_REQUEST, Json(json!({ "msg": err.to_string() }))).into_response(),
    }
}

/// Push from a peer: applied only when the sender's record wins.
async fn peer_config_push(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ConfigPayload>,
) -> Response {
    match state.sync.accept_push(&payload) {
        Ok(applied) => Json(json!({
            "msg": "done",
            "config_version": applied.config_version,
        }))
        .into_response(),
        Err(reason) => {
            (StatusCode::CONFLICT, Json(json!({ "msg": reason }))).into_response()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Peer-facing status
// ────────────────────────────────────────────────────────────────────────────

fn self_status_value(state: &SharedState) -> serde_json::Value {
    let cfg = state.config.get();
    let hash = cfg.fingerprint(&state.registry.members_for_hash(&state.identity.host));
    match state.port.self_status() {
        Some(status) => json!({
            "amp": status.amp,
            "voltage": status.voltage,
            "pilot": status.pilot,
            "vehicle": status.vehicle,
            "state": status.state,
            "config_version": cfg.config_version,
            "config_hash": hash,
            "device_id": state.identity.device_id,
        }),
        None => json!({
            "amp": 0.0,
            "voltage": 0.0,
            "pilot": 0.0,
            "vehicle": 0,
            "state": 0,
            "config_version": cfg.config_version,
            "config_hash": hash,
            "device_id": state.identity.device_id,
        }),
    }
}

async fn self_status(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(self_status_value(&state))
}

/// How often the stream refreshes subscribers (seconds).
const STREAM_REFRESH_SECS: u64 = 2;

async fn status_stream(
    State(state): State<Arc<SharedState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| stream_status(socket, state))
}

async fn stream_status(mut socket: WebSocket, state: Arc<SharedState>) {
    let mut tick = tokio::time::interval(Duration::from_secs(STREAM_REFRESH_SECS));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let frame = self_status_value(&state).to_string();
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }
}
