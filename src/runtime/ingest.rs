//! Peer status ingestion.
//!
//! One long-lived worker per joined peer keeps that peer's status cache and
//! `last_seen` fresh:
//!
//! 1. Bootstrap fetch of `/status` (retried at 1, 2, 4 s).
//! 2. Persistent `/ws` subscription — a full snapshot on connect, partial
//!    deltas afterwards. `last_seen` advances only on successfully parsed
//!    messages, never on mere connects.
//! 3. On disconnect the cached snapshot is retained and `last_seen` frozen;
//!    reconnects back off 1, 2, 4, … capped at 60 s and reset as soon as a
//!    message arrives. A peer whose stream endpoint 404s is served by plain
//!    HTTP polling at a third of the heartbeat window instead.
//!
//! A manager task reconciles the worker set against the joined hosts every
//! few seconds, and a 1 s heartbeat supervisor flips peers offline once
//! `last_seen` falls out of the configured window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigStore;

use super::config_sync::SyncSignal;
use super::peers::{host_key, SharedPeers};
use super::protocol::{
    PeerStatus, StatusFrame, INITIAL_RECONNECT_DELAY_SECS, MAX_RECONNECT_DELAY_SECS,
    STREAM_CONNECT_TIMEOUT_SECS, SUPERVISOR_PASS_SECS,
};
use super::registry::PeerRegistry;

/// Everything a per-peer worker needs, shared across all of them.
pub struct IngestContext {
    pub peers: SharedPeers,
    pub registry: Arc<PeerRegistry>,
    pub config: Arc<ConfigStore>,
    pub http: reqwest::Client,
    pub own_host: String,
    pub recompute: Arc<Notify>,
    pub sync_tx: mpsc::Sender<SyncSignal>,
}

/// How often the manager reconciles workers against the joined set (seconds).
const MANAGER_SCAN_INTERVAL_SECS: u64 = 2;

// ────────────────────────────────────────────────────────────────────────────
// Manager
// ────────────────────────────────────────────────────────────────────────────

/// Keeps exactly one worker alive per joined peer. Workers for removed
/// peers are cancelled; dead workers are respawned on the next scan.
pub async fn run_ingest_manager(ctx: Arc<IngestContext>, cancel: CancellationToken) {
    let mut workers: HashMap<String, (CancellationToken, JoinHandle<()>)> = HashMap::new();
    let mut tick = interval(Duration::from_secs(MANAGER_SCAN_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let enabled = ctx.config.get().enabled;
        let joined: Vec<String> = if enabled {
            ctx.registry.hosts()
        } else {
            Vec::new()
        };
        let joined_keys: Vec<String> = joined.iter().map(|h| host_key(h)).collect();

        workers.retain(|key, (token, handle)| {
            if !joined_keys.contains(key) {
                token.cancel();
                return false;
            }
            !handle.is_finished()
        });

        for host in joined {
            let key = host_key(&host);
            if workers.contains_key(&key) {
                continue;
            }
            let token = cancel.child_token();
            let worker_ctx = ctx.clone();
            let worker_token = token.clone();
            let handle = tokio::spawn(async move {
                run_peer_worker(host, worker_ctx, worker_token).await;
            });
            workers.insert(key, (token, handle));
        }
    }

    for (_, (token, _)) in workers {
        token.cancel();
    }
    log::debug!("ingest manager stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// Per-peer worker
// ────────────────────────────────────────────────────────────────────────────

enum StreamOutcome {
    /// Session ended; `true` when at least one message was parsed.
    Ended(bool),
    /// The peer has no stream endpoint; fall back to HTTP polling.
    NotFound,
    Failed,
}

async fn run_peer_worker(host: String, ctx: Arc<IngestContext>, cancel: CancellationToken) {
    log::info!("status worker started for {}", host);

    bootstrap(&host, &ctx, &cancel).await;

    let mut delay = INITIAL_RECONNECT_DELAY_SECS;
    while !cancel.is_cancelled() {
        match subscribe(&host, &ctx, &cancel).await {
            StreamOutcome::Ended(got_message) => {
                if got_message {
                    delay = INITIAL_RECONNECT_DELAY_SECS;
                }
            }
            StreamOutcome::NotFound => {
                poll_loop(&host, &ctx, &cancel).await;
            }
            StreamOutcome::Failed => {}
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(Duration::from_secs(delay)) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY_SECS);
    }

    log::debug!("status worker for {} stopped", host);
}

/// Initial HTTP fetch; retried at 1, 2, 4 s, then the worker moves on to the
/// stream regardless.
async fn bootstrap(host: &str, ctx: &IngestContext, cancel: &CancellationToken) {
    for delay in [0u64, 1, 2, 4] {
        if delay > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(Duration::from_secs(delay)) => {}
            }
        }
        match fetch_status(host, ctx).await {
            Ok(frame) => {
                apply_frame(host, ctx, &frame, true);
                return;
            }
            Err(err) => log::debug!("bootstrap fetch from {} failed: {}", host, err),
        }
    }
}

async fn fetch_status(host: &str, ctx: &IngestContext) -> anyhow::Result<StatusFrame> {
    let url = format!("http://{}/status", host);
    let text = ctx
        .http
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    StatusFrame::parse(&text).ok_or_else(|| anyhow::anyhow!("malformed status document"))
}

/// One stream session: connect, cache the initial full snapshot, merge
/// deltas until the stream drops or we are cancelled.
async fn subscribe(host: &str, ctx: &IngestContext, cancel: &CancellationToken) -> StreamOutcome {
    let url = format!("ws://{}/ws", host);
    let connect = timeout(
        Duration::from_secs(STREAM_CONNECT_TIMEOUT_SECS),
        connect_async(url.as_str()),
    );

    let ws = tokio::select! {
        _ = cancel.cancelled() => return StreamOutcome::Ended(false),
        result = connect => match result {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(WsError::Http(response))) if response.status().as_u16() == 404 => {
                log::debug!("{} has no stream endpoint, polling instead", host);
                return StreamOutcome::NotFound;
            }
            Ok(Err(err)) => {
                log::debug!("stream connect to {} failed: {}", host, err);
                return StreamOutcome::Failed;
            }
            Err(_) => {
                log::debug!("stream connect to {} timed out", host);
                return StreamOutcome::Failed;
            }
        },
    };

    log::debug!("stream to {} connected", host);
    let (_write, mut read) = ws.split();
    let mut got_message = false;
    let mut first = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return StreamOutcome::Ended(got_message),
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match StatusFrame::parse(text.as_str()) {
                        Some(frame) => {
                            apply_frame(host, ctx, &frame, first);
                            first = false;
                            got_message = true;
                        }
                        None => log::debug!("dropping malformed frame from {}", host),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("stream to {} closed", host);
                    return StreamOutcome::Ended(got_message);
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(err)) => {
                    log::debug!("stream read from {} failed: {}", host, err);
                    return StreamOutcome::Ended(got_message);
                }
            }
        }
    }
}

/// HTTP-poll fallback for peers without a stream endpoint. Runs until a poll
/// fails, then hands control back to the reconnect cycle.
async fn poll_loop(host: &str, ctx: &IngestContext, cancel: &CancellationToken) {
    loop {
        let period = (ctx.config.get().heartbeat_timeout_s / 3).max(1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(Duration::from_secs(period)) => {}
        }
        match fetch_status(host, ctx).await {
            Ok(frame) => apply_frame(host, ctx, &frame, true),
            Err(err) => {
                log::debug!("poll of {} failed: {}", host, err);
                return;
            }
        }
    }
}

/// Central sink for every successfully parsed message: merge into the cache,
/// stamp `last_seen`, wake the allocator, and route config drift to sync.
fn apply_frame(host: &str, ctx: &IngestContext, frame: &StatusFrame, full: bool) {
    let mut status = if full {
        PeerStatus::default()
    } else {
        ctx.peers
            .get(host)
            .and_then(|r| r.status)
            .unwrap_or_default()
    };
    frame.merge_into(&mut status);

    let fingerprint = (status.config_version, status.config_hash.clone());
    let came_online = ctx.peers.record_message(host, status);
    if came_online {
        log::info!("peer {} is online", host);
    }
    ctx.recompute.notify_one();

    // Peers that do not carry a fingerprint sit out of config sync.
    let (peer_version, peer_hash) = fingerprint;
    if peer_version == 0 && peer_hash.is_empty() {
        return;
    }
    let local = ctx.config.get();
    let local_hash = local.fingerprint(&ctx.registry.members_for_hash(&ctx.own_host));
    if peer_version != local.config_version || peer_hash != local_hash {
        let _ = ctx.sync_tx.try_send(SyncSignal {
            host: host.to_string(),
            peer_version,
            peer_hash,
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Heartbeat supervisor
// ────────────────────────────────────────────────────────────────────────────

/// Marks joined peers offline once `last_seen` leaves the heartbeat window
/// and wakes the evaluator so the failsafe sees the transition promptly.
pub async fn run_heartbeat_supervisor(
    peers: SharedPeers,
    config: Arc<ConfigStore>,
    recompute: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut tick = interval(Duration::from_secs(SUPERVISOR_PASS_SECS));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let window = Duration::from_secs(config.get().heartbeat_timeout_s);
        for record in peers.snapshot() {
            if !(record.joined && record.online) {
                continue;
            }
            let expired = record
                .last_seen
                .map(|seen| seen.elapsed() > window)
                .unwrap_or(true);
            if expired && peers.mark_offline(&record.host) {
                log::warn!(
                    "peer {} missed heartbeat for {}s, marking offline",
                    record.host,
                    window.as_secs()
                );
                recompute.notify_one();
            }
        }
    }
    log::debug!("heartbeat supervisor stopped");
}
