//! LAN discovery via mDNS/DNS-SD.
//!
//! One background loop browses for sibling chargers advertising
//! [`SERVICE_TYPE`](super::protocol::SERVICE_TYPE) and keeps an atomically
//! swapped snapshot of whatever the last browse window produced. Discovery
//! is best-effort enrichment only — membership lives in the registry, and a
//! peer missing from a window is never removed from anything.
//!
//! Two operations are exposed: `trigger` (make the next wake-up start a
//! browse immediately; idempotent, non-blocking) and `snapshot` (read the
//! last completed result; possibly stale, never touches the network).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use super::peers::{host_key, SharedPeers};
use super::protocol::{
    DISCOVERY_POLL_SECS, DISCOVERY_QUERY_TIMEOUT_SECS, DISCOVERY_SNAPSHOT_TTL_SECS, SERVICE_TYPE,
};

/// One advertised sibling as seen in a browse window.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub hostname: String,
    pub instance: String,
    pub ip: Option<String>,
    pub port: u16,
    /// TXT records, passed through to the diagnostic API untouched.
    pub txt: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    pub services: Vec<DiscoveredService>,
    pub completed_at: Option<Instant>,
}

impl DiscoverySnapshot {
    /// Past the TTL the snapshot may still be read, but callers should know
    /// it no longer reflects the LAN.
    pub fn is_stale(&self) -> bool {
        match self.completed_at {
            Some(at) => at.elapsed() > Duration::from_secs(DISCOVERY_SNAPSHOT_TTL_SECS),
            None => true,
        }
    }
}

/// Shared handle between the worker and its callers.
pub struct DiscoveryState {
    snapshot: RwLock<DiscoverySnapshot>,
    wakeup: Notify,
    forced: AtomicBool,
}

pub type SharedDiscovery = Arc<DiscoveryState>;

impl DiscoveryState {
    pub fn new() -> SharedDiscovery {
        Arc::new(Self {
            snapshot: RwLock::new(DiscoverySnapshot::default()),
            wakeup: Notify::new(),
            forced: AtomicBool::new(false),
        })
    }

    /// Make the next cycle start a browse now. Never pre-empts a window
    /// already in flight; the request is simply carried to the next one.
    pub fn trigger(&self) {
        self.forced.store(true, Ordering::Relaxed);
        self.wakeup.notify_one();
    }

    /// Last completed result. Never blocks on the network.
    pub fn snapshot(&self) -> DiscoverySnapshot {
        self.snapshot.read().clone()
    }

    fn take_forced(&self) -> bool {
        self.forced.swap(false, Ordering::Relaxed)
    }
}

struct BrowseWindow {
    rx: mdns_sd::Receiver<ServiceEvent>,
    started: Instant,
    /// Keyed by lower-cased hostname; first occurrence wins, so a device
    /// answering over several interfaces appears once.
    found: BTreeMap<String, DiscoveredService>,
}

/// Discovery worker loop. `Idle → QueryInFlight → Idle`; network errors,
/// empty results and timeouts all just produce the next snapshot.
pub async fn run_discovery(
    state: SharedDiscovery,
    peers: SharedPeers,
    own_host: String,
    interval_secs: u64,
    cancel: CancellationToken,
) {
    let own_key = host_key(&own_host);
    let mut tick = interval(Duration::from_secs(DISCOVERY_POLL_SECS));
    let mut daemon: Option<ServiceDaemon> = None;
    let mut window: Option<BrowseWindow> = None;
    let mut last_started: Option<Instant> = None;

    log::info!("discovery worker started ({})", SERVICE_TYPE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = state.wakeup.notified() => {}
            _ = tick.tick() => {}
        }

        if window.is_some() {
            let expired = {
                let active = window.as_mut().unwrap();
                drain_events(active, &own_key);
                active.started.elapsed() >= Duration::from_secs(DISCOVERY_QUERY_TIMEOUT_SECS)
            };
            if expired {
                let finished = window.take().unwrap();
                if let Some(d) = daemon.as_ref() {
                    let _ = d.stop_browse(SERVICE_TYPE);
                }
                publish(&state, &peers, finished);
            }
            continue;
        }

        let due = state.take_forced()
            || last_started
                .map(|at| at.elapsed() >= Duration::from_secs(interval_secs))
                .unwrap_or(true);
        if !due {
            continue;
        }

        if daemon.is_none() {
            match ServiceDaemon::new() {
                Ok(d) => daemon = Some(d),
                Err(err) => {
                    log::debug!("mDNS daemon unavailable: {}", err);
                    last_started = Some(Instant::now());
                    continue;
                }
            }
        }

        match daemon.as_ref().unwrap().browse(SERVICE_TYPE) {
            Ok(rx) => {
                last_started = Some(Instant::now());
                window = Some(BrowseWindow {
                    rx,
                    started: Instant::now(),
                    found: BTreeMap::new(),
                });
            }
            Err(err) => {
                log::debug!("mDNS browse failed: {}", err);
                // Drop the daemon; a fresh one is created next cycle.
                daemon = None;
                last_started = Some(Instant::now());
            }
        }
    }

    if let Some(d) = daemon {
        let _ = d.stop_browse(SERVICE_TYPE);
        let _ = d.shutdown();
    }
    log::debug!("discovery worker stopped");
}

fn drain_events(window: &mut BrowseWindow, own_key: &str) {
    while let Ok(event) = window.rx.try_recv() {
        if let ServiceEvent::ServiceResolved(info) = event {
            let hostname = info.get_hostname().trim_end_matches('.').to_string();
            let key = host_key(&hostname);
            if key.is_empty() || key == own_key {
                continue;
            }
            let instance = info
                .get_fullname()
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string();
            let txt = info
                .get_properties()
                .iter()
                .map(|p| (p.key().to_string(), p.val_str().to_string()))
                .collect();
            let service = DiscoveredService {
                hostname,
                instance,
                ip: info.get_addresses().iter().next().map(|a| a.to_string()),
                port: info.get_port(),
                txt,
            };
            // First occurrence wins.
            window.found.entry(key).or_insert(service);
        }
    }
}

fn publish(state: &DiscoveryState, peers: &SharedPeers, window: BrowseWindow) {
    let services: Vec<DiscoveredService> = window.found.into_values().collect();
    let hostnames: Vec<String> = services.iter().map(|s| s.hostname.clone()).collect();

    for service in &services {
        peers.mark_discovered(&service.hostname, service.ip.clone());
    }
    peers.retain_discovered(&hostnames);

    log::debug!("discovery window closed with {} service(s)", services.len());
    *state.snapshot.write() = DiscoverySnapshot {
        services,
        completed_at: Some(Instant::now()),
    };
}
