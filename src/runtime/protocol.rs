//! Wire types and protocol constants.
//!
//! Everything the agent exchanges with its peers — status frames on the
//! WebSocket stream, the status resource, and the group-config payload — is
//! defined here so that every worker speaks the same language.

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// DNS-SD service type every charger in a group advertises and browses.
pub const SERVICE_TYPE: &str = "_openevse._tcp.local.";

/// Discovery worker wake-up cadence (seconds).
pub const DISCOVERY_POLL_SECS: u64 = 2;

/// How often a fresh mDNS browse is started (seconds).
pub const DISCOVERY_INTERVAL_SECS: u64 = 60;

/// How long one browse window may run before it is finalized (seconds).
pub const DISCOVERY_QUERY_TIMEOUT_SECS: u64 = 5;

/// Age after which a discovery snapshot is considered stale (seconds).
/// Stale snapshots are still readable.
pub const DISCOVERY_SNAPSHOT_TTL_SECS: u64 = 60;

/// Heartbeat supervisor pass cadence (seconds).
pub const SUPERVISOR_PASS_SECS: u64 = 1;

/// Allocator fallback recompute cadence (seconds).
pub const EVALUATE_FALLBACK_SECS: u64 = 5;

/// Connect timeout for peer HTTP fetches (seconds).
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Read timeout for peer HTTP fetches (seconds).
pub const HTTP_READ_TIMEOUT_SECS: u64 = 10;

/// Handshake timeout for peer stream connects (seconds).
pub const STREAM_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Initial reconnect delay for peer subscriptions (seconds).
pub const INITIAL_RECONNECT_DELAY_SECS: u64 = 1;

/// Back-off ceiling for peer subscription reconnects (seconds).
pub const MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// Budget for flushing state on shutdown (seconds); past it, abort.
pub const SHUTDOWN_BUDGET_SECS: u64 = 2;

// ────────────────────────────────────────────────────────────────────────────
// EVSE state codes
// ────────────────────────────────────────────────────────────────────────────

/// J1772 EVSE state as reported by a charger.
///
/// Only `Connected` and `Charging` permit charging; every other code —
/// including error codes and codes this agent does not know — counts as
/// not demanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvseState {
    Idle,
    Connected,
    Charging,
    Other(u8),
}

impl EvseState {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => EvseState::Idle,
            2 => EvseState::Connected,
            3 => EvseState::Charging,
            other => EvseState::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            EvseState::Idle => 1,
            EvseState::Connected => 2,
            EvseState::Charging => 3,
            EvseState::Other(code) => code,
        }
    }

    /// Whether a vehicle in this state may draw current.
    pub fn permits_charging(self) -> bool {
        matches!(self, EvseState::Connected | EvseState::Charging)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Status frames
// ────────────────────────────────────────────────────────────────────────────

/// Fully resolved status snapshot for one charger.
///
/// The first stream message and every successful `/status` fetch produce one
/// of these; stream deltas are merged into it via [`StatusFrame::merge_into`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Measured charge current (A).
    pub amp: f64,
    /// Measured line voltage (V); 0 when the peer has no reading.
    pub voltage: f64,
    /// Advertised pilot limit (A); 0 when unknown.
    pub pilot: f64,
    /// 1 when a vehicle is connected.
    pub vehicle: u8,
    /// Raw EVSE state code.
    pub state: u8,
    /// The peer's config counter, used for drift detection.
    pub config_version: u64,
    /// The peer's config fingerprint.
    pub config_hash: String,
    /// Stable identifier reported by the peer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
}

impl PeerStatus {
    pub fn evse_state(&self) -> EvseState {
        EvseState::from_code(self.state)
    }
}

/// One frame as it appears on the wire: a full snapshot on connect, partial
/// deltas afterwards. Unknown fields are ignored by serde.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusFrame {
    pub amp: Option<f64>,
    pub voltage: Option<f64>,
    pub pilot: Option<f64>,
    pub vehicle: Option<u8>,
    pub state: Option<u8>,
    pub config_version: Option<u64>,
    pub config_hash: Option<String>,
    pub device_id: Option<String>,
}

impl StatusFrame {
    /// Parse a frame from raw JSON text. Returns `None` on malformed input;
    /// the caller drops the message.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Merge this delta into a cached snapshot, field by field.
    pub fn merge_into(&self, status: &mut PeerStatus) {
        if let Some(amp) = self.amp {
            status.amp = amp;
        }
        if let Some(voltage) = self.voltage {
            status.voltage = voltage;
        }
        if let Some(pilot) = self.pilot {
            status.pilot = pilot;
        }
        if let Some(vehicle) = self.vehicle {
            status.vehicle = vehicle;
        }
        if let Some(state) = self.state {
            status.state = state;
        }
        if let Some(version) = self.config_version {
            status.config_version = version;
        }
        if let Some(hash) = &self.config_hash {
            status.config_hash = hash.clone();
        }
        if let Some(id) = &self.device_id {
            status.device_id = id.clone();
        }
    }
}
