//! Enforcement bridge.
//!
//! Translates the evaluator's decision into the two numbers the charging
//! hardware driver consumes: the node's own power cap and the group's
//! observed load. The driver itself is an external collaborator behind
//! [`ChargerPort`]; this module only decides *what* to hand it and *when*
//! re-handing it is worth a hardware round-trip.

use parking_lot::{Mutex, RwLock};

use super::allocator::{amps, DeciAmps};
use super::peers::PeerRecord;

/// Assumed line voltage when neither the peer nor the local node reports one.
pub const NOMINAL_VOLTAGE: f64 = 240.0;

/// Re-emission threshold: 0.5 A at nominal voltage. Below this, hardware is
/// not bothered — except on failsafe transitions, which always go through.
const EMIT_THRESHOLD_W: f64 = 0.5 * NOMINAL_VOLTAGE;

/// The local charger's own sensor snapshot.
#[derive(Debug, Clone)]
pub struct SelfStatus {
    pub amp: f64,
    pub voltage: f64,
    pub pilot: f64,
    pub vehicle: u8,
    pub state: u8,
}

/// Contract to the local charging-hardware driver.
pub trait ChargerPort: Send + Sync {
    /// Current sensor snapshot; `None` when the hardware has no valid
    /// reading (which engages the failsafe upstream).
    fn self_status(&self) -> Option<SelfStatus>;

    /// Consume the node's power cap and the peers' observed load (watts).
    fn apply(&self, max_power_w: f64, live_power_w: f64);
}

/// Driver stand-in that logs every application. Useful on hardware-less
/// hosts and in tests; a real deployment supplies its own [`ChargerPort`].
pub struct LogChargerPort {
    status: RwLock<Option<SelfStatus>>,
}

impl LogChargerPort {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(Some(SelfStatus {
                amp: 0.0,
                voltage: NOMINAL_VOLTAGE,
                pilot: 0.0,
                vehicle: 0,
                state: 1,
            })),
        }
    }

    pub fn set_status(&self, status: Option<SelfStatus>) {
        *self.status.write() = status;
    }
}

impl Default for LogChargerPort {
    fn default() -> Self {
        Self::new()
    }
}

impl ChargerPort for LogChargerPort {
    fn self_status(&self) -> Option<SelfStatus> {
        self.status.read().clone()
    }

    fn apply(&self, max_power_w: f64, live_power_w: f64) {
        log::info!(
            "charger driver: max_power={:.0}W live_power={:.0}W",
            max_power_w,
            live_power_w
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Emission {
    max_power_w: f64,
    live_power_w: f64,
    failsafe: bool,
}

/// Thresholded emitter in front of a [`ChargerPort`].
pub struct EnforcementBridge<P: ChargerPort + ?Sized> {
    port: std::sync::Arc<P>,
    last: Mutex<Option<Emission>>,
}

impl<P: ChargerPort + ?Sized> EnforcementBridge<P> {
    pub fn new(port: std::sync::Arc<P>) -> Self {
        Self {
            port,
            last: Mutex::new(None),
        }
    }

    /// Compute both driver values and apply them if they moved enough.
    /// Returns `true` when the driver was actually called.
    pub fn emit(
        &self,
        self_target_da: DeciAmps,
        failsafe_engaged: bool,
        peers: &[PeerRecord],
        self_status: Option<&SelfStatus>,
    ) -> bool {
        let local_voltage = self_status.map(|s| s.voltage).filter(|v| *v > 0.0);
        let self_voltage = local_voltage.unwrap_or(NOMINAL_VOLTAGE);

        let max_power_w = amps(self_target_da) * self_voltage;
        let live_power_w: f64 = peers
            .iter()
            .filter(|p| p.joined && p.online)
            .filter_map(|p| p.status.as_ref())
            .map(|s| {
                let voltage = if s.voltage > 0.0 {
                    s.voltage
                } else {
                    local_voltage.unwrap_or(NOMINAL_VOLTAGE)
                };
                s.amp * voltage
            })
            .sum();

        let emission = Emission {
            max_power_w,
            live_power_w,
            failsafe: failsafe_engaged,
        };

        let mut last = self.last.lock();
        let should_emit = match *last {
            None => true,
            Some(prev) => {
                prev.failsafe != emission.failsafe
                    || (prev.max_power_w - emission.max_power_w).abs() >= EMIT_THRESHOLD_W
                    || (prev.live_power_w - emission.live_power_w).abs() >= EMIT_THRESHOLD_W
            }
        };
        if should_emit {
            *last = Some(emission);
            self.port.apply(max_power_w, live_power_w);
        }
        should_emit
    }
}
