//! Failsafe supervision.
//!
//! The allocator already prices individual peer loss into its budget; the
//! failsafe handles the cases where the node cannot trust its view of the
//! group at all. It is stateless — each evaluation derives the decision from
//! current inputs, so recovery is immediate once the condition clears.

use crate::config::{FailsafeMode, GroupConfig};

use super::allocator::{deci_amps, DeciAmps};

/// Why the failsafe engaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailsafeCause {
    /// Every joined peer is past the heartbeat window.
    AllPeersOffline,
    /// The local sensor snapshot is missing or invalid.
    NoSelfStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailsafeDecision {
    pub engaged: bool,
    pub cause: Option<FailsafeCause>,
    /// What the node may actually draw after the override.
    pub self_target_da: DeciAmps,
}

/// Apply the override rules to the allocator's self share.
///
/// * A group of one never engages; the node keeps the full permitted budget.
/// * Individual offline peers do not engage — their assumed draw is already
///   reserved upstream.
pub fn evaluate(
    cfg: &GroupConfig,
    joined_peers: usize,
    offline_joined_peers: usize,
    have_self_status: bool,
    allocator_self_da: DeciAmps,
    budget_da: DeciAmps,
) -> FailsafeDecision {
    if joined_peers == 0 {
        return FailsafeDecision {
            engaged: false,
            cause: None,
            self_target_da: budget_da.max(0),
        };
    }

    let cause = if offline_joined_peers >= joined_peers {
        Some(FailsafeCause::AllPeersOffline)
    } else if !have_self_status {
        Some(FailsafeCause::NoSelfStatus)
    } else {
        None
    };

    match cause {
        None => FailsafeDecision {
            engaged: false,
            cause: None,
            self_target_da: allocator_self_da,
        },
        Some(cause) => {
            let target = match cfg.failsafe_mode {
                FailsafeMode::Disable => 0,
                FailsafeMode::SafeCurrent => {
                    deci_amps(cfg.failsafe_safe_current_a).min(allocator_self_da)
                }
            };
            FailsafeDecision {
                engaged: true,
                cause: Some(cause),
                self_target_da: target.max(0),
            }
        }
    }
}
