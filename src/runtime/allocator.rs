//! Deterministic current allocation.
//!
//! Every node runs this same pure function over the same observed inputs and
//! must arrive at byte-identical output, so all arithmetic happens on a
//! 0.1 A integer grid (deci-amps) with truncation toward zero after each
//! operation. Floating point only appears at the two boundaries: deriving
//! the budget from the configured maximum, and converting the result for the
//! hardware bridge.
//!
//! The rule is Equal-Share-With-Minimums: reserve assumed current for every
//! offline member first, guarantee each demanding member its minimum if the
//! remaining budget allows, split the surplus equally with per-member caps,
//! and when even the minimums do not fit, serve members in identifier order
//! until the budget runs out.

use serde::Serialize;

use crate::config::GroupConfig;

use super::protocol::EvseState;

/// Current expressed in tenths of an ampere.
pub type DeciAmps = i64;

/// Convert amps to the 0.1 A grid, truncating toward zero.
pub fn deci_amps(amps: f64) -> DeciAmps {
    (amps * 10.0).trunc() as DeciAmps
}

/// Convert a grid value back to amps. Boundary use only.
pub fn amps(da: DeciAmps) -> f64 {
    da as f64 / 10.0
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs
// ────────────────────────────────────────────────────────────────────────────

/// The slice of group config the allocator consumes, pre-converted to the
/// grid. `group_max_da` already carries the conservative clamp applied while
/// the group's configs disagree.
#[derive(Debug, Clone)]
pub struct AllocLimits {
    pub group_max_da: DeciAmps,
    pub safety_factor: f64,
    pub min_charge_da: DeciAmps,
    pub per_node_cap_da: Option<DeciAmps>,
    pub assumed_offline_da: DeciAmps,
}

impl AllocLimits {
    /// `effective_group_max_a` is the configured maximum, possibly lowered
    /// to the smallest maximum observed among divergent peers.
    pub fn from_config(cfg: &GroupConfig, effective_group_max_a: f64) -> Self {
        Self {
            group_max_da: deci_amps(effective_group_max_a),
            safety_factor: cfg.safety_factor,
            min_charge_da: deci_amps(cfg.min_charge_current_a),
            per_node_cap_da: cfg.per_node_max_current_a.map(deci_amps),
            assumed_offline_da: deci_amps(cfg.failsafe_peer_assumed_current_a),
        }
    }

    /// The budget ceiling: `group_max × safety_factor`, truncated to grid.
    pub fn budget_da(&self) -> DeciAmps {
        ((self.group_max_da as f64) * self.safety_factor).trunc() as DeciAmps
    }
}

/// One group member as the allocator sees it.
#[derive(Debug, Clone)]
pub struct MemberView {
    /// Lexicographic sort identity (device_id; host while still unknown).
    pub id: String,
    pub host: String,
    pub is_self: bool,
    pub online: bool,
    pub vehicle: bool,
    pub state: EvseState,
    /// Reported pilot limit on the grid, when present and positive.
    pub pilot_da: Option<DeciAmps>,
}

impl MemberView {
    fn demanding(&self) -> bool {
        self.online && self.vehicle && self.state.permits_charging()
    }

    fn max_da(&self, limits: &AllocLimits) -> DeciAmps {
        match self.pilot_da {
            Some(pilot) if pilot > 0 => pilot,
            _ => limits.per_node_cap_da.unwrap_or(limits.group_max_da),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocReason {
    EqualShare,
    CappedAtMax,
    StarvedBySort,
    NoDemand,
    OfflineReserved,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationEntry {
    pub id: String,
    pub host: String,
    pub is_self: bool,
    pub target_da: DeciAmps,
    pub reason: AllocReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationTable {
    pub entries: Vec<AllocationEntry>,
    pub budget_da: DeciAmps,
    pub available_da: DeciAmps,
}

impl AllocationTable {
    pub fn self_target_da(&self) -> DeciAmps {
        self.entries
            .iter()
            .find(|e| e.is_self)
            .map(|e| e.target_da)
            .unwrap_or(0)
    }

    pub fn total_da(&self) -> DeciAmps {
        self.entries.iter().map(|e| e.target_da).sum()
    }

    /// Whether any member's target moved by at least one grid step (0.1 A).
    /// Below that, downstream consumers are not notified.
    pub fn differs_from(&self, other: &AllocationTable) -> bool {
        if self.entries.len() != other.entries.len() {
            return true;
        }
        self.entries.iter().zip(&other.entries).any(|(a, b)| {
            a.id != b.id || (a.target_da - b.target_da).abs() >= 1 || a.reason != b.reason
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Algorithm
// ────────────────────────────────────────────────────────────────────────────

/// Compute the allocation map. Pure; commutative in the member set.
pub fn allocate(limits: &AllocLimits, members: &[MemberView]) -> AllocationTable {
    let mut ordered: Vec<MemberView> = members.to_vec();
    ordered.sort_by(|a, b| (a.id.as_str(), a.host.as_str()).cmp(&(b.id.as_str(), b.host.as_str())));

    let budget = limits.budget_da().max(0);
    let offline = ordered.iter().filter(|m| !m.online).count() as DeciAmps;
    let reserve = offline * limits.assumed_offline_da;
    let available = (budget - reserve).max(0);

    let mut targets: Vec<DeciAmps> = vec![0; ordered.len()];
    let mut reasons: Vec<AllocReason> = ordered
        .iter()
        .map(|m| {
            if !m.online {
                AllocReason::OfflineReserved
            } else {
                AllocReason::NoDemand
            }
        })
        .collect();

    let demanding: Vec<usize> = (0..ordered.len()).filter(|&i| ordered[i].demanding()).collect();

    if demanding.is_empty() {
        // Nothing to serve; everyone reads as no-demand.
        for reason in reasons.iter_mut() {
            *reason = AllocReason::NoDemand;
        }
        return finish(ordered, targets, reasons, budget, available);
    }

    // A pilot below the configured minimum caps the guarantee itself.
    let max_of = |i: usize| ordered[i].max_da(limits);
    let min_of = |i: usize| limits.min_charge_da.min(max_of(i));
    let sum_min: DeciAmps = demanding.iter().map(|&i| min_of(i)).sum();

    if available >= sum_min {
        // Guarantee minimums, then split the surplus equally, pushing any
        // capped member's unused share back into the pool.
        let mut remaining = available - sum_min;
        let mut capped: Vec<bool> = vec![false; ordered.len()];
        for &i in &demanding {
            targets[i] = min_of(i);
            if min_of(i) < limits.min_charge_da {
                capped[i] = true;
            }
        }
        loop {
            let active: Vec<usize> = demanding
                .iter()
                .copied()
                .filter(|&i| targets[i] < max_of(i))
                .collect();
            if active.is_empty() || remaining == 0 {
                break;
            }
            let share = remaining / active.len() as DeciAmps;
            if share == 0 {
                break;
            }
            for &i in &active {
                let headroom = max_of(i) - targets[i];
                let add = share.min(headroom);
                targets[i] += add;
                remaining -= add;
                if add < share {
                    capped[i] = true;
                }
            }
        }
        for &i in &demanding {
            reasons[i] = if capped[i] {
                AllocReason::CappedAtMax
            } else {
                AllocReason::EqualShare
            };
        }
    } else {
        // Insufficient even for the minimums: serve in identifier order.
        let mut remaining = available;
        for &i in &demanding {
            let min = min_of(i);
            if remaining >= min && min > 0 {
                targets[i] = min;
                remaining -= min;
                reasons[i] = AllocReason::EqualShare;
            } else {
                targets[i] = 0;
                reasons[i] = AllocReason::StarvedBySort;
            }
        }
    }

    finish(ordered, targets, reasons, budget, available)
}

/// Assemble the table and enforce the ceiling: any residual grid violation
/// is shaved in 0.1 A steps from the lexicographically last nonzero member.
fn finish(
    ordered: Vec<MemberView>,
    mut targets: Vec<DeciAmps>,
    reasons: Vec<AllocReason>,
    budget: DeciAmps,
    available: DeciAmps,
) -> AllocationTable {
    let mut total: DeciAmps = targets.iter().sum();
    while total > budget {
        match (0..targets.len()).rev().find(|&i| targets[i] > 0) {
            Some(i) => {
                targets[i] -= 1;
                total -= 1;
            }
            None => break,
        }
    }

    let entries = ordered
        .into_iter()
        .zip(targets)
        .zip(reasons)
        .map(|((member, target_da), reason)| AllocationEntry {
            id: member.id,
            host: member.host,
            is_self: member.is_self,
            target_da,
            reason,
        })
        .collect();

    AllocationTable {
        entries,
        budget_da: budget,
        available_da: available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits(group_max_a: f64) -> AllocLimits {
        AllocLimits {
            group_max_da: deci_amps(group_max_a),
            safety_factor: 1.0,
            min_charge_da: 60,
            per_node_cap_da: None,
            assumed_offline_da: 60,
        }
    }

    fn member(id: &str, online: bool, demanding: bool, pilot: Option<f64>) -> MemberView {
        MemberView {
            id: id.to_string(),
            host: format!("{id}.local"),
            is_self: false,
            online,
            vehicle: demanding,
            state: if demanding {
                EvseState::Charging
            } else {
                EvseState::Idle
            },
            pilot_da: pilot.map(deci_amps),
        }
    }

    fn target_of(table: &AllocationTable, id: &str) -> DeciAmps {
        table.entries.iter().find(|e| e.id == id).unwrap().target_da
    }

    fn reason_of(table: &AllocationTable, id: &str) -> AllocReason {
        table.entries.iter().find(|e| e.id == id).unwrap().reason
    }

    #[test]
    fn two_demanding_peers_split_equally() {
        let table = allocate(
            &limits(50.0),
            &[member("a", true, true, None), member("b", true, true, None)],
        );
        assert_eq!(target_of(&table, "a"), 250);
        assert_eq!(target_of(&table, "b"), 250);
        assert_eq!(reason_of(&table, "a"), AllocReason::EqualShare);
    }

    #[test]
    fn offline_peer_reserves_assumed_current() {
        let table = allocate(
            &limits(50.0),
            &[
                member("a", true, true, None),
                member("b", true, true, None),
                member("c", false, false, None),
            ],
        );
        assert_eq!(table.available_da, 440);
        assert_eq!(target_of(&table, "a"), 220);
        assert_eq!(target_of(&table, "b"), 220);
        assert_eq!(target_of(&table, "c"), 0);
        assert_eq!(reason_of(&table, "c"), AllocReason::OfflineReserved);
    }

    #[test]
    fn starvation_walks_in_lex_order() {
        let table = allocate(
            &limits(20.0),
            &[
                member("d", true, true, None),
                member("b", true, true, None),
                member("a", true, true, None),
                member("c", true, true, None),
            ],
        );
        assert_eq!(target_of(&table, "a"), 60);
        assert_eq!(target_of(&table, "b"), 60);
        assert_eq!(target_of(&table, "c"), 60);
        assert_eq!(target_of(&table, "d"), 0);
        assert_eq!(reason_of(&table, "d"), AllocReason::StarvedBySort);
        assert_eq!(table.total_da(), 180);
    }

    #[test]
    fn cap_surplus_is_redistributed() {
        let table = allocate(
            &limits(60.0),
            &[
                member("a", true, true, Some(10.0)),
                member("b", true, true, None),
                member("c", true, true, None),
            ],
        );
        assert_eq!(target_of(&table, "a"), 100);
        assert_eq!(target_of(&table, "b"), 250);
        assert_eq!(target_of(&table, "c"), 250);
        assert_eq!(reason_of(&table, "a"), AllocReason::CappedAtMax);
        assert_eq!(reason_of(&table, "b"), AllocReason::EqualShare);
        assert_eq!(table.total_da(), 600);
    }

    #[test]
    fn no_demand_allocates_zero_everywhere() {
        let table = allocate(
            &limits(50.0),
            &[member("a", true, false, None), member("b", false, false, None)],
        );
        assert_eq!(table.total_da(), 0);
        assert!(table.entries.iter().all(|e| e.reason == AllocReason::NoDemand));
    }

    #[test]
    fn pilot_below_minimum_caps_the_guarantee() {
        let table = allocate(
            &limits(50.0),
            &[member("a", true, true, Some(3.0)), member("b", true, true, None)],
        );
        assert_eq!(target_of(&table, "a"), 30);
        assert_eq!(reason_of(&table, "a"), AllocReason::CappedAtMax);
        // b absorbs the rest of the budget
        assert_eq!(target_of(&table, "b"), 470);
    }

    #[test]
    fn safety_factor_scales_the_budget() {
        let mut l = limits(50.0);
        l.safety_factor = 0.8;
        let table = allocate(&l, &[member("a", true, true, None)]);
        assert_eq!(table.budget_da, 400);
        assert_eq!(target_of(&table, "a"), 400);
    }

    #[test]
    fn unknown_state_is_not_demanding() {
        let mut m = member("a", true, true, None);
        m.state = EvseState::Other(42);
        let table = allocate(&limits(50.0), &[m]);
        assert_eq!(table.total_da(), 0);
    }

    #[test]
    fn change_threshold_ignores_reorder_free_identity() {
        let l = limits(50.0);
        let before = allocate(&l, &[member("a", true, true, None)]);
        let after = allocate(&l, &[member("a", true, true, None)]);
        assert!(!after.differs_from(&before));
    }

    // Exhaustive invariants over randomized groups (2..=8 members).
    fn arb_group() -> impl Strategy<Value = Vec<MemberView>> {
        proptest::collection::vec(
            (any::<bool>(), any::<bool>(), 0u8..6, proptest::option::of(0.0f64..80.0)),
            2..=8,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(idx, (online, vehicle, state, pilot))| MemberView {
                    id: format!("m{idx:02}"),
                    host: format!("m{idx:02}.local"),
                    is_self: idx == 0,
                    online,
                    vehicle,
                    state: EvseState::from_code(state),
                    pilot_da: pilot.map(deci_amps),
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn sum_never_exceeds_budget(
            members in arb_group(),
            group_max in 0.0f64..100.0,
            safety in 0.0f64..=1.0,
        ) {
            let l = AllocLimits {
                group_max_da: deci_amps(group_max),
                safety_factor: safety,
                min_charge_da: 60,
                per_node_cap_da: None,
                assumed_offline_da: 60,
            };
            let table = allocate(&l, &members);
            prop_assert!(table.total_da() <= l.budget_da().max(0));
        }

        #[test]
        fn output_is_commutative_in_member_order(
            members in arb_group(),
            group_max in 0.0f64..100.0,
        ) {
            let l = limits(group_max);
            let forward = allocate(&l, &members);
            let mut reversed = members.clone();
            reversed.reverse();
            let backward = allocate(&l, &reversed);
            prop_assert_eq!(
                serde_json::to_string(&forward.entries).unwrap(),
                serde_json::to_string(&backward.entries).unwrap()
            );
        }

        #[test]
        fn offline_accounting_is_exact(members in arb_group(), group_max in 0.0f64..100.0) {
            let l = limits(group_max);
            let table = allocate(&l, &members);
            let offline = members.iter().filter(|m| !m.online).count() as DeciAmps;
            prop_assert_eq!(
                table.available_da,
                (l.budget_da() - offline * l.assumed_offline_da).max(0)
            );
        }
    }
}
