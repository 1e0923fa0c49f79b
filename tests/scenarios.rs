//! End-to-end scenarios over the coordination pipeline: the allocation
//! table a node computes, the failsafe override on top of it, persistence
//! across restarts, and config convergence between two nodes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

use loadshare::config::{ConfigStore, FailsafeMode, GroupConfig};
use loadshare::runtime::allocator::{allocate, deci_amps, AllocLimits, AllocReason, MemberView};
use loadshare::runtime::config_sync::{ConfigPayload, SyncContext};
use loadshare::runtime::failsafe;
use loadshare::runtime::peers::PeerTable;
use loadshare::runtime::protocol::EvseState;
use loadshare::runtime::registry::PeerRegistry;

fn group_limits(group_max_a: f64, assumed_a: f64) -> AllocLimits {
    AllocLimits {
        group_max_da: deci_amps(group_max_a),
        safety_factor: 1.0,
        min_charge_da: 60,
        per_node_cap_da: None,
        assumed_offline_da: deci_amps(assumed_a),
    }
}

fn charger(id: &str, online: bool, demanding: bool, pilot: Option<f64>) -> MemberView {
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

fn target(table: &loadshare::runtime::allocator::AllocationTable, id: &str) -> f64 {
    table
        .entries
        .iter()
        .find(|e| e.id == id)
        .map(|e| e.target_da as f64 / 10.0)
        .unwrap()
}

#[test]
fn two_demanding_peers_share_equally() {
    let table = allocate(
        &group_limits(50.0, 6.0),
        &[charger("a", true, true, None), charger("b", true, true, None)],
    );
    assert_eq!(target(&table, "a"), 25.0);
    assert_eq!(target(&table, "b"), 25.0);
}

#[test]
fn offline_peer_is_reserved_before_online_peers_are_served() {
    let table = allocate(
        &group_limits(50.0, 6.0),
        &[
            charger("a", true, true, None),
            charger("b", true, true, None),
            charger("c", false, false, None),
        ],
    );
    assert_eq!(table.available_da, 440);
    assert_eq!(target(&table, "a"), 22.0);
    assert_eq!(target(&table, "b"), 22.0);
    assert_eq!(target(&table, "c"), 0.0);
}

#[test]
fn minimums_starve_in_sort_order_under_tight_budget() {
    let table = allocate(
        &group_limits(20.0, 6.0),
        &[
            charger("a", true, true, None),
            charger("b", true, true, None),
            charger("c", true, true, None),
            charger("d", true, true, None),
        ],
    );
    assert_eq!(target(&table, "a"), 6.0);
    assert_eq!(target(&table, "b"), 6.0);
    assert_eq!(target(&table, "c"), 6.0);
    assert_eq!(target(&table, "d"), 0.0);
    assert_eq!(
        table.entries.iter().find(|e| e.id == "d").unwrap().reason,
        AllocReason::StarvedBySort
    );
    assert!(table.total_da() <= 200);
}

#[test]
fn capped_peer_returns_surplus_to_the_others() {
    let table = allocate(
        &group_limits(60.0, 6.0),
        &[
            charger("a", true, true, Some(10.0)),
            charger("b", true, true, None),
            charger("c", true, true, None),
        ],
    );
    assert_eq!(target(&table, "a"), 10.0);
    assert_eq!(target(&table, "b"), 25.0);
    assert_eq!(target(&table, "c"), 25.0);
    assert_eq!(table.total_da(), 600);
}

#[test]
fn failsafe_zeroes_self_when_every_peer_is_silent() {
    let cfg = GroupConfig {
        failsafe_mode: FailsafeMode::Disable,
        ..GroupConfig::default()
    };
    let table = allocate(
        &group_limits(50.0, 6.0),
        &[charger("a", false, false, None), charger("b", false, false, None)],
    );
    let decision = failsafe::evaluate(&cfg, 2, 2, true, table.self_target_da(), table.budget_da);
    assert!(decision.engaged);
    assert_eq!(decision.self_target_da, 0);
}

#[test]
fn registry_contents_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let before;
    {
        let registry = open_registry(dir.path(), "self.local");
        registry.add("left.local").unwrap();
        registry.add("right.local").unwrap();
        registry.remove("left.local").unwrap();
        before = registry.hosts();
    }
    let reopened = open_registry(dir.path(), "self.local");
    assert_eq!(reopened.hosts(), before);
}

fn open_registry(dir: &Path, own: &str) -> PeerRegistry {
    PeerRegistry::open(dir, vec![own.to_string()], PeerTable::new())
}

fn sync_context(dir: &Path, host: &str, device_id: &str) -> SyncContext {
    let config = Arc::new(ConfigStore::open(dir));
    let registry = Arc::new(PeerRegistry::open(
        dir,
        vec![host.to_string()],
        PeerTable::new(),
    ));
    SyncContext {
        config,
        registry,
        http: reqwest::Client::new(),
        own_host: host.to_string(),
        own_device_id: device_id.to_string(),
        recompute: Arc::new(Notify::new()),
        divergences: Arc::new(RwLock::new(BTreeMap::new())),
    }
}

#[test]
fn newer_config_is_adopted_and_hashes_converge() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = sync_context(dir_a.path(), "a.local", "node-a");
    let b = sync_context(dir_b.path(), "b.local", "node-b");

    // Node A is two edits ahead and knows about B.
    a.registry.add("b.local").unwrap();
    let mut edit = a.config.get();
    edit.group_max_current_a = 40.0;
    a.config.apply_operator(edit).unwrap();
    let mut edit = a.config.get();
    edit.group_max_current_a = 45.0;
    a.config.apply_operator(edit).unwrap();

    // Node B has one local edit of its own.
    let mut edit = b.config.get();
    edit.group_max_current_a = 32.0;
    b.config.apply_operator(edit).unwrap();

    let pushed = ConfigPayload::build(
        a.config.get(),
        a.registry.members_for_hash(&a.own_host),
        a.own_device_id.clone(),
    );
    let adopted = b.accept_push(&pushed).expect("push should win");

    assert_eq!(adopted.config_version, 2);
    assert_eq!(adopted.group_max_current_a, 45.0);
    // B now hashes the same member set and fields as A.
    let hash_b = b
        .config
        .get()
        .fingerprint(&b.registry.members_for_hash(&b.own_host));
    assert_eq!(hash_b, pushed.config_hash);
    assert!(b.divergences.read().is_empty());
    assert_eq!(b.registry.hosts(), vec!["a.local"]);
}

#[test]
fn stale_push_is_rejected_and_local_state_untouched() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = sync_context(dir_a.path(), "a.local", "node-a");
    let b = sync_context(dir_b.path(), "b.local", "node-b");

    let mut edit = b.config.get();
    edit.group_max_current_a = 32.0;
    b.config.apply_operator(edit).unwrap();
    let mut edit = b.config.get();
    edit.group_max_current_a = 30.0;
    b.config.apply_operator(edit).unwrap();

    let stale = ConfigPayload::build(
        a.config.get(),
        a.registry.members_for_hash(&a.own_host),
        a.own_device_id.clone(),
    );
    assert!(b.accept_push(&stale).is_err());
    assert_eq!(b.config.get().group_max_current_a, 30.0);
    assert_eq!(b.config.get().config_version, 2);
}

#[test]
fn tampered_push_payload_is_rejected() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = sync_context(dir_a.path(), "a.local", "node-a");
    let b = sync_context(dir_b.path(), "b.local", "node-b");

    let mut edit = a.config.get();
    edit.group_max_current_a = 40.0;
    a.config.apply_operator(edit).unwrap();

    let mut pushed = ConfigPayload::build(
        a.config.get(),
        a.registry.members_for_hash(&a.own_host),
        a.own_device_id.clone(),
    );
    pushed.config.group_max_current_a = 90.0; // hash no longer matches
    assert!(b.accept_push(&pushed).is_err());
}
