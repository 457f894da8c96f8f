use parking_lot::Mutex;
use slotmesh::core::hooks::{Keyspace, PubSubSink, ReplicationProbe};
use slotmesh::core::node::{Node, NodeFlags, NodeId};
use slotmesh::core::routing::{self, RouteDecision, key_slot};
use slotmesh::core::state::{ClusterHealth, ClusterMeta};
use std::collections::HashSet;

fn id(ch: u8) -> NodeId {
    NodeId::try_from_bytes(&[ch; 40]).unwrap()
}

#[derive(Default)]
struct TestStore {
    present: Mutex<HashSet<Vec<u8>>>,
}

impl TestStore {
    fn with_keys(keys: &[&[u8]]) -> Self {
        let store = TestStore::default();
        *store.present.lock() = keys.iter().map(|k| k.to_vec()).collect();
        store
    }
}

impl Keyspace for TestStore {
    fn count_keys_in_slot(&self, _slot: u16) -> u32 {
        self.present.lock().len() as u32
    }

    fn del_keys_in_slot(&self, _slot: u16) -> u32 {
        0
    }

    fn key_exists(&self, key: &[u8]) -> bool {
        self.present.lock().contains(key)
    }
}

impl PubSubSink for TestStore {
    fn publish(&self, _channel: &[u8], _message: &[u8], _sharded: bool) {}
}

impl ReplicationProbe for TestStore {
    fn replication_offset(&self) -> i64 {
        0
    }
    fn data_age_ms(&self) -> u64 {
        0
    }
    fn is_link_up(&self) -> bool {
        false
    }
    fn bind_primary(&self, _host: &str, _port: u16) {}
    fn unbind_primary(&self) {}
    fn pause_writes_until(&self, _deadline_ms: u64) {}
    fn resume_writes(&self) {}
}

/// Self owns the slot of "foo"; node b owns the slot of "bar".
fn routed_meta() -> ClusterMeta {
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    meta.assign_slot(key_slot(b"foo"), id(b'a'));
    let mut other = Node::new(id(b'b'), NodeFlags::PRIMARY, 0);
    other.ip = "10.0.0.2".to_string();
    other.port = 6390;
    meta.add_node(other);
    meta.assign_slot(key_slot(b"bar"), id(b'b'));
    meta.health = ClusterHealth::Ok;
    meta
}

#[test]
fn keyless_commands_run_locally() {
    let meta = routed_meta();
    let store = TestStore::default();
    assert_eq!(routing::route(&meta, &store, &[], false), RouteDecision::Local);
}

#[test]
fn owned_slot_is_local_foreign_slot_is_moved() {
    let meta = routed_meta();
    let store = TestStore::default();
    assert_eq!(
        routing::route(&meta, &store, &[b"foo"], false),
        RouteDecision::Local
    );
    match routing::route(&meta, &store, &[b"bar"], false) {
        RouteDecision::Redirect { node, addr, slot, ask } => {
            assert_eq!(node, id(b'b'));
            assert_eq!(addr, "10.0.0.2:6390");
            assert_eq!(slot, key_slot(b"bar"));
            assert!(!ask);
        }
        other => panic!("expected MOVED redirect, got {other:?}"),
    }
}

#[test]
fn keys_in_different_slots_are_rejected() {
    let meta = routed_meta();
    let store = TestStore::default();
    assert_eq!(
        routing::route(&meta, &store, &[b"foo", b"bar"], false),
        RouteDecision::CrossSlot
    );
    // Hash tags keep a multi-key command in one slot.
    let mut meta = routed_meta();
    meta.assign_slot(key_slot(b"{tag}a"), id(b'a'));
    assert_eq!(
        routing::route(&meta, &TestStore::with_keys(&[b"{tag}a", b"{tag}b"]), &[b"{tag}a", b"{tag}b"], false),
        RouteDecision::Local
    );
}

#[test]
fn down_cluster_and_unbound_slots_refuse_service() {
    let mut meta = routed_meta();
    meta.health = ClusterHealth::Fail;
    let store = TestStore::default();
    assert!(matches!(
        routing::route(&meta, &store, &[b"foo"], false),
        RouteDecision::Down { .. }
    ));

    let mut meta = routed_meta();
    meta.unassign_slot(key_slot(b"foo"));
    assert!(matches!(
        routing::route(&meta, &store, &[b"foo"], false),
        RouteDecision::Down { .. }
    ));
}

#[test]
fn migrating_slot_asks_for_missing_keys_serves_present_ones() {
    let mut meta = routed_meta();
    meta.migrating.insert(key_slot(b"foo"), id(b'b'));

    // The key is still here: serve it.
    let store = TestStore::with_keys(&[b"foo"]);
    assert_eq!(
        routing::route(&meta, &store, &[b"foo"], false),
        RouteDecision::Local
    );

    // The key already moved: ASK the destination.
    let store = TestStore::default();
    match routing::route(&meta, &store, &[b"foo"], false) {
        RouteDecision::Redirect { node, ask, .. } => {
            assert_eq!(node, id(b'b'));
            assert!(ask);
        }
        other => panic!("expected ASK redirect, got {other:?}"),
    }
}

#[test]
fn split_multikey_during_migration_says_try_again() {
    let mut meta = routed_meta();
    let slot = key_slot(b"{t}x");
    meta.assign_slot(slot, id(b'a'));
    meta.migrating.insert(slot, id(b'b'));
    // One key still local, the other already migrated.
    let store = TestStore::with_keys(&[b"{t}x"]);
    assert_eq!(
        routing::route(&meta, &store, &[b"{t}x", b"{t}y"], false),
        RouteDecision::TryAgain
    );
}

#[test]
fn importing_slot_serves_only_asking_clients() {
    let mut meta = routed_meta();
    // Slot still officially owned by b, mid-import on our side.
    let slot = key_slot(b"{q}a");
    meta.assign_slot(slot, id(b'b'));
    meta.importing.insert(slot, id(b'b'));

    let store = TestStore::with_keys(&[b"{q}a"]);
    // Without ASKING the request is still a MOVED to the official owner.
    assert!(matches!(
        routing::route(&meta, &store, &[b"{q}a"], false),
        RouteDecision::Redirect { ask: false, .. }
    ));
    // With ASKING we serve what we already imported.
    assert_eq!(
        routing::route(&meta, &store, &[b"{q}a"], true),
        RouteDecision::Local
    );
    // A half-arrived multi-key command is retried.
    assert_eq!(
        routing::route(&meta, &store, &[b"{q}a", b"{q}b"], true),
        RouteDecision::TryAgain
    );
}
