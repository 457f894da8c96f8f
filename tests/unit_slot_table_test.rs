use parking_lot::Mutex;
use slotmesh::config::Config;
use slotmesh::core::hooks::{Keyspace, PubSubSink, ReplicationProbe};
use slotmesh::core::node::{Node, NodeFlags, NodeId};
use slotmesh::core::slot_map::SlotBitmap;
use slotmesh::core::state::ClusterMeta;
use slotmesh::core::update;
use std::collections::HashMap;

fn id(ch: u8) -> NodeId {
    NodeId::try_from_bytes(&[ch; 40]).unwrap()
}

/// A keyspace double tracking which slots hold keys and which got wiped.
#[derive(Default)]
struct TestStore {
    keys_per_slot: Mutex<HashMap<u16, u32>>,
    deleted_slots: Mutex<Vec<u16>>,
    bound_primary: Mutex<Option<(String, u16)>>,
}

impl TestStore {
    fn with_keys(slots: &[(u16, u32)]) -> Self {
        let store = TestStore::default();
        *store.keys_per_slot.lock() = slots.iter().copied().collect();
        store
    }
}

impl Keyspace for TestStore {
    fn count_keys_in_slot(&self, slot: u16) -> u32 {
        *self.keys_per_slot.lock().get(&slot).unwrap_or(&0)
    }

    fn del_keys_in_slot(&self, slot: u16) -> u32 {
        self.deleted_slots.lock().push(slot);
        self.keys_per_slot.lock().remove(&slot).unwrap_or(0)
    }

    fn key_exists(&self, _key: &[u8]) -> bool {
        false
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

    fn bind_primary(&self, host: &str, port: u16) {
        *self.bound_primary.lock() = Some((host.to_string(), port));
    }

    fn unbind_primary(&self) {}

    fn pause_writes_until(&self, _deadline_ms: u64) {}

    fn resume_writes(&self) {}
}

fn add_primary(meta: &mut ClusterMeta, nid: NodeId, epoch: u64, slots: &[u16]) {
    let mut node = Node::new(nid, NodeFlags::PRIMARY, 0);
    node.config_epoch = epoch;
    node.ip = "10.0.0.9".to_string();
    node.port = 6379;
    node.bus_port = 16379;
    meta.add_node(node);
    for &slot in slots {
        meta.assign_slot(slot, nid);
    }
}

fn claimed(slots: &[u16]) -> SlotBitmap {
    let mut bitmap = SlotBitmap::new();
    for &slot in slots {
        bitmap.insert(slot);
    }
    bitmap
}

#[test]
fn newer_epoch_takes_over_slot() {
    let config = Config::default();
    let store = TestStore::default();
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    meta.myself_mut().config_epoch = 5;
    add_primary(&mut meta, id(b'b'), 3, &[7]);
    add_primary(&mut meta, id(b'c'), 9, &[]);

    update::update_slots(&mut meta, &config, &store, id(b'c'), 9, &claimed(&[7]));
    assert_eq!(meta.slots[7], Some(id(b'c')));
    assert!(meta.nodes.get(&id(b'c')).unwrap().slots.contains(7));
    assert!(!meta.nodes.get(&id(b'b')).unwrap().slots.contains(7));
    // The cached slot counts follow the bitmaps.
    for node in meta.nodes.values() {
        assert_eq!(node.slots.count(), node.numslots);
    }
}

#[test]
fn older_epoch_cannot_steal_a_slot() {
    let config = Config::default();
    let store = TestStore::default();
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    add_primary(&mut meta, id(b'b'), 9, &[7]);
    add_primary(&mut meta, id(b'c'), 3, &[]);

    update::update_slots(&mut meta, &config, &store, id(b'c'), 3, &claimed(&[7]));
    assert_eq!(meta.slots[7], Some(id(b'b')));
}

#[test]
fn owner_dropping_a_claim_is_soft_flagged_not_unbound() {
    let config = Config::default();
    let store = TestStore::default();
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    add_primary(&mut meta, id(b'b'), 4, &[3, 4]);

    // b now only claims slot 3.
    update::update_slots(&mut meta, &config, &store, id(b'b'), 4, &claimed(&[3]));
    assert_eq!(meta.slots[4], Some(id(b'b')), "slot stays bound");
    assert!(meta.owner_not_claiming.contains(4));
    assert!(!meta.owner_not_claiming.contains(3));

    // Claiming it again clears the soft flag.
    update::update_slots(&mut meta, &config, &store, id(b'b'), 4, &claimed(&[3, 4]));
    assert!(!meta.owner_not_claiming.contains(4));
}

#[test]
fn lost_slots_with_local_keys_are_wiped() {
    let config = Config::default();
    let store = TestStore::with_keys(&[(2, 10)]);
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    // We keep another slot so losing slot 2 does not empty us out.
    meta.myself_mut().config_epoch = 1;
    meta.assign_slot(2, id(b'a'));
    meta.assign_slot(3, id(b'a'));
    add_primary(&mut meta, id(b'b'), 8, &[]);

    update::update_slots(&mut meta, &config, &store, id(b'b'), 8, &claimed(&[2]));
    assert_eq!(meta.slots[2], Some(id(b'b')));
    assert_eq!(*store.deleted_slots.lock(), vec![2]);
    assert!(meta.myself().is_primary(), "still a primary, we kept slot 3");
}

#[test]
fn emptied_primary_follows_the_new_owner() {
    let config = Config::default();
    let store = TestStore::default();
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    meta.myself_mut().config_epoch = 1;
    meta.assign_slot(0, id(b'a'));
    meta.assign_slot(1, id(b'a'));
    add_primary(&mut meta, id(b'b'), 8, &[]);

    update::update_slots(&mut meta, &config, &store, id(b'b'), 8, &claimed(&[0, 1]));
    let me = meta.myself();
    assert!(me.is_replica());
    assert_eq!(me.replicaof, Some(id(b'b')));
    assert!(store.bound_primary.lock().is_some());
    // The demoted primary keeps its config epoch untouched; reconciliation
    // tolerates the stale-high value.
    assert_eq!(meta.myself().config_epoch, 1);
}

#[test]
fn stale_high_epoch_on_a_replica_does_not_block_reassignment() {
    let config = Config::default();
    let store = TestStore::default();
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    add_primary(&mut meta, id(b'b'), 5, &[1]);
    // A demoted ex-primary hanging around with a higher epoch than anyone.
    let mut demoted = Node::new(id(b'd'), NodeFlags::REPLICA, 0);
    demoted.config_epoch = 99;
    meta.add_node(demoted);
    add_primary(&mut meta, id(b'c'), 7, &[]);

    update::update_slots(&mut meta, &config, &store, id(b'c'), 7, &claimed(&[1]));
    assert_eq!(meta.slots[1], Some(id(b'c')));
}

#[test]
fn importing_slots_are_left_alone_mid_handover() {
    let config = Config::default();
    let store = TestStore::default();
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    add_primary(&mut meta, id(b'b'), 2, &[5]);
    add_primary(&mut meta, id(b'c'), 9, &[]);
    meta.importing.insert(5, id(b'c'));

    update::update_slots(&mut meta, &config, &store, id(b'c'), 9, &claimed(&[5]));
    assert_eq!(meta.slots[5], Some(id(b'b')), "import in progress, no rebind");
}

#[test]
fn replica_of_a_replica_adopts_the_grandprimary() {
    let config = Config::default();
    let store = TestStore::default();
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    {
        let me = meta.myself_mut();
        me.flags.remove(NodeFlags::PRIMARY);
        me.flags.insert(NodeFlags::REPLICA);
    }
    add_primary(&mut meta, id(b'c'), 9, &[8]);
    let mut middle = Node::new(id(b'b'), NodeFlags::REPLICA, 0);
    middle.ip = "10.0.0.2".to_string();
    meta.add_node(middle);
    meta.attach_replica(id(b'b'), id(b'c'));
    meta.attach_replica(id(b'a'), id(b'b'));

    // Any reconciliation pass notices the chain and flattens it.
    update::update_slots(&mut meta, &config, &store, id(b'c'), 9, &claimed(&[8]));
    assert_eq!(meta.myself().replicaof, Some(id(b'c')));
}

#[test]
fn update_mask_hides_unclaimed_slots() {
    let config = Config::default();
    let store = TestStore::default();
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    add_primary(&mut meta, id(b'b'), 4, &[3, 4]);
    meta.owner_not_claiming.insert(4);

    let msg = update::build_update_msg(&meta, &config, &store, id(b'b')).unwrap();
    match msg.payload {
        slotmesh::core::protocol::message::MsgPayload::Update { slots, .. } => {
            assert!(slots.contains(3));
            assert!(!slots.contains(4), "not-claiming slots are masked");
        }
        other => panic!("expected update payload, got {other:?}"),
    }
}
