use proptest::prelude::*;
use slotmesh::config::Config;
use slotmesh::core::node::{Node, NodeFlags, NodeId};
use slotmesh::core::persistence;
use slotmesh::core::state::ClusterMeta;

fn id(ch: u8) -> NodeId {
    NodeId::try_from_bytes(&[ch; 40]).unwrap()
}

fn build_meta() -> ClusterMeta {
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    {
        let me = meta.myself_mut();
        me.ip = "10.0.0.1".to_string();
        me.port = 7878;
        me.bus_port = 17878;
        me.config_epoch = 3;
    }
    for slot in 0..=100u16 {
        meta.assign_slot(slot, id(b'a'));
    }
    meta.assign_slot(16383, id(b'a'));

    let mut other = Node::new(id(b'b'), NodeFlags::PRIMARY, 0);
    other.ip = "10.0.0.2".to_string();
    other.port = 7879;
    other.bus_port = 17879;
    other.config_epoch = 9;
    other.hostname = Some("peer.example.com".to_string());
    meta.add_node(other);
    meta.assign_slot(200, id(b'b'));

    let mut replica = Node::new(id(b'c'), NodeFlags::REPLICA, 0);
    replica.ip = "10.0.0.3".to_string();
    replica.port = 7880;
    replica.bus_port = 17880;
    meta.add_node(replica);
    meta.attach_replica(id(b'c'), id(b'b'));

    meta.migrating.insert(42, id(b'b'));
    meta.importing.insert(200, id(b'b'));
    meta.current_epoch = 11;
    meta.last_vote_epoch = 9;
    meta.update_voting_size();
    meta
}

#[test]
fn round_trip_preserves_topology() {
    let meta = build_meta();
    let rendered = persistence::render(&meta);
    let parsed = persistence::parse(&rendered, 0).expect("round trip parses");

    assert_eq!(parsed.myself, meta.myself);
    assert_eq!(parsed.current_epoch, 11);
    assert_eq!(parsed.last_vote_epoch, 9);
    assert_eq!(parsed.nodes.len(), meta.nodes.len());
    for (nid, node) in &meta.nodes {
        let other = parsed.nodes.get(nid).expect("node survives");
        assert_eq!(other.flags & !NodeFlags::MIGRATE_TO, node.flags & !NodeFlags::MIGRATE_TO);
        assert_eq!(other.ip, node.ip);
        assert_eq!(other.port, node.port);
        assert_eq!(other.bus_port, node.bus_port);
        assert_eq!(other.config_epoch, node.config_epoch);
        assert_eq!(other.slots, node.slots);
        assert_eq!(other.numslots, node.numslots);
        assert_eq!(other.replicaof, node.replicaof);
        assert_eq!(other.hostname, node.hostname);
        assert_eq!(other.shard_id, node.shard_id);
    }
    for slot in 0..16384usize {
        assert_eq!(parsed.slots[slot], meta.slots[slot], "slot {slot}");
    }
    assert_eq!(parsed.migrating, meta.migrating);
    assert_eq!(parsed.importing, meta.importing);
}

#[test]
fn slot_ranges_and_singletons_render_compactly() {
    let meta = build_meta();
    let line = persistence::render_node_line(&meta, meta.myself());
    assert!(line.contains(" 0-100"));
    assert!(line.contains(" 16383"));
    assert!(line.contains("[42->-bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb]"));
    assert!(line.contains("[200-<-bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb]"));
    assert!(line.contains("myself,master"));
    assert!(line.contains("connected"));
}

#[test]
fn replica_line_references_primary() {
    let meta = build_meta();
    let replica = meta.nodes.get(&id(b'c')).unwrap();
    let line = persistence::render_node_line(&meta, replica);
    assert!(line.contains(&id(b'b').to_string()));
    assert!(line.contains("slave"));
}

#[test]
fn vars_trailer_round_trips_and_blank_lines_are_ignored() {
    let meta = build_meta();
    let mut rendered = persistence::render(&meta);
    rendered.push('\n');
    rendered.insert(0, '\n');
    let parsed = persistence::parse(&rendered, 0).unwrap();
    assert_eq!(parsed.current_epoch, 11);
    assert_eq!(parsed.last_vote_epoch, 9);
}

#[test]
fn malformed_records_reject_the_file() {
    let meta = build_meta();
    let rendered = persistence::render(&meta);

    // An invalid node id poisons the whole table.
    let broken = rendered.replacen(&id(b'b').to_string(), "UPPERCASE-NOT-HEX", 1);
    assert!(persistence::parse(&broken, 0).is_err());

    // Too few fields on a line.
    assert!(persistence::parse("deadbeef 1.2.3.4:1@2 master\n", 0).is_err());

    // Unknown auxiliary keys are rejected rather than silently dropped.
    let with_bad_aux = rendered.replacen(
        "10.0.0.2:7879@17879",
        "10.0.0.2:7879@17879,mystery=1",
        1,
    );
    assert!(persistence::parse(&with_bad_aux, 0).is_err());

    // A file without a myself record is unusable.
    let no_myself = rendered.replace("myself,", "");
    assert!(persistence::parse(&no_myself, 0).is_err());
}

#[test]
fn handshake_nodes_are_not_persisted() {
    let mut meta = build_meta();
    let mut ghost = Node::new(id(b'd'), NodeFlags::HANDSHAKE, 0);
    ghost.ip = "10.0.0.4".to_string();
    ghost.port = 1;
    ghost.bus_port = 2;
    meta.add_node(ghost);
    let rendered = persistence::render(&meta);
    assert!(!rendered.contains(&id(b'd').to_string()));
}

#[test]
fn load_or_init_creates_and_reloads_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.conf");
    let mut config = Config::default();
    config.cluster.config_file = path.to_str().unwrap().to_string();

    let (meta, lock) = persistence::load_or_init(&config).unwrap();
    let my_id = meta.myself;
    assert!(path.exists());
    drop(lock);

    let (reloaded, _lock) = persistence::load_or_init(&config).unwrap();
    assert_eq!(reloaded.myself, my_id);
}

#[test]
fn save_replaces_file_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.conf");
    let meta = build_meta();
    persistence::save(&meta, path.to_str().unwrap(), true).unwrap();
    let first = std::fs::read_to_string(&path).unwrap();
    persistence::save(&meta, path.to_str().unwrap(), false).unwrap();
    let second = std::fs::read_to_string(&path).unwrap();
    assert_eq!(first.lines().count(), second.lines().count());
    // No temp droppings left behind.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Serialize-then-parse yields an equivalent table for arbitrary slot
    /// assignments and epochs.
    #[test]
    fn arbitrary_slot_layouts_round_trip(
        slots in proptest::collection::btree_set(0u16..16384, 0..64),
        epoch in 0u64..1_000_000,
    ) {
        let mut meta = ClusterMeta::new(id(b'a'), 0);
        {
            let me = meta.myself_mut();
            me.ip = "127.0.0.1".to_string();
            me.port = 6379;
            me.bus_port = 16379;
            me.config_epoch = epoch;
        }
        for &slot in &slots {
            meta.assign_slot(slot, id(b'a'));
        }
        meta.current_epoch = epoch;

        let parsed = persistence::parse(&persistence::render(&meta), 0).unwrap();
        prop_assert_eq!(parsed.myself().numslots as usize, slots.len());
        for &slot in &slots {
            prop_assert!(parsed.myself().slots.contains(slot));
        }
        prop_assert_eq!(parsed.current_epoch, epoch);
        prop_assert_eq!(parsed.myself().config_epoch, epoch);
    }
}
