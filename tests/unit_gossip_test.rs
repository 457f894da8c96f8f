use slotmesh::config::Config;
use slotmesh::core::gossip;
use slotmesh::core::hooks::NullStore;
use slotmesh::core::node::{Node, NodeFlags, NodeId};
use slotmesh::core::protocol::message::{GossipEntry, MsgExtension, MsgPayload, MsgType};
use slotmesh::core::state::ClusterMeta;

fn id(n: u32) -> NodeId {
    let hex = format!("{n:040x}");
    hex.parse().unwrap()
}

fn connected_primary(nid: NodeId, slot: u16) -> Node {
    let mut node = Node::new(nid, NodeFlags::PRIMARY, 0);
    node.ip = "10.1.0.1".to_string();
    node.port = 6379;
    node.bus_port = 16379;
    node.add_slot(slot);
    node
}

fn entry_for(nid: NodeId, flags: NodeFlags) -> GossipEntry {
    GossipEntry {
        id: nid,
        ping_sent_s: 0,
        pong_received_s: 0,
        ip: "10.2.0.1".to_string(),
        port: 6379,
        bus_port: 16379,
        flags,
        tls_port: 0,
    }
}

#[test]
fn heartbeat_gossip_skips_receiver_and_dedups_entries() {
    let config = Config::default();
    let mut meta = ClusterMeta::new(id(0xa), 0);
    for n in 1..=20u32 {
        meta.add_node(connected_primary(id(0x100 + n), n as u16));
    }
    let receiver = id(0x101);

    let msg = gossip::build_heartbeat(&mut meta, &config, &NullStore, MsgType::Ping, Some(receiver));
    let MsgPayload::Heartbeat { gossip, extensions } = &msg.payload else {
        panic!("heartbeats carry a gossip section");
    };
    assert!(!gossip.is_empty());
    let mut seen = std::collections::HashSet::new();
    for entry in gossip {
        assert_ne!(entry.id, receiver, "receiver never rides its own ping");
        assert_ne!(entry.id, meta.myself, "self is never gossiped");
        assert!(seen.insert(entry.id), "no duplicates in one packet");
    }
    // The shard id extension is always attached.
    assert!(
        extensions
            .iter()
            .any(|e| matches!(e, MsgExtension::ShardId(_)))
    );
}

#[test]
fn pfail_peers_always_ride_along() {
    let config = Config::default();
    let mut meta = ClusterMeta::new(id(0xa), 0);
    for n in 1..=20u32 {
        meta.add_node(connected_primary(id(0x100 + n), n as u16));
    }
    let suspect = id(0x100 + 7);
    meta.nodes
        .get_mut(&suspect)
        .unwrap()
        .flags
        .insert(NodeFlags::PFAIL);

    for _ in 0..5 {
        let msg = gossip::build_heartbeat(&mut meta, &config, &NullStore, MsgType::Ping, None);
        let MsgPayload::Heartbeat { gossip, .. } = &msg.payload else {
            panic!("heartbeats carry a gossip section");
        };
        assert!(
            gossip.iter().any(|e| e.id == suspect),
            "a PFAIL peer must be in every packet"
        );
    }
}

#[test]
fn gossip_discovers_new_nodes_from_trusted_peers() {
    let config = Config::default();
    let mut meta = ClusterMeta::new(id(0xa), 0);
    let sender = id(0xb);
    meta.add_node(connected_primary(sender, 1));

    let newcomer = id(0xc);
    gossip::process_gossip_section(
        &mut meta,
        &config,
        &NullStore,
        sender,
        &[entry_for(newcomer, NodeFlags::PRIMARY)],
        1_000,
    );
    let node = meta.nodes.get(&newcomer).expect("created from gossip");
    assert_eq!(node.ip, "10.2.0.1");
    assert_eq!(node.bus_port, 16379);
    assert!(!node.in_handshake(), "gossiped ids are already authoritative");
}

#[test]
fn blacklisted_nodes_are_not_re_added() {
    let config = Config::default();
    let mut meta = ClusterMeta::new(id(0xa), 0);
    let sender = id(0xb);
    meta.add_node(connected_primary(sender, 1));
    let banned = id(0xc);
    meta.blacklist_add(banned, 1_000);

    gossip::process_gossip_section(
        &mut meta,
        &config,
        &NullStore,
        sender,
        &[entry_for(banned, NodeFlags::PRIMARY)],
        1_000,
    );
    assert!(!meta.nodes.contains_key(&banned));
}

#[test]
fn failure_reports_flow_from_primary_gossip() {
    let config = Config::default();
    let mut meta = ClusterMeta::new(id(0xa), 0);
    meta.assign_slot(0, id(0xa));
    let reporter = id(0xb);
    meta.add_node(connected_primary(reporter, 1));
    let target = id(0xc);
    meta.add_node(connected_primary(target, 2));
    meta.update_voting_size();

    gossip::process_gossip_section(
        &mut meta,
        &config,
        &NullStore,
        reporter,
        &[entry_for(target, NodeFlags::PRIMARY | NodeFlags::PFAIL)],
        1_000,
    );
    assert_eq!(meta.nodes.get(&target).unwrap().fail_reports.len(), 1);

    // The same reporter gossiping the node healthy retracts its report.
    gossip::process_gossip_section(
        &mut meta,
        &config,
        &NullStore,
        reporter,
        &[entry_for(target, NodeFlags::PRIMARY)],
        2_000,
    );
    assert!(meta.nodes.get(&target).unwrap().fail_reports.is_empty());
}

#[test]
fn fresher_pong_times_are_adopted_with_skew_guard() {
    let config = Config::default();
    let mut meta = ClusterMeta::new(id(0xa), 0);
    let sender = id(0xb);
    meta.add_node(connected_primary(sender, 1));
    let peer = id(0xc);
    meta.add_node(connected_primary(peer, 2));
    meta.nodes.get_mut(&peer).unwrap().pong_received = 10_000;

    let now = 100_000;
    let mut entry = entry_for(peer, NodeFlags::PRIMARY);
    entry.pong_received_s = 99; // 99_000 ms, fresher than ours
    gossip::process_gossip_section(&mut meta, &config, &NullStore, sender, &[entry], now);
    assert_eq!(meta.nodes.get(&peer).unwrap().pong_received, 99_000);

    // A pong claimed too far in the future is ignored.
    let mut entry = entry_for(peer, NodeFlags::PRIMARY);
    entry.pong_received_s = 200;
    gossip::process_gossip_section(&mut meta, &config, &NullStore, sender, &[entry], now);
    assert_eq!(meta.nodes.get(&peer).unwrap().pong_received, 99_000);
}

#[test]
fn failing_peer_gossiped_healthy_elsewhere_changes_address() {
    let config = Config::default();
    let mut meta = ClusterMeta::new(id(0xa), 0);
    let sender = id(0xb);
    meta.add_node(connected_primary(sender, 1));
    let peer = id(0xc);
    let mut node = connected_primary(peer, 2);
    node.flags.insert(NodeFlags::PFAIL);
    node.ip = "10.9.9.9".to_string();
    meta.add_node(node);

    let mut entry = entry_for(peer, NodeFlags::PRIMARY);
    entry.ip = "10.2.2.2".to_string();
    entry.port = 7000;
    entry.bus_port = 17000;
    gossip::process_gossip_section(&mut meta, &config, &NullStore, sender, &[entry], 1_000);

    let node = meta.nodes.get(&peer).unwrap();
    assert_eq!(node.ip, "10.2.2.2");
    assert_eq!(node.port, 7000);
    assert_eq!(node.bus_port, 17000);
}

#[test]
fn forgotten_node_extension_blacklists_and_removes() {
    let mut meta = ClusterMeta::new(id(0xa), 0);
    let sender = id(0xb);
    meta.add_node(connected_primary(sender, 1));
    let victim = id(0xc);
    meta.add_node(connected_primary(victim, 2));

    gossip::process_extensions(
        &mut meta,
        sender,
        &[MsgExtension::ForgottenNode {
            id: victim,
            ttl_s: 60,
        }],
        1_000,
    );
    assert!(!meta.nodes.contains_key(&victim));
    assert!(meta.blacklist_contains(victim, 2_000));
}

#[test]
fn hostname_and_shard_extensions_update_the_sender() {
    let mut meta = ClusterMeta::new(id(0xa), 0);
    let sender = id(0xb);
    meta.add_node(connected_primary(sender, 1));
    let shard = id(0xdd);

    gossip::process_extensions(
        &mut meta,
        sender,
        &[
            MsgExtension::Hostname("peer-1.internal".to_string()),
            MsgExtension::ShardId(shard),
            MsgExtension::Nodename("rack1".to_string()),
        ],
        1_000,
    );
    let node = meta.nodes.get(&sender).unwrap();
    assert_eq!(node.hostname.as_deref(), Some("peer-1.internal"));
    assert_eq!(node.nodename.as_deref(), Some("rack1"));
    assert_eq!(node.shard_id, shard);
    assert!(meta.shards.get(&shard).unwrap().contains(&sender));
}

#[test]
fn header_advertises_the_primary_claim_for_replicas() {
    let config = Config::default();
    let mut meta = ClusterMeta::new(id(0xa), 0);
    let primary = id(0xb);
    let mut node = connected_primary(primary, 9);
    node.config_epoch = 77;
    meta.add_node(node);
    {
        let me = meta.myself_mut();
        me.flags.remove(NodeFlags::PRIMARY);
        me.flags.insert(NodeFlags::REPLICA);
    }
    meta.attach_replica(meta.myself, primary);

    let header = gossip::build_header(&meta, &config, &NullStore, MsgType::Ping);
    assert_eq!(header.replicaof, Some(primary));
    assert_eq!(header.config_epoch, 77, "replica advertises its primary's epoch");
    assert!(header.slots.contains(9), "and its primary's slots");
}
