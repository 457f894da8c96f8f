use slotmesh::config::Config;
use slotmesh::core::failover;
use slotmesh::core::gossip::now_ms;
use slotmesh::core::hooks::NullStore;
use slotmesh::core::node::{Node, NodeFlags, NodeId};
use slotmesh::core::protocol::message::{MsgFlags, MsgHeader, MsgType};
use slotmesh::core::slot_map::SlotBitmap;
use slotmesh::core::state::ClusterMeta;

fn id(ch: u8) -> NodeId {
    NodeId::try_from_bytes(&[ch; 40]).unwrap()
}

fn add_primary(meta: &mut ClusterMeta, nid: NodeId, epoch: u64, slots: &[u16]) {
    let mut node = Node::new(nid, NodeFlags::PRIMARY, 0);
    node.config_epoch = epoch;
    meta.add_node(node);
    for &slot in slots {
        meta.assign_slot(slot, nid);
    }
}

/// Self is a voting primary; `candidate` is a replica of the FAILed primary
/// `failed`, which owned `slots` at `epoch`.
fn voting_meta(candidate: NodeId, failed: NodeId, epoch: u64, slots: &[u16]) -> ClusterMeta {
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    meta.myself_mut().config_epoch = 1;
    meta.assign_slot(100, id(b'a'));
    add_primary(&mut meta, failed, epoch, slots);
    meta.nodes
        .get_mut(&failed)
        .unwrap()
        .flags
        .insert(NodeFlags::FAIL);
    meta.add_node(Node::new(candidate, NodeFlags::REPLICA, 0));
    meta.attach_replica(candidate, failed);
    meta.update_voting_size();
    meta
}

fn auth_request(candidate: NodeId, current_epoch: u64, config_epoch: u64, slots: &[u16]) -> MsgHeader {
    let mut bitmap = SlotBitmap::new();
    for &slot in slots {
        bitmap.insert(slot);
    }
    MsgHeader {
        mtype: MsgType::AuthRequest,
        port: 6379,
        current_epoch,
        config_epoch,
        repl_offset: 0,
        sender: candidate,
        slots: bitmap,
        replicaof: None,
        ip: None,
        tls_port: 0,
        bus_port: 16379,
        flags: NodeFlags::REPLICA,
        state_fail: false,
        mflags: MsgFlags::empty(),
    }
}

#[test]
fn eligible_request_earns_the_vote() {
    let config = Config::default();
    let candidate = id(b'c');
    let failed = id(b'b');
    let mut meta = voting_meta(candidate, failed, 7, &[5]);
    meta.current_epoch = 8;

    let request = auth_request(candidate, 8, 7, &[5]);
    let now = now_ms();
    failover::vote_if_eligible(&mut meta, &config, &NullStore, &request, now);
    assert_eq!(meta.last_vote_epoch, 8);
    assert_eq!(meta.nodes.get(&failed).unwrap().voted_time, now);
}

#[test]
fn one_vote_per_epoch() {
    let config = Config::default();
    let candidate = id(b'c');
    let other_candidate = id(b'd');
    let failed = id(b'b');
    let mut meta = voting_meta(candidate, failed, 7, &[5]);
    meta.add_node(Node::new(other_candidate, NodeFlags::REPLICA, 0));
    meta.attach_replica(other_candidate, failed);
    meta.current_epoch = 8;

    let now = now_ms();
    failover::vote_if_eligible(&mut meta, &config, &NullStore, &auth_request(candidate, 8, 7, &[5]), now);
    assert_eq!(meta.last_vote_epoch, 8);

    // A second request in the same epoch is refused, whoever sends it.
    let voted_before = meta.nodes.get(&failed).unwrap().voted_time;
    failover::vote_if_eligible(
        &mut meta,
        &config,
        &NullStore,
        &auth_request(other_candidate, 8, 7, &[5]),
        now + 1,
    );
    assert_eq!(meta.nodes.get(&failed).unwrap().voted_time, voted_before);
}

#[test]
fn stale_epoch_and_reachable_primary_are_refused() {
    let config = Config::default();
    let candidate = id(b'c');
    let failed = id(b'b');
    let mut meta = voting_meta(candidate, failed, 7, &[5]);
    meta.current_epoch = 8;

    // Requested epoch below ours.
    failover::vote_if_eligible(&mut meta, &config, &NullStore, &auth_request(candidate, 7, 7, &[5]), now_ms());
    assert_eq!(meta.last_vote_epoch, 0);

    // Primary came back: no vote without the forceack escape hatch.
    meta.nodes
        .get_mut(&failed)
        .unwrap()
        .flags
        .remove(NodeFlags::FAIL);
    failover::vote_if_eligible(&mut meta, &config, &NullStore, &auth_request(candidate, 8, 7, &[5]), now_ms());
    assert_eq!(meta.last_vote_epoch, 0);

    // ...but a manual failover's forceack is honored.
    let mut forced = auth_request(candidate, 8, 7, &[5]);
    forced.mflags |= MsgFlags::FORCEACK;
    failover::vote_if_eligible(&mut meta, &config, &NullStore, &forced, now_ms());
    assert_eq!(meta.last_vote_epoch, 8);
}

#[test]
fn votes_for_one_primary_are_rate_limited() {
    let config = Config::default();
    let candidate = id(b'c');
    let failed = id(b'b');
    let mut meta = voting_meta(candidate, failed, 7, &[5]);
    meta.current_epoch = 8;
    let now = now_ms();
    meta.nodes.get_mut(&failed).unwrap().voted_time = now - 1_000;

    failover::vote_if_eligible(&mut meta, &config, &NullStore, &auth_request(candidate, 8, 7, &[5]), now);
    assert_eq!(meta.last_vote_epoch, 0, "2x node_timeout spacing enforced");
}

#[test]
fn stale_slot_claims_are_refused() {
    let config = Config::default();
    let candidate = id(b'c');
    let failed = id(b'b');
    let mut meta = voting_meta(candidate, failed, 7, &[5]);
    meta.current_epoch = 9;
    // Slot 5 has since moved to a primary with a newer epoch.
    add_primary(&mut meta, id(b'e'), 9, &[]);
    meta.assign_slot(5, id(b'e'));
    meta.nodes.get_mut(&id(b'e')).unwrap().config_epoch = 9;

    failover::vote_if_eligible(&mut meta, &config, &NullStore, &auth_request(candidate, 9, 7, &[5]), now_ms());
    assert_eq!(meta.last_vote_epoch, 0);
}

#[test]
fn tally_counts_only_voting_primaries_at_the_election_epoch() {
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    add_primary(&mut meta, id(b'b'), 1, &[1]);
    add_primary(&mut meta, id(b'c'), 1, &[]);
    meta.failover.auth_epoch = 8;

    let mut header = auth_request(id(b'b'), 8, 1, &[]);
    header.mtype = MsgType::AuthAck;
    header.flags = NodeFlags::PRIMARY;
    failover::tally_vote(&mut meta, &header);
    assert_eq!(meta.failover.auth_count, 1);

    // Slotless primaries are not part of the voting set.
    header.sender = id(b'c');
    failover::tally_vote(&mut meta, &header);
    assert_eq!(meta.failover.auth_count, 1);

    // Acks from an older epoch are ignored.
    header.sender = id(b'b');
    header.current_epoch = 7;
    failover::tally_vote(&mut meta, &header);
    assert_eq!(meta.failover.auth_count, 1);
}

#[test]
fn winning_the_election_promotes_and_claims_slots() {
    let config = Config::default();
    let store = NullStore;
    let failed = id(b'b');
    // We are the replica this time.
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    {
        let me = meta.myself_mut();
        me.flags.remove(NodeFlags::PRIMARY);
        me.flags.insert(NodeFlags::REPLICA);
        me.config_epoch = 2;
    }
    add_primary(&mut meta, failed, 7, &[5, 6]);
    meta.nodes
        .get_mut(&failed)
        .unwrap()
        .flags
        .insert(NodeFlags::FAIL);
    meta.attach_replica(meta.myself, failed);
    // Two more voting primaries so the quorum is 2 of 3.
    add_primary(&mut meta, id(b'c'), 3, &[7]);
    add_primary(&mut meta, id(b'd'), 4, &[8]);
    meta.update_voting_size();
    assert_eq!(meta.quorum(), 2);

    let now = now_ms();
    meta.current_epoch = 8;
    meta.failover.auth_epoch = 8;
    meta.failover.auth_sent = true;
    meta.failover.auth_time = now.saturating_sub(100);
    meta.failover.auth_count = 2;

    failover::handle_replica_failover(&mut meta, &config, &store, now);

    let me = meta.myself();
    assert!(me.is_primary());
    assert_eq!(me.config_epoch, 8);
    assert_eq!(me.replicaof, None);
    assert_eq!(meta.slots[5], Some(id(b'a')));
    assert_eq!(meta.slots[6], Some(id(b'a')));
    assert_eq!(meta.nodes.get(&failed).unwrap().numslots, 0);
}

#[test]
fn election_schedule_accounts_for_rank() {
    let config = Config::default();
    let store = NullStore;
    let failed = id(b'b');
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    {
        let me = meta.myself_mut();
        me.flags.remove(NodeFlags::PRIMARY);
        me.flags.insert(NodeFlags::REPLICA);
    }
    add_primary(&mut meta, failed, 7, &[5]);
    meta.nodes
        .get_mut(&failed)
        .unwrap()
        .flags
        .insert(NodeFlags::FAIL);
    meta.attach_replica(meta.myself, failed);
    // A co-replica with a fresher offset outranks us.
    let mut sibling = Node::new(id(b'c'), NodeFlags::REPLICA, 0);
    sibling.repl_offset = 500;
    meta.add_node(sibling);
    meta.attach_replica(id(b'c'), failed);
    meta.update_voting_size();

    assert_eq!(failover::replica_rank(&meta, &store), 1);

    let now = now_ms();
    failover::handle_replica_failover(&mut meta, &config, &store, now);
    assert!(!meta.failover.auth_sent, "first pass only schedules");
    // Base delay 500..1000ms plus 1000ms for rank 1.
    let delay = meta.failover.auth_time - now;
    assert!((1_500..2_000).contains(&delay), "delay was {delay}");
}

#[test]
fn epoch_collision_moves_only_the_smaller_id() {
    let mut meta = ClusterMeta::new(id(b'0'), 0);
    meta.myself_mut().config_epoch = 12;
    meta.current_epoch = 12;
    add_primary(&mut meta, id(b'f'), 12, &[1]);

    // Peer id is greater: we are the smaller side and must move.
    failover::handle_epoch_collision(&mut meta, id(b'f'));
    assert_eq!(meta.myself().config_epoch, 13);
    assert_eq!(meta.current_epoch, 13);

    // Now the reverse: a peer with a smaller id and our same epoch leaves
    // us untouched.
    let mut meta = ClusterMeta::new(id(b'f'), 0);
    meta.myself_mut().config_epoch = 12;
    meta.current_epoch = 12;
    add_primary(&mut meta, id(b'0'), 12, &[1]);
    failover::handle_epoch_collision(&mut meta, id(b'0'));
    assert_eq!(meta.myself().config_epoch, 12);
}

#[test]
fn manual_failover_gates_on_offset_parity() {
    let store = NullStore;
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    meta.manual.end_time = now_ms() + 5_000;
    meta.manual.primary_offset = 42;
    failover::handle_manual_failover(&mut meta, &store);
    assert!(!meta.manual.can_start, "offsets differ");

    // NullStore reports offset 0.
    meta.manual.primary_offset = 0;
    failover::handle_manual_failover(&mut meta, &store);
    assert!(meta.manual.can_start);
}

#[test]
fn manual_failover_times_out() {
    let store = NullStore;
    let mut meta = ClusterMeta::new(id(b'a'), 0);
    let now = now_ms();
    meta.manual.end_time = now - 1;
    meta.manual.primary_offset = 7;
    failover::manual_failover_check_timeout(&mut meta, &store, now);
    assert_eq!(meta.manual.end_time, 0);
    assert_eq!(meta.manual.primary_offset, -1);
}
