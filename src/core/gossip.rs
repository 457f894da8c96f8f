// src/core/gossip.rs

//! Heartbeats and epidemic membership: gossip-section construction, the
//! PING/PONG/MEET exchange, and the central packet dispatcher for every bus
//! message type.

use crate::config::Config;
use crate::core::failover;
use crate::core::failure;
use crate::core::hooks::StoreHooks;
use crate::core::node::{Node, NodeFlags, NodeId};
use crate::core::protocol::message::{
    ClusterMsg, GossipEntry, MsgExtension, MsgFlags, MsgHeader, MsgPayload, MsgType,
};
use crate::core::state::{Cluster, ClusterHealth, ClusterMeta, TodoFlags};
use crate::core::update;
use rand::Rng;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Manual failover window; the primary pauses writes for twice as long.
pub const MF_TIMEOUT_MS: u64 = 5_000;
pub const MF_PAUSE_MULT: u64 = 2;

/// Helper to get the current system time in milliseconds since the UNIX
/// epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Builds the fixed header every outgoing packet carries. A replica
/// advertises its primary's slot bitmap and config epoch, so observers
/// always reconcile against the authoritative claim.
pub fn build_header(
    meta: &ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    mtype: MsgType,
) -> MsgHeader {
    let me = meta.myself();
    let claim_source = me
        .replicaof
        .filter(|_| me.is_replica())
        .and_then(|id| meta.nodes.get(&id))
        .unwrap_or(me);

    let mut mflags = MsgFlags::empty();
    if me.is_primary() && meta.manual.end_time != 0 {
        mflags |= MsgFlags::PAUSED;
    }

    MsgHeader {
        mtype,
        port: config.announced_port(),
        current_epoch: meta.current_epoch,
        config_epoch: claim_source.config_epoch,
        repl_offset: hooks.replication_offset(),
        sender: meta.myself,
        slots: claim_source.slots.clone(),
        replicaof: me.replicaof.filter(|_| me.is_replica()),
        ip: config.cluster.announce_ip.clone(),
        tls_port: config.tls_port.unwrap_or(0),
        bus_port: config.announced_bus_port(),
        flags: me.flags,
        state_fail: meta.health == ClusterHealth::Fail,
        mflags,
    }
}

fn gossip_entry_for(node: &Node) -> GossipEntry {
    GossipEntry {
        id: node.id,
        ping_sent_s: (node.ping_sent / 1000) as u32,
        pong_received_s: (node.pong_received / 1000) as u32,
        ip: node.ip.clone(),
        port: node.port,
        bus_port: node.bus_port,
        flags: node.flags,
        tls_port: node.tls_port,
    }
}

/// Builds a PING/PONG/MEET with a freshly sampled gossip section.
///
/// The section targets `max(3, n/10)` entries sampled uniformly without
/// replacement (bounded attempts), skipping ourselves, the receiver, peers
/// in handshake, peers with no address, and idle disconnected peers. All
/// PFAIL peers are appended afterwards so suspicion spreads fast.
pub fn build_heartbeat(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    mtype: MsgType,
    receiver: Option<NodeId>,
) -> ClusterMsg {
    meta.gossip_seq += 1;
    let seq = meta.gossip_seq;
    let now = now_ms();

    let node_count = meta.nodes.len();
    let mut wanted = 3.max(node_count / 10);
    if wanted > node_count.saturating_sub(2) {
        wanted = node_count.saturating_sub(2);
    }

    let candidates: Vec<NodeId> = meta
        .nodes
        .keys()
        .copied()
        .filter(|id| *id != meta.myself)
        .collect();
    let mut gossip: Vec<GossipEntry> = Vec::with_capacity(wanted + 1);
    if !candidates.is_empty() {
        let mut rng = rand::thread_rng();
        let max_attempts = wanted * 3;
        let mut attempts = 0;
        while gossip.len() < wanted && attempts < max_attempts {
            attempts += 1;
            let pick = candidates[rng.gen_range(0..candidates.len())];
            if Some(pick) == receiver {
                continue;
            }
            let Some(node) = meta.nodes.get_mut(&pick) else {
                continue;
            };
            if node.last_in_ping_gossip == seq {
                continue;
            }
            if node
                .flags
                .intersects(NodeFlags::HANDSHAKE | NodeFlags::NOADDR)
            {
                continue;
            }
            if node.link.is_none() && node.numslots == 0 {
                continue;
            }
            node.last_in_ping_gossip = seq;
            let entry = gossip_entry_for(node);
            gossip.push(entry);
        }
    }

    // Every PFAIL peer rides along, beyond the random sample.
    let pfail_ids: Vec<NodeId> = meta
        .nodes
        .values()
        .filter(|n| {
            n.flags.contains(NodeFlags::PFAIL)
                && !n
                    .flags
                    .intersects(NodeFlags::HANDSHAKE | NodeFlags::NOADDR)
                && n.last_in_ping_gossip != seq
                && Some(n.id) != receiver
        })
        .map(|n| n.id)
        .collect();
    for id in pfail_ids {
        if let Some(node) = meta.nodes.get_mut(&id) {
            node.last_in_ping_gossip = seq;
            let entry = gossip_entry_for(node);
            gossip.push(entry);
        }
    }

    let mut extensions = vec![MsgExtension::ShardId(meta.myself().shard_id)];
    if let Some(hostname) = &config.cluster.announce_hostname {
        extensions.push(MsgExtension::Hostname(hostname.clone()));
    }
    if let Some(nodename) = &config.cluster.announce_nodename {
        extensions.push(MsgExtension::Nodename(nodename.clone()));
    }
    for (id, deadline) in meta.blacklist.iter() {
        if *deadline > now {
            extensions.push(MsgExtension::ForgottenNode {
                id: *id,
                ttl_s: (*deadline - now).div_ceil(1000),
            });
        }
    }

    let mut header = build_header(meta, config, hooks, mtype);
    if !extensions.is_empty() {
        header.mflags |= MsgFlags::EXT_DATA;
    }
    ClusterMsg {
        header,
        payload: MsgPayload::Heartbeat { gossip, extensions },
    }
}

/// Sends a PING (or MEET) over a node's outbound link, arming the
/// pong-expected timer.
pub fn send_ping_to_node(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    node_id: NodeId,
    mtype: MsgType,
) {
    let Some(link_id) = meta.nodes.get(&node_id).and_then(|n| n.link) else {
        return;
    };
    let msg = build_heartbeat(meta, config, hooks, mtype, Some(node_id));
    if mtype == MsgType::Ping {
        if let Some(node) = meta.nodes.get_mut(&node_id) {
            if node.ping_sent == 0 {
                node.ping_sent = now_ms();
            }
        }
    }
    meta.send_on_link(link_id, &msg);
}

/// Broadcasts a PONG so peers refresh their view of us at once: to everyone
/// (`None`) after a promotion, or to our co-replicas to share election rank.
pub fn broadcast_pong(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    replicas_of: Option<NodeId>,
) {
    let msg = build_heartbeat(meta, config, hooks, MsgType::Pong, None);
    match replicas_of {
        None => meta.broadcast(&msg),
        Some(primary) => meta.broadcast_to_replicas_of(primary, &msg),
    }
}

impl Cluster {
    /// Propagation entry point for the pub/sub collaborator: fans a locally
    /// published message out on the bus. Plain publishes reach every peer;
    /// sharded publishes only the shard serving the channel's slot.
    pub fn propagate_publish(&self, channel: &[u8], message: &[u8], sharded: bool) {
        let config = &self.config;
        let hooks = &*self.hooks;
        let mut meta = self.lock();
        let mtype = if sharded {
            MsgType::PublishShard
        } else {
            MsgType::Publish
        };
        let msg = ClusterMsg {
            header: build_header(&meta, config, hooks, mtype),
            payload: MsgPayload::Publish {
                channel: bytes::Bytes::copy_from_slice(channel),
                message: bytes::Bytes::copy_from_slice(message),
            },
        };
        if !sharded {
            meta.broadcast(&msg);
            return;
        }
        let slot = crate::core::routing::key_slot(channel);
        let Some(shard_id) = meta.slots[slot as usize]
            .and_then(|owner| meta.nodes.get(&owner))
            .map(|owner| owner.shard_id)
        else {
            return;
        };
        let members: Vec<NodeId> = meta
            .shards
            .get(&shard_id)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|id| *id != meta.myself)
                    .collect()
            })
            .unwrap_or_default();
        for member in members {
            meta.send_to_node(member, &msg);
        }
    }
}

/// Connect-completion hook: the first packet on a fresh outbound link is a
/// PING, or a MEET while the introduction handshake is pending. A ping timer
/// already running survives the reconnect so liveness accounting is not
/// reset.
pub fn on_link_connected(cluster: &Arc<Cluster>, node_id: NodeId, link_id: u64) {
    let config = &cluster.config;
    let hooks = &*cluster.hooks;
    let mut meta = cluster.lock();
    let Some(node) = meta.nodes.get(&node_id) else {
        return;
    };
    let mtype = if node.flags.contains(NodeFlags::MEET) {
        MsgType::Meet
    } else {
        MsgType::Ping
    };
    let old_ping_sent = node.ping_sent;
    send_ping_to_node(&mut meta, config, hooks, node_id, mtype);
    if old_ping_sent != 0 {
        if let Some(node) = meta.nodes.get_mut(&node_id) {
            node.ping_sent = old_ping_sent;
        }
    }
    debug!("Outbound bus link {link_id} to {node_id} established, sent {}", mtype.name());
}

/// Applies the extension section of a trusted heartbeat.
pub fn process_extensions(
    meta: &mut ClusterMeta,
    sender_id: NodeId,
    extensions: &[MsgExtension],
    now: u64,
) {
    for ext in extensions {
        match ext {
            MsgExtension::Hostname(name) => {
                if let Some(node) = meta.nodes.get_mut(&sender_id) {
                    node.hostname = (!name.is_empty()).then(|| name.clone());
                }
            }
            MsgExtension::Nodename(name) => {
                if let Some(node) = meta.nodes.get_mut(&sender_id) {
                    node.nodename = (!name.is_empty()).then(|| name.clone());
                }
            }
            MsgExtension::ShardId(shard) => {
                meta.set_shard_id(sender_id, *shard);
            }
            MsgExtension::ForgottenNode { id, ttl_s } => {
                if *id != meta.myself && meta.nodes.contains_key(id) {
                    info!("Forgetting node {id} per gossip extension (ttl {ttl_s}s)");
                    meta.blacklist.insert(*id, now + ttl_s * 1000);
                    meta.remove_node(*id);
                    meta.todo |= TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG;
                }
            }
        }
    }
}

/// Digests the gossip entries of a trusted heartbeat.
pub fn process_gossip_section(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    sender_id: NodeId,
    entries: &[GossipEntry],
    now: u64,
) {
    let sender_is_primary = meta
        .nodes
        .get(&sender_id)
        .map(|n| n.is_primary())
        .unwrap_or(false);

    for entry in entries {
        if entry.id == meta.myself {
            continue;
        }
        let known = meta.nodes.contains_key(&entry.id);
        if known {
            let entry_failing = entry
                .flags
                .intersects(NodeFlags::FAIL | NodeFlags::PFAIL);
            if sender_is_primary {
                if entry_failing {
                    meta.add_failure_report(entry.id, sender_id, now);
                    failure::mark_failing_if_needed(meta, config, hooks, entry.id, now);
                } else {
                    meta.remove_failure_report(entry.id, sender_id);
                }
            }

            // Adopt a fresher pong time so an already-probed peer is not
            // re-probed by everyone at once. Seconds resolution on the wire;
            // a small skew into the future is tolerated.
            let node = meta
                .nodes
                .get_mut(&entry.id)
                .expect("checked for membership above");
            if !entry_failing && node.ping_sent == 0 && node.fail_reports.is_empty() {
                let pongtime = entry.pong_received_s as u64 * 1000;
                if pongtime > node.pong_received && pongtime <= now + 500 {
                    node.pong_received = pongtime;
                }
            }

            // A peer we see as failing, gossiped healthy at a different
            // address, probably restarted elsewhere: chase the new address.
            if node.is_failing()
                && !entry_failing
                && !entry.flags.contains(NodeFlags::NOADDR)
                && !entry.ip.is_empty()
                && (node.ip != entry.ip
                    || node.port != entry.port
                    || node.bus_port != entry.bus_port)
            {
                info!(
                    "Address for failing node {} changed to {}:{}@{}",
                    entry.id, entry.ip, entry.port, entry.bus_port
                );
                node.ip = entry.ip.clone();
                node.port = entry.port;
                node.tls_port = entry.tls_port;
                node.bus_port = entry.bus_port;
                node.flags.remove(NodeFlags::NOADDR);
                let stale_link = node.link;
                if let Some(link_id) = stale_link {
                    meta.free_link(link_id);
                }
            }
        } else if !entry.flags.contains(NodeFlags::NOADDR)
            && !entry.ip.is_empty()
            && !meta.blacklist_contains(entry.id, now)
        {
            // First mention of a node by a trusted peer: add it directly,
            // no handshake needed since the id is already authoritative.
            debug!("Discovered new node {} via gossip", entry.id);
            let mut node = Node::new(entry.id, NodeFlags::empty(), now);
            node.ip = entry.ip.clone();
            node.port = entry.port;
            node.tls_port = entry.tls_port;
            node.bus_port = entry.bus_port;
            meta.add_node(node);
        }
    }
}

/// Refreshes a known node's address from a packet header when it no longer
/// matches. Returns `true` when something changed.
fn update_node_address(
    meta: &mut ClusterMeta,
    node_id: NodeId,
    header: &MsgHeader,
    peer_ip: &str,
    hooks: &dyn StoreHooks,
) -> bool {
    let ip = header.ip.clone().unwrap_or_else(|| peer_ip.to_string());
    let Some(node) = meta.nodes.get_mut(&node_id) else {
        return false;
    };
    if node.ip == ip
        && node.port == header.port
        && node.bus_port == header.bus_port
        && node.tls_port == header.tls_port
    {
        return false;
    }
    node.ip = ip;
    node.port = header.port;
    node.tls_port = header.tls_port;
    node.bus_port = header.bus_port;
    node.flags.remove(NodeFlags::NOADDR);
    info!("Address updated for node {node_id}, now {}", node.addr());
    let stale_link = node.link;
    let was_my_primary =
        meta.myself().is_replica() && meta.myself().replicaof == Some(node_id);
    if let Some(link_id) = stale_link {
        meta.free_link(link_id);
    }
    if was_my_primary {
        let (ip, port) = {
            let node = meta.nodes.get(&node_id).expect("node updated above");
            (node.ip.clone(), node.port)
        };
        hooks.bind_primary(&ip, port);
    }
    meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE;
    true
}

/// The packet dispatcher: every validated frame read from any link lands
/// here. Runs synchronously under the state lock and never blocks on I/O;
/// replies and broadcasts are enqueued, not written.
pub fn process_packet(cluster: &Arc<Cluster>, link_id: u64, msg: ClusterMsg) {
    let config = &cluster.config;
    let hooks = &*cluster.hooks;
    let mut guard = cluster.lock();
    let meta = &mut *guard;
    let now = now_ms();
    let header = msg.header;
    let mtype = header.mtype;
    meta.stats_received[mtype as usize] += 1;

    if header.sender == meta.myself {
        return;
    }

    let Some(link) = meta.links.get(&link_id) else {
        // The link was freed while this packet sat in the reader.
        return;
    };
    let mut link_node_id = link.node;
    let link_inbound = link.inbound;
    let link_peer_ip = link.peer_ip.clone();

    let mut sender_in_table = meta.nodes.contains_key(&header.sender);

    // Liveness, epoch and offset bookkeeping for a known sender.
    if sender_in_table {
        if let Some(node) = meta.nodes.get_mut(&header.sender) {
            node.data_received = now;
        }
        // A fresh inbound link becomes the sender's inbound link once the
        // first packet names it.
        if link_inbound && link_node_id.is_none() {
            meta.adopt_inbound_link(link_id, header.sender);
        }
    }
    let sender_trusted = sender_in_table
        && meta
            .nodes
            .get(&header.sender)
            .map(|n| !n.in_handshake())
            .unwrap_or(false);
    if sender_trusted {
        meta.observe_epoch(header.current_epoch);
        let epoch_advanced = {
            let node = meta
                .nodes
                .get_mut(&header.sender)
                .expect("sender checked above");
            node.repl_offset = header.repl_offset;
            node.repl_offset_time = now;
            if header.config_epoch > node.config_epoch {
                node.config_epoch = header.config_epoch;
                true
            } else {
                false
            }
        };
        if epoch_advanced {
            meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;
        }

        // Replica side of a manual failover: the first paused heartbeat
        // from our primary carries the offset we must reach.
        if meta.manual.end_time != 0
            && meta.manual.primary_offset == -1
            && header.mflags.contains(MsgFlags::PAUSED)
            && meta.myself().is_replica()
            && meta.myself().replicaof == Some(header.sender)
        {
            meta.manual.primary_offset = header.repl_offset;
            meta.todo |= TodoFlags::HANDLE_MANUALFAILOVER;
            info!(
                "Received replication offset {} for paused primary during manual failover",
                header.repl_offset
            );
        }
    }

    // An unsolicited MEET introduces its sender: record it as a handshake
    // node under a placeholder id until its real identity is confirmed.
    if mtype == MsgType::Meet && !sender_in_table {
        let ip = header.ip.clone().unwrap_or_else(|| link_peer_ip.clone());
        let mut node = Node::new(NodeId::random(), NodeFlags::HANDSHAKE, now);
        node.ip = ip;
        node.port = header.port;
        node.tls_port = header.tls_port;
        node.bus_port = header.bus_port;
        info!("MEET from unknown peer at {}, adding handshake node", node.addr());
        meta.add_node(node);
        meta.todo |= TodoFlags::SAVE_CONFIG;
    }

    // PING and MEET always earn a PONG on the same link.
    if matches!(mtype, MsgType::Ping | MsgType::Meet) {
        let receiver = sender_in_table.then_some(header.sender);
        let pong = build_heartbeat(meta, config, hooks, MsgType::Pong, receiver);
        meta.send_on_link(link_id, &pong);
    }

    if mtype.is_heartbeat() {
        // Handshake resolution on our own outbound link.
        if let Some(owner_id) = link_node_id {
            let owner_in_handshake = meta
                .nodes
                .get(&owner_id)
                .map(|n| n.in_handshake())
                .unwrap_or(false);
            if owner_in_handshake {
                if sender_in_table {
                    // The peer is already known under its real id: this
                    // handshake record is a duplicate.
                    update_node_address(meta, header.sender, &header, &link_peer_ip, hooks);
                    debug!("Handshake with {owner_id} resolved to known node {}", header.sender);
                    meta.remove_node(owner_id);
                    meta.todo |= TodoFlags::SAVE_CONFIG;
                    return;
                }
                if meta.rename_node(owner_id, header.sender) {
                    let node = meta
                        .nodes
                        .get_mut(&header.sender)
                        .expect("node renamed above");
                    node.flags.remove(NodeFlags::HANDSHAKE | NodeFlags::MEET);
                    node.flags |=
                        header.flags & (NodeFlags::PRIMARY | NodeFlags::REPLICA);
                    meta.todo |= TodoFlags::SAVE_CONFIG;
                    sender_in_table = true;
                    link_node_id = Some(header.sender);
                } else {
                    meta.remove_node(owner_id);
                    return;
                }
            } else if owner_id != header.sender {
                // The peer answers with an id other than the one on record:
                // its address is no longer trustworthy.
                warn!(
                    "Node {owner_id} replied with id {}; marking it without address",
                    header.sender
                );
                if let Some(node) = meta.nodes.get_mut(&owner_id) {
                    node.flags.insert(NodeFlags::NOADDR);
                    node.ip.clear();
                    node.port = 0;
                    node.tls_port = 0;
                    node.bus_port = 0;
                }
                meta.free_link(link_id);
                meta.todo |= TodoFlags::SAVE_CONFIG;
                return;
            }
        }

        let sender_trusted = sender_in_table
            && meta
                .nodes
                .get(&header.sender)
                .map(|n| !n.in_handshake())
                .unwrap_or(false);

        // An inbound PING from a peer whose address moved: follow it.
        if sender_trusted && mtype == MsgType::Ping && link_inbound {
            update_node_address(meta, header.sender, &header, &link_peer_ip, hooks);
        }

        // PONG on our outbound link refreshes liveness and may clear
        // suspicion.
        if mtype == MsgType::Pong && link_node_id == Some(header.sender) {
            if let Some(node) = meta.nodes.get_mut(&header.sender) {
                node.pong_received = now;
                node.ping_sent = 0;
                node.flags.remove(NodeFlags::MEET);
            }
            let was_pfail = meta
                .nodes
                .get(&header.sender)
                .map(|n| n.flags.contains(NodeFlags::PFAIL))
                .unwrap_or(false);
            if was_pfail {
                info!("Node {} is reachable again, clearing PFAIL", header.sender);
                if let Some(node) = meta.nodes.get_mut(&header.sender) {
                    node.flags.remove(NodeFlags::PFAIL);
                }
                meta.todo |= TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG;
            } else {
                failure::clear_failure_if_needed(meta, config, header.sender, now);
            }
        }

        if sender_trusted {
            // Role reconciliation from the claimed primary field.
            match header.replicaof {
                None => update::set_node_as_primary(meta, header.sender),
                Some(claimed_primary) => {
                    let was_primary = meta
                        .nodes
                        .get(&header.sender)
                        .map(|n| n.is_primary())
                        .unwrap_or(false);
                    if was_primary {
                        info!("Node {} demoted itself to replica", header.sender);
                        update::clear_all_slots_of(meta, header.sender);
                        if let Some(node) = meta.nodes.get_mut(&header.sender) {
                            node.flags
                                .remove(NodeFlags::PRIMARY | NodeFlags::MIGRATE_TO);
                            node.flags.insert(NodeFlags::REPLICA);
                        }
                        meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE;
                    }
                    let current = meta
                        .nodes
                        .get(&header.sender)
                        .and_then(|n| n.replicaof);
                    if meta.nodes.contains_key(&claimed_primary)
                        && current != Some(claimed_primary)
                    {
                        meta.attach_replica(header.sender, claimed_primary);
                        meta.todo |= TodoFlags::SAVE_CONFIG;
                    }
                }
            }

            // Slot reconciliation against the bitmap the sender vouches
            // for (its own as a primary, its primary's as a replica).
            let claim_owner = {
                let sender = meta
                    .nodes
                    .get(&header.sender)
                    .expect("sender checked above");
                if sender.is_primary() {
                    Some(header.sender)
                } else {
                    sender.replicaof.filter(|id| meta.nodes.contains_key(id))
                }
            };
            if let Some(owner_id) = claim_owner {
                let differs = meta
                    .nodes
                    .get(&owner_id)
                    .map(|n| n.slots != header.slots)
                    .unwrap_or(false);
                let owner_is_primary = meta
                    .nodes
                    .get(&owner_id)
                    .map(|n| n.is_primary())
                    .unwrap_or(false);
                if differs && owner_is_primary {
                    update::update_slots(
                        meta,
                        config,
                        hooks,
                        owner_id,
                        header.config_epoch,
                        &header.slots,
                    );
                }
            }

            // The sender claims slots whose recorded owner outranks it:
            // push the authoritative configuration back so it converges.
            let stale_owner = header.slots.iter().find_map(|slot| {
                meta.slots[slot as usize].and_then(|owner_id| {
                    let owner = meta.nodes.get(&owner_id)?;
                    (owner_id != header.sender && owner.config_epoch > header.config_epoch)
                        .then_some(owner_id)
                })
            });
            if let Some(owner_id) = stale_owner {
                debug!(
                    "Node {} has a stale view of some slots, sending UPDATE for {}",
                    header.sender, owner_id
                );
                if let Some(update_msg) =
                    update::build_update_msg(meta, config, hooks, owner_id)
                {
                    meta.send_on_link(link_id, &update_msg);
                }
            }

            // Two primaries advertising the same config epoch must diverge.
            let myself_primary = meta.myself().is_primary();
            let sender_primary = meta
                .nodes
                .get(&header.sender)
                .map(|n| n.is_primary())
                .unwrap_or(false);
            if myself_primary
                && sender_primary
                && header.config_epoch == meta.myself().config_epoch
            {
                failover::handle_epoch_collision(meta, header.sender);
            }

            if let MsgPayload::Heartbeat { gossip, extensions } = &msg.payload {
                process_extensions(meta, header.sender, extensions, now);
                process_gossip_section(meta, config, hooks, header.sender, gossip, now);
            }
        }
        return;
    }

    match (mtype, &msg.payload) {
        (MsgType::Fail, MsgPayload::Fail { target }) => {
            if !sender_in_table {
                return;
            }
            let Some(node) = meta.nodes.get_mut(target) else {
                debug!("FAIL about unknown node {target}, ignored");
                return;
            };
            if node.is_myself() || node.flags.contains(NodeFlags::FAIL) {
                return;
            }
            info!("FAIL message received from {} about {}", header.sender, target);
            node.flags.remove(NodeFlags::PFAIL);
            node.flags.insert(NodeFlags::FAIL);
            node.fail_time = now;
            meta.todo |= TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG;
        }
        (MsgType::Publish | MsgType::PublishShard, MsgPayload::Publish { channel, message }) => {
            hooks.publish(channel, message, mtype == MsgType::PublishShard);
        }
        (MsgType::AuthRequest, _) => {
            if sender_trusted {
                failover::vote_if_eligible(meta, config, hooks, &header, now);
            }
        }
        (MsgType::AuthAck, _) => {
            if sender_trusted {
                failover::tally_vote(meta, &header);
            }
        }
        (MsgType::MfStart, _) => {
            if !sender_trusted {
                return;
            }
            let is_my_replica = meta
                .nodes
                .get(&header.sender)
                .map(|n| n.is_replica() && n.replicaof == Some(meta.myself))
                .unwrap_or(false);
            if !is_my_replica {
                return;
            }
            failover::reset_manual_failover(meta, hooks);
            meta.manual.end_time = now + MF_TIMEOUT_MS;
            meta.manual.replica = Some(header.sender);
            hooks.pause_writes_until(now + MF_TIMEOUT_MS * MF_PAUSE_MULT);
            info!(
                "Manual failover requested by replica {}, pausing writes",
                header.sender
            );
        }
        (MsgType::Update, MsgPayload::Update { config_epoch, node, slots }) => {
            if !sender_trusted {
                return;
            }
            let Some(target) = meta.nodes.get(node) else {
                return;
            };
            if target.config_epoch >= *config_epoch {
                return;
            }
            if meta
                .nodes
                .get(node)
                .map(|n| n.is_replica())
                .unwrap_or(false)
            {
                update::set_node_as_primary(meta, *node);
            }
            if let Some(target) = meta.nodes.get_mut(node) {
                target.config_epoch = *config_epoch;
            }
            meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;
            update::update_slots(meta, config, hooks, *node, *config_epoch, slots);
        }
        (MsgType::Module, MsgPayload::Module { module_id, .. }) => {
            // No module runtime is attached to this build; count and move on.
            debug!("Ignoring module message {module_id:#x} from {}", header.sender);
        }
        _ => debug!("Packet of type {} with mismatched payload", mtype.name()),
    }
}
