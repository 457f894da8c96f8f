// src/core/state.rs

//! The process-wide cluster state: node table, shard index, slot table,
//! epochs, election bookkeeping and per-link handles.

use crate::config::Config;
use crate::core::bus::link::{LinkHandle, MsgBlock};
use crate::core::errors::ClusterError;
use crate::core::hooks::StoreHooks;
use crate::core::node::{FailureReport, Node, NodeFlags, NodeId, ShardId};
use crate::core::protocol::codec::encode_msg;
use crate::core::protocol::message::{ClusterMsg, MSG_TYPE_COUNT};
use crate::core::slot_map::{SLOT_COUNT, SlotBitmap};
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::sync::Arc;
use tracing::{debug, info};

/// How long a forgotten node stays barred from gossip re-admission.
pub const BLACKLIST_TTL_MS: u64 = 60_000;

/// Overall cluster health from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    Ok,
    Fail,
}

bitflags! {
    /// Work coalesced until the end of the current handler invocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TodoFlags: u8 {
        const HANDLE_FAILOVER       = 1 << 0;
        const UPDATE_STATE          = 1 << 1;
        const SAVE_CONFIG           = 1 << 2;
        const FSYNC_CONFIG          = 1 << 3;
        const HANDLE_MANUALFAILOVER = 1 << 4;
    }
}

/// Why a replica is currently unable to start or win an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CantFailoverReason {
    #[default]
    None,
    DataAge,
    WaitingDelay,
    Expired,
    WaitingVotes,
}

impl CantFailoverReason {
    pub fn describe(&self) -> &'static str {
        match self {
            CantFailoverReason::None => "none",
            CantFailoverReason::DataAge => {
                "Disconnected from master for longer than allowed. \
                 Please check the 'cluster-replica-validity-factor' configuration option."
            }
            CantFailoverReason::WaitingDelay => "Waiting the delay before I can start a new failover.",
            CantFailoverReason::Expired => "Failover attempt expired.",
            CantFailoverReason::WaitingVotes => "Waiting for votes, but majority still not reached.",
        }
    }
}

/// Replica-side election bookkeeping.
#[derive(Debug, Default)]
pub struct ElectionState {
    /// Time of the previous or next election, unix ms. 0 = never scheduled.
    pub auth_time: u64,
    /// Votes received so far in the current election.
    pub auth_count: u64,
    /// True once the vote request went out for the current election.
    pub auth_sent: bool,
    /// Our rank among co-replicas at schedule time.
    pub auth_rank: u64,
    /// Epoch of the current election.
    pub auth_epoch: u64,
    pub cant_reason: CantFailoverReason,
    /// Last time the can't-failover reason was logged.
    pub cant_reason_logged: u64,
}

/// Manual failover progress, both the primary and the replica side.
#[derive(Debug)]
pub struct ManualFailoverState {
    /// Deadline of the ongoing manual failover, 0 when none is in progress.
    pub end_time: u64,
    /// Primary side: the replica performing the failover.
    pub replica: Option<NodeId>,
    /// Replica side: the primary's offset to catch up to, -1 until known.
    pub primary_offset: i64,
    /// Replica side: offset reached, the election may fire.
    pub can_start: bool,
}

impl Default for ManualFailoverState {
    fn default() -> Self {
        ManualFailoverState {
            end_time: 0,
            replica: None,
            primary_offset: -1,
            can_start: false,
        }
    }
}

/// Everything mutable behind the state lock. Handlers lock it, run to
/// completion and release; nothing here is touched from two tasks at once.
pub struct ClusterMeta {
    pub myself: NodeId,
    /// The node table: sole owner of all `Node` records.
    pub nodes: HashMap<NodeId, Node>,
    /// shard id -> member node ids.
    pub shards: HashMap<ShardId, Vec<NodeId>>,
    /// Recently forgotten nodes: id -> re-admission deadline (unix ms).
    pub blacklist: HashMap<NodeId, u64>,
    /// Slot -> owning primary.
    pub slots: Vec<Option<NodeId>>,
    /// In-progress outgoing handovers: slot -> destination.
    pub migrating: BTreeMap<u16, NodeId>,
    /// In-progress incoming handovers: slot -> source.
    pub importing: BTreeMap<u16, NodeId>,
    /// Slots whose recorded owner stopped advertising them.
    pub owner_not_claiming: SlotBitmap,
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
    pub health: ClusterHealth,
    /// Number of primaries serving at least one slot.
    pub voting_size: usize,
    pub failover: ElectionState,
    pub manual: ManualFailoverState,
    /// Live links by id, inbound and outbound.
    pub links: HashMap<u64, LinkHandle>,
    next_link_id: u64,
    /// Monotone heartbeat counter used to dedup gossip entries per packet.
    pub gossip_seq: u64,
    pub stats_sent: [u64; MSG_TYPE_COUNT],
    pub stats_received: [u64; MSG_TYPE_COUNT],
    pub links_buffer_limit_exceeded: u64,
    pub todo: TodoFlags,
    /// When this primary found itself in a partition minority, unix ms.
    pub among_minority_since: u64,
    /// First time the health recomputation ran, for the startup grace delay.
    pub first_state_check: u64,
}

impl ClusterMeta {
    /// Fresh state for a node starting for the first time.
    pub fn new(myself_id: NodeId, now: u64) -> Self {
        let mut myself = Node::new(myself_id, NodeFlags::MYSELF | NodeFlags::PRIMARY, now);
        myself.pong_received = now;
        let mut meta = ClusterMeta {
            myself: myself_id,
            nodes: HashMap::new(),
            shards: HashMap::new(),
            blacklist: HashMap::new(),
            slots: vec![None; SLOT_COUNT],
            migrating: BTreeMap::new(),
            importing: BTreeMap::new(),
            owner_not_claiming: SlotBitmap::new(),
            current_epoch: 0,
            last_vote_epoch: 0,
            health: ClusterHealth::Fail,
            voting_size: 0,
            failover: ElectionState::default(),
            manual: ManualFailoverState::default(),
            links: HashMap::new(),
            next_link_id: 1,
            gossip_seq: 0,
            stats_sent: [0; MSG_TYPE_COUNT],
            stats_received: [0; MSG_TYPE_COUNT],
            links_buffer_limit_exceeded: 0,
            todo: TodoFlags::empty(),
            among_minority_since: 0,
            first_state_check: 0,
        };
        meta.add_node(myself);
        meta
    }

    pub fn myself(&self) -> &Node {
        self.nodes
            .get(&self.myself)
            .expect("own node record must exist in the node table")
    }

    pub fn myself_mut(&mut self) -> &mut Node {
        let id = self.myself;
        self.nodes
            .get_mut(&id)
            .expect("own node record must exist in the node table")
    }

    /// The primary this node follows: itself when primary, its primary's id
    /// when replica (falling back to self while the primary is unknown).
    pub fn current_primary(&self) -> NodeId {
        let me = self.myself();
        if me.is_replica() {
            me.replicaof.unwrap_or(self.myself)
        } else {
            self.myself
        }
    }

    // --- Node table maintenance ---

    pub fn add_node(&mut self, node: Node) {
        self.shards
            .entry(node.shard_id)
            .or_default()
            .push(node.id);
        self.nodes.insert(node.id, node);
    }

    /// Removes a node and wipes every reference to it: slot table, handover
    /// markers, shard index, replica lists and links.
    pub fn remove_node(&mut self, id: NodeId) {
        for slot in 0..SLOT_COUNT as u16 {
            if self.slots[slot as usize] == Some(id) {
                self.slots[slot as usize] = None;
                self.owner_not_claiming.remove(slot);
            }
        }
        self.migrating.retain(|_, target| *target != id);
        self.importing.retain(|_, source| *source != id);

        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        self.unindex_shard(id, node.shard_id);
        if let Some(primary_id) = node.replicaof {
            if let Some(primary) = self.nodes.get_mut(&primary_id) {
                primary.replicas.retain(|r| *r != id);
            }
        }
        for replica_id in node.replicas {
            if let Some(replica) = self.nodes.get_mut(&replica_id) {
                replica.replicaof = None;
            }
        }
        if let Some(link_id) = node.link {
            self.free_link(link_id);
        }
        if let Some(link_id) = node.inbound_link {
            self.free_link(link_id);
        }
        debug!("Removed node {id} from the node table");
    }

    /// Replaces a handshake node's placeholder identifier with its real one.
    /// Fails if the real identifier is already present (duplicate node).
    pub fn rename_node(&mut self, old: NodeId, new: NodeId) -> bool {
        if self.nodes.contains_key(&new) {
            return false;
        }
        let Some(mut node) = self.nodes.remove(&old) else {
            return false;
        };
        self.unindex_shard(old, node.shard_id);
        info!("Renaming node {old} to {new}");
        node.id = new;
        // Links keep pointing at the same record under its new key.
        if let Some(link_id) = node.link {
            if let Some(handle) = self.links.get_mut(&link_id) {
                handle.node = Some(new);
            }
        }
        if let Some(link_id) = node.inbound_link {
            if let Some(handle) = self.links.get_mut(&link_id) {
                handle.node = Some(new);
            }
        }
        self.add_node(node);
        true
    }

    fn unindex_shard(&mut self, id: NodeId, shard: ShardId) {
        if let Some(members) = self.shards.get_mut(&shard) {
            members.retain(|m| *m != id);
            if members.is_empty() {
                self.shards.remove(&shard);
            }
        }
    }

    /// Moves a node to a different shard, reindexing it.
    pub fn set_shard_id(&mut self, id: NodeId, shard: ShardId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.shard_id == shard {
            return;
        }
        let old = node.shard_id;
        node.shard_id = shard;
        self.unindex_shard(id, old);
        self.shards.entry(shard).or_default().push(id);
    }

    /// Looks a node up by bus address, for handshake deduplication.
    pub fn node_by_addr(&self, ip: &str, bus_port: u16) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.ip == ip && n.bus_port == bus_port)
            .map(|n| n.id)
    }

    /// True if a handshake toward this address is already in progress.
    pub fn handshake_in_progress(&self, ip: &str, bus_port: u16) -> bool {
        self.nodes
            .values()
            .any(|n| n.in_handshake() && n.ip == ip && n.bus_port == bus_port)
    }

    // --- Replication topology ---

    /// Points `replica` at `primary`, maintaining both replica lists and the
    /// shard index (a replica always joins its primary's shard).
    pub fn attach_replica(&mut self, replica_id: NodeId, primary_id: NodeId) {
        let Some(replica) = self.nodes.get(&replica_id) else {
            return;
        };
        let old_primary = replica.replicaof;
        if old_primary == Some(primary_id) {
            return;
        }
        if let Some(old_id) = old_primary {
            if let Some(old) = self.nodes.get_mut(&old_id) {
                old.replicas.retain(|r| *r != replica_id);
            }
        }
        let shard = self.nodes.get(&primary_id).map(|p| p.shard_id);
        if let Some(primary) = self.nodes.get_mut(&primary_id) {
            if !primary.replicas.contains(&replica_id) {
                primary.replicas.push(replica_id);
            }
        }
        if let Some(replica) = self.nodes.get_mut(&replica_id) {
            replica.replicaof = Some(primary_id);
            replica.flags.remove(NodeFlags::PRIMARY);
            replica.flags.insert(NodeFlags::REPLICA);
        }
        if let Some(shard) = shard {
            self.set_shard_id(replica_id, shard);
        }
    }

    /// Detaches a replica from its primary without assigning a new one.
    pub fn detach_replica(&mut self, replica_id: NodeId) {
        let Some(replica) = self.nodes.get(&replica_id) else {
            return;
        };
        let Some(primary_id) = replica.replicaof else {
            return;
        };
        if let Some(primary) = self.nodes.get_mut(&primary_id) {
            primary.replicas.retain(|r| *r != replica_id);
        }
        if let Some(replica) = self.nodes.get_mut(&replica_id) {
            replica.replicaof = None;
        }
    }

    /// Non-failing replicas of a primary.
    pub fn ok_replicas_of(&self, primary_id: NodeId) -> usize {
        self.nodes
            .get(&primary_id)
            .map(|p| {
                p.replicas
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .filter(|r| !r.is_failing())
                    .count()
            })
            .unwrap_or(0)
    }

    // --- Voting set ---

    /// Recomputes the number of primaries serving at least one slot.
    pub fn update_voting_size(&mut self) {
        self.voting_size = self
            .nodes
            .values()
            .filter(|n| n.is_primary() && n.numslots > 0)
            .count();
    }

    /// Votes needed to confirm a failure or win an election.
    pub fn quorum(&self) -> usize {
        self.voting_size / 2 + 1
    }

    // --- Epochs ---

    /// Adopts a higher epoch observed on the bus.
    pub fn observe_epoch(&mut self, epoch: u64) {
        if epoch > self.current_epoch {
            self.current_epoch = epoch;
            self.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;
        }
    }

    /// Claims a brand-new config epoch without consensus. Safe because epoch
    /// collisions are resolved deterministically when they are noticed.
    pub fn bump_config_epoch(&mut self) -> u64 {
        let max_epoch = self
            .nodes
            .values()
            .map(|n| n.config_epoch)
            .max()
            .unwrap_or(0);
        self.current_epoch = self.current_epoch.max(max_epoch) + 1;
        let epoch = self.current_epoch;
        self.myself_mut().config_epoch = epoch;
        self.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;
        epoch
    }

    // --- Blacklist ---

    pub fn blacklist_add(&mut self, id: NodeId, now: u64) {
        self.blacklist.insert(id, now + BLACKLIST_TTL_MS);
    }

    pub fn blacklist_contains(&mut self, id: NodeId, now: u64) -> bool {
        self.blacklist.retain(|_, deadline| *deadline > now);
        self.blacklist.contains_key(&id)
    }

    // --- Slot table ---

    /// Binds a slot to a node, updating both the table and the node bitmap.
    pub fn assign_slot(&mut self, slot: u16, owner: NodeId) {
        if let Some(previous) = self.slots[slot as usize] {
            if let Some(node) = self.nodes.get_mut(&previous) {
                node.del_slot(slot);
            }
        }
        if let Some(node) = self.nodes.get_mut(&owner) {
            node.add_slot(slot);
        }
        self.slots[slot as usize] = Some(owner);
        self.owner_not_claiming.remove(slot);
    }

    /// Unbinds a slot entirely.
    pub fn unassign_slot(&mut self, slot: u16) {
        if let Some(previous) = self.slots[slot as usize].take() {
            if let Some(node) = self.nodes.get_mut(&previous) {
                node.del_slot(slot);
            }
        }
        self.owner_not_claiming.remove(slot);
    }

    /// A slot with no owner, or whose owner stopped claiming it.
    pub fn slot_unclaimed(&self, slot: u16) -> bool {
        self.slots[slot as usize].is_none() || self.owner_not_claiming.contains(slot)
    }

    // --- Links ---

    pub fn alloc_link_id(&mut self) -> u64 {
        let id = self.next_link_id;
        self.next_link_id += 1;
        id
    }

    pub fn register_link(&mut self, handle: LinkHandle) {
        if let Some(node_id) = handle.node {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                if handle.inbound {
                    node.inbound_link = Some(handle.id);
                } else {
                    node.link = Some(handle.id);
                }
            }
        }
        self.links.insert(handle.id, handle);
    }

    /// Drops a link: closes its tasks, discards its queue and detaches it
    /// from its owning node.
    pub fn free_link(&mut self, link_id: u64) {
        let Some(handle) = self.links.remove(&link_id) else {
            return;
        };
        handle.close();
        if let Some(node_id) = handle.node {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                if node.link == Some(link_id) {
                    node.link = None;
                }
                if node.inbound_link == Some(link_id) {
                    node.inbound_link = None;
                }
            }
        }
    }

    /// Associates a just-accepted inbound link with the node it turned out
    /// to belong to, replacing any previous inbound link of that node.
    pub fn adopt_inbound_link(&mut self, link_id: u64, node_id: NodeId) {
        let old = self
            .nodes
            .get(&node_id)
            .and_then(|n| n.inbound_link)
            .filter(|id| *id != link_id);
        if let Some(old_id) = old {
            self.free_link(old_id);
        }
        if let Some(handle) = self.links.get_mut(&link_id) {
            handle.node = Some(node_id);
        }
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.inbound_link = Some(link_id);
        }
    }

    // --- Sending ---

    /// Encodes a message once and enqueues it on a specific link.
    pub fn send_on_link(&mut self, link_id: u64, msg: &ClusterMsg) {
        let block = Arc::new(MsgBlock::new(msg.header.mtype, encode_msg(msg)));
        self.stats_sent[msg.header.mtype as usize] += 1;
        if let Some(handle) = self.links.get(&link_id) {
            handle.enqueue(block);
        }
    }

    /// Sends to a node's outbound link, if connected.
    pub fn send_to_node(&mut self, node_id: NodeId, msg: &ClusterMsg) {
        let Some(link_id) = self.nodes.get(&node_id).and_then(|n| n.link) else {
            return;
        };
        self.send_on_link(link_id, msg);
    }

    /// Enqueues the same encoded block on every connected, established peer.
    /// The block is reference-counted: each queue holds a clone of the `Arc`.
    pub fn broadcast(&mut self, msg: &ClusterMsg) {
        let block = Arc::new(MsgBlock::new(msg.header.mtype, encode_msg(msg)));
        let targets: Vec<u64> = self
            .nodes
            .values()
            .filter(|n| !n.is_myself() && !n.in_handshake())
            .filter_map(|n| n.link)
            .collect();
        self.stats_sent[msg.header.mtype as usize] += targets.len() as u64;
        for link_id in targets {
            if let Some(handle) = self.links.get(&link_id) {
                handle.enqueue(Arc::clone(&block));
            }
        }
    }

    /// Enqueues a message on the outbound links of all replicas of the given
    /// primary (used to propagate rank changes and manual failover state).
    pub fn broadcast_to_replicas_of(&mut self, primary_id: NodeId, msg: &ClusterMsg) {
        let Some(primary) = self.nodes.get(&primary_id) else {
            return;
        };
        let targets: Vec<u64> = primary
            .replicas
            .iter()
            .filter(|id| **id != self.myself)
            .filter_map(|id| self.nodes.get(id))
            .filter_map(|n| n.link)
            .collect();
        let block = Arc::new(MsgBlock::new(msg.header.mtype, encode_msg(msg)));
        self.stats_sent[msg.header.mtype as usize] += targets.len() as u64;
        for link_id in targets {
            if let Some(handle) = self.links.get(&link_id) {
                handle.enqueue(Arc::clone(&block));
            }
        }
    }

    // --- Failure reports ---

    /// Adds or refreshes a failure report for `target` from `reporter`.
    pub fn add_failure_report(&mut self, target: NodeId, reporter: NodeId, now: u64) {
        let Some(node) = self.nodes.get_mut(&target) else {
            return;
        };
        match node.fail_reports.iter_mut().find(|r| r.reporter == reporter) {
            Some(report) => report.time = now,
            None => node.fail_reports.push(FailureReport {
                reporter,
                time: now,
            }),
        }
    }

    pub fn remove_failure_report(&mut self, target: NodeId, reporter: NodeId) {
        if let Some(node) = self.nodes.get_mut(&target) {
            node.fail_reports.retain(|r| r.reporter != reporter);
        }
    }
}

/// The cluster engine handle shared by every task of the process.
pub struct Cluster {
    pub config: Config,
    pub hooks: Arc<dyn StoreHooks>,
    inner: Mutex<ClusterMeta>,
    /// Advisory lock on the node table file, held for the process lifetime.
    _config_lock: Option<File>,
}

impl Cluster {
    /// Builds the cluster engine, loading the persisted node table when one
    /// exists and creating a fresh identity otherwise.
    pub fn new(config: Config, hooks: Arc<dyn StoreHooks>) -> Result<Arc<Self>, ClusterError> {
        let (meta, lock) = crate::core::persistence::load_or_init(&config)?;
        Ok(Arc::new(Cluster {
            config,
            hooks,
            inner: Mutex::new(meta),
            _config_lock: Some(lock),
        }))
    }

    /// A cluster built around pre-assembled state. Used by tests.
    pub fn from_meta(config: Config, hooks: Arc<dyn StoreHooks>, meta: ClusterMeta) -> Arc<Self> {
        Arc::new(Cluster {
            config,
            hooks,
            inner: Mutex::new(meta),
            _config_lock: None,
        })
    }

    /// Locks the cluster metadata. Handlers must not hold the guard across
    /// an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, ClusterMeta> {
        self.inner.lock()
    }

    pub fn my_id(&self) -> NodeId {
        self.lock().myself
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::NodeFlags;

    fn sample_meta() -> ClusterMeta {
        ClusterMeta::new(NodeId::random(), 1_000)
    }

    #[test]
    fn voting_size_counts_only_slot_serving_primaries() {
        let mut meta = sample_meta();
        let p1 = NodeId::random();
        let mut node = Node::new(p1, NodeFlags::PRIMARY, 0);
        node.add_slot(1);
        meta.add_node(node);
        meta.add_node(Node::new(NodeId::random(), NodeFlags::PRIMARY, 0));
        meta.add_node(Node::new(NodeId::random(), NodeFlags::REPLICA, 0));
        meta.slots[1] = Some(p1);
        meta.update_voting_size();
        assert_eq!(meta.voting_size, 1);
        assert_eq!(meta.quorum(), 1);
    }

    #[test]
    fn remove_node_wipes_every_reference() {
        let mut meta = sample_meta();
        let primary = NodeId::random();
        let replica = NodeId::random();
        let mut p = Node::new(primary, NodeFlags::PRIMARY, 0);
        p.add_slot(7);
        meta.add_node(p);
        meta.add_node(Node::new(replica, NodeFlags::REPLICA, 0));
        meta.attach_replica(replica, primary);
        meta.slots[7] = Some(primary);
        meta.migrating.insert(9, primary);

        meta.remove_node(primary);
        assert!(meta.slots[7].is_none());
        assert!(meta.migrating.is_empty());
        assert!(meta.nodes.get(&replica).unwrap().replicaof.is_none());
        assert!(!meta.shards.values().flatten().any(|id| *id == primary));
    }

    #[test]
    fn rename_refuses_duplicates() {
        let mut meta = sample_meta();
        let a = NodeId::random();
        let b = NodeId::random();
        meta.add_node(Node::new(a, NodeFlags::HANDSHAKE, 0));
        meta.add_node(Node::new(b, NodeFlags::PRIMARY, 0));
        assert!(!meta.rename_node(a, b));
        let c = NodeId::random();
        assert!(meta.rename_node(a, c));
        assert!(meta.nodes.contains_key(&c));
        assert!(!meta.nodes.contains_key(&a));
    }

    #[test]
    fn bump_config_epoch_exceeds_every_known_epoch() {
        let mut meta = sample_meta();
        let mut other = Node::new(NodeId::random(), NodeFlags::PRIMARY, 0);
        other.config_epoch = 41;
        meta.add_node(other);
        meta.current_epoch = 10;
        let epoch = meta.bump_config_epoch();
        assert_eq!(epoch, 42);
        assert_eq!(meta.myself().config_epoch, 42);
        assert_eq!(meta.current_epoch, 42);
    }

    #[test]
    fn blacklist_expires() {
        let mut meta = sample_meta();
        let id = NodeId::random();
        meta.blacklist_add(id, 1_000);
        assert!(meta.blacklist_contains(id, 2_000));
        assert!(!meta.blacklist_contains(id, 1_000 + BLACKLIST_TTL_MS + 1));
    }
}
