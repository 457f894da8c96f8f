// src/core/admin.rs

//! The administrative surface of the cluster engine, consumed by the data
//! store's command layer: topology commands, slot management and the
//! human-readable descriptions.

use crate::core::cron;
use crate::core::errors::ClusterError;
use crate::core::failover;
use crate::core::gossip::{self, now_ms, MF_TIMEOUT_MS};
use crate::core::node::{Node, NodeFlags, NodeId, ShardId};
use crate::core::persistence;
use crate::core::protocol::message::{ClusterMsg, MSG_TYPE_COUNT, MsgPayload, MsgType};
use crate::core::slot_map::SLOT_COUNT;
use crate::core::state::{Cluster, ClusterHealth, TodoFlags};
use crate::core::update;
use std::net::IpAddr;
use tracing::info;

/// Flavors of the FAILOVER admin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverOption {
    /// Coordinated hand-off through MFSTART, no writes lost.
    Default,
    /// Skip the primary hand-off (it is unreachable) but still get elected.
    Force,
    /// No election at all: claim the shard unilaterally.
    Takeover,
}

/// Target states of SETSLOT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSlotOp {
    Migrating(NodeId),
    Importing(NodeId),
    Stable,
    Node(NodeId),
}

/// Result of BUMPEPOCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochBump {
    Bumped(u64),
    Still(u64),
}

/// One node of a shard, as rendered by the SHARDS description.
#[derive(Debug, Clone)]
pub struct ShardNodeView {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub tls_port: u16,
    pub hostname: Option<String>,
    pub role: &'static str,
    pub repl_offset: i64,
    pub health: &'static str,
}

/// A shard: the slot ranges of its primary plus every member node.
#[derive(Debug, Clone)]
pub struct ShardView {
    pub shard_id: ShardId,
    pub slots: Vec<(u16, u16)>,
    pub nodes: Vec<ShardNodeView>,
}

impl Cluster {
    /// Starts a handshake toward a new peer (CLUSTER MEET).
    pub fn meet(&self, ip: &str, port: u16, bus_port: u16) -> Result<(), ClusterError> {
        if port == 0 || bus_port == 0 {
            return Err(ClusterError::InvalidRequest(
                "Invalid base or bus port".to_string(),
            ));
        }
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| ClusterError::InvalidRequest(format!("Invalid node address: {ip}")))?;
        let ip = ip.to_string();

        {
            let mut meta = self.lock();
            if meta.handshake_in_progress(&ip, bus_port) {
                // Already being introduced; the cron will finish the job.
                return Ok(());
            }
            let now = now_ms();
            let mut node = Node::new(
                NodeId::random(),
                NodeFlags::HANDSHAKE | NodeFlags::MEET,
                now,
            );
            node.ip = ip.clone();
            node.port = port;
            node.bus_port = bus_port;
            info!("Starting handshake with {ip}:{port}@{bus_port}");
            meta.add_node(node);
            meta.todo |= TodoFlags::SAVE_CONFIG;
        }
        cron::before_sleep(self);
        Ok(())
    }

    /// Removes a node and bars gossip from re-adding it (CLUSTER FORGET).
    pub fn forget(&self, id: NodeId) -> Result<(), ClusterError> {
        {
            let mut meta = self.lock();
            if id == meta.myself {
                return Err(ClusterError::InvalidRequest(
                    "I tried hard but I can't forget myself...".to_string(),
                ));
            }
            if !meta.nodes.contains_key(&id) {
                return Err(ClusterError::UnknownNode(id));
            }
            if meta.myself().is_replica() && meta.myself().replicaof == Some(id) {
                return Err(ClusterError::InvalidRequest(
                    "Can't forget my primary!".to_string(),
                ));
            }
            let now = now_ms();
            meta.blacklist_add(id, now);
            meta.remove_node(id);
            meta.update_voting_size();
            meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE;
        }
        cron::before_sleep(self);
        Ok(())
    }

    /// Turns this node into a replica of `id` (CLUSTER REPLICATE).
    pub fn replicate(&self, id: NodeId) -> Result<(), ClusterError> {
        {
            let mut meta = self.lock();
            if id == meta.myself {
                return Err(ClusterError::InvalidRequest(
                    "Can't replicate myself".to_string(),
                ));
            }
            let Some(target) = meta.nodes.get(&id) else {
                return Err(ClusterError::UnknownNode(id));
            };
            if target.is_replica() {
                return Err(ClusterError::InvalidRequest(
                    "I can only replicate a primary, not a replica.".to_string(),
                ));
            }
            if meta.myself().is_primary()
                && (meta.myself().numslots > 0 || !self.keyspace_is_empty())
            {
                return Err(ClusterError::InvalidState(
                    "To set a primary the node must be empty and without assigned slots."
                        .to_string(),
                ));
            }
            update::reconfigure_as_replica_of(&mut meta, &*self.hooks, id);
        }
        cron::before_sleep(self);
        Ok(())
    }

    fn keyspace_is_empty(&self) -> bool {
        (0..SLOT_COUNT as u16).all(|slot| self.hooks.count_keys_in_slot(slot) == 0)
    }

    /// Promotes this replica over its primary (CLUSTER FAILOVER).
    pub fn failover(&self, option: FailoverOption) -> Result<(), ClusterError> {
        let config = &self.config;
        let hooks = &*self.hooks;
        {
            let mut meta = self.lock();
            if meta.myself().is_primary() {
                return Err(ClusterError::InvalidState(
                    "You should send CLUSTER FAILOVER to a replica".to_string(),
                ));
            }
            let Some(primary_id) = meta.myself().replicaof else {
                return Err(ClusterError::InvalidState(
                    "I'm a replica but my primary is unknown to me".to_string(),
                ));
            };
            let primary_down = meta
                .nodes
                .get(&primary_id)
                .map(|p| p.flags.contains(NodeFlags::FAIL) || p.link.is_none())
                .unwrap_or(true);
            if option == FailoverOption::Default && primary_down {
                return Err(ClusterError::InvalidState(
                    "Primary is down or failed, please use CLUSTER FAILOVER FORCE".to_string(),
                ));
            }

            failover::reset_manual_failover(&mut meta, hooks);
            let now = now_ms();
            meta.manual.end_time = now + MF_TIMEOUT_MS;

            match option {
                FailoverOption::Takeover => {
                    info!("Taking over the primary without coordination");
                    failover::takeover(&mut meta, config, hooks);
                }
                FailoverOption::Force => {
                    info!("Forced failover replica election, primary not consulted");
                    meta.manual.can_start = true;
                    meta.todo |= TodoFlags::HANDLE_FAILOVER;
                }
                FailoverOption::Default => {
                    info!("Manual failover requested, contacting primary");
                    let msg = ClusterMsg {
                        header: gossip::build_header(&meta, config, hooks, MsgType::MfStart),
                        payload: MsgPayload::Empty,
                    };
                    meta.send_to_node(primary_id, &msg);
                }
            }
        }
        cron::before_sleep(self);
        Ok(())
    }

    /// Claims unassigned slots for this node (CLUSTER ADDSLOTS).
    pub fn add_slots(&self, slots: &[u16]) -> Result<(), ClusterError> {
        {
            let mut meta = self.lock();
            for &slot in slots {
                if slot as usize >= SLOT_COUNT {
                    return Err(ClusterError::InvalidSlot);
                }
                if meta.slots[slot as usize].is_some() {
                    return Err(ClusterError::InvalidState(format!(
                        "Slot {slot} is already busy"
                    )));
                }
            }
            let myself_id = meta.myself;
            for &slot in slots {
                meta.assign_slot(slot, myself_id);
            }
            meta.update_voting_size();
            meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE;
        }
        cron::before_sleep(self);
        Ok(())
    }

    /// Releases assigned slots (CLUSTER DELSLOTS).
    pub fn del_slots(&self, slots: &[u16]) -> Result<(), ClusterError> {
        {
            let mut meta = self.lock();
            for &slot in slots {
                if slot as usize >= SLOT_COUNT {
                    return Err(ClusterError::InvalidSlot);
                }
                if meta.slots[slot as usize].is_none() {
                    return Err(ClusterError::InvalidState(format!(
                        "Slot {slot} is already unassigned"
                    )));
                }
            }
            for &slot in slots {
                meta.unassign_slot(slot);
                meta.migrating.remove(&slot);
                meta.importing.remove(&slot);
            }
            meta.update_voting_size();
            meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE;
        }
        cron::before_sleep(self);
        Ok(())
    }

    /// Drives the slot-migration state machine (CLUSTER SETSLOT).
    pub fn set_slot(&self, slot: u16, op: SetSlotOp) -> Result<(), ClusterError> {
        if slot as usize >= SLOT_COUNT {
            return Err(ClusterError::InvalidSlot);
        }
        {
            let mut meta = self.lock();
            let myself_id = meta.myself;
            match op {
                SetSlotOp::Migrating(target) => {
                    if meta.slots[slot as usize] != Some(myself_id) {
                        return Err(ClusterError::InvalidState(format!(
                            "I'm not the owner of hash slot {slot}"
                        )));
                    }
                    let Some(node) = meta.nodes.get(&target) else {
                        return Err(ClusterError::UnknownNode(target));
                    };
                    if !node.is_primary() {
                        return Err(ClusterError::InvalidState(
                            "Target node is not a primary".to_string(),
                        ));
                    }
                    meta.migrating.insert(slot, target);
                }
                SetSlotOp::Importing(source) => {
                    if meta.slots[slot as usize] == Some(myself_id) {
                        return Err(ClusterError::InvalidState(format!(
                            "I'm already the owner of hash slot {slot}"
                        )));
                    }
                    let Some(node) = meta.nodes.get(&source) else {
                        return Err(ClusterError::UnknownNode(source));
                    };
                    if !node.is_primary() {
                        return Err(ClusterError::InvalidState(
                            "Source node is not a primary".to_string(),
                        ));
                    }
                    meta.importing.insert(slot, source);
                }
                SetSlotOp::Stable => {
                    meta.migrating.remove(&slot);
                    meta.importing.remove(&slot);
                }
                SetSlotOp::Node(owner) => {
                    if !meta.nodes.contains_key(&owner) {
                        return Err(ClusterError::UnknownNode(owner));
                    }
                    if meta.slots[slot as usize] == Some(myself_id)
                        && owner != myself_id
                        && self.hooks.count_keys_in_slot(slot) > 0
                    {
                        return Err(ClusterError::InvalidState(format!(
                            "Can't assign hashslot {slot} to a different node while I still \
                             hold keys for this hash slot."
                        )));
                    }
                    if meta.migrating.contains_key(&slot)
                        && self.hooks.count_keys_in_slot(slot) == 0
                    {
                        meta.migrating.remove(&slot);
                    }
                    if owner == myself_id && meta.importing.remove(&slot).is_some() {
                        // Finishing an import: claim a fresh epoch so the
                        // new ownership wins reconciliation everywhere.
                        let epoch = meta.bump_config_epoch();
                        info!("Slot {slot} imported, config epoch bumped to {epoch}");
                    }
                    meta.assign_slot(slot, owner);
                    meta.update_voting_size();
                }
            }
            meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE;
        }
        cron::before_sleep(self);
        Ok(())
    }

    /// CLUSTER BUMPEPOCH: claim a fresh config epoch unless ours is already
    /// the greatest known.
    pub fn bump_epoch(&self) -> EpochBump {
        let result = {
            let mut meta = self.lock();
            let max_epoch = meta
                .nodes
                .values()
                .map(|n| n.config_epoch)
                .max()
                .unwrap_or(0);
            let mine = meta.myself().config_epoch;
            if mine == 0 || mine != max_epoch {
                EpochBump::Bumped(meta.bump_config_epoch())
            } else {
                EpochBump::Still(mine)
            }
        };
        cron::before_sleep(self);
        result
    }

    /// CLUSTER RESET: forget everything. `hard` also renames the node and
    /// zeroes the epochs.
    pub fn reset(&self, hard: bool) -> Result<(), ClusterError> {
        {
            let mut meta = self.lock();
            if meta.myself().is_primary() && !self.keyspace_is_empty() {
                return Err(ClusterError::InvalidState(
                    "CLUSTER RESET can't be called with primary nodes containing keys"
                        .to_string(),
                ));
            }

            let myself_id = meta.myself;
            if meta.myself().is_replica() {
                let me = meta.myself_mut();
                me.flags.remove(NodeFlags::REPLICA);
                me.flags.insert(NodeFlags::PRIMARY);
                meta.detach_replica(myself_id);
                self.hooks.unbind_primary();
            }

            for slot in 0..SLOT_COUNT as u16 {
                meta.unassign_slot(slot);
            }
            meta.migrating.clear();
            meta.importing.clear();
            failover::reset_manual_failover(&mut meta, &*self.hooks);

            let others: Vec<NodeId> = meta
                .nodes
                .keys()
                .copied()
                .filter(|id| *id != myself_id)
                .collect();
            for id in others {
                meta.remove_node(id);
            }

            if hard {
                meta.current_epoch = 0;
                meta.last_vote_epoch = 0;
                meta.myself_mut().config_epoch = 0;
                let new_id = NodeId::random();
                meta.rename_node(myself_id, new_id);
                meta.myself = new_id;
                info!("Node hard reset, I'm now {new_id}");
            } else {
                info!("Node soft reset");
            }
            meta.update_voting_size();
            meta.todo |=
                TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG | TodoFlags::UPDATE_STATE;
        }
        cron::before_sleep(self);
        Ok(())
    }

    /// CLUSTER SET-CONFIG-EPOCH: bootstrap-time manual epoch assignment.
    pub fn set_config_epoch(&self, epoch: u64) -> Result<(), ClusterError> {
        {
            let mut meta = self.lock();
            if epoch == 0 {
                return Err(ClusterError::InvalidRequest(
                    "Invalid config epoch specified: 0".to_string(),
                ));
            }
            if meta.myself().config_epoch != 0 {
                return Err(ClusterError::InvalidState(
                    "Node config epoch is already non-zero".to_string(),
                ));
            }
            meta.myself_mut().config_epoch = epoch;
            if epoch > meta.current_epoch {
                meta.current_epoch = epoch;
            }
            meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;
        }
        cron::before_sleep(self);
        Ok(())
    }

    /// This node's identifier (CLUSTER MYID).
    pub fn myid(&self) -> NodeId {
        self.my_id()
    }

    /// CLUSTER INFO: the human-readable state summary.
    pub fn info(&self) -> String {
        let meta = self.lock();
        let mut assigned = 0usize;
        let mut ok = 0usize;
        let mut pfail = 0usize;
        let mut fail = 0usize;
        for slot in 0..SLOT_COUNT {
            let Some(owner) = meta.slots[slot] else {
                continue;
            };
            assigned += 1;
            match meta.nodes.get(&owner).map(|n| n.flags) {
                Some(flags) if flags.contains(NodeFlags::FAIL) => fail += 1,
                Some(flags) if flags.contains(NodeFlags::PFAIL) => pfail += 1,
                _ => ok += 1,
            }
        }
        let pfail_nodes = meta
            .nodes
            .values()
            .filter(|n| n.flags.contains(NodeFlags::PFAIL) && n.has_addr())
            .count();

        let mut out = String::new();
        out.push_str(&format!(
            "cluster_enabled:1\r\ncluster_state:{}\r\n",
            if meta.health == ClusterHealth::Ok { "ok" } else { "fail" }
        ));
        out.push_str(&format!("cluster_slots_assigned:{assigned}\r\n"));
        out.push_str(&format!("cluster_slots_ok:{ok}\r\n"));
        out.push_str(&format!("cluster_slots_pfail:{pfail}\r\n"));
        out.push_str(&format!("cluster_slots_fail:{fail}\r\n"));
        out.push_str(&format!("cluster_known_nodes:{}\r\n", meta.nodes.len()));
        out.push_str(&format!("cluster_size:{}\r\n", meta.voting_size));
        out.push_str(&format!("cluster_current_epoch:{}\r\n", meta.current_epoch));
        out.push_str(&format!(
            "cluster_my_epoch:{}\r\n",
            meta.myself().config_epoch
        ));
        out.push_str(&format!("cluster_stats_pfail_nodes:{pfail_nodes}\r\n"));

        let mut total_sent = 0u64;
        let mut total_received = 0u64;
        for raw in 0..MSG_TYPE_COUNT as u16 {
            let mtype = MsgType::from_wire(raw).expect("all wire values covered");
            let sent = meta.stats_sent[raw as usize];
            let received = meta.stats_received[raw as usize];
            total_sent += sent;
            total_received += received;
            if sent > 0 {
                out.push_str(&format!(
                    "cluster_stats_messages_{}_sent:{sent}\r\n",
                    mtype.name()
                ));
            }
            if received > 0 {
                out.push_str(&format!(
                    "cluster_stats_messages_{}_received:{received}\r\n",
                    mtype.name()
                ));
            }
        }
        out.push_str(&format!("cluster_stats_messages_sent:{total_sent}\r\n"));
        out.push_str(&format!(
            "cluster_stats_messages_received:{total_received}\r\n"
        ));
        out.push_str(&format!(
            "total_cluster_links_buffer_limit_exceeded:{}\r\n",
            meta.links_buffer_limit_exceeded
        ));
        out
    }

    /// CLUSTER NODES: one canonical line per known node.
    pub fn nodes_description(&self) -> String {
        let meta = self.lock();
        let mut out = String::new();
        for node in meta.nodes.values() {
            out.push_str(&persistence::render_node_line(&meta, node));
            out.push('\n');
        }
        out
    }

    /// CLUSTER SHARDS: topology grouped by shard.
    pub fn shards(&self) -> Vec<ShardView> {
        let meta = self.lock();
        let mut out = Vec::new();
        for (shard_id, members) in &meta.shards {
            let mut slots = Vec::new();
            let mut nodes = Vec::new();
            for id in members {
                let Some(node) = meta.nodes.get(id) else {
                    continue;
                };
                if node.is_primary() {
                    slots.extend(node.slots.ranges());
                }
                nodes.push(ShardNodeView {
                    id: node.id,
                    ip: node.ip.clone(),
                    port: node.port,
                    tls_port: node.tls_port,
                    hostname: node.hostname.clone(),
                    role: if node.is_primary() { "master" } else { "replica" },
                    repl_offset: node.repl_offset,
                    health: if node.is_failing() { "failed" } else { "online" },
                });
            }
            if nodes.is_empty() {
                continue;
            }
            out.push(ShardView {
                shard_id: *shard_id,
                slots,
                nodes,
            });
        }
        out
    }

    /// CLUSTER REPLICAS: the canonical lines of a primary's replicas.
    pub fn replicas_of(&self, id: NodeId) -> Result<Vec<String>, ClusterError> {
        let meta = self.lock();
        let Some(node) = meta.nodes.get(&id) else {
            return Err(ClusterError::UnknownNode(id));
        };
        if !node.is_primary() {
            return Err(ClusterError::InvalidRequest(format!(
                "The specified node is not a primary: {id}"
            )));
        }
        Ok(node
            .replicas
            .iter()
            .filter_map(|rid| meta.nodes.get(rid))
            .map(|replica| persistence::render_node_line(&meta, replica))
            .collect())
    }

    /// CLUSTER COUNTKEYSINSLOT passthrough.
    pub fn count_keys_in_slot(&self, slot: u16) -> Result<u32, ClusterError> {
        if slot as usize >= SLOT_COUNT {
            return Err(ClusterError::InvalidSlot);
        }
        Ok(self.hooks.count_keys_in_slot(slot))
    }
}
