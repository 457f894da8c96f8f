// src/core/update.rs

//! Slot-table reconciliation: applying a primary's claimed bitmap under the
//! config-epoch ordering, UPDATE packets, and the role switches that fall
//! out of ownership changes.

use crate::config::Config;
use crate::core::failover;
use crate::core::gossip;
use crate::core::hooks::StoreHooks;
use crate::core::node::{NodeFlags, NodeId};
use crate::core::protocol::message::{ClusterMsg, MsgPayload, MsgType};
use crate::core::slot_map::{SLOT_COUNT, SlotBitmap};
use crate::core::state::{ClusterMeta, TodoFlags};
use tracing::{debug, info};

/// Turns a node we believed to be a replica into a primary (it said so
/// itself, or an UPDATE outranked our view).
pub fn set_node_as_primary(meta: &mut ClusterMeta, node_id: NodeId) {
    let Some(node) = meta.nodes.get(&node_id) else {
        return;
    };
    if node.is_primary() {
        return;
    }
    if node.replicaof.is_some() {
        meta.detach_replica(node_id);
    }
    let node = meta
        .nodes
        .get_mut(&node_id)
        .expect("node presence checked above");
    node.flags.remove(NodeFlags::REPLICA);
    node.flags.insert(NodeFlags::PRIMARY);
    meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE;
}

/// Unbinds every slot a node holds, table and bitmap both.
pub fn clear_all_slots_of(meta: &mut ClusterMeta, node_id: NodeId) {
    for slot in 0..SLOT_COUNT as u16 {
        if meta.slots[slot as usize] == Some(node_id) {
            meta.unassign_slot(slot);
        }
    }
    if let Some(node) = meta.nodes.get_mut(&node_id) {
        node.clear_slots();
    }
}

/// Reconfigures the local node as a replica of `primary_id`: the adoption
/// path for observers of a failover, for replica migration, and for the
/// REPLICATE admin command.
pub fn reconfigure_as_replica_of(
    meta: &mut ClusterMeta,
    hooks: &dyn StoreHooks,
    primary_id: NodeId,
) {
    let myself_id = meta.myself;
    if meta.myself().is_primary() {
        let me = meta.myself_mut();
        me.flags.remove(NodeFlags::PRIMARY | NodeFlags::MIGRATE_TO);
        me.flags.insert(NodeFlags::REPLICA);
        // Any half-done handovers are meaningless in the new role.
        meta.migrating.clear();
        meta.importing.clear();
    }
    meta.attach_replica(myself_id, primary_id);
    failover::reset_manual_failover(meta, hooks);

    if let Some(primary) = meta.nodes.get(&primary_id) {
        info!("Reconfigured myself as a replica of {primary_id}");
        hooks.bind_primary(&primary.ip, primary.port);
    }
    meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE | TodoFlags::FSYNC_CONFIG;
}

/// Applies the slot bitmap `sender_id` vouches for at `sender_epoch`.
///
/// Per slot: the sender keeps what it already owns; it takes over slots that
/// are unclaimed or whose owner is outranked by its epoch; a slot it owns
/// but stopped claiming is only soft-flagged, never unbound, so a transient
/// disagreement cannot blackhole requests. Slots this node is importing are
/// left alone until the handover completes.
pub fn update_slots(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    sender_id: NodeId,
    sender_epoch: u64,
    claimed: &SlotBitmap,
) {
    let cur_primary = meta.current_primary();
    let mut new_primary: Option<NodeId> = None;
    let mut dirty_slots: Vec<u16> = Vec::new();
    let mut sender_claimed = 0usize;
    let mut taken_from_us = 0usize;

    for slot in 0..SLOT_COUNT as u16 {
        let claimed_here = claimed.contains(slot);
        if claimed_here {
            sender_claimed += 1;
        }
        let owner = meta.slots[slot as usize];
        if owner == Some(sender_id) {
            if claimed_here {
                meta.owner_not_claiming.remove(slot);
            } else {
                meta.owner_not_claiming.insert(slot);
            }
            continue;
        }
        if !claimed_here {
            continue;
        }
        if meta.importing.contains_key(&slot) {
            continue;
        }
        let owner_epoch = owner
            .and_then(|id| meta.nodes.get(&id))
            .map(|n| n.config_epoch)
            .unwrap_or(0);
        if meta.slot_unclaimed(slot) || owner_epoch < sender_epoch {
            if owner == Some(meta.myself) && hooks.count_keys_in_slot(slot) > 0 {
                dirty_slots.push(slot);
            }
            if owner == Some(cur_primary) {
                new_primary = Some(sender_id);
                taken_from_us += 1;
            }
            meta.assign_slot(slot, sender_id);
            meta.todo |=
                TodoFlags::SAVE_CONFIG | TodoFlags::UPDATE_STATE | TodoFlags::FSYNC_CONFIG;
        }
    }
    meta.update_voting_size();

    let cur_primary_emptied = meta
        .nodes
        .get(&cur_primary)
        .map(|n| n.numslots == 0)
        .unwrap_or(false);
    if let Some(new_primary) = new_primary.filter(|_| {
        cur_primary_emptied
            && (config.cluster.allow_replica_migration || sender_claimed == taken_from_us)
    }) {
        // Our (possibly former) primary lost everything to the sender: it
        // won a failover or absorbed the shard, so we follow it.
        info!(
            "Configuration change detected. Reconfiguring myself as a replica of {new_primary}"
        );
        reconfigure_as_replica_of(meta, hooks, new_primary);
    } else if let Some(grandprimary) = sub_replica_target(meta) {
        // Our primary became a replica itself; track its primary instead of
        // forming a replication chain.
        info!("My primary is now a replica of {grandprimary}, following it");
        reconfigure_as_replica_of(meta, hooks, grandprimary);
    } else {
        // We kept our role but lost slots we still hold keys for.
        for slot in dirty_slots {
            let deleted = hooks.del_keys_in_slot(slot);
            debug!("Deleted {deleted} keys in dirty slot {slot}");
        }
    }
}

/// When we are a replica of a node that itself replicates someone, returns
/// the grandprimary to adopt (never ourselves, avoiding a cycle).
fn sub_replica_target(meta: &ClusterMeta) -> Option<NodeId> {
    let me = meta.myself();
    if !me.is_replica() {
        return None;
    }
    let primary = meta.nodes.get(&me.replicaof?)?;
    let grandprimary = primary.replicaof?;
    (grandprimary != meta.myself).then_some(grandprimary)
}

/// Builds an UPDATE packet describing the authoritative owner's claim,
/// masking out slots the owner is itself no longer advertising so a stale
/// view never propagates.
pub fn build_update_msg(
    meta: &ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    owner_id: NodeId,
) -> Option<ClusterMsg> {
    let owner = meta.nodes.get(&owner_id)?;
    let mut slots = owner.slots.clone();
    for slot in 0..SLOT_COUNT as u16 {
        if meta.owner_not_claiming.contains(slot) {
            slots.remove(slot);
        }
    }
    Some(ClusterMsg {
        header: gossip::build_header(meta, config, hooks, MsgType::Update),
        payload: MsgPayload::Update {
            config_epoch: owner.config_epoch,
            node: owner_id,
            slots,
        },
    })
}
