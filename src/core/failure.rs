// src/core/failure.rs

//! Failure detection: aggregation of gossip failure reports and the
//! PFAIL -> FAIL promotion under primary quorum.

use crate::config::Config;
use crate::core::gossip::{self, now_ms};
use crate::core::hooks::StoreHooks;
use crate::core::node::{NodeFlags, NodeId};
use crate::core::protocol::message::{ClusterMsg, MsgPayload, MsgType};
use crate::core::state::{ClusterMeta, TodoFlags};
use tracing::info;

/// Failure reports stay valid for this multiple of the node timeout.
pub const FAIL_REPORT_VALIDITY_MULT: u64 = 2;

/// A failed primary that nobody replaced gets its FAIL flag dropped after
/// this multiple of the node timeout once it is reachable again.
pub const FAIL_UNDO_TIME_MULT: u64 = 2;

/// Drops failure reports older than the validity window and returns how
/// many remain.
fn trim_fail_reports(meta: &mut ClusterMeta, node_id: NodeId, validity_ms: u64, now: u64) -> usize {
    let Some(node) = meta.nodes.get_mut(&node_id) else {
        return 0;
    };
    node.fail_reports
        .retain(|report| now.saturating_sub(report.time) <= validity_ms);
    node.fail_reports.len()
}

/// Promotes a PFAIL node to FAIL when a quorum of the voting set agrees,
/// counting ourselves when we are a primary. On promotion the FAIL is
/// broadcast so the whole cluster converges without waiting for its own
/// timers.
pub fn mark_failing_if_needed(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    node_id: NodeId,
    now: u64,
) {
    let validity = config.node_timeout_ms() * FAIL_REPORT_VALIDITY_MULT;
    let mut failures = trim_fail_reports(meta, node_id, validity, now);

    let Some(node) = meta.nodes.get(&node_id) else {
        return;
    };
    if !node.flags.contains(NodeFlags::PFAIL) || node.flags.contains(NodeFlags::FAIL) {
        return;
    }
    if meta.myself().is_primary() {
        failures += 1;
    }
    if failures < meta.quorum() {
        return;
    }

    info!(
        "Marking node {node_id} as failing ({failures} reports, quorum {})",
        meta.quorum()
    );
    let node = meta
        .nodes
        .get_mut(&node_id)
        .expect("node presence checked above");
    node.flags.remove(NodeFlags::PFAIL);
    node.flags.insert(NodeFlags::FAIL);
    node.fail_time = now;
    meta.todo |= TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG;

    // Everyone learns of the confirmed failure immediately.
    let msg = ClusterMsg {
        header: gossip::build_header(meta, config, hooks, MsgType::Fail),
        payload: MsgPayload::Fail { target: node_id },
    };
    meta.broadcast(&msg);
}

/// Clears the FAIL flag of a node that became reachable again, when doing
/// so cannot lose writes: replicas and slotless primaries immediately, a
/// slot-serving primary only after nobody took over for long enough.
pub fn clear_failure_if_needed(meta: &mut ClusterMeta, config: &Config, node_id: NodeId, now: u64) {
    let Some(node) = meta.nodes.get(&node_id) else {
        return;
    };
    if !node.flags.contains(NodeFlags::FAIL) {
        return;
    }

    let undo_after = config.node_timeout_ms() * FAIL_UNDO_TIME_MULT;
    let clearable = node.is_replica()
        || node.numslots == 0
        || (node.is_primary()
            && node.numslots > 0
            && now.saturating_sub(node.fail_time) > undo_after);
    if !clearable {
        return;
    }

    info!("Clearing FAIL state for reachable node {node_id}");
    let node = meta
        .nodes
        .get_mut(&node_id)
        .expect("node presence checked above");
    node.flags.remove(NodeFlags::FAIL);
    node.fail_time = 0;
    meta.todo |= TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG;
}

/// PFAIL marking pass of the cron: a peer that answered neither our pending
/// ping nor sent any data within the node timeout is suspected down.
pub fn mark_pfail_if_timed_out(meta: &mut ClusterMeta, config: &Config, node_id: NodeId) {
    let now = now_ms();
    let timeout = config.node_timeout_ms();
    let Some(node) = meta.nodes.get_mut(&node_id) else {
        return;
    };
    if node.ping_sent == 0 {
        return;
    }
    if node
        .flags
        .intersects(NodeFlags::PFAIL | NodeFlags::FAIL | NodeFlags::MYSELF | NodeFlags::HANDSHAKE)
    {
        return;
    }
    let ping_delay = now.saturating_sub(node.ping_sent);
    let data_delay = if node.data_received != 0 {
        now.saturating_sub(node.data_received)
    } else {
        u64::MAX
    };
    if ping_delay.min(data_delay) > timeout {
        info!("Node {node_id} is not responding, marking as possibly failing");
        node.flags.insert(NodeFlags::PFAIL);
        meta.todo |= TodoFlags::UPDATE_STATE;
    }
}
