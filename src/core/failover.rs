// src/core/failover.rs

//! Replica-initiated failover under the config-epoch voting discipline:
//! election scheduling by replication rank, vote granting on the primary
//! side, win handling, epoch collision resolution and manual failover.

use crate::config::Config;
use crate::core::gossip::{self, now_ms};
use crate::core::hooks::StoreHooks;
use crate::core::node::{NodeFlags, NodeId};
use crate::core::protocol::message::{ClusterMsg, MsgFlags, MsgHeader, MsgPayload, MsgType};
use crate::core::state::{CantFailoverReason, ClusterMeta, ManualFailoverState, TodoFlags};
use crate::core::update;
use rand::Rng;
use tracing::{info, warn};

/// Base delay before a replica starts an election; a random slice of the
/// same magnitude is added so co-replicas spread out.
const FAILOVER_BASE_DELAY_MS: u64 = 500;

/// Spacing between co-replicas of different rank.
const FAILOVER_RANK_DELAY_MS: u64 = 1_000;

/// Floor for the election validity window.
const AUTH_TIMEOUT_MIN_MS: u64 = 2_000;

/// Assumed replication ping period, part of the data-age validity bound.
const PING_PERIOD_S: u64 = 10;

/// Minimum interval between two logs of the same can't-failover reason.
const CANT_FAILOVER_RELOG_MS: u64 = 10_000;

fn auth_timeout_ms(config: &Config) -> u64 {
    (config.node_timeout_ms() * 2).max(AUTH_TIMEOUT_MIN_MS)
}

/// This replica's election rank: the number of co-replicas of the same
/// primary with a strictly fresher replication offset. Rank 0 fires first.
pub fn replica_rank(meta: &ClusterMeta, hooks: &dyn StoreHooks) -> u64 {
    let my_offset = hooks.replication_offset();
    let me = meta.myself();
    let Some(primary) = me.replicaof.and_then(|id| meta.nodes.get(&id)) else {
        return 0;
    };
    primary
        .replicas
        .iter()
        .filter(|id| **id != meta.myself)
        .filter_map(|id| meta.nodes.get(id))
        .filter(|replica| replica.repl_offset > my_offset)
        .count() as u64
}

fn log_cant_failover(meta: &mut ClusterMeta, reason: CantFailoverReason, now: u64) {
    let election = &mut meta.failover;
    if election.cant_reason == reason
        && now.saturating_sub(election.cant_reason_logged) < CANT_FAILOVER_RELOG_MS
    {
        return;
    }
    election.cant_reason = reason;
    election.cant_reason_logged = now;
    if reason != CantFailoverReason::None {
        warn!("Currently unable to failover: {}", reason.describe());
    }
}

/// The replica failover state machine, run from the cron and from the
/// before-sleep hook whenever election progress is flagged.
pub fn handle_replica_failover(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    now: u64,
) {
    let node_timeout = config.node_timeout_ms();
    let auth_timeout = auth_timeout_ms(config);
    let auth_retry = auth_timeout * 2;
    let manual = meta.manual.end_time != 0 && meta.manual.can_start;

    let me = meta.myself();
    let primary_id = me.replicaof;
    let primary_failed = primary_id
        .and_then(|id| meta.nodes.get(&id))
        .map(|p| p.flags.contains(NodeFlags::FAIL))
        .unwrap_or(false);
    let primary_slots = primary_id
        .and_then(|id| meta.nodes.get(&id))
        .map(|p| p.numslots)
        .unwrap_or(0);

    if me.is_primary()
        || primary_id.is_none()
        || (!primary_failed && !manual)
        || (config.cluster.no_failover && !manual)
        || primary_slots == 0
    {
        meta.failover.cant_reason = CantFailoverReason::None;
        return;
    }
    let primary_id = primary_id.expect("checked above");

    // A replica whose data is too old would lose too many writes.
    let mut data_age = hooks.data_age_ms();
    if data_age > node_timeout {
        data_age -= node_timeout;
    }
    if config.cluster.replica_validity_factor != 0
        && data_age > PING_PERIOD_S * 1000 + node_timeout * config.cluster.replica_validity_factor
        && !manual
    {
        log_cant_failover(meta, CantFailoverReason::DataAge, now);
        return;
    }

    let auth_age = now.saturating_sub(meta.failover.auth_time);

    // The previous election (if any) expired: schedule a new one, offset by
    // our replication rank so the freshest replica runs first.
    if auth_age > auth_retry {
        let rank = replica_rank(meta, hooks);
        let jitter = rand::thread_rng().gen_range(0..FAILOVER_BASE_DELAY_MS);
        meta.failover.auth_time =
            now + FAILOVER_BASE_DELAY_MS + jitter + rank * FAILOVER_RANK_DELAY_MS;
        meta.failover.auth_count = 0;
        meta.failover.auth_sent = false;
        meta.failover.auth_rank = rank;
        if manual {
            meta.failover.auth_time = now;
            meta.failover.auth_rank = 0;
            meta.todo |= TodoFlags::HANDLE_FAILOVER;
        }
        info!(
            "Start of election delayed for {} ms, rank #{rank}",
            meta.failover.auth_time.saturating_sub(now)
        );
        // Let co-replicas learn our offset so their ranks stay accurate.
        gossip::broadcast_pong(meta, config, hooks, Some(primary_id));
        return;
    }

    // Our rank may have worsened while waiting; push the election out by the
    // difference (only before the vote request went out, and never for
    // manual failovers).
    if !meta.failover.auth_sent && meta.manual.end_time == 0 {
        let newrank = replica_rank(meta, hooks);
        if newrank > meta.failover.auth_rank {
            let delta = newrank - meta.failover.auth_rank;
            meta.failover.auth_time += delta * FAILOVER_RANK_DELAY_MS;
            meta.failover.auth_rank = newrank;
            info!("Replica rank updated to #{newrank}, election delayed");
        }
    }

    if now < meta.failover.auth_time {
        log_cant_failover(meta, CantFailoverReason::WaitingDelay, now);
        return;
    }
    if auth_age > auth_timeout {
        log_cant_failover(meta, CantFailoverReason::Expired, now);
        return;
    }

    if !meta.failover.auth_sent {
        meta.current_epoch += 1;
        meta.failover.auth_epoch = meta.current_epoch;
        info!(
            "Starting a failover election for epoch {}",
            meta.current_epoch
        );
        let mut msg = ClusterMsg {
            header: gossip::build_header(meta, config, hooks, MsgType::AuthRequest),
            payload: MsgPayload::Empty,
        };
        if manual {
            msg.header.mflags |= MsgFlags::FORCEACK;
        }
        meta.broadcast(&msg);
        meta.failover.auth_sent = true;
        meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;
        return;
    }

    if meta.failover.auth_count as usize >= meta.quorum() {
        info!(
            "Failover election won with {} votes (quorum {})",
            meta.failover.auth_count,
            meta.quorum()
        );
        replace_primary(meta, config, hooks, now);
    } else {
        log_cant_failover(meta, CantFailoverReason::WaitingVotes, now);
    }
}

/// Primary-side vote granting for an AUTH_REQ. Every refusal reason is
/// logged so operators can follow a stuck election.
pub fn vote_if_eligible(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    request: &MsgHeader,
    now: u64,
) {
    let candidate = request.sender;
    let force = request.mflags.contains(MsgFlags::FORCEACK);

    // Only primaries serving slots are part of the voting set.
    if !meta.myself().is_primary() || meta.myself().numslots == 0 {
        return;
    }
    if request.current_epoch < meta.current_epoch {
        warn!(
            "Failover auth denied to {candidate}: its epoch {} is older than mine {}",
            request.current_epoch, meta.current_epoch
        );
        return;
    }
    if meta.last_vote_epoch == meta.current_epoch {
        warn!(
            "Failover auth denied to {candidate}: already voted for epoch {}",
            meta.current_epoch
        );
        return;
    }

    let Some(primary_id) = meta
        .nodes
        .get(&candidate)
        .filter(|n| n.is_replica())
        .and_then(|n| n.replicaof)
    else {
        warn!("Failover auth denied to {candidate}: it is not a known replica");
        return;
    };
    let Some(primary) = meta.nodes.get(&primary_id) else {
        warn!("Failover auth denied to {candidate}: its primary is unknown");
        return;
    };
    if !force && !primary.flags.contains(NodeFlags::FAIL) {
        warn!("Failover auth denied to {candidate}: its primary {primary_id} is still reachable");
        return;
    }
    if now.saturating_sub(primary.voted_time) < config.node_timeout_ms() * 2 {
        warn!(
            "Failover auth denied to {candidate}: already voted for a replica of {primary_id} recently"
        );
        return;
    }

    // A claim over any slot whose recorded owner carries a newer epoch is
    // stale; granting it could resurrect an old configuration.
    for slot in request.slots.iter() {
        if meta.slot_unclaimed(slot) {
            continue;
        }
        let owner_epoch = meta.slots[slot as usize]
            .and_then(|id| meta.nodes.get(&id))
            .map(|n| n.config_epoch)
            .unwrap_or(0);
        if owner_epoch > request.config_epoch {
            warn!(
                "Failover auth denied to {candidate}: slot {slot} epoch {owner_epoch} is newer \
                 than the claimed {}",
                request.config_epoch
            );
            return;
        }
    }

    meta.last_vote_epoch = meta.current_epoch;
    if let Some(primary) = meta.nodes.get_mut(&primary_id) {
        primary.voted_time = now;
    }
    meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;
    let ack = ClusterMsg {
        header: gossip::build_header(meta, config, hooks, MsgType::AuthAck),
        payload: MsgPayload::Empty,
    };
    meta.send_to_node(candidate, &ack);
    info!(
        "Failover auth granted to {candidate} for epoch {}",
        meta.current_epoch
    );
}

/// Replica-side vote counting. A vote counts when it comes from a primary of
/// the voting set and refers to (at least) our election epoch.
pub fn tally_vote(meta: &mut ClusterMeta, header: &MsgHeader) {
    let counts = meta
        .nodes
        .get(&header.sender)
        .map(|n| n.is_primary() && n.numslots > 0)
        .unwrap_or(false);
    if counts && header.current_epoch >= meta.failover.auth_epoch {
        meta.failover.auth_count += 1;
        meta.todo |= TodoFlags::HANDLE_FAILOVER;
    }
}

/// The win path: promote ourselves, absorb the failed primary's slots, and
/// tell everyone at once.
pub fn replace_primary(
    meta: &mut ClusterMeta,
    config: &Config,
    hooks: &dyn StoreHooks,
    _now: u64,
) {
    let myself_id = meta.myself;
    let Some(old_primary) = meta.myself().replicaof else {
        return;
    };
    info!("Promoting myself to primary, replacing {old_primary}");

    update::set_node_as_primary(meta, myself_id);
    hooks.unbind_primary();

    let auth_epoch = meta.failover.auth_epoch;
    {
        let me = meta.myself_mut();
        me.config_epoch = me.config_epoch.max(auth_epoch);
    }

    let claimed: Vec<u16> = meta
        .nodes
        .get(&old_primary)
        .map(|p| p.slots.iter().collect())
        .unwrap_or_default();
    for slot in claimed {
        meta.assign_slot(slot, myself_id);
    }
    meta.update_voting_size();
    meta.todo |=
        TodoFlags::UPDATE_STATE | TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;

    gossip::broadcast_pong(meta, config, hooks, None);
    reset_manual_failover(meta, hooks);
}

/// Resolves a config-epoch tie between two primaries: the one with the
/// lexicographically smaller identifier claims a fresh epoch. Deterministic
/// on both sides, so exactly one of them moves.
pub fn handle_epoch_collision(meta: &mut ClusterMeta, sender_id: NodeId) {
    let me = meta.myself();
    let Some(sender) = meta.nodes.get(&sender_id) else {
        return;
    };
    if !me.is_primary() || !sender.is_primary() || sender.config_epoch != me.config_epoch {
        return;
    }
    // Only the smaller id moves; the peer runs the same comparison and
    // stays put.
    if sender_id <= meta.myself {
        return;
    }
    meta.current_epoch += 1;
    let epoch = meta.current_epoch;
    meta.myself_mut().config_epoch = epoch;
    warn!("Config epoch collision with {sender_id}; claiming new epoch {epoch}");
    meta.todo |= TodoFlags::SAVE_CONFIG | TodoFlags::FSYNC_CONFIG;
}

/// Clears all manual failover state, resuming writes if we paused them.
pub fn reset_manual_failover(meta: &mut ClusterMeta, hooks: &dyn StoreHooks) {
    if meta.manual.end_time != 0 && meta.myself().is_primary() {
        hooks.resume_writes();
    }
    meta.manual = ManualFailoverState::default();
}

/// Replica-side manual failover gate: once our processed offset matches the
/// paused primary's, the election may fire with rank 0.
pub fn handle_manual_failover(meta: &mut ClusterMeta, hooks: &dyn StoreHooks) {
    if meta.manual.end_time == 0 || meta.manual.can_start {
        return;
    }
    if meta.manual.primary_offset == -1 {
        return;
    }
    if meta.manual.primary_offset == hooks.replication_offset() {
        meta.manual.can_start = true;
        info!("All primary replication stream processed, manual failover can start.");
        meta.todo |= TodoFlags::HANDLE_FAILOVER;
    }
}

/// Aborts a manual failover that outlived its window.
pub fn manual_failover_check_timeout(meta: &mut ClusterMeta, hooks: &dyn StoreHooks, now: u64) {
    if meta.manual.end_time != 0 && meta.manual.end_time < now {
        warn!("Manual failover timed out.");
        reset_manual_failover(meta, hooks);
    }
}

/// TAKEOVER: become primary without any agreement, for operator-driven
/// recovery of a minority partition. Bumps the epoch locally so the change
/// eventually outranks the old configuration.
pub fn takeover(meta: &mut ClusterMeta, config: &Config, hooks: &dyn StoreHooks) {
    let now = now_ms();
    meta.bump_config_epoch();
    meta.failover.auth_epoch = meta.myself().config_epoch;
    replace_primary(meta, config, hooks, now);
}
