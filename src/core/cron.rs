// src/core/cron.rs

//! The 10 Hz orchestrator driving every time-based duty: reconnects, the
//! ping rotation, failure marking, failover progress, replica migration and
//! the cluster health recomputation, plus the coalesced before-sleep flush.

use crate::core::bus::link;
use crate::core::failover;
use crate::core::failure;
use crate::core::gossip::{self, now_ms};
use crate::core::node::{NodeFlags, NodeId};
use crate::core::persistence;
use crate::core::protocol::message::MsgType;
use crate::core::state::{Cluster, ClusterHealth, ClusterMeta, TodoFlags};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const CRON_PERIOD: Duration = Duration::from_millis(100);

/// A node that answered a minority partition comes back to OK only after a
/// settle delay, clamped to this window.
const MAX_REJOIN_DELAY_MS: u64 = 5_000;
const MIN_REJOIN_DELAY_MS: u64 = 500;

/// Grace period after startup before the state check may declare OK.
const WRITABLE_DELAY_MS: u64 = 2_000;

/// How long a primary must stay orphaned before a replica migrates to it.
const REPLICA_MIGRATION_DELAY_MS: u64 = 5_000;

/// The cron task. Ticks every 100 ms; the ping rotation runs on every tenth
/// tick.
pub async fn run(cluster: Arc<Cluster>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(CRON_PERIOD);
    let mut iteration: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Cluster cron shutting down.");
                return;
            }
            _ = ticker.tick() => {
                iteration += 1;
                tick(&cluster, iteration);
            }
        }
    }
}

fn tick(cluster: &Arc<Cluster>, iteration: u64) {
    let config = &cluster.config;
    let hooks = &*cluster.hooks;
    let now = now_ms();
    let node_timeout = config.node_timeout_ms();
    let ping_interval = node_timeout / 2;
    let mut connect_targets: Vec<(NodeId, String, u16)> = Vec::new();

    {
        let mut guard = cluster.lock();
        let meta = &mut *guard;

        refresh_own_announce(meta, config);

        // Links whose queue blew the byte budget are dropped, both
        // directions; the reconnect below restores them.
        let limit = config.cluster.link_send_buffer_limit;
        if limit > 0 {
            let over: Vec<(u64, Option<NodeId>)> = meta
                .links
                .values()
                .filter(|l| l.send_queue_mem() > limit)
                .map(|l| (l.id, l.node))
                .collect();
            for (link_id, node_id) in over {
                meta.links_buffer_limit_exceeded += 1;
                warn!(
                    "Freeing bus link {link_id} of node {:?}: send queue over {limit} bytes",
                    node_id
                );
                let both = node_id
                    .and_then(|id| meta.nodes.get(&id))
                    .map(|n| (n.link, n.inbound_link));
                if let Some((outbound, inbound)) = both {
                    if let Some(id) = outbound {
                        meta.free_link(id);
                    }
                    if let Some(id) = inbound {
                        meta.free_link(id);
                    }
                } else {
                    meta.free_link(link_id);
                }
            }
        }

        // Handshakes have a bounded lifetime.
        let handshake_timeout = node_timeout.max(1_000);
        let expired: Vec<NodeId> = meta
            .nodes
            .values()
            .filter(|n| n.in_handshake() && now.saturating_sub(n.ctime) > handshake_timeout)
            .map(|n| n.id)
            .collect();
        for id in expired {
            warn!("Handshake with node {id} timed out, dropping it");
            meta.remove_node(id);
        }

        // Reconnect every addressable peer lacking an outbound link.
        let reconnect: Vec<NodeId> = meta
            .nodes
            .values()
            .filter(|n| {
                !n.is_myself()
                    && n.has_addr()
                    && n.bus_port != 0
                    && n.link.is_none()
                    && !n.connecting
            })
            .map(|n| n.id)
            .collect();
        for id in reconnect {
            if let Some(node) = meta.nodes.get_mut(&id) {
                node.connecting = true;
                connect_targets.push((id, node.ip.clone(), node.bus_port));
            }
        }

        // Once per second, ping the peer we heard from least recently among
        // a few random connected candidates.
        if iteration % 10 == 0 {
            let candidates: Vec<NodeId> = meta
                .nodes
                .values()
                .filter(|n| !n.is_myself() && !n.in_handshake())
                .filter(|n| n.link.is_some() && n.ping_sent == 0)
                .map(|n| n.id)
                .collect();
            if !candidates.is_empty() {
                let mut rng = rand::thread_rng();
                let mut oldest: Option<NodeId> = None;
                for _ in 0..5 {
                    let pick = candidates[rng.gen_range(0..candidates.len())];
                    let better = match oldest {
                        None => true,
                        Some(current) => {
                            let current_pong =
                                meta.nodes.get(&current).map(|n| n.pong_received).unwrap_or(0);
                            let pick_pong =
                                meta.nodes.get(&pick).map(|n| n.pong_received).unwrap_or(0);
                            pick_pong < current_pong
                        }
                    };
                    if better {
                        oldest = Some(pick);
                    }
                }
                if let Some(target) = oldest {
                    gossip::send_ping_to_node(meta, config, hooks, target, MsgType::Ping);
                }
            }
        }

        // Full node walk: orphan accounting, overdue pings, dead link
        // teardown and PFAIL marking.
        let my_primary = meta.myself().replicaof.filter(|_| meta.myself().is_replica());
        let mut orphaned_primaries = 0usize;
        let mut max_replicas = 0usize;
        let mut this_replicas = 0usize;
        let walk: Vec<NodeId> = meta.nodes.keys().copied().collect();
        for id in walk {
            let Some(node) = meta.nodes.get(&id) else {
                continue;
            };
            if node
                .flags
                .intersects(NodeFlags::MYSELF | NodeFlags::NOADDR | NodeFlags::HANDSHAKE)
            {
                continue;
            }

            if node.is_primary() {
                let ok_replicas = meta.ok_replicas_of(id);
                let node = meta.nodes.get_mut(&id).expect("node fetched above");
                if ok_replicas > 0 {
                    node.flags.insert(NodeFlags::MIGRATE_TO);
                }
                if ok_replicas == 0
                    && node.numslots > 0
                    && node.flags.contains(NodeFlags::MIGRATE_TO)
                {
                    if node.orphaned_time == 0 {
                        node.orphaned_time = now;
                    }
                    orphaned_primaries += 1;
                } else {
                    node.orphaned_time = 0;
                }
                if ok_replicas > max_replicas {
                    max_replicas = ok_replicas;
                }
                if Some(id) == my_primary {
                    this_replicas = ok_replicas;
                }
            }

            // During a manual failover the replica keeps the primary's
            // offset view fresh with extra pings.
            let node = meta.nodes.get(&id).expect("node fetched above");
            if meta.manual.end_time != 0 && Some(id) == my_primary && node.link.is_some() {
                gossip::send_ping_to_node(meta, config, hooks, id, MsgType::Ping);
            }

            let node = meta.nodes.get(&id).expect("node fetched above");
            if node.link.is_some()
                && node.ping_sent == 0
                && now.saturating_sub(node.pong_received) > ping_interval
            {
                gossip::send_ping_to_node(meta, config, hooks, id, MsgType::Ping);
                continue;
            }

            // A link that stayed silent for half the timeout while a pong
            // is due is likely dead; tear it down so the reconnect path
            // gets a fresh chance before the node times out entirely.
            let node = meta.nodes.get(&id).expect("node fetched above");
            if let Some(link_id) = node.link {
                if node.ping_sent != 0
                    && now.saturating_sub(node.ping_sent) > node_timeout / 2
                    && now.saturating_sub(node.data_received) > node_timeout / 2
                {
                    meta.free_link(link_id);
                }
            }

            failure::mark_pfail_if_timed_out(meta, config, id);
        }

        // A replica that knows its primary's address but has no replication
        // stream binds it now.
        if let Some(primary_id) = my_primary {
            let addr = meta
                .nodes
                .get(&primary_id)
                .filter(|p| p.has_addr() && !p.ip.is_empty())
                .map(|p| (p.ip.clone(), p.port));
            if let Some((ip, port)) = addr {
                if !hooks.is_link_up() {
                    hooks.bind_primary(&ip, port);
                }
            }
        }

        failover::manual_failover_check_timeout(meta, hooks, now);
        failover::handle_manual_failover(meta, hooks);
        failover::handle_replica_failover(meta, config, hooks, now);

        if my_primary.is_some()
            && config.cluster.allow_replica_migration
            && orphaned_primaries > 0
            && this_replicas == max_replicas
            && meta.health == ClusterHealth::Ok
        {
            handle_replica_migration(meta, config, hooks, max_replicas, now);
        }

        if meta.todo.contains(TodoFlags::UPDATE_STATE) || meta.health == ClusterHealth::Fail {
            meta.todo.remove(TodoFlags::UPDATE_STATE);
            update_state(meta, config, now);
        }
    }

    for (id, ip, bus_port) in connect_targets {
        tokio::spawn(link::connect_to_node(Arc::clone(cluster), id, ip, bus_port));
    }
    before_sleep(cluster);
}

fn refresh_own_announce(meta: &mut ClusterMeta, config: &crate::config::Config) {
    let ip = config.announced_ip();
    let port = config.announced_port();
    let tls_port = config.tls_port.unwrap_or(0);
    let bus_port = config.announced_bus_port();
    let hostname = config.cluster.announce_hostname.clone();
    let nodename = config.cluster.announce_nodename.clone();
    let me = meta.myself_mut();
    if me.ip != ip
        || me.port != port
        || me.tls_port != tls_port
        || me.bus_port != bus_port
        || me.hostname != hostname
        || me.nodename != nodename
    {
        me.ip = ip;
        me.port = port;
        me.tls_port = tls_port;
        me.bus_port = bus_port;
        me.hostname = hostname;
        me.nodename = nodename;
        meta.todo |= TodoFlags::SAVE_CONFIG;
    }
}

/// Recomputes the cluster health: OK iff every slot is covered by a live
/// primary (when full coverage is required) and a quorum of the voting set
/// is reachable. Return to OK from a minority partition is deferred so
/// configuration updates can land first.
pub fn update_state(meta: &mut ClusterMeta, config: &crate::config::Config, now: u64) {
    if meta.first_state_check == 0 {
        meta.first_state_check = now;
    }
    if meta.myself().is_primary()
        && meta.health == ClusterHealth::Fail
        && now.saturating_sub(meta.first_state_check) < WRITABLE_DELAY_MS
    {
        return;
    }

    let mut new_state = ClusterHealth::Ok;

    if config.cluster.require_full_coverage {
        let uncovered = (0..crate::core::slot_map::SLOT_COUNT as u16).any(|slot| {
            match meta.slots[slot as usize] {
                None => true,
                Some(owner) => meta
                    .nodes
                    .get(&owner)
                    .map(|n| n.flags.contains(NodeFlags::FAIL))
                    .unwrap_or(true),
            }
        });
        if uncovered {
            new_state = ClusterHealth::Fail;
        }
    }

    meta.update_voting_size();
    let reachable = meta
        .nodes
        .values()
        .filter(|n| n.is_primary() && n.numslots > 0 && !n.is_failing())
        .count();
    if reachable < meta.quorum() {
        new_state = ClusterHealth::Fail;
        meta.among_minority_since = now;
    }

    if new_state != meta.health {
        let rejoin_delay = config
            .node_timeout_ms()
            .clamp(MIN_REJOIN_DELAY_MS, MAX_REJOIN_DELAY_MS);
        if new_state == ClusterHealth::Ok
            && meta.myself().is_primary()
            && now.saturating_sub(meta.among_minority_since) < rejoin_delay
        {
            return;
        }
        info!(
            "Cluster state changed: {}",
            if new_state == ClusterHealth::Ok { "ok" } else { "fail" }
        );
        meta.health = new_state;
    }
}

/// Replica migration: when some primary sits orphaned and our own primary
/// has replicas to spare, the lexicographically smallest co-replica adopts
/// the orphan so every shard keeps a failover candidate.
fn handle_replica_migration(
    meta: &mut ClusterMeta,
    config: &crate::config::Config,
    hooks: &dyn crate::core::hooks::StoreHooks,
    max_replicas: usize,
    now: u64,
) {
    let Some(my_primary) = meta.myself().replicaof else {
        return;
    };
    if meta.ok_replicas_of(my_primary) <= config.cluster.migration_barrier {
        return;
    }

    let mut candidate = meta.myself;
    let mut target: Option<NodeId> = None;
    let primaries: Vec<NodeId> = meta
        .nodes
        .values()
        .filter(|n| n.is_primary())
        .map(|n| n.id)
        .collect();
    for id in primaries {
        let ok_replicas = meta.ok_replicas_of(id);
        let Some(node) = meta.nodes.get(&id) else {
            continue;
        };
        if ok_replicas == 0
            && target.is_none()
            && node.numslots > 0
            && node.flags.contains(NodeFlags::MIGRATE_TO)
        {
            target = Some(id);
        }
        if ok_replicas == max_replicas {
            for replica_id in &node.replicas {
                if *replica_id < candidate {
                    candidate = *replica_id;
                }
            }
        }
    }

    if let Some(target) = target {
        let waited_out = meta
            .nodes
            .get(&target)
            .map(|n| now.saturating_sub(n.orphaned_time) > REPLICA_MIGRATION_DELAY_MS)
            .unwrap_or(false);
        if candidate == meta.myself && waited_out {
            info!("Migrating to orphaned primary {target}");
            crate::core::update::reconfigure_as_replica_of(meta, hooks, target);
        }
    }
}

/// Flushes the work coalesced during the last handler invocation: manual
/// failover progress, election progress, state recomputation, and at most
/// one config save. A failed save is unrecoverable and terminates the
/// process, since a diverging durable node table must never be served.
pub fn before_sleep(cluster: &Cluster) {
    let config = &cluster.config;
    let hooks = &*cluster.hooks;
    let now = now_ms();
    let mut guard = cluster.lock();
    let meta = &mut *guard;
    let todo = meta.todo;
    meta.todo = TodoFlags::empty();
    if todo.is_empty() {
        return;
    }

    if todo.contains(TodoFlags::HANDLE_MANUALFAILOVER) {
        failover::handle_manual_failover(meta, hooks);
    }
    if todo.contains(TodoFlags::HANDLE_FAILOVER) {
        failover::handle_replica_failover(meta, config, hooks, now);
    }
    if todo.contains(TodoFlags::UPDATE_STATE) {
        update_state(meta, config, now);
    }
    if todo.contains(TodoFlags::SAVE_CONFIG) {
        let do_fsync = todo.contains(TodoFlags::FSYNC_CONFIG);
        if let Err(e) = persistence::save(meta, &config.cluster.config_file, do_fsync) {
            error!("Could not save the cluster node table: {e}. Exiting.");
            std::process::exit(1);
        }
    }
}
