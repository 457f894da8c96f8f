// src/core/persistence.rs

//! The durable node table (`nodes.conf`): text format, atomic rewrite and
//! the process-lifetime advisory lock.
//!
//! One line per node:
//!
//! ```text
//! <id> <ip>:<port>@<bus_port>[,<hostname>][,<k>=<v>]* <flags> <primary|-> \
//!     <ping_sent> <pong_received> <config_epoch> <link_status> [slots...]
//! ```
//!
//! plus a trailer `vars currentEpoch <N> lastVoteEpoch <N>`. The same line
//! renderer backs the CLUSTER NODES output.

use crate::config::Config;
use crate::core::errors::ClusterError;
use crate::core::gossip::now_ms;
use crate::core::node::{Node, NodeFlags, NodeId};
use crate::core::state::ClusterMeta;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{info, warn};

/// Opens the node table, takes the exclusive advisory lock, and loads the
/// persisted state; a missing or empty file yields a fresh identity.
pub fn load_or_init(config: &Config) -> Result<(ClusterMeta, File), ClusterError> {
    let path = &config.cluster.config_file;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    lock_exclusive(&file).map_err(|_| {
        ClusterError::ConfigPersistence(format!(
            "Sorry, the cluster configuration file {path} is already used by a different process"
        ))
    })?;

    let mut content = String::new();
    (&file).read_to_string(&mut content)?;

    let now = now_ms();
    let meta = if content.trim().is_empty() {
        let meta = fresh_meta(config, now);
        info!("No cluster configuration found, I'm {}", meta.myself);
        save(&meta, path, true)?;
        meta
    } else {
        let mut meta = parse(&content, now)?;
        refresh_own_address(&mut meta, config);
        info!(
            "Node configuration loaded, I'm {} at epoch {}",
            meta.myself, meta.current_epoch
        );
        meta
    };
    Ok((meta, file))
}

fn fresh_meta(config: &Config, now: u64) -> ClusterMeta {
    let mut meta = ClusterMeta::new(NodeId::random(), now);
    refresh_own_address(&mut meta, config);
    meta
}

fn refresh_own_address(meta: &mut ClusterMeta, config: &Config) {
    let ip = config.announced_ip();
    let port = config.announced_port();
    let tls_port = config.tls_port.unwrap_or(0);
    let bus_port = config.announced_bus_port();
    let hostname = config.cluster.announce_hostname.clone();
    let nodename = config.cluster.announce_nodename.clone();
    let me = meta.myself_mut();
    me.ip = ip;
    me.port = port;
    me.tls_port = tls_port;
    me.bus_port = bus_port;
    me.hostname = hostname;
    me.nodename = nodename;
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

/// Renders the whole node table plus the epoch trailer. Handshake nodes are
/// transient placeholders and never persisted.
pub fn render(meta: &ClusterMeta) -> String {
    let mut out = String::new();
    for node in meta.nodes.values() {
        if node.in_handshake() {
            continue;
        }
        out.push_str(&render_node_line(meta, node));
        out.push('\n');
    }
    out.push_str(&format!(
        "vars currentEpoch {} lastVoteEpoch {}\n",
        meta.current_epoch, meta.last_vote_epoch
    ));
    out
}

/// One canonical node line, shared by the on-disk format and CLUSTER NODES.
pub fn render_node_line(meta: &ClusterMeta, node: &Node) -> String {
    let mut addr = format!("{}:{}@{}", node.ip, node.port, node.bus_port);
    if let Some(hostname) = &node.hostname {
        addr.push(',');
        addr.push_str(hostname);
    }
    addr.push_str(&format!(",shard-id={}", node.shard_id));
    if let Some(nodename) = &node.nodename {
        addr.push_str(&format!(",nodename={nodename}"));
    }
    if node.tls_port != 0 {
        addr.push_str(&format!(",tls-port={}", node.tls_port));
    }

    let primary = node
        .replicaof
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let link_status = if node.is_myself() || node.link.is_some() {
        "connected"
    } else {
        "disconnected"
    };

    let mut line = format!(
        "{} {} {} {} {} {} {} {}",
        node.id,
        addr,
        node.flags.render(),
        primary,
        node.ping_sent,
        node.pong_received,
        node.config_epoch,
        link_status
    );

    for (start, end) in node.slots.ranges() {
        if start == end {
            line.push_str(&format!(" {start}"));
        } else {
            line.push_str(&format!(" {start}-{end}"));
        }
    }
    if node.is_myself() {
        for (slot, target) in &meta.migrating {
            line.push_str(&format!(" [{slot}->-{target}]"));
        }
        for (slot, source) in &meta.importing {
            line.push_str(&format!(" [{slot}-<-{source}]"));
        }
    }
    line
}

/// Parses a node table file back into cluster state. Any malformed record
/// rejects the whole file; a half-understood node table is worse than none.
pub fn parse(content: &str, now: u64) -> Result<ClusterMeta, ClusterError> {
    struct ParsedNode {
        node: Node,
        replicaof: Option<NodeId>,
        migrating: Vec<(u16, NodeId)>,
        importing: Vec<(u16, NodeId)>,
        slots: Vec<(u16, u16)>,
    }

    let mut parsed: Vec<ParsedNode> = Vec::new();
    let mut current_epoch = 0u64;
    let mut last_vote_epoch = 0u64;
    let mut myself_id: Option<NodeId> = None;

    for (lineno, line) in content.lines().enumerate() {
        let lineno = lineno + 1;
        let bad = |msg: &str| ClusterError::ConfigParse(lineno, msg.to_string());
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens[0] == "vars" {
            let mut iter = tokens[1..].chunks_exact(2);
            for pair in &mut iter {
                match pair[0] {
                    "currentEpoch" => {
                        current_epoch = pair[1].parse().map_err(|_| bad("bad currentEpoch"))?;
                    }
                    "lastVoteEpoch" => {
                        last_vote_epoch = pair[1].parse().map_err(|_| bad("bad lastVoteEpoch"))?;
                    }
                    other => return Err(bad(&format!("unknown vars key '{other}'"))),
                }
            }
            continue;
        }
        if tokens.len() < 8 {
            return Err(bad("too few fields"));
        }

        let id: NodeId = tokens[0].parse().map_err(|_| bad("invalid node id"))?;
        let flags = NodeFlags::parse(tokens[2]).map_err(|_| bad("invalid flags"))?;
        let mut node = Node::new(id, flags, now);

        // ip:port@bus_port, then optional hostname and k=v auxiliaries.
        let mut addr_parts = tokens[1].split(',');
        let endpoint = addr_parts.next().ok_or_else(|| bad("missing address"))?;
        let (host_port, bus_port) = endpoint
            .split_once('@')
            .ok_or_else(|| bad("missing bus port"))?;
        let (ip, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| bad("missing client port"))?;
        node.ip = ip.to_string();
        node.port = port.parse().map_err(|_| bad("bad client port"))?;
        node.bus_port = bus_port.parse().map_err(|_| bad("bad bus port"))?;
        for extra in addr_parts {
            match extra.split_once('=') {
                None => {
                    if !extra.is_empty() {
                        node.hostname = Some(extra.to_string());
                    }
                }
                Some(("shard-id", value)) => {
                    node.shard_id = value.parse().map_err(|_| bad("invalid shard id"))?;
                }
                Some(("nodename", value)) => node.nodename = Some(value.to_string()),
                Some(("tls-port", value)) => {
                    node.tls_port = value.parse().map_err(|_| bad("bad tls port"))?;
                }
                Some(("tcp-port", value)) => {
                    // Redundant with the endpoint in this build; validated
                    // for compatibility with files written by others.
                    let _: u16 = value.parse().map_err(|_| bad("bad tcp port"))?;
                }
                Some((key, _)) => {
                    return Err(bad(&format!("unknown auxiliary field '{key}'")));
                }
            }
        }

        let replicaof = match tokens[3] {
            "-" => None,
            raw => Some(raw.parse().map_err(|_| bad("invalid primary id"))?),
        };
        node.ping_sent = tokens[4].parse().map_err(|_| bad("bad ping timestamp"))?;
        node.pong_received = tokens[5].parse().map_err(|_| bad("bad pong timestamp"))?;
        node.config_epoch = tokens[6].parse().map_err(|_| bad("bad config epoch"))?;
        // tokens[7] is the link status, a runtime fact re-derived on boot.

        let mut migrating = Vec::new();
        let mut importing = Vec::new();
        let mut slots = Vec::new();
        for token in &tokens[8..] {
            if let Some(body) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                if let Some((slot, target)) = body.split_once("->-") {
                    let slot: u16 = slot.parse().map_err(|_| bad("bad migrating slot"))?;
                    migrating
                        .push((slot, target.parse().map_err(|_| bad("bad migration target"))?));
                } else if let Some((slot, source)) = body.split_once("-<-") {
                    let slot: u16 = slot.parse().map_err(|_| bad("bad importing slot"))?;
                    importing
                        .push((slot, source.parse().map_err(|_| bad("bad import source"))?));
                } else {
                    return Err(bad("bad slot handover token"));
                }
            } else if let Some((start, end)) = token.split_once('-') {
                let start: u16 = start.parse().map_err(|_| bad("bad slot range"))?;
                let end: u16 = end.parse().map_err(|_| bad("bad slot range"))?;
                if start > end || end as usize >= crate::core::slot_map::SLOT_COUNT {
                    return Err(bad("slot range out of bounds"));
                }
                slots.push((start, end));
            } else {
                let slot: u16 = token.parse().map_err(|_| bad("bad slot"))?;
                if slot as usize >= crate::core::slot_map::SLOT_COUNT {
                    return Err(bad("slot out of bounds"));
                }
                slots.push((slot, slot));
            }
        }

        if flags.contains(NodeFlags::MYSELF) {
            if myself_id.is_some() {
                return Err(bad("duplicate myself record"));
            }
            myself_id = Some(id);
        }
        parsed.push(ParsedNode {
            node,
            replicaof,
            migrating,
            importing,
            slots,
        });
    }

    let myself_id = myself_id.ok_or(ClusterError::ConfigParse(
        0,
        "no record is flagged myself".to_string(),
    ))?;

    let mut meta = ClusterMeta::new(myself_id, now);
    // ClusterMeta::new seeds a blank self record; replace it with the
    // parsed one and add everyone else.
    meta.remove_node(myself_id);
    for entry in &parsed {
        meta.add_node(entry.node.clone());
    }
    for entry in &parsed {
        let id = entry.node.id;
        if let Some(primary_id) = entry.replicaof {
            if !meta.nodes.contains_key(&primary_id) {
                // The primary is referenced but has no record (partial
                // file); keep a placeholder so topology stays connected.
                warn!("Node {id} replicates unknown node {primary_id}, adding placeholder");
                meta.add_node(Node::new(primary_id, NodeFlags::NOADDR, now));
            }
            meta.attach_replica(id, primary_id);
        }
        for &(start, end) in &entry.slots {
            for slot in start..=end {
                meta.assign_slot(slot, id);
            }
        }
        if id == myself_id {
            for &(slot, target) in &entry.migrating {
                meta.migrating.insert(slot, target);
            }
            for &(slot, source) in &entry.importing {
                meta.importing.insert(slot, source);
            }
        }
    }
    meta.current_epoch = current_epoch;
    meta.last_vote_epoch = last_vote_epoch;
    meta.update_voting_size();
    Ok(meta)
}

/// Atomically replaces the node table on disk: temp file, flush, rename,
/// then (optionally) fsync of file and parent directory.
pub fn save(meta: &ClusterMeta, path: &str, do_fsync: bool) -> Result<(), ClusterError> {
    let content = render(meta);
    write_atomic(path, &content, do_fsync)?;
    Ok(())
}

fn write_atomic(path: &str, content: &str, do_fsync: bool) -> io::Result<()> {
    let tmp_path = format!("{}.tmp-{}", path, std::process::id());
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(content.as_bytes())?;
        if do_fsync {
            tmp.sync_all()?;
        }
    }
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if do_fsync {
        if let Some(parent) = Path::new(path).parent() {
            let dir = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            File::open(dir)?.sync_all()?;
        }
    }
    Ok(())
}
