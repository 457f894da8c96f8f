// src/core/node.rs

//! Node records: identifiers, flags, liveness timestamps and failure reports.

use crate::core::errors::ClusterError;
use crate::core::slot_map::SlotBitmap;
use bitflags::bitflags;
use std::fmt;

/// Length of a node (and shard) identifier: 40 lowercase hex characters.
pub const NODE_ID_LEN: usize = 40;

/// A stable 40-character hexadecimal node identifier.
///
/// The same representation is used for shard identifiers, which share the
/// format. Comparison order is plain byte order, which the election collision
/// rule and replica migration rely on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

/// Shard identifiers share the node identifier format.
pub type ShardId = NodeId;

impl NodeId {
    /// Generates a fresh random identifier (20 random bytes, hex encoded).
    pub fn random() -> Self {
        let raw: [u8; 20] = rand::random();
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(hex::encode(raw).as_bytes());
        NodeId(out)
    }

    /// Validates and builds an identifier from raw bytes. Only 40 lowercase
    /// hex characters are accepted; anything else is rejected.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, ClusterError> {
        if bytes.len() != NODE_ID_LEN {
            return Err(ClusterError::InvalidNodeId);
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
        {
            return Err(ClusterError::InvalidNodeId);
        }
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(bytes);
        Ok(NodeId(out))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII hex.
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl std::str::FromStr for NodeId {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeId::try_from_bytes(s.as_bytes())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.as_str())
    }
}

bitflags! {
    /// Flags representing the role and state of a cluster node.
    ///
    /// The bit values are carried verbatim in the heartbeat header `flags`
    /// field and must stay stable across versions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u16 {
        const PRIMARY    = 1 << 0;
        const REPLICA    = 1 << 1;
        const PFAIL      = 1 << 2;
        const FAIL       = 1 << 3;
        const MYSELF     = 1 << 4;
        const HANDSHAKE  = 1 << 5;
        const NOADDR     = 1 << 6;
        const MEET       = 1 << 7;
        const MIGRATE_TO = 1 << 8;
        const NOFAILOVER = 1 << 9;
    }
}

impl NodeFlags {
    /// Renders the comma-separated flags token of the node table line format.
    pub fn render(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if self.contains(NodeFlags::MYSELF) {
            parts.push("myself");
        }
        if self.contains(NodeFlags::PRIMARY) {
            parts.push("master");
        }
        if self.contains(NodeFlags::REPLICA) {
            parts.push("slave");
        }
        if self.contains(NodeFlags::PFAIL) {
            parts.push("fail?");
        }
        if self.contains(NodeFlags::FAIL) {
            parts.push("fail");
        }
        if self.contains(NodeFlags::HANDSHAKE) {
            parts.push("handshake");
        }
        if self.contains(NodeFlags::NOADDR) {
            parts.push("noaddr");
        }
        if self.contains(NodeFlags::NOFAILOVER) {
            parts.push("nofailover");
        }
        if parts.is_empty() {
            parts.push("noflags");
        }
        parts.join(",")
    }

    /// Parses the flags token. Unknown names reject the containing record.
    pub fn parse(token: &str) -> Result<Self, ClusterError> {
        let mut flags = NodeFlags::empty();
        for part in token.split(',') {
            flags |= match part {
                "myself" => NodeFlags::MYSELF,
                "master" => NodeFlags::PRIMARY,
                "slave" => NodeFlags::REPLICA,
                "fail?" => NodeFlags::PFAIL,
                "fail" => NodeFlags::FAIL,
                "handshake" => NodeFlags::HANDSHAKE,
                "noaddr" => NodeFlags::NOADDR,
                "nofailover" => NodeFlags::NOFAILOVER,
                "noflags" => NodeFlags::empty(),
                other => {
                    return Err(ClusterError::InvalidRequest(format!(
                        "unknown node flag '{other}'"
                    )));
                }
            };
        }
        Ok(flags)
    }
}

/// A failure report: a primary told us (through gossip) that it considers the
/// target node as failing.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub reporter: NodeId,
    /// Time of the last report from this node, unix milliseconds.
    pub time: u64,
}

/// A cluster participant as seen by the local node.
///
/// The node table in [`crate::core::state::ClusterMeta`] is the sole owner of
/// these records; every cross-reference (slot table, shard index, replica
/// lists, links) is held as an identifier or link id, never as a second
/// owning handle.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub shard_id: ShardId,
    pub flags: NodeFlags,
    /// Latest known IP address. Empty when the NOADDR flag is set.
    pub ip: String,
    /// Latest known client port (the primary one: TLS when serving TLS).
    pub port: u16,
    /// Secondary client port: the non-default of tcp/tls. 0 when absent.
    pub tls_port: u16,
    /// Latest known cluster bus port.
    pub bus_port: u16,
    pub hostname: Option<String>,
    pub nodename: Option<String>,
    /// Last configuration epoch observed for this node.
    pub config_epoch: u64,
    pub slots: SlotBitmap,
    /// Cached population count of `slots`.
    pub numslots: u32,
    /// For replicas, the primary being tracked. `None` for primaries.
    pub replicaof: Option<NodeId>,
    /// For primaries, the known replicas.
    pub replicas: Vec<NodeId>,
    /// Last known replication offset for this node.
    pub repl_offset: i64,
    /// Unix time we received the offset, milliseconds.
    pub repl_offset_time: u64,
    /// Node object creation time.
    pub ctime: u64,
    /// Unix time we sent the latest ping, 0 if we received a pong since.
    pub ping_sent: u64,
    /// Unix time we received the latest pong.
    pub pong_received: u64,
    /// Unix time we received any data from the node.
    pub data_received: u64,
    /// Unix time the FAIL flag was set.
    pub fail_time: u64,
    /// Last time we granted a vote to a replica of this primary.
    pub voted_time: u64,
    /// Start of the orphaned-primary condition, 0 when not orphaned.
    pub orphaned_time: u64,
    pub fail_reports: Vec<FailureReport>,
    /// Heartbeat send counter value when this node last rode a gossip
    /// section, used to avoid duplicates within one packet.
    pub last_in_ping_gossip: u64,
    /// Outbound link id, if connected.
    pub link: Option<u64>,
    /// Inbound link id, if the peer connected to us.
    pub inbound_link: Option<u64>,
    /// An outbound connection attempt is in flight.
    pub connecting: bool,
}

impl Node {
    pub fn new(id: NodeId, flags: NodeFlags, now: u64) -> Self {
        Node {
            id,
            shard_id: NodeId::random(),
            flags,
            ip: String::new(),
            port: 0,
            tls_port: 0,
            bus_port: 0,
            hostname: None,
            nodename: None,
            config_epoch: 0,
            slots: SlotBitmap::new(),
            numslots: 0,
            replicaof: None,
            replicas: Vec::new(),
            repl_offset: 0,
            repl_offset_time: 0,
            ctime: now,
            ping_sent: 0,
            pong_received: 0,
            data_received: 0,
            fail_time: 0,
            voted_time: 0,
            orphaned_time: 0,
            fail_reports: Vec::new(),
            last_in_ping_gossip: 0,
            link: None,
            inbound_link: None,
            connecting: false,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.flags.contains(NodeFlags::PRIMARY)
    }

    pub fn is_replica(&self) -> bool {
        self.flags.contains(NodeFlags::REPLICA)
    }

    pub fn is_myself(&self) -> bool {
        self.flags.contains(NodeFlags::MYSELF)
    }

    pub fn in_handshake(&self) -> bool {
        self.flags.contains(NodeFlags::HANDSHAKE)
    }

    /// FAIL or PFAIL.
    pub fn is_failing(&self) -> bool {
        self.flags.intersects(NodeFlags::FAIL | NodeFlags::PFAIL)
    }

    pub fn has_addr(&self) -> bool {
        !self.flags.contains(NodeFlags::NOADDR)
    }

    /// `ip:port@bus_port`, the address triple of the node table line.
    pub fn addr(&self) -> String {
        format!("{}:{}@{}", self.ip, self.port, self.bus_port)
    }

    /// The `ip:port` pair clients are redirected to.
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Claims a slot in the node's own bitmap. Returns `false` if already
    /// owned.
    pub fn add_slot(&mut self, slot: u16) -> bool {
        let added = self.slots.insert(slot);
        if added {
            self.numslots += 1;
        }
        added
    }

    /// Drops a slot from the node's own bitmap. Returns `false` if not owned.
    pub fn del_slot(&mut self, slot: u16) -> bool {
        let removed = self.slots.remove(slot);
        if removed {
            self.numslots -= 1;
        }
        removed
    }

    pub fn clear_slots(&mut self) {
        self.slots.clear();
        self.numslots = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_bad_input() {
        assert!(NodeId::try_from_bytes(b"deadbeef").is_err());
        assert!(
            NodeId::try_from_bytes(&[b'A'; NODE_ID_LEN]).is_err(),
            "uppercase hex is invalid"
        );
        assert!(NodeId::try_from_bytes(&[b'g'; NODE_ID_LEN]).is_err());
        let ok = NodeId::try_from_bytes(&[b'a'; NODE_ID_LEN]).unwrap();
        assert_eq!(ok.as_str().len(), NODE_ID_LEN);
    }

    #[test]
    fn random_ids_are_valid_and_distinct() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_ne!(a, b);
        assert!(NodeId::try_from_bytes(a.as_bytes()).is_ok());
    }

    #[test]
    fn flags_round_trip_through_text() {
        let flags = NodeFlags::MYSELF | NodeFlags::PRIMARY | NodeFlags::PFAIL;
        assert_eq!(flags.render(), "myself,master,fail?");
        assert_eq!(NodeFlags::parse("myself,master,fail?").unwrap(), flags);
        assert_eq!(NodeFlags::parse("noflags").unwrap(), NodeFlags::empty());
        assert!(NodeFlags::parse("bogus").is_err());
    }

    #[test]
    fn slot_accounting_tracks_bitmap() {
        let mut node = Node::new(NodeId::random(), NodeFlags::PRIMARY, 0);
        assert!(node.add_slot(42));
        assert!(!node.add_slot(42));
        assert_eq!(node.numslots, 1);
        assert_eq!(node.slots.count(), node.numslots);
        assert!(node.del_slot(42));
        assert_eq!(node.numslots, 0);
    }
}
