// src/core/protocol/message.rs

//! In-memory model of cluster bus packets.
//!
//! The binary layout lives in [`super::codec`]; this module only defines the
//! decoded shapes and the stable numeric identifiers shared with every other
//! implementation of the bus.

use crate::core::node::{NodeFlags, NodeId, ShardId};
use crate::core::slot_map::SlotBitmap;
use bitflags::bitflags;
use bytes::Bytes;

/// Bus protocol version. Packets with any other version are dropped.
pub const PROTO_VER: u16 = 1;

/// Number of distinct message types, sizing the per-type stat arrays.
pub const MSG_TYPE_COUNT: usize = 11;

/// Message types. The numeric values are wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Ping = 0,
    Pong = 1,
    Meet = 2,
    Fail = 3,
    Publish = 4,
    AuthRequest = 5,
    AuthAck = 6,
    Update = 7,
    MfStart = 8,
    Module = 9,
    PublishShard = 10,
}

impl MsgType {
    pub fn from_wire(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => MsgType::Ping,
            1 => MsgType::Pong,
            2 => MsgType::Meet,
            3 => MsgType::Fail,
            4 => MsgType::Publish,
            5 => MsgType::AuthRequest,
            6 => MsgType::AuthAck,
            7 => MsgType::Update,
            8 => MsgType::MfStart,
            9 => MsgType::Module,
            10 => MsgType::PublishShard,
            _ => return None,
        })
    }

    /// PING, PONG and MEET share the heartbeat layout.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, MsgType::Ping | MsgType::Pong | MsgType::Meet)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MsgType::Ping => "ping",
            MsgType::Pong => "pong",
            MsgType::Meet => "meet",
            MsgType::Fail => "fail",
            MsgType::Publish => "publish",
            MsgType::AuthRequest => "auth-req",
            MsgType::AuthAck => "auth-ack",
            MsgType::Update => "update",
            MsgType::MfStart => "mfstart",
            MsgType::Module => "module",
            MsgType::PublishShard => "publishshard",
        }
    }
}

bitflags! {
    /// Per-message flags (first byte of the three-byte flag area).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u8 {
        /// Sender is a primary paused for manual failover.
        const PAUSED   = 1 << 0;
        /// Grant the vote even if the primary looks reachable.
        const FORCEACK = 1 << 1;
        /// The packet carries an extension section after the gossip entries.
        const EXT_DATA = 1 << 2;
    }
}

/// The fixed header every bus packet starts with.
#[derive(Debug, Clone)]
pub struct MsgHeader {
    pub mtype: MsgType,
    /// Sender's client TCP port.
    pub port: u16,
    /// Sender's view of the cluster-wide epoch.
    pub current_epoch: u64,
    /// Sender's config epoch; for replicas, that of their primary.
    pub config_epoch: u64,
    /// Master replication offset for primaries, processed offset for
    /// replicas.
    pub repl_offset: i64,
    pub sender: NodeId,
    pub slots: SlotBitmap,
    /// The sender's primary, or `None` when the sender is a primary
    /// (all-zero on the wire).
    pub replicaof: Option<NodeId>,
    /// Sender's announced IP; `None` (all-zero) means "use the peer socket
    /// address".
    pub ip: Option<String>,
    /// Secondary client port: the non-default of tcp/tls.
    pub tls_port: u16,
    /// Sender's bus port.
    pub bus_port: u16,
    pub flags: NodeFlags,
    /// Sender's cluster state: OK(0) or FAIL(1).
    pub state_fail: bool,
    pub mflags: MsgFlags,
}

/// One 104-byte gossip section entry.
#[derive(Debug, Clone)]
pub struct GossipEntry {
    pub id: NodeId,
    /// Seconds resolution on the wire.
    pub ping_sent_s: u32,
    pub pong_received_s: u32,
    pub ip: String,
    pub port: u16,
    pub bus_port: u16,
    pub flags: NodeFlags,
    pub tls_port: u16,
}

/// Extension TLVs ride on heartbeats when `MsgFlags::EXT_DATA` is set.
/// The numeric tags are wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgExtension {
    /// Announced hostname, NUL-terminated on the wire.
    Hostname(String),
    /// A node the sender recently forgot; receivers blacklist it for `ttl_s`.
    ForgottenNode { id: NodeId, ttl_s: u64 },
    /// Sender's shard identifier.
    ShardId(ShardId),
    /// Announced human-readable node name.
    Nodename(String),
}

pub const EXT_TYPE_HOSTNAME: u16 = 0;
pub const EXT_TYPE_FORGOTTEN_NODE: u16 = 1;
pub const EXT_TYPE_SHARD_ID: u16 = 2;
pub const EXT_TYPE_NODENAME: u16 = 3;

/// The type-specific portion of a packet.
#[derive(Debug, Clone)]
pub enum MsgPayload {
    /// PING / PONG / MEET.
    Heartbeat {
        gossip: Vec<GossipEntry>,
        extensions: Vec<MsgExtension>,
    },
    Fail {
        target: NodeId,
    },
    /// PUBLISH / PUBLISHSHARD; which one is in the header type.
    Publish {
        channel: Bytes,
        message: Bytes,
    },
    Update {
        config_epoch: u64,
        node: NodeId,
        slots: SlotBitmap,
    },
    /// AUTH_REQ / AUTH_ACK / MFSTART carry no payload.
    Empty,
    Module {
        module_id: u64,
        subtype: u8,
        payload: Bytes,
    },
}

/// A complete decoded bus packet.
#[derive(Debug, Clone)]
pub struct ClusterMsg {
    pub header: MsgHeader,
    pub payload: MsgPayload,
}
