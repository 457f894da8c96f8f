// src/core/protocol/codec.rs

//! Binary encoder/decoder for cluster bus packets.
//!
//! Every multi-byte integer is big-endian and every field sits at a fixed
//! offset; the layout is shared across implementations and releases, so the
//! constants below are wire format. Senders zero all reserved bytes;
//! receivers never rely on them.

use crate::core::errors::ClusterError;
use crate::core::node::{NODE_ID_LEN, NodeFlags, NodeId};
use crate::core::protocol::message::*;
use crate::core::slot_map::{SLOT_BITMAP_LEN, SlotBitmap};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// Packet signature, first four bytes of every message.
pub const MSG_SIGNATURE: &[u8; 4] = b"RCmb";

/// Fixed header length; also the total length of payload-less packets.
pub const HEADER_LEN: usize = 2256;

/// Length of one gossip section entry.
pub const GOSSIP_ENTRY_LEN: usize = 104;

/// Fixed size of the announced-IP fields (NUL-padded).
pub const IP_LEN: usize = 46;

/// Receive buffer sizing: initial allocation and the preallocation ceiling
/// past which growth becomes linear.
pub const RCVBUF_INIT_LEN: usize = 1024;
pub const RCVBUF_MAX_PREALLOC: usize = 1 << 20;

/// Upper bound on a single packet; a declared length beyond this means the
/// stream cannot be trusted and the link is reset.
const PACKET_MAX_LEN: usize = 256 << 20;

/// UPDATE payload: config epoch + node id + slot bitmap.
const UPDATE_PAYLOAD_LEN: usize = 8 + NODE_ID_LEN + SLOT_BITMAP_LEN;

/// MODULE payload prologue: module id + length + subtype.
const MODULE_PROLOGUE_LEN: usize = 8 + 4 + 1;

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Encodes a complete packet to its wire form.
pub fn encode_msg(msg: &ClusterMsg) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 256);
    let mut codec = BusCodec::new();
    // Encoding of a well-formed in-memory message cannot fail.
    codec
        .encode(msg, &mut buf)
        .unwrap_or_else(|_| unreachable!("encoding a ClusterMsg is infallible"));
    buf.freeze()
}

/// Stateless codec for the cluster bus byte stream.
#[derive(Debug, Default)]
pub struct BusCodec {
    _priv: (),
}

impl BusCodec {
    pub fn new() -> Self {
        BusCodec { _priv: () }
    }
}

fn put_fixed_str(dst: &mut BytesMut, s: Option<&str>, len: usize) {
    match s {
        Some(s) if s.len() < len => {
            dst.put_slice(s.as_bytes());
            dst.put_bytes(0, len - s.len());
        }
        // Too long to fit with the trailing NUL: announce nothing rather
        // than a truncated name.
        _ => dst.put_bytes(0, len),
    }
}

fn get_fixed_str(src: &[u8]) -> Option<String> {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&src[..end]).ok().map(str::to_owned)
}

impl Encoder<&ClusterMsg> for BusCodec {
    type Error = ClusterError;

    fn encode(&mut self, msg: &ClusterMsg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        let h = &msg.header;

        dst.put_slice(MSG_SIGNATURE);
        dst.put_u32(0); // total length, patched below
        dst.put_u16(PROTO_VER);
        dst.put_u16(h.port);
        dst.put_u16(h.mtype as u16);
        let count = match &msg.payload {
            MsgPayload::Heartbeat { gossip, .. } => gossip.len() as u16,
            _ => 0,
        };
        dst.put_u16(count);
        dst.put_u64(h.current_epoch);
        dst.put_u64(h.config_epoch);
        dst.put_u64(h.repl_offset as u64);
        dst.put_slice(h.sender.as_bytes());
        dst.put_slice(h.slots.as_bytes());
        match &h.replicaof {
            Some(primary) => dst.put_slice(primary.as_bytes()),
            None => dst.put_bytes(0, NODE_ID_LEN),
        }
        put_fixed_str(dst, h.ip.as_deref(), IP_LEN);
        let ext_count = match &msg.payload {
            MsgPayload::Heartbeat { extensions, .. } => extensions.len() as u16,
            _ => 0,
        };
        dst.put_u16(ext_count);
        dst.put_bytes(0, 30); // reserved
        dst.put_u16(h.tls_port);
        dst.put_u16(h.bus_port);
        dst.put_u16(h.flags.bits());
        dst.put_u8(h.state_fail as u8);
        dst.put_u8(h.mflags.bits());
        dst.put_bytes(0, 2);
        debug_assert_eq!(dst.len() - start, HEADER_LEN);

        match &msg.payload {
            MsgPayload::Heartbeat { gossip, extensions } => {
                for entry in gossip {
                    let entry_start = dst.len();
                    dst.put_slice(entry.id.as_bytes());
                    dst.put_u32(entry.ping_sent_s);
                    dst.put_u32(entry.pong_received_s);
                    put_fixed_str(dst, Some(&entry.ip), IP_LEN);
                    dst.put_u16(entry.port);
                    dst.put_u16(entry.bus_port);
                    dst.put_u16(entry.flags.bits());
                    dst.put_u16(entry.tls_port);
                    dst.put_bytes(0, 2);
                    debug_assert_eq!(dst.len() - entry_start, GOSSIP_ENTRY_LEN);
                }
                for ext in extensions {
                    encode_extension(dst, ext);
                }
            }
            MsgPayload::Fail { target } => dst.put_slice(target.as_bytes()),
            MsgPayload::Publish { channel, message } => {
                dst.put_u32(channel.len() as u32);
                dst.put_u32(message.len() as u32);
                dst.put_slice(channel);
                dst.put_slice(message);
            }
            MsgPayload::Update {
                config_epoch,
                node,
                slots,
            } => {
                dst.put_u64(*config_epoch);
                dst.put_slice(node.as_bytes());
                dst.put_slice(slots.as_bytes());
            }
            MsgPayload::Empty => {}
            MsgPayload::Module {
                module_id,
                subtype,
                payload,
            } => {
                dst.put_u64(*module_id);
                dst.put_u32(payload.len() as u32);
                dst.put_u8(*subtype);
                dst.put_slice(payload);
            }
        }

        let totlen = (dst.len() - start) as u32;
        dst[start + 4..start + 8].copy_from_slice(&totlen.to_be_bytes());
        Ok(())
    }
}

fn encode_extension(dst: &mut BytesMut, ext: &MsgExtension) {
    match ext {
        MsgExtension::Hostname(name) | MsgExtension::Nodename(name) => {
            let ext_type = match ext {
                MsgExtension::Hostname(_) => EXT_TYPE_HOSTNAME,
                _ => EXT_TYPE_NODENAME,
            };
            let body_len = align8(name.len() + 1);
            dst.put_u32((8 + body_len) as u32);
            dst.put_u16(ext_type);
            dst.put_u16(0);
            dst.put_slice(name.as_bytes());
            dst.put_bytes(0, body_len - name.len());
        }
        MsgExtension::ForgottenNode { id, ttl_s } => {
            dst.put_u32((8 + NODE_ID_LEN + 8) as u32);
            dst.put_u16(EXT_TYPE_FORGOTTEN_NODE);
            dst.put_u16(0);
            dst.put_slice(id.as_bytes());
            dst.put_u64(*ttl_s);
        }
        MsgExtension::ShardId(id) => {
            dst.put_u32((8 + NODE_ID_LEN) as u32);
            dst.put_u16(EXT_TYPE_SHARD_ID);
            dst.put_u16(0);
            dst.put_slice(id.as_bytes());
        }
    }
}

impl Decoder for BusCodec {
    type Item = ClusterMsg;
    type Error = ClusterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClusterMsg>, Self::Error> {
        loop {
            if src.len() < 8 {
                if src.capacity() < RCVBUF_INIT_LEN {
                    src.reserve(RCVBUF_INIT_LEN - src.len());
                }
                return Ok(None);
            }
            if &src[0..4] != MSG_SIGNATURE {
                return Err(ClusterError::InvalidRequest(
                    "bad message signature on cluster bus".to_string(),
                ));
            }
            let totlen = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
            if totlen < 8 || totlen > PACKET_MAX_LEN {
                return Err(ClusterError::InvalidRequest(format!(
                    "bad message length {totlen} on cluster bus"
                )));
            }
            if src.len() < totlen {
                // Grow toward the full declared packet: double while small,
                // linear past the preallocation ceiling.
                if src.capacity() < totlen {
                    let target = if totlen < RCVBUF_MAX_PREALLOC {
                        totlen * 2
                    } else {
                        totlen + RCVBUF_MAX_PREALLOC
                    };
                    src.reserve(target - src.len());
                }
                return Ok(None);
            }

            let frame = src.split_to(totlen);
            if src.is_empty() && src.capacity() > RCVBUF_INIT_LEN {
                *src = BytesMut::with_capacity(RCVBUF_INIT_LEN);
            }
            match parse_frame(frame.freeze()) {
                Ok(msg) => return Ok(Some(msg)),
                // Malformed packets are dropped without resetting the link.
                Err(reason) => {
                    debug!("Dropping cluster bus packet: {reason}");
                    continue;
                }
            }
        }
    }
}

fn parse_frame(frame: Bytes) -> Result<ClusterMsg, String> {
    if frame.len() < HEADER_LEN {
        return Err(format!("truncated header ({} bytes)", frame.len()));
    }
    let ver = u16::from_be_bytes([frame[8], frame[9]]);
    if ver != PROTO_VER {
        return Err(format!("protocol version {ver}"));
    }
    let raw_type = u16::from_be_bytes([frame[12], frame[13]]);
    let mtype = MsgType::from_wire(raw_type).ok_or_else(|| format!("unknown type {raw_type}"))?;
    let count = u16::from_be_bytes([frame[14], frame[15]]) as usize;

    // Validate total length for the type before any payload parsing.
    let ext_data = MsgFlags::from_bits_truncate(frame[2253]).contains(MsgFlags::EXT_DATA);
    let expected = match mtype {
        MsgType::Ping | MsgType::Pong | MsgType::Meet => HEADER_LEN + count * GOSSIP_ENTRY_LEN,
        MsgType::Fail => HEADER_LEN + NODE_ID_LEN,
        MsgType::Publish | MsgType::PublishShard => {
            if frame.len() < HEADER_LEN + 8 {
                return Err("publish payload truncated".to_string());
            }
            let channel_len =
                u32::from_be_bytes(frame[HEADER_LEN..HEADER_LEN + 4].try_into().unwrap()) as usize;
            let message_len =
                u32::from_be_bytes(frame[HEADER_LEN + 4..HEADER_LEN + 8].try_into().unwrap())
                    as usize;
            HEADER_LEN
                .checked_add(8)
                .and_then(|n| n.checked_add(channel_len))
                .and_then(|n| n.checked_add(message_len))
                .ok_or("publish length overflow")?
        }
        MsgType::Update => HEADER_LEN + UPDATE_PAYLOAD_LEN,
        MsgType::AuthRequest | MsgType::AuthAck | MsgType::MfStart => HEADER_LEN,
        MsgType::Module => {
            if frame.len() < HEADER_LEN + MODULE_PROLOGUE_LEN {
                return Err("module payload truncated".to_string());
            }
            let len =
                u32::from_be_bytes(frame[HEADER_LEN + 8..HEADER_LEN + 12].try_into().unwrap())
                    as usize;
            HEADER_LEN + MODULE_PROLOGUE_LEN + len
        }
    };
    if mtype.is_heartbeat() {
        if ext_data {
            if frame.len() < expected {
                return Err(format!(
                    "heartbeat too short for {count} gossip entries ({} bytes)",
                    frame.len()
                ));
            }
        } else if frame.len() != expected {
            return Err(format!(
                "heartbeat length {} != expected {expected}",
                frame.len()
            ));
        }
    } else if frame.len() != expected {
        return Err(format!(
            "{} length {} != expected {expected}",
            mtype.name(),
            frame.len()
        ));
    }

    let sender = NodeId::try_from_bytes(&frame[40..40 + NODE_ID_LEN])
        .map_err(|_| "malformed sender id".to_string())?;
    let slots = SlotBitmap::from_bytes(
        frame[80..80 + SLOT_BITMAP_LEN]
            .try_into()
            .expect("fixed slice length"),
    );
    let replicaof_raw = &frame[2128..2128 + NODE_ID_LEN];
    let replicaof = if replicaof_raw.iter().all(|&b| b == 0) {
        None
    } else {
        Some(
            NodeId::try_from_bytes(replicaof_raw)
                .map_err(|_| "malformed primary id".to_string())?,
        )
    };

    let header = MsgHeader {
        mtype,
        port: u16::from_be_bytes([frame[10], frame[11]]),
        current_epoch: u64::from_be_bytes(frame[16..24].try_into().unwrap()),
        config_epoch: u64::from_be_bytes(frame[24..32].try_into().unwrap()),
        repl_offset: u64::from_be_bytes(frame[32..40].try_into().unwrap()) as i64,
        sender,
        slots,
        replicaof,
        ip: get_fixed_str(&frame[2168..2168 + IP_LEN]),
        tls_port: u16::from_be_bytes([frame[2246], frame[2247]]),
        bus_port: u16::from_be_bytes([frame[2248], frame[2249]]),
        flags: NodeFlags::from_bits_truncate(u16::from_be_bytes([frame[2250], frame[2251]])),
        state_fail: frame[2252] != 0,
        mflags: MsgFlags::from_bits_truncate(frame[2253]),
    };
    let ext_count = u16::from_be_bytes([frame[2214], frame[2215]]) as usize;

    let payload = match mtype {
        MsgType::Ping | MsgType::Pong | MsgType::Meet => {
            let gossip = parse_gossip_section(&frame, count);
            let extensions = if ext_data {
                parse_extensions(
                    &frame[HEADER_LEN + count * GOSSIP_ENTRY_LEN..],
                    ext_count,
                )?
            } else {
                Vec::new()
            };
            MsgPayload::Heartbeat { gossip, extensions }
        }
        MsgType::Fail => MsgPayload::Fail {
            target: NodeId::try_from_bytes(&frame[HEADER_LEN..HEADER_LEN + NODE_ID_LEN])
                .map_err(|_| "malformed fail target id".to_string())?,
        },
        MsgType::Publish | MsgType::PublishShard => {
            let channel_len =
                u32::from_be_bytes(frame[HEADER_LEN..HEADER_LEN + 4].try_into().unwrap()) as usize;
            let bulk = frame.slice(HEADER_LEN + 8..);
            MsgPayload::Publish {
                channel: bulk.slice(..channel_len),
                message: bulk.slice(channel_len..),
            }
        }
        MsgType::Update => {
            let base = HEADER_LEN;
            MsgPayload::Update {
                config_epoch: u64::from_be_bytes(frame[base..base + 8].try_into().unwrap()),
                node: NodeId::try_from_bytes(&frame[base + 8..base + 8 + NODE_ID_LEN])
                    .map_err(|_| "malformed update node id".to_string())?,
                slots: SlotBitmap::from_bytes(
                    frame[base + 8 + NODE_ID_LEN..base + UPDATE_PAYLOAD_LEN]
                        .try_into()
                        .expect("fixed slice length"),
                ),
            }
        }
        MsgType::AuthRequest | MsgType::AuthAck | MsgType::MfStart => MsgPayload::Empty,
        MsgType::Module => MsgPayload::Module {
            module_id: u64::from_be_bytes(frame[HEADER_LEN..HEADER_LEN + 8].try_into().unwrap()),
            subtype: frame[HEADER_LEN + 12],
            payload: frame.slice(HEADER_LEN + MODULE_PROLOGUE_LEN..),
        },
    };

    Ok(ClusterMsg { header, payload })
}

/// Parses the gossip entries. A single malformed identifier discards the
/// whole section: the rest of the packet stays valid, but none of its gossip
/// is trusted.
fn parse_gossip_section(frame: &Bytes, count: usize) -> Vec<GossipEntry> {
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let base = HEADER_LEN + i * GOSSIP_ENTRY_LEN;
        let raw_id = &frame[base..base + NODE_ID_LEN];
        let id = match NodeId::try_from_bytes(raw_id) {
            Ok(id) => id,
            Err(_) => {
                warn!(
                    "Discarding gossip section: malformed node id in entry {i}: {}",
                    hex::encode(raw_id)
                );
                return Vec::new();
            }
        };
        entries.push(GossipEntry {
            id,
            ping_sent_s: u32::from_be_bytes(frame[base + 40..base + 44].try_into().unwrap()),
            pong_received_s: u32::from_be_bytes(frame[base + 44..base + 48].try_into().unwrap()),
            ip: get_fixed_str(&frame[base + 48..base + 48 + IP_LEN]).unwrap_or_default(),
            port: u16::from_be_bytes([frame[base + 94], frame[base + 95]]),
            bus_port: u16::from_be_bytes([frame[base + 96], frame[base + 97]]),
            flags: NodeFlags::from_bits_truncate(u16::from_be_bytes([
                frame[base + 98],
                frame[base + 99],
            ])),
            tls_port: u16::from_be_bytes([frame[base + 100], frame[base + 101]]),
        });
    }
    entries
}

fn parse_extensions(mut body: &[u8], declared: usize) -> Result<Vec<MsgExtension>, String> {
    let mut out = Vec::new();
    let mut seen = 0usize;
    while !body.is_empty() {
        if body.len() < 8 {
            return Err("extension header truncated".to_string());
        }
        let len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
        if len < 8 || len % 8 != 0 || len > body.len() {
            return Err(format!("bad extension length {len}"));
        }
        let ext_type = u16::from_be_bytes([body[4], body[5]]);
        let data = &body[8..len];
        match ext_type {
            EXT_TYPE_HOSTNAME => {
                out.push(MsgExtension::Hostname(
                    get_fixed_str(data).unwrap_or_default(),
                ));
            }
            EXT_TYPE_FORGOTTEN_NODE => {
                if data.len() < NODE_ID_LEN + 8 {
                    return Err("forgotten-node extension truncated".to_string());
                }
                let id = NodeId::try_from_bytes(&data[..NODE_ID_LEN])
                    .map_err(|_| "malformed forgotten-node id".to_string())?;
                let ttl_s =
                    u64::from_be_bytes(data[NODE_ID_LEN..NODE_ID_LEN + 8].try_into().unwrap());
                out.push(MsgExtension::ForgottenNode { id, ttl_s });
            }
            EXT_TYPE_SHARD_ID => {
                if data.len() < NODE_ID_LEN {
                    return Err("shard-id extension truncated".to_string());
                }
                let id = NodeId::try_from_bytes(&data[..NODE_ID_LEN])
                    .map_err(|_| "malformed shard id".to_string())?;
                out.push(MsgExtension::ShardId(id));
            }
            EXT_TYPE_NODENAME => {
                out.push(MsgExtension::Nodename(
                    get_fixed_str(data).unwrap_or_default(),
                ));
            }
            // Unknown extensions from newer peers are skipped.
            _ => {}
        }
        seen += 1;
        body = &body[len..];
    }
    if seen != declared {
        return Err(format!("extension count mismatch: {seen} != {declared}"));
    }
    Ok(out)
}
