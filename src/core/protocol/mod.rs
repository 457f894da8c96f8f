// src/core/protocol/mod.rs

//! The cluster bus wire protocol: message model and binary codec.

pub mod codec;
pub mod message;

pub use codec::BusCodec;
pub use message::{ClusterMsg, GossipEntry, MsgExtension, MsgFlags, MsgHeader, MsgPayload, MsgType};
