// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use crate::core::node::NodeId;
use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the node.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid node identifier")]
    InvalidNodeId,

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Invalid slot")]
    InvalidSlot,

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Persistence Error: {0}")]
    ConfigPersistence(String),

    #[error("Malformed node table line {0}: {1}")]
    ConfigParse(usize, String),

    #[error("Internal Error: {0}")]
    Internal(String),

    // --- Routing errors ---
    /// A redirect indicating that a key/slot is served by a different node.
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    /// A temporary redirect for a slot that is currently being migrated.
    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: String },

    /// A multi-key command was attempted on keys in different slots.
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    /// Keys of a multi-key command are split between migration source and
    /// destination; the client should retry shortly.
    #[error("TRYAGAIN Multiple keys request during rehashing of slot")]
    TryAgain,

    /// The cluster is down or a slot is unassigned.
    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for ClusterError {
    fn clone(&self) -> Self {
        match self {
            ClusterError::Io(e) => ClusterError::Io(Arc::clone(e)),
            ClusterError::InvalidNodeId => ClusterError::InvalidNodeId,
            ClusterError::UnknownNode(id) => ClusterError::UnknownNode(*id),
            ClusterError::InvalidSlot => ClusterError::InvalidSlot,
            ClusterError::NotAnInteger => ClusterError::NotAnInteger,
            ClusterError::InvalidRequest(s) => ClusterError::InvalidRequest(s.clone()),
            ClusterError::InvalidState(s) => ClusterError::InvalidState(s.clone()),
            ClusterError::ConfigPersistence(s) => ClusterError::ConfigPersistence(s.clone()),
            ClusterError::ConfigParse(n, s) => ClusterError::ConfigParse(*n, s.clone()),
            ClusterError::Internal(s) => ClusterError::Internal(s.clone()),
            ClusterError::Moved { slot, addr } => ClusterError::Moved {
                slot: *slot,
                addr: addr.clone(),
            },
            ClusterError::Ask { slot, addr } => ClusterError::Ask {
                slot: *slot,
                addr: addr.clone(),
            },
            ClusterError::CrossSlot => ClusterError::CrossSlot,
            ClusterError::TryAgain => ClusterError::TryAgain,
            ClusterError::ClusterDown(s) => ClusterError::ClusterDown(s.clone()),
        }
    }
}

impl PartialEq for ClusterError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClusterError::Io(e1), ClusterError::Io(e2)) => e1.to_string() == e2.to_string(),
            (ClusterError::UnknownNode(a), ClusterError::UnknownNode(b)) => a == b,
            (ClusterError::InvalidRequest(a), ClusterError::InvalidRequest(b)) => a == b,
            (ClusterError::InvalidState(a), ClusterError::InvalidState(b)) => a == b,
            (ClusterError::ConfigPersistence(a), ClusterError::ConfigPersistence(b)) => a == b,
            (ClusterError::ConfigParse(n1, a), ClusterError::ConfigParse(n2, b)) => {
                n1 == n2 && a == b
            }
            (ClusterError::Internal(a), ClusterError::Internal(b)) => a == b,
            (ClusterError::ClusterDown(a), ClusterError::ClusterDown(b)) => a == b,
            (
                ClusterError::Moved { slot: s1, addr: a1 },
                ClusterError::Moved { slot: s2, addr: a2 },
            ) => s1 == s2 && a1 == a2,
            (
                ClusterError::Ask { slot: s1, addr: a1 },
                ClusterError::Ask { slot: s2, addr: a2 },
            ) => s1 == s2 && a1 == a2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Io(Arc::new(e))
    }
}

impl From<ParseIntError> for ClusterError {
    fn from(_: ParseIntError) -> Self {
        ClusterError::NotAnInteger
    }
}

impl From<std::str::Utf8Error> for ClusterError {
    fn from(_: std::str::Utf8Error) -> Self {
        ClusterError::InvalidRequest("invalid UTF-8".to_string())
    }
}
