//! Error taxonomy shared by every layer of the stack.

use std::fmt;
use thiserror::Error;

use crate::address::{AddressKind, AddressRange};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, MeshError>;

/// Mesh errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Malformed or out-of-place PDU
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// MIC or confirmation value did not verify
    #[error("authentication failure")]
    AuthenticationFailure,

    /// Partial segmented message expired before completion
    #[error("reassembly timeout (src={src:04X}, seq_zero={seq_zero})")]
    ReassemblyTimeout { src: u16, seq_zero: u16 },

    /// No address block available
    #[error("no {0} unicast address(es) available")]
    Exhausted(u8),

    /// Address range conflicts with an already registered one
    #[error("{kind} range {requested} overlaps {existing}")]
    Overlap {
        kind: AddressKind,
        requested: AddressRange,
        existing: AddressRange,
    },

    /// Range outside the bounds of its address kind, or low > high
    #[error("invalid {kind} range {low:04X}-{high:04X}")]
    InvalidRange { kind: AddressKind, low: u16, high: u16 },

    /// Persistence collaborator failed
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Referenced key index does not exist
    #[error("unknown {0}")]
    UnknownKey(KeyRef),

    /// Inconsistent configuration (e.g. too many keys sharing one NID)
    #[error("configuration error: {0}")]
    Config(String),

    /// 24-bit sequence space used up; an IV update is required
    #[error("sequence number space exhausted for {0:04X}")]
    SequenceExhausted(u16),

    /// SEQ not newer than the last one seen from this source
    #[error("replayed PDU from {src:04X} (seq={seq})")]
    Replay { src: u16, seq: u32 },

    /// Provisioning attempt ended in a failure state
    #[error("provisioning failed: {0}")]
    Provisioning(crate::provisioning::FailureReason),
}

/// Identifies a key in [`MeshError::UnknownKey`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef {
    Network(u16),
    Application(u16),
    /// Device key of the node at this unicast address
    Device(u16),
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRef::Network(i) => write!(f, "network key {}", i),
            KeyRef::Application(i) => write!(f, "application key {}", i),
            KeyRef::Device(addr) => write!(f, "device key of {:04X}", addr),
        }
    }
}

impl MeshError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        MeshError::ProtocolViolation(msg.into())
    }

    /// True for errors that must be dropped silently when they come from
    /// ordinary network traffic.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            MeshError::AuthenticationFailure | MeshError::Replay { .. }
        )
    }
}
