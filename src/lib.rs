//! Bluetooth Mesh provisioner
//!
//! Provisioning state machine, mesh key derivation, address allocation and
//! the network/transport PDU engine used to talk to provisioned nodes.

pub mod address;
pub mod composition;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod network;
pub mod node;
pub mod provisioning;
pub mod store;
pub mod transport;

pub use error::{MeshError, Result};
