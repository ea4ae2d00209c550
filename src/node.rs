//! Provisioned node records and the registry that owns them
//!
//! The registry is an arena keyed by primary unicast address. Elements are
//! addressed by offset from the primary address, so element lookups go
//! through the registry rather than through back-pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::address::{AddressKind, AddressRange, UNICAST_MAX};
use crate::composition::{CompositionData, Element};
use crate::error::{MeshError, Result};
use crate::keys::DeviceKey;
use crate::network::iv::IvIndex;
use crate::network::NetworkLayer;
use crate::provisioning::pdu::Capabilities;

/// A provisioned node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Device UUID from the unprovisioned device beacon, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_uuid: Option<String>,
    pub unicast_address: u16,
    pub device_key: DeviceKey,
    pub element_count: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition: Option<CompositionData>,
    pub net_key_indices: Vec<u16>,
    #[serde(default)]
    pub app_key_indices: Vec<u16>,
    pub iv_index: IvIndex,
    /// Next sequence number the node is known to use
    #[serde(default)]
    pub sequence_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<u8>,
    pub provisioned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        unicast_address: u16,
        element_count: u8,
        device_key: DeviceKey,
        net_key_index: u16,
        iv_index: IvIndex,
    ) -> Self {
        Self {
            name: name.into(),
            device_uuid: None,
            unicast_address,
            device_key,
            element_count,
            composition: None,
            net_key_indices: vec![net_key_index],
            app_key_indices: Vec::new(),
            iv_index,
            sequence_number: 0,
            default_ttl: None,
            provisioned_at: Utc::now(),
            capabilities: None,
        }
    }

    /// Unicast addresses occupied by the node's elements
    pub fn address_range(&self) -> AddressRange {
        let last = self.unicast_address as u32 + self.element_count.max(1) as u32 - 1;
        AddressRange::new(self.unicast_address, last.min(UNICAST_MAX as u32) as u16)
    }

    pub fn contains_address(&self, address: u16) -> bool {
        self.address_range().contains(address)
    }

    pub fn element_address(&self, index: usize) -> Option<u16> {
        (index < self.element_count as usize)
            .then(|| CompositionData::element_address(self.unicast_address, index))
    }

    /// Attach composition data; its element count must match what the
    /// device reported during provisioning. Elements get their unicast
    /// addresses from the node's primary address.
    pub fn set_composition(&mut self, mut composition: CompositionData) -> Result<()> {
        if composition.elements.len() != self.element_count as usize {
            return Err(MeshError::malformed(format!(
                "composition data lists {} elements, node {:04X} has {}",
                composition.elements.len(),
                self.unicast_address,
                self.element_count
            )));
        }
        composition.assign_addresses(self.unicast_address);
        self.composition = Some(composition);
        Ok(())
    }

    /// Record a sequence number seen from or used by the node; never moves backwards
    pub fn observe_sequence(&mut self, seq: u32) {
        self.sequence_number = self.sequence_number.max(seq.saturating_add(1));
    }

    /// Copy the SEQ and IV index of the network layer running as this node,
    /// ready to be written back through the store
    pub fn record_network_state(&mut self, network: &NetworkLayer) {
        self.sequence_number = self.sequence_number.max(network.sequence().current());
        self.iv_index = network.iv_index();
    }
}

/// All provisioned nodes, keyed by primary unicast address
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<u16, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Its element addresses must not overlap another node's.
    pub fn insert(&mut self, node: Node) -> Result<()> {
        let range = node.address_range();
        if let Some(existing) = self
            .nodes
            .values()
            .filter(|n| n.unicast_address != node.unicast_address)
            .map(Node::address_range)
            .find(|r| r.overlaps(&range))
        {
            return Err(MeshError::Overlap {
                kind: AddressKind::Unicast,
                requested: range,
                existing,
            });
        }
        self.nodes.insert(node.unicast_address, node);
        Ok(())
    }

    pub fn remove(&mut self, unicast_address: u16) -> Option<Node> {
        self.nodes.remove(&unicast_address)
    }

    pub fn get(&self, unicast_address: u16) -> Option<&Node> {
        self.nodes.get(&unicast_address)
    }

    pub fn get_mut(&mut self, unicast_address: u16) -> Option<&mut Node> {
        self.nodes.get_mut(&unicast_address)
    }

    /// Node owning the element at `address`
    pub fn node_for_address(&self, address: u16) -> Option<&Node> {
        self.nodes
            .range(..=address)
            .next_back()
            .map(|(_, node)| node)
            .filter(|node| node.contains_address(address))
    }

    /// Node and element index for an element address
    pub fn element_index(&self, address: u16) -> Option<(&Node, usize)> {
        self.node_for_address(address)
            .map(|node| (node, (address - node.unicast_address) as usize))
    }

    /// Composition element at `address`, when the node's composition is known
    pub fn element(&self, address: u16) -> Option<&Element> {
        let node = self.node_for_address(address)?;
        node.composition
            .as_ref()?
            .element_by_address(node.unicast_address, address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::MeshModel;

    fn node(address: u16, elements: u8) -> Node {
        Node::new(
            format!("node-{:04X}", address),
            address,
            elements,
            DeviceKey([address as u8; 16]),
            0,
            IvIndex::new(0),
        )
    }

    #[test]
    fn test_element_lookup_by_address() {
        let mut registry = NodeRegistry::new();
        registry.insert(node(0x0100, 3)).unwrap();
        registry.insert(node(0x0200, 1)).unwrap();

        assert_eq!(registry.element_index(0x0102).map(|(n, i)| (n.unicast_address, i)), Some((0x0100, 2)));
        assert_eq!(registry.element_index(0x0200).map(|(n, i)| (n.unicast_address, i)), Some((0x0200, 0)));
        assert!(registry.node_for_address(0x0103).is_none());
        assert!(registry.node_for_address(0x00FF).is_none());
    }

    #[test]
    fn test_overlapping_nodes_rejected() {
        let mut registry = NodeRegistry::new();
        registry.insert(node(0x0100, 3)).unwrap();
        let err = registry.insert(node(0x0102, 1)).unwrap_err();
        assert!(matches!(err, MeshError::Overlap { kind: AddressKind::Unicast, .. }));
        // Re-provisioning the same primary address replaces the record
        registry.insert(node(0x0100, 2)).unwrap();
        assert_eq!(registry.get(0x0100).unwrap().element_count, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_composition_must_match_element_count() {
        let mut n = node(0x0010, 2);
        let composition = CompositionData {
            company_id: 0x0059,
            product_id: 1,
            version_id: 1,
            crpl: 8,
            features: Default::default(),
            elements: vec![
                Element::new(0x0100, vec![MeshModel::sig(0x0000)]),
                Element::new(0x0101, vec![MeshModel::sig(0x1000)]),
            ],
        };
        let mut single = composition.clone();
        single.elements.truncate(1);
        assert!(n.set_composition(single).is_err());
        n.set_composition(composition).unwrap();

        let mut registry = NodeRegistry::new();
        registry.insert(n).unwrap();
        let element = registry.element(0x0011).unwrap();
        assert_eq!(element.location, 0x0101);
        assert_eq!(element.address, 0x0011);
        assert_eq!(element.models, vec![MeshModel::sig(0x1000)]);
        assert_eq!(registry.element(0x0010).unwrap().address, 0x0010);
    }

    #[test]
    fn test_sequence_never_moves_backwards() {
        let mut n = node(0x0001, 1);
        n.observe_sequence(10);
        n.observe_sequence(3);
        assert_eq!(n.sequence_number, 11);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut n = node(0x0005, 1);
        n.device_uuid = Some("0011223344556677".into());
        let json = serde_json::to_string(&n).unwrap();
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, n);
    }
}
