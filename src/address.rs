//! Provisioner address ranges and unicast allocation
//!
//! A provisioner owns ranges of unicast, group and scene addresses. Ranges of
//! the same kind may never overlap. Unicast ranges are consumed block by
//! block as nodes get provisioned; group and scene ranges are only validated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{MeshError, Result};

pub const UNASSIGNED_ADDRESS: u16 = 0x0000;
pub const UNICAST_MIN: u16 = 0x0001;
pub const UNICAST_MAX: u16 = 0x7FFF;
pub const GROUP_MIN: u16 = 0xC000;
pub const GROUP_MAX: u16 = 0xFEFF;
pub const SCENE_MIN: u16 = 0x0001;
pub const SCENE_MAX: u16 = 0xFFFF;

pub fn is_unicast(address: u16) -> bool {
    (UNICAST_MIN..=UNICAST_MAX).contains(&address)
}

pub fn is_virtual(address: u16) -> bool {
    (0x8000..=0xBFFF).contains(&address)
}

pub fn is_group(address: u16) -> bool {
    address >= GROUP_MIN
}

/// Kind of address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Unicast,
    Group,
    Scene,
}

impl AddressKind {
    fn bounds(self) -> (u16, u16) {
        match self {
            AddressKind::Unicast => (UNICAST_MIN, UNICAST_MAX),
            AddressKind::Group => (GROUP_MIN, GROUP_MAX),
            AddressKind::Scene => (SCENE_MIN, SCENE_MAX),
        }
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Unicast => write!(f, "unicast"),
            AddressKind::Group => write!(f, "group"),
            AddressKind::Scene => write!(f, "scene"),
        }
    }
}

/// Inclusive `{low, high}` address range. Stored as
/// `{"lowAddress": "0100", "highAddress": "01FF"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    #[serde(rename = "lowAddress", with = "address_hex")]
    pub low: u16,
    #[serde(rename = "highAddress", with = "address_hex")]
    pub high: u16,
}

mod address_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(address: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:04X}", address))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        if text.len() != 4 {
            return Err(D::Error::custom(format!("address {:?} is not 4 hex digits", text)));
        }
        u16::from_str_radix(&text, 16).map_err(D::Error::custom)
    }
}

/// Every range a provisioner owns, as persisted through the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerRanges {
    #[serde(rename = "allocatedUnicastRange", default)]
    pub unicast: Vec<AddressRange>,
    #[serde(rename = "allocatedGroupRange", default)]
    pub group: Vec<AddressRange>,
    #[serde(rename = "allocatedSceneRange", default)]
    pub scene: Vec<AddressRange>,
}

impl ProvisionerRanges {
    pub fn is_empty(&self) -> bool {
        self.unicast.is_empty() && self.group.is_empty() && self.scene.is_empty()
    }
}

impl AddressRange {
    pub fn new(low: u16, high: u16) -> Self {
        Self { low, high }
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.low <= other.high && other.low <= self.high
    }

    pub fn contains(&self, address: u16) -> bool {
        (self.low..=self.high).contains(&address)
    }

    pub fn len(&self) -> u32 {
        self.high as u32 - self.low as u32 + 1
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}-{:04X}", self.low, self.high)
    }
}

/// What to hand back with [`AddressAllocator::release`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// A single unicast address
    Address(u16),
    /// A block of `count` addresses starting at `start` (a node's elements)
    Block { start: u16, count: u8 },
}

/// Address ranges of one provisioner plus the unicast addresses in use
#[derive(Debug, Default, Clone)]
pub struct AddressAllocator {
    unicast: Vec<AddressRange>,
    group: Vec<AddressRange>,
    scene: Vec<AddressRange>,
    assigned: BTreeSet<u16>,
}

/// Allocator shared between concurrent provisioning sessions
pub type SharedAllocator = Arc<tokio::sync::Mutex<AddressAllocator>>;

impl AddressAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedAllocator {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    fn ranges_mut(&mut self, kind: AddressKind) -> &mut Vec<AddressRange> {
        match kind {
            AddressKind::Unicast => &mut self.unicast,
            AddressKind::Group => &mut self.group,
            AddressKind::Scene => &mut self.scene,
        }
    }

    /// Rebuild an allocator from persisted ranges, validating each one again
    pub fn from_ranges(ranges: &ProvisionerRanges) -> Result<Self> {
        let mut allocator = Self::new();
        let sections = [
            (AddressKind::Unicast, &ranges.unicast),
            (AddressKind::Group, &ranges.group),
            (AddressKind::Scene, &ranges.scene),
        ];
        for (kind, list) in sections {
            for range in list {
                allocator.register_range(kind, range.low, range.high)?;
            }
        }
        Ok(allocator)
    }

    /// Registered ranges of every kind, for persisting
    pub fn provisioner_ranges(&self) -> ProvisionerRanges {
        ProvisionerRanges {
            unicast: self.unicast.clone(),
            group: self.group.clone(),
            scene: self.scene.clone(),
        }
    }

    /// Registered ranges of `kind`, sorted by low bound
    pub fn ranges(&self, kind: AddressKind) -> &[AddressRange] {
        match kind {
            AddressKind::Unicast => &self.unicast,
            AddressKind::Group => &self.group,
            AddressKind::Scene => &self.scene,
        }
    }

    /// Register a new range; rejected if it overlaps any range of the same kind
    pub fn register_range(&mut self, kind: AddressKind, low: u16, high: u16) -> Result<()> {
        let (min, max) = kind.bounds();
        if low > high || low < min || high > max {
            return Err(MeshError::InvalidRange { kind, low, high });
        }

        let requested = AddressRange::new(low, high);
        let ranges = self.ranges_mut(kind);
        if let Some(existing) = ranges.iter().find(|r| r.overlaps(&requested)) {
            return Err(MeshError::Overlap {
                kind,
                requested,
                existing: *existing,
            });
        }

        ranges.push(requested);
        ranges.sort_by_key(|r| r.low);
        info!("Registered {} range {}", kind, requested);
        Ok(())
    }

    /// Remove a previously registered range. Assigned addresses are untouched.
    pub fn unregister_range(&mut self, kind: AddressKind, range: AddressRange) -> bool {
        let ranges = self.ranges_mut(kind);
        let before = ranges.len();
        ranges.retain(|r| *r != range);
        before != ranges.len()
    }

    /// First-fit allocation of `count` consecutive unicast addresses
    pub fn allocate_unicast(&mut self, count: u8) -> Result<u16> {
        if count == 0 {
            return Err(MeshError::Exhausted(count));
        }
        let count32 = count as u32;

        let assigned = &self.assigned;
        let found = self.unicast.iter().find_map(|range| {
            let mut candidate = range.low as u32;
            while candidate + count32 - 1 <= range.high as u32 {
                let last = (candidate + count32 - 1) as u16;
                match assigned.range(candidate as u16..=last).next_back() {
                    // Skip past the highest taken address inside the window
                    Some(&taken) => candidate = taken as u32 + 1,
                    None => return Some(candidate as u16),
                }
            }
            None
        });

        if let Some(start) = found {
            self.mark_assigned(start, count);
            debug!("Allocated unicast block {:04X}+{}", start, count);
            return Ok(start);
        }

        Err(MeshError::Exhausted(count))
    }

    /// Record addresses already in use (e.g. nodes loaded from storage)
    pub fn mark_assigned(&mut self, start: u16, count: u8) {
        for offset in 0..count as u32 {
            let address = start as u32 + offset;
            if address <= u16::MAX as u32 {
                self.assigned.insert(address as u16);
            }
        }
    }

    pub fn release(&mut self, target: Release) {
        match target {
            Release::Address(address) => {
                self.assigned.remove(&address);
            }
            Release::Block { start, count } => {
                for offset in 0..count as u32 {
                    let address = start as u32 + offset;
                    if address <= u16::MAX as u32 {
                        self.assigned.remove(&(address as u16));
                    }
                }
            }
        }
        debug!("Released {:?}", target);
    }

    pub fn is_assigned(&self, address: u16) -> bool {
        self.assigned.contains(&address)
    }

    /// Number of unicast addresses still free inside the registered ranges
    pub fn available_unicast(&self) -> u32 {
        self.unicast
            .iter()
            .map(|r| {
                let used = self.assigned.range(r.low..=r.high).count() as u32;
                r.len() - used
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with(low: u16, high: u16) -> AddressAllocator {
        let mut alloc = AddressAllocator::new();
        alloc
            .register_range(AddressKind::Unicast, low, high)
            .unwrap();
        alloc
    }

    #[test]
    fn test_overlap_rejected_for_same_kind() {
        let mut alloc = AddressAllocator::new();
        alloc.register_range(AddressKind::Group, 0xC000, 0xC0FF).unwrap();
        alloc.register_range(AddressKind::Group, 0xC200, 0xC2FF).unwrap();

        for (low, high) in [(0xC0FF, 0xC100), (0xC100, 0xC200), (0xC000, 0xC000), (0xC250, 0xC260)] {
            match alloc.register_range(AddressKind::Group, low, high) {
                Err(MeshError::Overlap { kind, .. }) => assert_eq!(kind, AddressKind::Group),
                other => panic!("expected overlap for {:04X}-{:04X}, got {:?}", low, high, other),
            }
        }

        // Disjoint range slots in between
        alloc.register_range(AddressKind::Group, 0xC100, 0xC1FF).unwrap();
    }

    #[test]
    fn test_ranges_persist_as_hex_records() {
        let mut alloc = allocator_with(0x0100, 0x01FF);
        alloc.register_range(AddressKind::Group, 0xC000, 0xC0FF).unwrap();
        let ranges = alloc.provisioner_ranges();

        let json = serde_json::to_value(&ranges).unwrap();
        assert_eq!(
            json["allocatedUnicastRange"],
            serde_json::json!([{ "lowAddress": "0100", "highAddress": "01FF" }])
        );
        assert_eq!(json["allocatedGroupRange"][0]["lowAddress"], "C000");

        let parsed: ProvisionerRanges = serde_json::from_value(json).unwrap();
        let restored = AddressAllocator::from_ranges(&parsed).unwrap();
        assert_eq!(restored.ranges(AddressKind::Unicast), alloc.ranges(AddressKind::Unicast));
        assert_eq!(restored.ranges(AddressKind::Group), alloc.ranges(AddressKind::Group));
        assert!(restored.ranges(AddressKind::Scene).is_empty());
    }

    #[test]
    fn test_bad_persisted_ranges_rejected() {
        let short = r#"{"allocatedUnicastRange": [{"lowAddress": "100", "highAddress": "01FF"}]}"#;
        assert!(serde_json::from_str::<ProvisionerRanges>(short).is_err());

        let overlapping: ProvisionerRanges = serde_json::from_str(
            r#"{"allocatedUnicastRange": [
                {"lowAddress": "0100", "highAddress": "01FF"},
                {"lowAddress": "0180", "highAddress": "02FF"}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            AddressAllocator::from_ranges(&overlapping),
            Err(MeshError::Overlap { kind: AddressKind::Unicast, .. })
        ));
    }

    #[test]
    fn test_different_kinds_do_not_conflict() {
        let mut alloc = AddressAllocator::new();
        alloc.register_range(AddressKind::Unicast, 0x0001, 0x00FF).unwrap();
        alloc.register_range(AddressKind::Scene, 0x0001, 0x00FF).unwrap();
        assert_eq!(alloc.ranges(AddressKind::Scene).len(), 1);
    }

    #[test]
    fn test_invalid_ranges() {
        let mut alloc = AddressAllocator::new();
        assert!(matches!(
            alloc.register_range(AddressKind::Unicast, 0x0010, 0x0001),
            Err(MeshError::InvalidRange { .. })
        ));
        assert!(matches!(
            alloc.register_range(AddressKind::Unicast, 0x7000, 0x8000),
            Err(MeshError::InvalidRange { .. })
        ));
        assert!(matches!(
            alloc.register_range(AddressKind::Group, 0x0100, 0x0200),
            Err(MeshError::InvalidRange { .. })
        ));
        assert!(matches!(
            alloc.register_range(AddressKind::Scene, 0x0000, 0x0010),
            Err(MeshError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_allocate_from_empty_range() {
        let mut alloc = allocator_with(0x0100, 0x01FF);
        let start = alloc.allocate_unicast(5).unwrap();
        assert_eq!(start, 0x0100);
        for a in 0x0100..0x0105 {
            assert!(alloc.is_assigned(a));
        }
        assert!(!alloc.is_assigned(0x0105));

        // Never reuses until released
        let next = alloc.allocate_unicast(3).unwrap();
        assert_eq!(next, 0x0105);

        alloc.release(Release::Block { start: 0x0100, count: 5 });
        assert_eq!(alloc.allocate_unicast(2).unwrap(), 0x0100);
    }

    #[test]
    fn test_first_fit_skips_holes_too_small() {
        let mut alloc = allocator_with(0x0001, 0x0010);
        alloc.mark_assigned(0x0003, 1);
        // [1,2] is free but too small for 3
        assert_eq!(alloc.allocate_unicast(3).unwrap(), 0x0004);
        assert_eq!(alloc.allocate_unicast(2).unwrap(), 0x0001);
    }

    #[test]
    fn test_allocation_spans_only_one_range() {
        let mut alloc = AddressAllocator::new();
        alloc.register_range(AddressKind::Unicast, 0x0001, 0x0002).unwrap();
        alloc.register_range(AddressKind::Unicast, 0x0003, 0x0004).unwrap();
        // Four contiguous addresses exist, but not inside one range
        assert_eq!(alloc.allocate_unicast(4), Err(MeshError::Exhausted(4)));
        assert_eq!(alloc.available_unicast(), 4);
    }

    #[test]
    fn test_exhausted_has_no_partial_allocation() {
        let mut alloc = allocator_with(0x0001, 0x0004);
        alloc.allocate_unicast(3).unwrap();
        assert_eq!(alloc.allocate_unicast(2), Err(MeshError::Exhausted(2)));
        assert!(!alloc.is_assigned(0x0004));
        assert_eq!(alloc.allocate_unicast(1).unwrap(), 0x0004);
    }

    #[test]
    fn test_allocate_at_top_of_unicast_space() {
        let mut alloc = allocator_with(0x7FFE, 0x7FFF);
        assert_eq!(alloc.allocate_unicast(2).unwrap(), 0x7FFE);
        assert_eq!(alloc.allocate_unicast(1), Err(MeshError::Exhausted(1)));
    }

    #[test]
    fn test_release_single_address() {
        let mut alloc = allocator_with(0x0001, 0x0004);
        alloc.allocate_unicast(4).unwrap();
        alloc.release(Release::Address(0x0002));
        assert_eq!(alloc.allocate_unicast(1).unwrap(), 0x0002);
    }

    #[test]
    fn test_unregister_range() {
        let mut alloc = allocator_with(0x0001, 0x0004);
        assert!(alloc.unregister_range(AddressKind::Unicast, AddressRange::new(1, 4)));
        assert_eq!(alloc.allocate_unicast(1), Err(MeshError::Exhausted(1)));
    }
}
