//! Persistence for nodes, keys and the provisioner's address ranges

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::address::ProvisionerRanges;
use crate::error::{MeshError, Result};
use crate::keys::KeySnapshot;
use crate::node::Node;

#[async_trait]
pub trait MeshStore: Send + Sync {
    async fn load_node(&self, unicast_address: u16) -> Result<Option<Node>>;
    async fn save_node(&self, node: &Node) -> Result<()>;
    async fn remove_node(&self, unicast_address: u16) -> Result<()>;
    /// Every stored node, ordered by primary address
    async fn load_nodes(&self) -> Result<Vec<Node>>;
    async fn load_keys(&self) -> Result<KeySnapshot>;
    async fn save_keys(&self, keys: &KeySnapshot) -> Result<()>;
    /// Address ranges registered with the provisioner; empty when none were saved
    async fn load_ranges(&self) -> Result<ProvisionerRanges>;
    async fn save_ranges(&self, ranges: &ProvisionerRanges) -> Result<()>;
}

fn unavailable(e: impl std::fmt::Display) -> MeshError {
    MeshError::StorageUnavailable(e.to_string())
}

/// Volatile store
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: DashMap<u16, Node>,
    keys: RwLock<KeySnapshot>,
    ranges: RwLock<ProvisionerRanges>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeshStore for MemoryStore {
    async fn load_node(&self, unicast_address: u16) -> Result<Option<Node>> {
        Ok(self.nodes.get(&unicast_address).map(|n| n.clone()))
    }

    async fn save_node(&self, node: &Node) -> Result<()> {
        self.nodes.insert(node.unicast_address, node.clone());
        Ok(())
    }

    async fn remove_node(&self, unicast_address: u16) -> Result<()> {
        self.nodes.remove(&unicast_address);
        Ok(())
    }

    async fn load_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by_key(|n| n.unicast_address);
        Ok(nodes)
    }

    async fn load_keys(&self) -> Result<KeySnapshot> {
        Ok(self.keys.read().clone())
    }

    async fn save_keys(&self, keys: &KeySnapshot) -> Result<()> {
        *self.keys.write() = keys.clone();
        Ok(())
    }

    async fn load_ranges(&self) -> Result<ProvisionerRanges> {
        Ok(self.ranges.read().clone())
    }

    async fn save_ranges(&self, ranges: &ProvisionerRanges) -> Result<()> {
        *self.ranges.write() = ranges.clone();
        Ok(())
    }
}

/// On-disk layout of [`JsonFileStore`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct MeshDatabase {
    #[serde(default)]
    keys: KeySnapshot,
    #[serde(default)]
    nodes: BTreeMap<u16, Node>,
    #[serde(default)]
    ranges: ProvisionerRanges,
}

/// Whole-database JSON file. Every write rewrites the file through a
/// temporary sibling and a rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<MeshDatabase> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(unavailable),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No database at {:?} yet", self.path);
                Ok(MeshDatabase::default())
            }
            Err(e) => Err(unavailable(format!("{:?}: {}", self.path, e))),
        }
    }

    async fn write(&self, db: &MeshDatabase) -> Result<()> {
        let json = serde_json::to_vec_pretty(db).map_err(unavailable)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| unavailable(format!("{:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| unavailable(format!("{:?}: {}", self.path, e)))
    }

    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut MeshDatabase) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut db = self.read().await?;
        change(&mut db);
        self.write(&db).await
    }
}

#[async_trait]
impl MeshStore for JsonFileStore {
    async fn load_node(&self, unicast_address: u16) -> Result<Option<Node>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.nodes.remove(&unicast_address))
    }

    async fn save_node(&self, node: &Node) -> Result<()> {
        let node = node.clone();
        info!("Saving node {} ({:04X})", node.name, node.unicast_address);
        self.update(move |db| {
            db.nodes.insert(node.unicast_address, node);
        })
        .await
    }

    async fn remove_node(&self, unicast_address: u16) -> Result<()> {
        self.update(move |db| {
            db.nodes.remove(&unicast_address);
        })
        .await
    }

    async fn load_nodes(&self) -> Result<Vec<Node>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.nodes.into_values().collect())
    }

    async fn load_keys(&self) -> Result<KeySnapshot> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.keys)
    }

    async fn save_keys(&self, keys: &KeySnapshot) -> Result<()> {
        let keys = keys.clone();
        self.update(move |db| db.keys = keys).await
    }

    async fn load_ranges(&self) -> Result<ProvisionerRanges> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.ranges)
    }

    async fn save_ranges(&self, ranges: &ProvisionerRanges) -> Result<()> {
        let ranges = ranges.clone();
        self.update(move |db| db.ranges = ranges).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressAllocator, AddressKind};
    use crate::keys::{DeviceKey, KeyStore};
    use crate::network::iv::IvIndex;
    use tokio_test::{assert_err, assert_ok};

    fn node(address: u16) -> Node {
        Node::new(
            format!("node-{:04X}", address),
            address,
            2,
            DeviceKey([address as u8; 16]),
            0,
            IvIndex::new(0),
        )
    }

    fn keys() -> KeySnapshot {
        let mut store = KeyStore::new();
        let net = store.add_network_key([0x7D; 16]).unwrap();
        store.add_application_key([0x63; 16], net).unwrap();
        store.snapshot()
    }

    async fn exercise(store: &dyn MeshStore) {
        assert_eq!(store.load_node(0x0100).await.unwrap(), None);
        assert_eq!(store.load_keys().await.unwrap(), KeySnapshot::default());

        let first = node(0x0100);
        store.save_node(&node(0x0200)).await.unwrap();
        store.save_node(&first).await.unwrap();
        assert_eq!(store.load_node(0x0100).await.unwrap(), Some(first));

        let all = store.load_nodes().await.unwrap();
        assert_eq!(
            all.iter().map(|n| n.unicast_address).collect::<Vec<_>>(),
            vec![0x0100, 0x0200]
        );

        store.remove_node(0x0100).await.unwrap();
        assert_eq!(store.load_node(0x0100).await.unwrap(), None);
        assert_eq!(store.load_nodes().await.unwrap().len(), 1);

        let snapshot = keys();
        store.save_keys(&snapshot).await.unwrap();
        assert_eq!(store.load_keys().await.unwrap(), snapshot);

        assert!(store.load_ranges().await.unwrap().is_empty());
        store.save_ranges(&ranges()).await.unwrap();
        assert_eq!(store.load_ranges().await.unwrap(), ranges());
    }

    fn ranges() -> ProvisionerRanges {
        let mut alloc = AddressAllocator::new();
        alloc.register_range(AddressKind::Unicast, 0x0001, 0x7FFF).unwrap();
        alloc.register_range(AddressKind::Scene, 0x0001, 0x3FFF).unwrap();
        alloc.provisioner_ranges()
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("mesh.json"));
        exercise(&store).await;

        // A second handle over the same file sees the same data
        let reopened = JsonFileStore::new(store.path());
        let remaining = assert_ok!(reopened.load_nodes().await);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].unicast_address, 0x0200);
        assert_eq!(remaining[0].device_key, DeviceKey([0x00; 16]));
        assert_eq!(reopened.load_keys().await.unwrap(), keys());

        let raw: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(store.path()).await.unwrap()).unwrap();
        assert_eq!(
            raw["ranges"]["allocatedUnicastRange"],
            serde_json::json!([{ "lowAddress": "0001", "highAddress": "7FFF" }])
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let store = JsonFileStore::new(&path);
        let err = assert_err!(store.load_keys().await);
        assert!(matches!(err, MeshError::StorageUnavailable(_)));
    }
}
