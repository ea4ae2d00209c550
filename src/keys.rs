//! Mesh key management
//!
//! - Network keys with their k2/k3-derived material (NID, encryption key,
//!   privacy key, network ID) and the key refresh procedure
//! - Application keys bound to a network key, identified on air by AID
//! - Device key derivation at the end of provisioning
//!
//! Neither NID (7 bits) nor AID (6 bits) is unique, so lookups return every
//! candidate and the caller tries each one until a MIC verifies.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::crypto::{self, Key};
use crate::error::{KeyRef, MeshError, Result};

/// Highest valid network / application key index (12 bits)
pub const MAX_KEY_INDEX: u16 = 0x0FFF;

/// Default cap on the number of key material sets sharing one NID
pub const DEFAULT_NID_CANDIDATE_LIMIT: usize = 8;

/// Network key material derived from a network key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkKeyMaterial {
    pub nid: u8,
    pub encryption_key: Key,
    pub privacy_key: Key,
    pub network_id: [u8; 8],
    pub identity_key: Key,
    pub beacon_key: Key,
}

impl NetworkKeyMaterial {
    pub fn derive(key: &Key) -> Self {
        let k2 = crypto::k2(key, &[0x00]);
        Self {
            nid: k2.nid,
            encryption_key: k2.encryption_key,
            privacy_key: k2.privacy_key,
            network_id: crypto::k3(key),
            identity_key: crypto::identity_key(key),
            beacon_key: crypto::beacon_key(key),
        }
    }
}

/// Key refresh phase of a network key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyRefreshPhase {
    /// Only the current key exists
    #[default]
    Normal,
    /// New key distributed; old key still used for transmission
    KeyDistribution,
    /// New key used for transmission; old key still accepted
    Transition,
}

/// A network key plus its derived material
#[derive(Debug, Clone)]
pub struct NetworkKey {
    pub index: u16,
    key: Key,
    material: NetworkKeyMaterial,
    phase: KeyRefreshPhase,
    /// Replacement key while a key refresh is running
    new: Option<(Key, NetworkKeyMaterial)>,
}

impl NetworkKey {
    pub fn new(index: u16, key: Key) -> Self {
        Self {
            index,
            key,
            material: NetworkKeyMaterial::derive(&key),
            phase: KeyRefreshPhase::Normal,
            new: None,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn material(&self) -> &NetworkKeyMaterial {
        &self.material
    }

    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// Material for outgoing traffic
    pub fn tx_material(&self) -> &NetworkKeyMaterial {
        match (&self.phase, &self.new) {
            (KeyRefreshPhase::Transition, Some((_, material))) => material,
            _ => &self.material,
        }
    }

    /// Every material set accepted for incoming traffic
    fn rx_materials(&self) -> impl Iterator<Item = (&NetworkKeyMaterial, bool)> {
        std::iter::once((&self.material, false))
            .chain(self.new.as_ref().map(|(_, material)| (material, true)))
    }
}

/// One network key material set that matched a NID lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkKeyCandidate {
    pub index: u16,
    pub material: NetworkKeyMaterial,
    /// True if this is the refreshed key rather than the old one
    pub is_new: bool,
}

/// An application key bound to a network key
#[derive(Debug, Clone)]
pub struct ApplicationKey {
    pub index: u16,
    pub bound_net_index: u16,
    key: Key,
    aid: u8,
    new: Option<(Key, u8)>,
}

impl ApplicationKey {
    pub fn new(index: u16, bound_net_index: u16, key: Key) -> Self {
        Self {
            index,
            bound_net_index,
            key,
            aid: crypto::k4(&key),
            new: None,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn aid(&self) -> u8 {
        self.aid
    }
}

/// An application key that matched an AID lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplicationKeyCandidate {
    pub index: u16,
    pub bound_net_index: u16,
    pub key: Key,
    pub aid: u8,
}

/// Per-node device key, known only after provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKey(#[serde(with = "hex_key")] pub Key);

/// Key store: network keys, application keys and device key derivation
#[derive(Debug)]
pub struct KeyStore {
    network_keys: Vec<NetworkKey>,
    application_keys: Vec<ApplicationKey>,
    nid_candidate_limit: usize,
}

/// Key store shared between sessions: single writer, concurrent readers
pub type SharedKeyStore = Arc<RwLock<KeyStore>>;

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self::with_nid_limit(DEFAULT_NID_CANDIDATE_LIMIT)
    }

    pub fn with_nid_limit(nid_candidate_limit: usize) -> Self {
        Self {
            network_keys: Vec::new(),
            application_keys: Vec::new(),
            nid_candidate_limit: nid_candidate_limit.max(1),
        }
    }

    pub fn into_shared(self) -> SharedKeyStore {
        Arc::new(RwLock::new(self))
    }

    fn nid_usage(&self, nid: u8) -> usize {
        self.network_keys
            .iter()
            .flat_map(|k| k.rx_materials())
            .filter(|(m, _)| m.nid == nid)
            .count()
    }

    fn check_nid_capacity(&self, material: &NetworkKeyMaterial) -> Result<()> {
        if self.nid_usage(material.nid) >= self.nid_candidate_limit {
            return Err(MeshError::Config(format!(
                "more than {} network keys would share NID 0x{:02X}",
                self.nid_candidate_limit, material.nid
            )));
        }
        Ok(())
    }

    /// Add a network key under the lowest free key index
    pub fn add_network_key(&mut self, key: Key) -> Result<u16> {
        let index = (0..=MAX_KEY_INDEX)
            .find(|i| self.network_key(*i).is_none())
            .ok_or_else(|| MeshError::Config("network key indices exhausted".into()))?;
        self.add_network_key_with_index(index, key)?;
        Ok(index)
    }

    pub fn add_network_key_with_index(&mut self, index: u16, key: Key) -> Result<()> {
        if index > MAX_KEY_INDEX {
            return Err(MeshError::Config(format!("key index {} out of range", index)));
        }
        if self.network_key(index).is_some() {
            return Err(MeshError::Config(format!(
                "network key index {} already in use",
                index
            )));
        }
        if self.network_keys.iter().any(|k| k.key == key) {
            return Err(MeshError::Config("network key already present".into()));
        }

        let net_key = NetworkKey::new(index, key);
        self.check_nid_capacity(&net_key.material)?;
        info!(
            "Added network key {} (NID=0x{:02X}, network ID {})",
            index,
            net_key.material.nid,
            hex::encode(net_key.material.network_id)
        );
        self.network_keys.push(net_key);
        self.network_keys.sort_by_key(|k| k.index);
        Ok(())
    }

    pub fn network_key(&self, index: u16) -> Option<&NetworkKey> {
        self.network_keys.iter().find(|k| k.index == index)
    }

    pub fn network_keys(&self) -> &[NetworkKey] {
        &self.network_keys
    }

    /// Remove a network key together with the application keys bound to it
    pub fn remove_network_key(&mut self, index: u16) -> Result<NetworkKey> {
        let pos = self
            .network_keys
            .iter()
            .position(|k| k.index == index)
            .ok_or(MeshError::UnknownKey(KeyRef::Network(index)))?;
        self.application_keys.retain(|a| a.bound_net_index != index);
        Ok(self.network_keys.remove(pos))
    }

    /// Add an application key bound to an existing network key
    pub fn add_application_key(&mut self, key: Key, bound_net_index: u16) -> Result<u16> {
        if self.network_key(bound_net_index).is_none() {
            return Err(MeshError::UnknownKey(KeyRef::Network(bound_net_index)));
        }
        let index = (0..=MAX_KEY_INDEX)
            .find(|i| self.application_key(*i).is_none())
            .ok_or_else(|| MeshError::Config("application key indices exhausted".into()))?;

        let app_key = ApplicationKey::new(index, bound_net_index, key);
        debug!(
            "Added application key {} (AID=0x{:02X}) bound to network key {}",
            index, app_key.aid, bound_net_index
        );
        self.application_keys.push(app_key);
        Ok(index)
    }

    pub fn application_key(&self, index: u16) -> Option<&ApplicationKey> {
        self.application_keys.iter().find(|k| k.index == index)
    }

    pub fn application_keys(&self) -> &[ApplicationKey] {
        &self.application_keys
    }

    /// Device key from the ECDH secret and the provisioning salt.
    ///
    /// The provisioning salt already folds in the confirmation salt and both
    /// random values, see [`crypto::provisioning_salt`].
    pub fn derive_device_key(ecdh_secret: &[u8; 32], provisioning_salt: &[u8; 16]) -> DeviceKey {
        DeviceKey(crypto::device_key(ecdh_secret, provisioning_salt))
    }

    /// Look up network key material by NID.
    /// Note: several keys can share a NID; the NetMIC check disambiguates.
    pub fn lookup_network_key_by_nid(&self, nid: u8) -> Vec<NetworkKeyCandidate> {
        self.network_keys
            .iter()
            .flat_map(|k| {
                k.rx_materials().map(move |(material, is_new)| NetworkKeyCandidate {
                    index: k.index,
                    material: *material,
                    is_new,
                })
            })
            .filter(|c| c.material.nid == nid)
            .collect()
    }

    /// Look up application keys by AID (old and refreshed keys alike)
    pub fn lookup_application_key_by_aid(&self, aid: u8) -> Vec<ApplicationKeyCandidate> {
        let mut out = Vec::new();
        for app in &self.application_keys {
            if app.aid == aid {
                out.push(ApplicationKeyCandidate {
                    index: app.index,
                    bound_net_index: app.bound_net_index,
                    key: app.key,
                    aid: app.aid,
                });
            }
            if let Some((key, new_aid)) = app.new {
                if new_aid == aid {
                    out.push(ApplicationKeyCandidate {
                        index: app.index,
                        bound_net_index: app.bound_net_index,
                        key,
                        aid: new_aid,
                    });
                }
            }
        }
        out
    }

    /// Material to use when sending with network key `index`
    pub fn tx_material(&self, index: u16) -> Result<NetworkKeyMaterial> {
        self.network_key(index)
            .map(|k| *k.tx_material())
            .ok_or(MeshError::UnknownKey(KeyRef::Network(index)))
    }

    /// Application key to use when sending, honouring the bound network
    /// key's refresh phase
    pub fn app_key_for_tx(&self, index: u16) -> Result<ApplicationKeyCandidate> {
        let app = self
            .application_key(index)
            .ok_or(MeshError::UnknownKey(KeyRef::Application(index)))?;
        let phase = self
            .network_key(app.bound_net_index)
            .map(|k| k.phase)
            .unwrap_or_default();

        let (key, aid) = match (phase, app.new) {
            (KeyRefreshPhase::Transition, Some(new)) => new,
            _ => (app.key, app.aid),
        };
        Ok(ApplicationKeyCandidate {
            index: app.index,
            bound_net_index: app.bound_net_index,
            key,
            aid,
        })
    }

    // Key refresh procedure

    /// Phase 1: distribute a new network key
    pub fn start_key_refresh(&mut self, index: u16, new_key: Key) -> Result<()> {
        let material = NetworkKeyMaterial::derive(&new_key);
        self.check_nid_capacity(&material)?;

        let net_key = self.network_key_mut(index)?;
        if net_key.phase != KeyRefreshPhase::Normal {
            return Err(MeshError::Config(format!(
                "network key {} already in key refresh ({:?})",
                index, net_key.phase
            )));
        }
        net_key.new = Some((new_key, material));
        net_key.phase = KeyRefreshPhase::KeyDistribution;
        info!("Key refresh started for network key {}", index);
        Ok(())
    }

    /// Distribute a new application key while its network key is in phase 1
    pub fn update_application_key(&mut self, index: u16, new_key: Key) -> Result<()> {
        let bound = self
            .application_key(index)
            .map(|a| a.bound_net_index)
            .ok_or(MeshError::UnknownKey(KeyRef::Application(index)))?;
        let phase = self
            .network_key(bound)
            .map(|k| k.phase)
            .ok_or(MeshError::UnknownKey(KeyRef::Network(bound)))?;
        if phase != KeyRefreshPhase::KeyDistribution {
            return Err(MeshError::Config(format!(
                "application key {} can only be updated during key distribution",
                index
            )));
        }

        if let Some(app) = self.application_keys.iter_mut().find(|a| a.index == index) {
            app.new = Some((new_key, crypto::k4(&new_key)));
        }
        Ok(())
    }

    /// Phase 2: switch transmission to the new key
    pub fn transition_key_refresh(&mut self, index: u16) -> Result<()> {
        let net_key = self.network_key_mut(index)?;
        if net_key.phase != KeyRefreshPhase::KeyDistribution {
            return Err(MeshError::Config(format!(
                "network key {} is not distributing a new key",
                index
            )));
        }
        net_key.phase = KeyRefreshPhase::Transition;
        info!("Network key {} now transmitting with refreshed key", index);
        Ok(())
    }

    /// Phase 3: revoke the old key; the refreshed key becomes the only key
    pub fn revoke_old_key(&mut self, index: u16) -> Result<()> {
        let net_key = self.network_key_mut(index)?;
        let (key, material) = net_key.new.take().ok_or_else(|| {
            MeshError::Config(format!("network key {} has no refreshed key", index))
        })?;
        net_key.key = key;
        net_key.material = material;
        net_key.phase = KeyRefreshPhase::Normal;

        for app in self
            .application_keys
            .iter_mut()
            .filter(|a| a.bound_net_index == index)
        {
            if let Some((key, aid)) = app.new.take() {
                app.key = key;
                app.aid = aid;
            }
        }
        info!("Old key revoked for network key {}", index);
        Ok(())
    }

    fn network_key_mut(&mut self, index: u16) -> Result<&mut NetworkKey> {
        self.network_keys
            .iter_mut()
            .find(|k| k.index == index)
            .ok_or(MeshError::UnknownKey(KeyRef::Network(index)))
    }

    /// Serializable form of every key
    pub fn snapshot(&self) -> KeySnapshot {
        KeySnapshot {
            network_keys: self
                .network_keys
                .iter()
                .map(|k| StoredNetworkKey {
                    index: k.index,
                    key: k.key,
                    new_key: k.new.map(|(key, _)| key),
                    phase: k.phase,
                })
                .collect(),
            application_keys: self
                .application_keys
                .iter()
                .map(|a| StoredApplicationKey {
                    index: a.index,
                    bound_net_index: a.bound_net_index,
                    key: a.key,
                    new_key: a.new.map(|(key, _)| key),
                })
                .collect(),
        }
    }

    /// Rebuild a key store from a snapshot, re-deriving all material
    pub fn restore(snapshot: &KeySnapshot, nid_candidate_limit: usize) -> Result<Self> {
        let mut store = Self::with_nid_limit(nid_candidate_limit);
        for stored in &snapshot.network_keys {
            store.add_network_key_with_index(stored.index, stored.key)?;
            if let Some(new_key) = stored.new_key {
                store.start_key_refresh(stored.index, new_key)?;
                if stored.phase == KeyRefreshPhase::Transition {
                    store.transition_key_refresh(stored.index)?;
                }
            }
        }
        for stored in &snapshot.application_keys {
            if store.network_key(stored.bound_net_index).is_none() {
                return Err(MeshError::UnknownKey(KeyRef::Network(stored.bound_net_index)));
            }
            let mut app = ApplicationKey::new(stored.index, stored.bound_net_index, stored.key);
            app.new = stored.new_key.map(|k| (k, crypto::k4(&k)));
            store.application_keys.push(app);
        }
        Ok(store)
    }
}

/// Persisted network key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNetworkKey {
    pub index: u16,
    #[serde(with = "hex_key")]
    pub key: Key,
    #[serde(default, with = "hex_key_opt")]
    pub new_key: Option<Key>,
    #[serde(default)]
    pub phase: KeyRefreshPhase,
}

/// Persisted application key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredApplicationKey {
    pub index: u16,
    pub bound_net_index: u16,
    #[serde(with = "hex_key")]
    pub key: Key,
    #[serde(default, with = "hex_key_opt")]
    pub new_key: Option<Key>,
}

/// Every key, as handed to the persistence layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub network_keys: Vec<StoredNetworkKey>,
    pub application_keys: Vec<StoredApplicationKey>,
}

/// Parse a 128-bit key from hex
pub fn parse_key(s: &str) -> Result<Key> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| MeshError::Config(format!("invalid key hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| MeshError::Config(format!("key must be 16 bytes, got {}", b.len())))
}

/// serde helper: 128-bit keys as hex strings
pub mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        super::parse_key(&s).map_err(serde::de::Error::custom)
    }
}

/// serde helper: optional 128-bit keys as hex strings
pub mod hex_key_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Option<[u8; 16]>, s: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(k) => s.serialize_some(&hex::encode(k)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 16]>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => super::parse_key(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
