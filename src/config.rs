use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::address::{AddressAllocator, AddressKind};
use crate::error::Result;
use crate::keys::{self, KeyStore, DEFAULT_NID_CANDIDATE_LIMIT};
use crate::network::iv::IvIndex;
use crate::provisioning::{AuthPolicy, ProvisioningSettings};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub network: NetworkConfig,
    pub provisioner: ProvisionerConfig,
    pub provisioning: ProvisioningConfig,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Primary network key, hex
    pub net_key: Option<String>,
    pub key_index: u16,
    pub iv_index: u32,
    pub iv_update: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RangeConfig {
    pub low: u16,
    pub high: u16,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub name: String,
    /// Unicast address of the provisioner itself
    pub address: u16,
    pub unicast: Vec<RangeConfig>,
    pub group: Vec<RangeConfig>,
    pub scene: Vec<RangeConfig>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            name: "mesh-provisioner".to_string(),
            address: 0x0001,
            unicast: vec![RangeConfig {
                low: 0x0002,
                high: 0x7FFF,
            }],
            group: vec![RangeConfig {
                low: 0xC000,
                high: 0xCFFF,
            }],
            scene: vec![RangeConfig {
                low: 0x0001,
                high: 0x0FFF,
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub attention_duration: u8,
    pub auth_policy: AuthPolicy,
    pub use_oob_public_key: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        let defaults = ProvisioningSettings::default();
        Self {
            timeout_ms: defaults.timeout.as_millis() as u64,
            max_retries: defaults.max_retries,
            attention_duration: defaults.attention_duration,
            auth_policy: defaults.auth_policy,
            use_oob_public_key: defaults.use_oob_public_key,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub reassembly_timeout_ms: u64,
    pub default_ttl: u8,
    pub replay_cache_size: usize,
    /// Most network keys allowed to share one NID
    pub nid_candidate_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout_ms: 10_000,
            default_ttl: 7,
            replay_cache_size: 256,
            nid_candidate_limit: DEFAULT_NID_CANDIDATE_LIMIT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON database; in-memory only when unset
    pub path: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    pub fn provisioning_settings(&self) -> ProvisioningSettings {
        ProvisioningSettings {
            timeout: Duration::from_millis(self.provisioning.timeout_ms),
            max_retries: self.provisioning.max_retries,
            attention_duration: self.provisioning.attention_duration,
            auth_policy: self.provisioning.auth_policy,
            use_oob_public_key: self.provisioning.use_oob_public_key,
        }
    }

    pub fn iv_index(&self) -> IvIndex {
        IvIndex {
            index: self.network.iv_index,
            update_active: self.network.iv_update,
        }
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.reassembly_timeout_ms)
    }

    /// Allocator seeded with the configured ranges
    pub fn allocator(&self) -> Result<AddressAllocator> {
        let mut allocator = AddressAllocator::new();
        let sections = [
            (AddressKind::Unicast, &self.provisioner.unicast),
            (AddressKind::Group, &self.provisioner.group),
            (AddressKind::Scene, &self.provisioner.scene),
        ];
        for (kind, ranges) in sections {
            for range in ranges {
                allocator.register_range(kind, range.low, range.high)?;
            }
        }
        allocator.mark_assigned(self.provisioner.address, 1);
        Ok(allocator)
    }

    /// Key store holding the configured network key, if any
    pub fn key_store(&self) -> Result<KeyStore> {
        let mut store = KeyStore::with_nid_limit(self.transport.nid_candidate_limit);
        if let Some(hex) = &self.network.net_key {
            store.add_network_key_with_index(self.network.key_index, keys::parse_key(hex)?)?;
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.transport.default_ttl, 7);
        assert_eq!(config.provisioning_settings().timeout, Duration::from_secs(10));
        assert!(config.storage.path.is_none());
        assert!(config.key_store().unwrap().network_keys().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let config: Config = toml::from_str(
            r#"
            [logging]
            level = "debug"

            [network]
            net_key = "7dd7364cd842ad18c17c2b820c84c3d6"
            key_index = 3
            iv_index = 0x12345678

            [provisioner]
            name = "lab"
            address = 0x0001
            unicast = [{ low = 0x0100, high = 0x01FF }]
            group = []
            scene = []

            [provisioning]
            timeout_ms = 500
            auth_policy = "static"

            [transport]
            nid_candidate_limit = 2

            [storage]
            path = "mesh.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.provisioner.name, "lab");
        assert_eq!(config.iv_index(), IvIndex::new(0x1234_5678));
        let settings = config.provisioning_settings();
        assert_eq!(settings.timeout, Duration::from_millis(500));
        assert_eq!(settings.auth_policy, AuthPolicy::Static);
        assert_eq!(settings.max_retries, 3);

        let store = config.key_store().unwrap();
        assert!(store.network_key(3).is_some());

        let mut allocator = config.allocator().unwrap();
        assert_eq!(allocator.allocate_unicast(2).unwrap(), 0x0100);
    }

    #[test]
    fn test_bad_key_rejected() {
        let config: Config = toml::from_str("[network]\nnet_key = \"abcd\"").unwrap();
        assert!(config.key_store().is_err());
    }
}
