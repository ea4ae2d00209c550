use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mesh_provisioner::address::AddressAllocator;
use mesh_provisioner::composition::CompositionData;
use mesh_provisioner::config::Config;
use mesh_provisioner::crypto::{self, ecdh::random_bytes};
use mesh_provisioner::keys::{self, KeyRefreshPhase, KeyStore, NetworkKeyMaterial};
use mesh_provisioner::network;
use mesh_provisioner::provisioning::{
    Capabilities, MemoryOob, MpscChannel, Provisionee, Provisioner, ProvisioningRequest,
};
use mesh_provisioner::store::{JsonFileStore, MemoryStore, MeshStore};
use mesh_provisioner::transport::lower::LowerTransportPdu;

#[derive(Parser)]
#[command(name = "mesh-provisioner")]
#[command(about = "Bluetooth Mesh provisioner and PDU toolkit")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the material derived from a network key and the AID of an application key
    Keys {
        /// Network key (hex); a random one when omitted
        #[arg(long)]
        net_key: Option<String>,
        #[arg(long)]
        app_key: Option<String>,
    },
    /// Decode a network PDU with the configured network key
    Decode {
        /// Network PDU (hex)
        pdu: String,
    },
    /// Parse composition data page 0
    Composition {
        /// Composition data (hex)
        data: String,
    },
    /// Provision an in-process simulated device and store the resulting node
    Provision {
        #[arg(long, default_value = "device")]
        name: String,
        #[arg(long, default_value_t = 1)]
        elements: u8,
        /// Static OOB value (hex) shared with the simulated device
        #[arg(long)]
        static_oob: Option<String>,
    },
    /// List stored nodes
    Nodes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    match cli.command {
        Command::Keys { net_key, app_key } => show_keys(net_key, app_key),
        Command::Decode { pdu } => decode(&config, &pdu),
        Command::Composition { data } => show_composition(&data),
        Command::Provision {
            name,
            elements,
            static_oob,
        } => provision(&config, name, elements, static_oob).await,
        Command::Nodes => list_nodes(&config).await,
    }
}

fn show_keys(net_key: Option<String>, app_key: Option<String>) -> anyhow::Result<()> {
    let net_key = match net_key {
        Some(hex) => keys::parse_key(&hex)?,
        None => random_bytes()?,
    };
    let material = NetworkKeyMaterial::derive(&net_key);

    println!("NetKey:         {}", hex::encode(net_key));
    println!("  NID:          0x{:02X}", material.nid);
    println!("  EncryptionKey {}", hex::encode(material.encryption_key));
    println!("  PrivacyKey    {}", hex::encode(material.privacy_key));
    println!("  NetworkID     {}", hex::encode(material.network_id));
    println!("  IdentityKey   {}", hex::encode(material.identity_key));
    println!("  BeaconKey     {}", hex::encode(material.beacon_key));

    if let Some(hex) = app_key {
        let app_key = keys::parse_key(&hex)?;
        println!("AppKey:         {}", hex::encode(app_key));
        println!("  AID:          0x{:02X}", crypto::k4(&app_key));
    }
    Ok(())
}

fn decode(config: &Config, pdu: &str) -> anyhow::Result<()> {
    let data = hex::decode(pdu.trim()).context("PDU is not valid hex")?;
    let store = config.key_store()?;
    let nid = data.first().map(|b| b & 0x7F).unwrap_or_default();
    let candidates = store.lookup_network_key_by_nid(nid);
    if candidates.is_empty() {
        anyhow::bail!("no configured network key has NID 0x{:02X}", nid);
    }

    let decoded = network::decode(&data, &candidates, config.iv_index())?;
    println!("Network key {} (IV index {})", decoded.net_key_index, decoded.iv_index);
    println!("  {}", decoded.pdu);
    match LowerTransportPdu::decode(decoded.pdu.ctl, &decoded.pdu.transport_pdu) {
        Ok(lower) => println!("  {}", lower),
        Err(e) => warn!("Lower transport PDU did not parse: {}", e),
    }
    Ok(())
}

fn show_composition(data: &str) -> anyhow::Result<()> {
    let bytes = hex::decode(data.trim()).context("composition data is not valid hex")?;
    let composition = CompositionData::parse(&bytes)?;

    println!(
        "CID 0x{:04X} PID 0x{:04X} VID 0x{:04X} CRPL {}",
        composition.company_id, composition.product_id, composition.version_id, composition.crpl
    );
    println!("Features: {:?}", composition.features);
    for (i, element) in composition.elements.iter().enumerate() {
        println!("Element {} (location 0x{:04X})", i, element.location);
        for model in &element.models {
            println!("  {}", model);
        }
    }
    Ok(())
}

fn open_store(config: &Config) -> Arc<dyn MeshStore> {
    match &config.storage.path {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    }
}

/// Stored keys, or the configured ones, or a fresh random network key
async fn load_keys(config: &Config, store: &dyn MeshStore) -> anyhow::Result<KeyStore> {
    let snapshot = store.load_keys().await?;
    let mut keys = if snapshot.network_keys.is_empty() {
        config.key_store()?
    } else {
        KeyStore::restore(&snapshot, config.transport.nid_candidate_limit)?
    };
    if keys.network_keys().is_empty() {
        let index = keys.add_network_key(random_bytes()?)?;
        info!("Generated network key {}", index);
    }
    store.save_keys(&keys.snapshot()).await?;
    Ok(keys)
}

/// Stored address ranges, or the configured ones on first use
async fn load_allocator(config: &Config, store: &dyn MeshStore) -> anyhow::Result<AddressAllocator> {
    let stored = store.load_ranges().await?;
    let allocator = if stored.is_empty() {
        let allocator = config.allocator()?;
        store.save_ranges(&allocator.provisioner_ranges()).await?;
        allocator
    } else {
        let mut allocator = AddressAllocator::from_ranges(&stored)?;
        allocator.mark_assigned(config.provisioner.address, 1);
        allocator
    };
    Ok(allocator)
}

async fn provision(
    config: &Config,
    name: String,
    elements: u8,
    static_oob: Option<String>,
) -> anyhow::Result<()> {
    let store = open_store(config);
    let keys = load_keys(config, store.as_ref()).await?;
    let net_key = keys
        .network_keys()
        .first()
        .context("no network key available")?;

    let mut allocator = load_allocator(config, store.as_ref()).await?;
    for node in store.load_nodes().await? {
        allocator.mark_assigned(node.unicast_address, node.element_count);
    }
    let allocator = allocator.into_shared();

    let mut oob = MemoryOob::new();
    let mut capabilities = Capabilities {
        num_elements: elements,
        algorithms: Capabilities::ALGORITHM_P256,
        ..Default::default()
    };
    if let Some(hex) = static_oob {
        oob = oob.with_static_value(keys::parse_key(&hex)?);
        capabilities.static_oob_type = 0x01;
    }
    let oob = Arc::new(oob);
    let settings = config.provisioning_settings();

    let (provisioner_end, device_end) = MpscChannel::pair(8);
    let device = Provisionee::new(device_end, oob.clone(), capabilities, &settings)?;
    let device_task = tokio::spawn(device.run());

    let request = ProvisioningRequest {
        name,
        device_uuid: Some(random_bytes()?),
        net_key: *net_key.key(),
        net_key_index: net_key.index,
        iv_index: config.iv_index(),
        key_refresh: net_key.phase() != KeyRefreshPhase::Normal,
    };
    let mut provisioner = Provisioner::new(provisioner_end, oob, settings);
    let outcome = provisioner
        .provision_into(&request, &allocator)
        .await
        .context("provisioning failed")?;

    let device = device_task.await?.context("device side failed")?;
    if device.device_key != outcome.device_key {
        anyhow::bail!("device derived a different device key");
    }

    store.save_node(&outcome.node).await?;
    println!(
        "Provisioned {} at {:04X} ({} element(s)) using {}",
        outcome.node.name, outcome.node.unicast_address, outcome.node.element_count, device.method
    );
    println!("  DevKey {}", hex::encode(outcome.device_key.0));
    Ok(())
}

async fn list_nodes(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config);
    let nodes = store.load_nodes().await?;
    if nodes.is_empty() {
        println!("No nodes");
    }
    for node in nodes {
        let last = node.unicast_address as u32 + node.element_count as u32 - 1;
        println!(
            "{:04X}-{:04X}  {}  provisioned {}",
            node.unicast_address,
            last,
            node.name,
            node.provisioned_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
