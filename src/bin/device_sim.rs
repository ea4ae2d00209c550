//! Device Simulator
//!
//! Provisions simulated devices in-process, one per authentication method,
//! then fetches each node's composition data over the network and
//! transport layers with its freshly derived device key. Each simulated
//! node runs from its stored record and writes its SEQ back afterwards.
//! Useful for exercising the whole stack without a bearer.
//!
//! Usage: cargo run --bin device-sim [elements]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use mesh_provisioner::address::{AddressAllocator, AddressKind};
use mesh_provisioner::composition::{CompositionData, Element, Features, MeshModel};
use mesh_provisioner::crypto::ecdh::random_bytes;
use mesh_provisioner::keys::KeyStore;
use mesh_provisioner::network::iv::IvIndex;
use mesh_provisioner::network::NetworkLayer;
use mesh_provisioner::node::Node;
use mesh_provisioner::provisioning::{
    AuthPolicy, Capabilities, MemoryOob, MpscChannel, Provisionee, Provisioner,
    ProvisioningOutcome, ProvisioningRequest, ProvisioningSettings,
};
use mesh_provisioner::store::{MemoryStore, MeshStore};
use mesh_provisioner::transport::{
    AccessKeySelector, OutgoingAccess, TransportEvent, TransportLayer,
};

const PROVISIONER_ADDRESS: u16 = 0x0001;
const NET_KEY_INDEX: u16 = 0;

/// Config Composition Data Get / Status
const OP_COMPOSITION_GET: [u8; 2] = [0x80, 0x08];
const OP_COMPOSITION_STATUS: u8 = 0x02;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let elements: u8 = env::args()
        .nth(1)
        .unwrap_or_else(|| "2".to_string())
        .parse()?;

    let net_key: [u8; 16] = random_bytes()?;
    let iv_index = IvIndex::new(0);

    println!("Bluetooth Mesh Device Simulator");
    println!("  NetKey: {}", hex::encode(net_key));
    println!("  Elements per device: {}", elements);
    println!();

    let mut allocator = AddressAllocator::new();
    allocator.register_range(AddressKind::Unicast, 0x0100, 0x01FF)?;
    let allocator = allocator.into_shared();

    let scenarios = [
        ("No OOB", AuthPolicy::NoOob),
        ("Static OOB", AuthPolicy::Static),
        ("Output OOB (numeric)", AuthPolicy::Output),
        ("Input OOB (numeric)", AuthPolicy::Input),
    ];

    let store = MemoryStore::new();
    let mut provisioned = Vec::new();
    for (desc, policy) in scenarios {
        println!("Provisioning with {}", desc);

        let static_value: [u8; 16] = random_bytes()?;
        let oob = Arc::new(MemoryOob::new().with_static_value(static_value));
        let capabilities = Capabilities {
            num_elements: elements,
            algorithms: Capabilities::ALGORITHM_P256,
            static_oob_type: 0x01,
            output_oob_size: 4,
            output_oob_action: 1 << 3,
            input_oob_size: 4,
            input_oob_action: 1 << 2,
            ..Default::default()
        };
        let settings = ProvisioningSettings {
            timeout: Duration::from_secs(2),
            auth_policy: policy,
            ..Default::default()
        };

        let (provisioner_end, device_end) = MpscChannel::pair(8);
        let device = Provisionee::new(device_end, oob.clone(), capabilities, &settings)?;
        let device_task = tokio::spawn(device.run());

        let request = ProvisioningRequest {
            name: format!("sim-{}", provisioned.len() + 1),
            device_uuid: Some(random_bytes()?),
            net_key,
            net_key_index: NET_KEY_INDEX,
            iv_index,
            key_refresh: false,
        };
        let mut provisioner = Provisioner::new(provisioner_end, oob, settings);
        match provisioner.provision_into(&request, &allocator).await {
            Ok(outcome) => {
                let device = device_task.await??;
                let agreed = device.device_key == outcome.device_key;
                println!(
                    "   Node {:04X}, method {}, device keys {}",
                    outcome.node.unicast_address,
                    device.method,
                    if agreed { "match" } else { "DIFFER" }
                );
                store.save_node(&outcome.node).await?;
                provisioned.push(outcome);
            }
            Err(e) => {
                println!("   Failed: {}", e);
                device_task.abort();
            }
        }
        println!();
    }

    let provisioner = stack(net_key, iv_index, PROVISIONER_ADDRESS)?;
    for outcome in &provisioned {
        provisioner.add_device_key(outcome.node.unicast_address, outcome.device_key);
        fetch_composition(&store, &provisioner, net_key, outcome).await?;
    }

    println!("Simulation complete!");
    Ok(())
}

/// Composition data page 0 the simulated node reports
fn composition(elements: u8) -> CompositionData {
    let mut all = vec![Element::new(
        0x0100,
        vec![
            MeshModel::sig(0x0000),
            MeshModel::sig(0x0002),
            MeshModel::sig(0x1000),
        ],
    )];
    for i in 1..elements as u16 {
        all.push(Element::new(
            0x0100 + i,
            vec![MeshModel::sig(0x1000), MeshModel::vendor(0x0059, 0x0001)],
        ));
    }
    CompositionData {
        company_id: 0x0059,
        product_id: 0x0001,
        version_id: 0x0001,
        crpl: 0x0020,
        features: Features {
            relay: true,
            ..Default::default()
        },
        elements: all,
    }
}

fn keys(net_key: [u8; 16]) -> anyhow::Result<KeyStore> {
    let mut keys = KeyStore::new();
    keys.add_network_key_with_index(NET_KEY_INDEX, net_key)?;
    Ok(keys)
}

fn stack(net_key: [u8; 16], iv_index: IvIndex, address: u16) -> anyhow::Result<TransportLayer> {
    let network = NetworkLayer::new(keys(net_key)?.into_shared(), address, iv_index, 0, 64);
    Ok(TransportLayer::new(network, Duration::from_secs(10), 7))
}

fn node_stack(net_key: [u8; 16], node: &Node) -> anyhow::Result<TransportLayer> {
    let network = NetworkLayer::for_node(keys(net_key)?.into_shared(), node, 64);
    Ok(TransportLayer::new(network, Duration::from_secs(10), 7))
}

/// Deliver every PDU to `to`, returning the completed event and bouncing
/// segment acknowledgments back to `from`
fn deliver(
    pdus: Vec<Vec<u8>>,
    from: &TransportLayer,
    to: &TransportLayer,
) -> Option<TransportEvent> {
    let mut event = None;
    for pdu in pdus {
        println!("   -> {} bytes: {}", pdu.len(), hex::encode(&pdu));
        let delivery = to.receive(&pdu)?;
        if let Some(ack) = delivery.ack {
            let returned = from.receive(&ack).and_then(|d| d.event);
            if let Some(TransportEvent::SegmentAck { ack, .. }) = returned {
                println!("   <- Segment ack, block 0x{:08X}", ack.block_ack);
            }
        }
        event = delivery.event.or(event);
    }
    event
}

async fn fetch_composition(
    store: &dyn MeshStore,
    provisioner: &TransportLayer,
    net_key: [u8; 16],
    outcome: &ProvisioningOutcome,
) -> anyhow::Result<()> {
    let mut node = store
        .load_node(outcome.node.unicast_address)
        .await?
        .ok_or_else(|| anyhow::anyhow!("node {:04X} was not stored", outcome.node.unicast_address))?;
    println!("Composition Data Get -> {:04X}", node.unicast_address);

    let device = node_stack(net_key, &node)?;
    device.add_device_key(node.unicast_address, outcome.device_key);

    let mut get = OP_COMPOSITION_GET.to_vec();
    get.push(0x00);
    let pdus = provisioner.send_access(&OutgoingAccess {
        dst: node.unicast_address,
        key: AccessKeySelector::Device {
            net_key_index: NET_KEY_INDEX,
        },
        ttl: None,
        label_uuid: None,
        payload: get,
    })?;
    match deliver(pdus, provisioner, &device) {
        Some(TransportEvent::Access { payload, .. }) if payload.starts_with(&OP_COMPOSITION_GET) => {}
        other => anyhow::bail!("device did not receive the request: {:?}", other),
    }

    let mut status = vec![OP_COMPOSITION_STATUS, 0x00];
    status.extend(composition(node.element_count).encode());
    let pdus = device.send_access(&OutgoingAccess {
        dst: PROVISIONER_ADDRESS,
        key: AccessKeySelector::Device {
            net_key_index: NET_KEY_INDEX,
        },
        ttl: None,
        label_uuid: None,
        payload: status,
    })?;
    match deliver(pdus, &device, provisioner) {
        Some(TransportEvent::Access { payload, .. }) => {
            let parsed = CompositionData::parse_status(&payload[1..])?;
            println!(
                "   CID 0x{:04X}, {} element(s), {} SIG / {} vendor models",
                parsed.company_id,
                parsed.elements.len(),
                parsed.sig_model_count(),
                parsed.vendor_model_count()
            );
            node.set_composition(parsed)?;
        }
        other => anyhow::bail!("no composition data status: {:?}", other),
    }

    node.record_network_state(device.network());
    store.save_node(&node).await?;
    println!("   Node SEQ saved at {}", node.sequence_number);
    println!();
    Ok(())
}
