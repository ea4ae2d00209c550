use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use mesh_provisioner::address::{AddressAllocator, AddressKind, SharedAllocator};
use mesh_provisioner::crypto::ecdh::EcdhKeyPair;
use mesh_provisioner::network::iv::IvIndex;
use mesh_provisioner::provisioning::pdu::Start;
use mesh_provisioner::provisioning::{
    AuthMethod, AuthPolicy, Capabilities, ErrorCode, FailureReason, MemoryOob, MpscChannel,
    PduType, ProvisionedDevice, Provisionee, Provisioner, ProvisioningChannel,
    ProvisioningOutcome, ProvisioningPdu, ProvisioningRequest, ProvisioningSettings,
    ProvisioningState, ReceivedPdu,
};
use mesh_provisioner::MeshError;

const NET_KEY: [u8; 16] = [
    0x7d, 0xd7, 0x36, 0x4c, 0xd8, 0x42, 0xad, 0x18, 0xc1, 0x7c, 0x2b, 0x82, 0x0c, 0x84, 0xc3, 0xd6,
];

fn settings(policy: AuthPolicy) -> ProvisioningSettings {
    ProvisioningSettings {
        timeout: Duration::from_millis(500),
        max_retries: 2,
        auth_policy: policy,
        ..Default::default()
    }
}

fn capabilities(elements: u8) -> Capabilities {
    Capabilities {
        num_elements: elements,
        algorithms: Capabilities::ALGORITHM_P256,
        static_oob_type: 0x01,
        output_oob_size: 4,
        // Output numeric
        output_oob_action: 1 << 3,
        input_oob_size: 4,
        // Input numeric
        input_oob_action: 1 << 2,
        ..Default::default()
    }
}

fn request(name: &str) -> ProvisioningRequest {
    ProvisioningRequest {
        name: name.to_string(),
        device_uuid: Some([0xDD; 16]),
        net_key: NET_KEY,
        net_key_index: 0x0123,
        iv_index: IvIndex::new(0x1234_5678),
        key_refresh: false,
    }
}

fn allocator(low: u16, high: u16) -> SharedAllocator {
    let mut allocator = AddressAllocator::new();
    allocator
        .register_range(AddressKind::Unicast, low, high)
        .unwrap();
    allocator.into_shared()
}

async fn run_pair(
    elements: u8,
    policy: AuthPolicy,
    provisioner_oob: Arc<MemoryOob>,
    device_oob: Arc<MemoryOob>,
    allocator: &SharedAllocator,
) -> (
    Result<ProvisioningOutcome, MeshError>,
    Result<ProvisionedDevice, MeshError>,
) {
    let settings = settings(policy);
    let (provisioner_end, device_end) = MpscChannel::pair(8);
    let device = Provisionee::new(device_end, device_oob, capabilities(elements), &settings).unwrap();
    let device_task = tokio::spawn(device.run());

    let mut provisioner = Provisioner::new(provisioner_end, provisioner_oob, settings);
    let outcome = provisioner
        .provision_into(&request("lamp"), allocator)
        .await;
    (outcome, device_task.await.unwrap())
}

#[tokio::test]
async fn test_full_provisioning_every_method() {
    let allocator = allocator(0x0100, 0x01FF);
    let cases = [
        (AuthPolicy::NoOob, AuthMethod::NoOob),
        (AuthPolicy::Static, AuthMethod::StaticOob),
        (AuthPolicy::Strongest, AuthMethod::StaticOob),
    ];

    let mut next = 0x0100;
    for (policy, expected) in cases {
        let oob = Arc::new(MemoryOob::new().with_static_value([0x5A; 16]));
        let (outcome, device) = run_pair(2, policy, oob.clone(), oob, &allocator).await;
        let outcome = outcome.unwrap();
        let device = device.unwrap();

        assert_eq!(device.method, expected);
        assert_eq!(outcome.device_key, device.device_key);
        assert_eq!(outcome.node.device_key, device.device_key);
        assert_eq!(outcome.node.unicast_address, next);
        assert_eq!(outcome.node.element_count, 2);
        assert_eq!(outcome.node.net_key_indices, vec![0x0123]);
        assert_eq!(outcome.node.device_uuid.as_deref(), Some("dd".repeat(16).as_str()));

        assert_eq!(device.data.net_key, NET_KEY);
        assert_eq!(device.data.net_key_index, 0x0123);
        assert_eq!(device.data.iv_index, 0x1234_5678);
        assert_eq!(device.data.unicast_address, next);
        assert!(!device.data.key_refresh());
        assert!(!device.data.iv_update_active());
        next += 2;
    }
    assert!(allocator.lock().await.is_assigned(0x0105));
    assert!(!allocator.lock().await.is_assigned(0x0106));
}

#[tokio::test]
async fn test_output_and_input_oob() {
    let allocator = allocator(0x0100, 0x01FF);
    for policy in [AuthPolicy::Output, AuthPolicy::Input] {
        // Whatever one side shows, the other side "types in"
        let oob = Arc::new(MemoryOob::new());
        let (outcome, device) = run_pair(1, policy, oob.clone(), oob, &allocator).await;
        let outcome = outcome.unwrap();
        let device = device.unwrap();
        assert_eq!(outcome.device_key, device.device_key);
        match (policy, device.method) {
            (AuthPolicy::Output, AuthMethod::OutputOob { size, .. })
            | (AuthPolicy::Input, AuthMethod::InputOob { size, .. }) => assert_eq!(size, 4),
            other => panic!("unexpected method {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_oob_public_key() {
    let settings = ProvisioningSettings {
        use_oob_public_key: true,
        ..settings(AuthPolicy::NoOob)
    };
    let caps = Capabilities {
        public_key_type: 0x01,
        ..capabilities(1)
    };
    let (provisioner_end, device_end) = MpscChannel::pair(8);
    let device = Provisionee::new(device_end, Arc::new(MemoryOob::new()), caps, &settings).unwrap();
    let provisioner_oob = Arc::new(MemoryOob::new().with_public_key(*device.public_key()));
    let device_task = tokio::spawn(device.run());

    let mut provisioner = Provisioner::new(provisioner_end, provisioner_oob, settings);
    let outcome = provisioner.provision(&request("sensor"), 0x0042).await.unwrap();
    let device = device_task.await.unwrap().unwrap();
    assert_eq!(outcome.device_key, device.device_key);
    assert_eq!(device.data.unicast_address, 0x0042);
}

#[tokio::test]
async fn test_static_oob_mismatch_never_completes() {
    let allocator = allocator(0x0100, 0x01FF);
    let (outcome, device) = run_pair(
        1,
        AuthPolicy::Static,
        Arc::new(MemoryOob::new().with_static_value([0x01; 16])),
        Arc::new(MemoryOob::new().with_static_value([0x02; 16])),
        &allocator,
    )
    .await;

    // The device checks first and reports the failure back
    assert_eq!(
        device.unwrap_err(),
        MeshError::Provisioning(FailureReason::ConfirmationMismatch)
    );
    assert_eq!(
        outcome.unwrap_err(),
        MeshError::Provisioning(FailureReason::RemoteFailure(ErrorCode::ConfirmationFailed))
    );
    // Nothing stays allocated for the failed attempt
    assert!(!allocator.lock().await.is_assigned(0x0100));
}

async fn expect(peer: &mut MpscChannel, expected: PduType) -> ProvisioningPdu {
    let data = peer
        .receive(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("provisioner went quiet");
    let pdu = ProvisioningPdu::decode(&data).unwrap();
    assert_eq!(pdu.pdu_type(), expected, "got {}", pdu);
    pdu
}

#[tokio::test]
async fn test_bogus_device_confirmation_is_rejected() {
    let allocator = allocator(0x0100, 0x01FF);
    let (provisioner_end, mut peer) = MpscChannel::pair(8);
    let mut provisioner = Provisioner::new(
        provisioner_end,
        Arc::new(MemoryOob::new()),
        settings(AuthPolicy::NoOob),
    );

    let script = tokio::spawn(async move {
        expect(&mut peer, PduType::Invite).await;
        let caps = ProvisioningPdu::Capabilities(capabilities(1));
        peer.send(caps.encode()).await.unwrap();
        expect(&mut peer, PduType::Start).await;
        expect(&mut peer, PduType::PublicKey).await;
        let key_pair = EcdhKeyPair::generate().unwrap();
        let ours = ProvisioningPdu::PublicKey(*key_pair.public_key());
        peer.send(ours.encode()).await.unwrap();
        expect(&mut peer, PduType::Confirmation).await;
        peer.send(ProvisioningPdu::Confirmation([0xAA; 16]).encode())
            .await
            .unwrap();
        expect(&mut peer, PduType::Random).await;
        peer.send(ProvisioningPdu::Random([0xBB; 16]).encode())
            .await
            .unwrap();
        expect(&mut peer, PduType::Failed).await
    });

    let result = provisioner.provision_into(&request("bogus"), &allocator).await;
    assert_eq!(
        result.unwrap_err(),
        MeshError::Provisioning(FailureReason::ConfirmationMismatch)
    );
    assert!(matches!(
        provisioner.state(),
        ProvisioningState::Failed(FailureReason::ConfirmationMismatch)
    ));
    assert_eq!(
        script.await.unwrap(),
        ProvisioningPdu::Failed(ErrorCode::ConfirmationFailed)
    );
    assert_eq!(allocator.lock().await.available_unicast(), 0x100);
}

#[tokio::test]
async fn test_invite_is_retried_after_timeout() {
    let settings = ProvisioningSettings {
        timeout: Duration::from_millis(100),
        ..settings(AuthPolicy::NoOob)
    };
    let (provisioner_end, mut peer) = MpscChannel::pair(8);
    let device_settings = settings.clone();

    let device_task = tokio::spawn(async move {
        // Lose the first Invite, then let a real device answer the retry
        expect(&mut peer, PduType::Invite).await;
        let device = Provisionee::new(
            peer,
            Arc::new(MemoryOob::new()),
            capabilities(1),
            &ProvisioningSettings {
                timeout: Duration::from_secs(2),
                ..device_settings
            },
        )
        .unwrap();
        device.run().await
    });

    let mut provisioner = Provisioner::new(provisioner_end, Arc::new(MemoryOob::new()), settings);
    let outcome = provisioner.provision(&request("late"), 0x0200).await.unwrap();
    let device = device_task.await.unwrap().unwrap();
    assert_eq!(outcome.device_key, device.device_key);
}

#[tokio::test]
async fn test_silent_device_times_out_after_retries() {
    let settings = ProvisioningSettings {
        timeout: Duration::from_millis(50),
        max_retries: 2,
        ..Default::default()
    };
    let (provisioner_end, mut peer) = MpscChannel::pair(8);
    let mut provisioner = Provisioner::new(provisioner_end, Arc::new(MemoryOob::new()), settings);

    let result = provisioner.provision(&request("ghost"), 0x0300).await;
    assert_eq!(
        result.unwrap_err(),
        MeshError::Provisioning(FailureReason::Timeout)
    );

    // Initial Invite plus two retries, and no Failed PDU after a timeout
    let mut invites = 0;
    while let Some(data) = peer.receive(Duration::from_millis(20)).await.unwrap() {
        assert_eq!(
            ProvisioningPdu::decode(&data).unwrap().pdu_type(),
            PduType::Invite
        );
        invites += 1;
    }
    assert_eq!(invites, 3);
}

#[tokio::test]
async fn test_address_exhaustion_is_reported_to_device() {
    let allocator = allocator(0x0100, 0x0101);
    let oob = Arc::new(MemoryOob::new());
    let (outcome, device) = run_pair(3, AuthPolicy::NoOob, oob.clone(), oob, &allocator).await;

    assert_eq!(
        outcome.unwrap_err(),
        MeshError::Provisioning(FailureReason::CannotAssignAddresses(3))
    );
    assert_eq!(
        device.unwrap_err(),
        MeshError::Provisioning(FailureReason::RemoteFailure(ErrorCode::CannotAssignAddresses))
    );
    assert_eq!(allocator.lock().await.available_unicast(), 2);
}

#[tokio::test]
async fn test_unexpected_pdu_fails_session() {
    let (provisioner_end, mut peer) = MpscChannel::pair(8);
    let mut provisioner = Provisioner::new(
        provisioner_end,
        Arc::new(MemoryOob::new()),
        settings(AuthPolicy::NoOob),
    );

    let script = tokio::spawn(async move {
        expect(&mut peer, PduType::Invite).await;
        let start = Start {
            algorithm: 0,
            public_key: 0,
            auth_method: 0,
            auth_action: 0,
            auth_size: 0,
        };
        peer.send(ProvisioningPdu::Start(start).encode()).await.unwrap();
        expect(&mut peer, PduType::Failed).await
    });

    let result = provisioner.provision(&request("confused"), 0x0400).await;
    assert_eq!(
        result.unwrap_err(),
        MeshError::Provisioning(FailureReason::UnexpectedPdu {
            expected: PduType::Capabilities,
            received: PduType::Start.into(),
        })
    );
    assert_eq!(
        script.await.unwrap(),
        ProvisioningPdu::Failed(ErrorCode::UnexpectedPdu)
    );
}

#[tokio::test]
async fn test_malformed_capabilities_fails_session() {
    let (provisioner_end, mut peer) = MpscChannel::pair(8);
    let mut provisioner = Provisioner::new(
        provisioner_end,
        Arc::new(MemoryOob::new()),
        settings(AuthPolicy::NoOob),
    );

    let script = tokio::spawn(async move {
        expect(&mut peer, PduType::Invite).await;
        // Capabilities type octet with one parameter byte instead of eleven
        peer.send(vec![0x01, 0x02]).await.unwrap();
        expect(&mut peer, PduType::Failed).await
    });

    let malformed = FailureReason::UnexpectedPdu {
        expected: PduType::Capabilities,
        received: ReceivedPdu::Malformed,
    };
    let result = provisioner.provision(&request("garbled"), 0x0500).await;
    assert_eq!(result.unwrap_err(), MeshError::Provisioning(malformed.clone()));
    assert_eq!(provisioner.state(), &ProvisioningState::Failed(malformed));
    assert_eq!(
        script.await.unwrap(),
        ProvisioningPdu::Failed(ErrorCode::InvalidFormat)
    );
}

/// Drops the first outgoing PDU of one type
struct Lossy {
    inner: MpscChannel,
    lose: PduType,
    lost: bool,
}

impl Lossy {
    fn new(inner: MpscChannel, lose: PduType) -> Self {
        Self {
            inner,
            lose,
            lost: false,
        }
    }
}

#[async_trait]
impl ProvisioningChannel for Lossy {
    async fn send(&mut self, pdu: Vec<u8>) -> mesh_provisioner::Result<()> {
        if !self.lost && pdu.first() == Some(&(self.lose as u8)) {
            self.lost = true;
            return Ok(());
        }
        self.inner.send(pdu).await
    }

    async fn receive(&mut self, timeout: Duration) -> mesh_provisioner::Result<Option<Vec<u8>>> {
        self.inner.receive(timeout).await
    }
}

fn lossy_settings() -> ProvisioningSettings {
    ProvisioningSettings {
        timeout: Duration::from_millis(150),
        ..settings(AuthPolicy::NoOob)
    }
}

#[tokio::test]
async fn test_lost_start_is_sent_again() {
    let allocator = allocator(0x0100, 0x01FF);
    let (provisioner_end, device_end) = MpscChannel::pair(8);
    let device = Provisionee::new(
        device_end,
        Arc::new(MemoryOob::new()),
        capabilities(1),
        &lossy_settings(),
    )
    .unwrap();
    let device_task = tokio::spawn(device.run());

    let mut provisioner = Provisioner::new(
        Lossy::new(provisioner_end, PduType::Start),
        Arc::new(MemoryOob::new()),
        lossy_settings(),
    );
    let outcome = provisioner
        .provision_into(&request("lossy"), &allocator)
        .await
        .unwrap();
    let device = device_task.await.unwrap().unwrap();
    assert_eq!(outcome.device_key, device.device_key);
    assert_eq!(device.data.unicast_address, 0x0100);
}

#[tokio::test]
async fn test_lost_complete_keeps_address_assigned() {
    let allocator = allocator(0x0100, 0x01FF);
    let (provisioner_end, device_end) = MpscChannel::pair(8);
    let device = Provisionee::new(
        Lossy::new(device_end, PduType::Complete),
        Arc::new(MemoryOob::new()),
        capabilities(2),
        &lossy_settings(),
    )
    .unwrap();
    let device_task = tokio::spawn(device.run());

    let mut provisioner =
        Provisioner::new(provisioner_end, Arc::new(MemoryOob::new()), lossy_settings());
    let outcome = provisioner
        .provision_into(&request("quiet"), &allocator)
        .await
        .unwrap();
    let device = device_task.await.unwrap().unwrap();

    // Both ends agree and the block the device now uses stays taken
    assert_eq!(outcome.device_key, device.device_key);
    assert_eq!(outcome.node.unicast_address, device.data.unicast_address);
    assert!(allocator.lock().await.is_assigned(0x0100));
    assert!(allocator.lock().await.is_assigned(0x0101));
}

#[tokio::test]
async fn test_concurrent_sessions_get_disjoint_blocks() {
    let allocator = allocator(0x0100, 0x01FF);
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let allocator = allocator.clone();
        tasks.push(tokio::spawn(async move {
            let oob = Arc::new(MemoryOob::new());
            let (outcome, device) = run_pair(3, AuthPolicy::NoOob, oob.clone(), oob, &allocator).await;
            assert_eq!(outcome.as_ref().unwrap().device_key, device.unwrap().device_key);
            outcome.unwrap().node.address_range()
        }));
    }

    let mut ranges = Vec::new();
    for task in tasks {
        ranges.push(task.await.unwrap());
    }
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            assert!(!a.overlaps(b), "{} overlaps {}", a, b);
        }
    }
}
