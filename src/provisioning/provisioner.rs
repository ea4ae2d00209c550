//! Provisioner role

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::auth::{AuthMethod, AuthValue, OobProvider};
use super::channel::ProvisioningChannel;
use super::pdu::{Capabilities, PduType, ProvisioningData, ProvisioningPdu};
use super::{
    internal, unexpected, FailureReason, Link, ProvisioningSettings, ProvisioningState, Session,
    Step,
};
use crate::address::{Release, SharedAllocator, UNICAST_MAX};
use crate::crypto::ecdh::EcdhKeyPair;
use crate::crypto::Key;
use crate::error::{MeshError, Result};
use crate::keys::{DeviceKey, KeyStore};
use crate::network::iv::IvIndex;
use crate::node::Node;

/// What to hand to the device
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub name: String,
    pub device_uuid: Option<[u8; 16]>,
    pub net_key: Key,
    pub net_key_index: u16,
    pub iv_index: IvIndex,
    /// Network key is in the middle of a key refresh
    pub key_refresh: bool,
}

impl ProvisioningRequest {
    fn flags(&self) -> u8 {
        self.key_refresh as u8 | self.iv_index.flags()
    }
}

/// Result of a completed attempt
#[derive(Debug, Clone)]
pub struct ProvisioningOutcome {
    pub device_key: DeviceKey,
    pub node: Node,
}

enum AddressSource<'a> {
    Fixed(u16),
    Allocator(&'a SharedAllocator),
}

/// Drives one device from Invite to Complete
pub struct Provisioner<C> {
    link: Link<C>,
    oob: Arc<dyn OobProvider>,
    settings: ProvisioningSettings,
    state: ProvisioningState,
    /// Address block taken from the shared allocator during this attempt
    allocated: Option<(u16, u8)>,
}

impl<C: ProvisioningChannel> Provisioner<C> {
    pub fn new(channel: C, oob: Arc<dyn OobProvider>, settings: ProvisioningSettings) -> Self {
        Self {
            link: Link::new(channel, settings.timeout, settings.max_retries),
            oob,
            settings,
            state: ProvisioningState::Invite,
            allocated: None,
        }
    }

    pub fn state(&self) -> &ProvisioningState {
        &self.state
    }

    pub fn into_channel(self) -> C {
        self.link.into_inner()
    }

    /// Provision the device at a caller-chosen primary address
    pub async fn provision(
        &mut self,
        request: &ProvisioningRequest,
        unicast_address: u16,
    ) -> Result<ProvisioningOutcome> {
        self.run(request, AddressSource::Fixed(unicast_address)).await
    }

    /// Provision the device at an address block taken from `allocator`.
    /// The block is released again if the attempt fails.
    pub async fn provision_into(
        &mut self,
        request: &ProvisioningRequest,
        allocator: &SharedAllocator,
    ) -> Result<ProvisioningOutcome> {
        let result = self.run(request, AddressSource::Allocator(allocator)).await;
        if let (Err(_), Some((start, count))) = (&result, self.allocated.take()) {
            allocator.lock().await.release(Release::Block { start, count });
            info!("Released {} address(es) at {:04X}", count, start);
        }
        result
    }

    async fn run(
        &mut self,
        request: &ProvisioningRequest,
        source: AddressSource<'_>,
    ) -> Result<ProvisioningOutcome> {
        self.state = ProvisioningState::Invite;
        self.allocated = None;
        let mut session = Session::default();
        let mut address = 0u16;
        let mut device_key = None;

        info!("Provisioning {}", request.name);
        loop {
            let step = match self.state.clone() {
                ProvisioningState::Invite => self.invite(&mut session).await,
                ProvisioningState::Capabilities => {
                    match self.assign_address(&session.capabilities, &source).await {
                        Ok(assigned) => {
                            address = assigned;
                            self.start(&mut session).await
                        }
                        Err(reason) => Err(reason),
                    }
                }
                ProvisioningState::PublicKeyExchange => self.exchange_public_keys(&mut session).await,
                ProvisioningState::AuthenticationInputs => self.authenticate(&mut session).await,
                ProvisioningState::Confirmation => self.confirm(&mut session).await,
                ProvisioningState::Random => self.check_random(&mut session).await,
                ProvisioningState::DataDistribution => {
                    match self.distribute(&session, request, address).await {
                        Ok(key) => {
                            device_key = Some(key);
                            Ok(ProvisioningState::Complete)
                        }
                        Err(reason) => Err(reason),
                    }
                }
                ProvisioningState::Complete => {
                    let device_key = device_key
                        .ok_or_else(|| MeshError::malformed("completed without a device key"))?;
                    let mut node = Node::new(
                        request.name.clone(),
                        address,
                        session.capabilities.num_elements,
                        device_key,
                        request.net_key_index,
                        request.iv_index,
                    );
                    node.capabilities = Some(session.capabilities);
                    node.device_uuid = request.device_uuid.map(hex::encode);
                    info!(
                        "Provisioned {} at {:04X} ({} element(s))",
                        request.name, address, node.element_count
                    );
                    self.allocated = None;
                    return Ok(ProvisioningOutcome { device_key, node });
                }
                ProvisioningState::Failed(reason) => {
                    return Err(MeshError::Provisioning(reason));
                }
            };

            match step {
                Ok(next) => {
                    debug!("{} -> {}", self.state, next);
                    self.state = next;
                }
                Err(reason) => {
                    warn!("Provisioning failed in {}: {}", self.state, reason);
                    self.link.report(&reason).await;
                    self.state = ProvisioningState::Failed(reason);
                }
            }
        }
    }

    /// Invite: send Invite, wait for Capabilities
    async fn invite(&mut self, session: &mut Session) -> Step<ProvisioningState> {
        let invite = ProvisioningPdu::Invite {
            attention_duration: self.settings.attention_duration,
        };
        let caps = match self.link.exchange(Some(&invite), PduType::Capabilities).await? {
            ProvisioningPdu::Capabilities(caps) => caps,
            other => return Err(unexpected(PduType::Capabilities, &other)),
        };
        info!(
            "Device has {} element(s), static OOB {}, output OOB size {}, input OOB size {}",
            caps.num_elements,
            caps.supports_static_oob(),
            caps.output_oob_size,
            caps.input_oob_size
        );
        session.confirmation_inputs.extend(invite.parameters());
        session
            .confirmation_inputs
            .extend(ProvisioningPdu::Capabilities(caps).parameters());
        session.capabilities = caps;
        Ok(ProvisioningState::Capabilities)
    }

    async fn assign_address(
        &mut self,
        caps: &Capabilities,
        source: &AddressSource<'_>,
    ) -> Step<u16> {
        let count = caps.num_elements;
        match source {
            AddressSource::Fixed(address) => {
                let last = *address as u32 + count as u32 - 1;
                if *address == 0 || last > UNICAST_MAX as u32 {
                    return Err(FailureReason::CannotAssignAddresses(count));
                }
                Ok(*address)
            }
            AddressSource::Allocator(allocator) => {
                let start = allocator
                    .lock()
                    .await
                    .allocate_unicast(count)
                    .map_err(|_| FailureReason::CannotAssignAddresses(count))?;
                self.allocated = Some((start, count));
                info!("Allocated {} address(es) at {:04X}", count, start);
                Ok(start)
            }
        }
    }

    /// Capabilities: pick the method and send Start
    async fn start(&mut self, session: &mut Session) -> Step<ProvisioningState> {
        let caps = session.capabilities;
        let method = AuthMethod::select(&caps, self.settings.auth_policy)?;
        let oob_public_key = self.settings.use_oob_public_key && caps.supports_oob_public_key();
        info!("Using {} authentication", method);

        let start = ProvisioningPdu::Start(method.start(oob_public_key));
        self.link.send(&start).await?;
        session.confirmation_inputs.extend(start.parameters());
        session.method = method;
        session.oob_public_key = oob_public_key;
        Ok(ProvisioningState::PublicKeyExchange)
    }

    async fn exchange_public_keys(&mut self, session: &mut Session) -> Step<ProvisioningState> {
        let key_pair = EcdhKeyPair::generate().map_err(internal)?;
        let own = *key_pair.public_key();
        let ours = ProvisioningPdu::PublicKey(own);

        let device_key = if session.oob_public_key {
            self.link.send(&ours).await?;
            self.oob
                .public_key()
                .await
                .map_err(|e| FailureReason::Oob(e.to_string()))?
        } else {
            match self.link.exchange(Some(&ours), PduType::PublicKey).await? {
                ProvisioningPdu::PublicKey(key) => key,
                other => return Err(unexpected(PduType::PublicKey, &other)),
            }
        };
        if device_key == own {
            return Err(FailureReason::InvalidPdu("device echoed our public key".into()));
        }

        session.confirmation_inputs.extend_from_slice(&own);
        session.confirmation_inputs.extend_from_slice(&device_key);
        session.ecdh_secret = key_pair
            .agree(&device_key)
            .map_err(|e| FailureReason::InvalidPdu(e.to_string()))?;
        Ok(ProvisioningState::AuthenticationInputs)
    }

    async fn authenticate(&mut self, session: &mut Session) -> Step<ProvisioningState> {
        let method = session.method;
        let oob_error = |e: MeshError| FailureReason::Oob(e.to_string());

        let value = match method {
            AuthMethod::NoOob => AuthValue::None,
            AuthMethod::StaticOob | AuthMethod::OutputOob { .. } => {
                self.oob.auth_value(&method).await.map_err(oob_error)?
            }
            AuthMethod::InputOob { .. } => {
                let value = method.generate_value().map_err(internal)?;
                self.oob.display(&method, &value).await.map_err(oob_error)?;
                match self.link.exchange(None, PduType::InputComplete).await? {
                    ProvisioningPdu::InputComplete => value,
                    other => return Err(unexpected(PduType::InputComplete, &other)),
                }
            }
        };
        if !value.matches(&method) {
            return Err(FailureReason::Oob(format!("{:?} does not fit {}", value, method)));
        }
        session.auth_value = value.to_bytes();
        Ok(ProvisioningState::Confirmation)
    }

    async fn confirm(&mut self, session: &mut Session) -> Step<ProvisioningState> {
        session.prepare_confirmation()?;
        let ours = ProvisioningPdu::Confirmation(session.confirmation);
        match self.link.exchange(Some(&ours), PduType::Confirmation).await? {
            ProvisioningPdu::Confirmation(value) => session.accept_peer_confirmation(value)?,
            other => return Err(unexpected(PduType::Confirmation, &other)),
        }
        Ok(ProvisioningState::Random)
    }

    /// Reveal our random and check the device's confirmation against its
    /// random before any key material leaves this side
    async fn check_random(&mut self, session: &mut Session) -> Step<ProvisioningState> {
        let ours = ProvisioningPdu::Random(session.random);
        match self.link.exchange(Some(&ours), PduType::Random).await? {
            ProvisioningPdu::Random(value) => session.verify_peer(value)?,
            other => return Err(unexpected(PduType::Random, &other)),
        }
        Ok(ProvisioningState::DataDistribution)
    }

    async fn distribute(
        &mut self,
        session: &Session,
        request: &ProvisioningRequest,
        address: u16,
    ) -> Step<DeviceKey> {
        let keys = session.keys(&session.random, &session.peer_random);
        let data = ProvisioningData {
            net_key: request.net_key,
            net_key_index: request.net_key_index,
            flags: request.flags(),
            iv_index: request.iv_index.index,
            unicast_address: address,
        };
        let sealed = data
            .seal(&keys.session_key, &keys.session_nonce)
            .map_err(internal)?;

        match self
            .link
            .exchange(Some(&ProvisioningPdu::Data(sealed)), PduType::Complete)
            .await?
        {
            ProvisioningPdu::Complete => {}
            other => return Err(unexpected(PduType::Complete, &other)),
        }
        Ok(KeyStore::derive_device_key(&session.ecdh_secret, &keys.provisioning_salt))
    }
}
