//! Device (provisionee) role
//!
//! Used by the device simulator and by tests to run the other half of the
//! handshake against a [`Provisioner`](super::Provisioner).

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::auth::{AuthMethod, AuthValue, OobProvider};
use super::channel::ProvisioningChannel;
use super::pdu::{Capabilities, PduType, ProvisioningData, ProvisioningPdu};
use super::{
    internal, unexpected, FailureReason, Link, ProvisioningSettings, ProvisioningState, Session,
    Step,
};
use crate::crypto::ecdh::{EcdhKeyPair, PublicKeyBytes};
use crate::error::{MeshError, Result};
use crate::keys::{DeviceKey, KeyStore};

/// What the device learned from a successful run
#[derive(Debug, Clone)]
pub struct ProvisionedDevice {
    pub device_key: DeviceKey,
    pub data: ProvisioningData,
    pub method: AuthMethod,
}

pub struct Provisionee<C> {
    link: Link<C>,
    oob: Arc<dyn OobProvider>,
    capabilities: Capabilities,
    key_pair: Option<EcdhKeyPair>,
    public_key: PublicKeyBytes,
    state: ProvisioningState,
    /// How long Complete is re-sent for a retransmitted Data PDU
    grace: Duration,
}

impl<C: ProvisioningChannel + 'static> Provisionee<C> {
    /// The key pair is generated up front so its public half can be handed
    /// out of band before the link opens
    pub fn new(
        channel: C,
        oob: Arc<dyn OobProvider>,
        capabilities: Capabilities,
        settings: &ProvisioningSettings,
    ) -> Result<Self> {
        if capabilities.num_elements == 0
            || capabilities.algorithms & Capabilities::ALGORITHM_P256 == 0
        {
            return Err(MeshError::Config(format!(
                "unusable device capabilities {:?}",
                capabilities
            )));
        }
        let key_pair = EcdhKeyPair::generate()?;
        let public_key = *key_pair.public_key();
        Ok(Self {
            link: Link::new(channel, settings.timeout, settings.max_retries),
            oob,
            capabilities,
            key_pair: Some(key_pair),
            public_key,
            state: ProvisioningState::Invite,
            grace: settings.timeout * (settings.max_retries + 1),
        })
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }

    pub fn state(&self) -> &ProvisioningState {
        &self.state
    }

    /// Wait for an Invite and answer the provisioner until Complete.
    ///
    /// The link stays open in the background for a while afterwards so a
    /// lost Complete can still reach the provisioner.
    pub async fn run(mut self) -> Result<ProvisionedDevice> {
        let mut session = Session::default();
        match self.handshake(&mut session).await {
            Ok(device) => {
                info!(
                    "Provisioned at {:04X} with key index {}",
                    device.data.unicast_address, device.data.net_key_index
                );
                let grace = self.grace;
                let mut link = self.link;
                tokio::spawn(async move { link.linger(grace).await });
                Ok(device)
            }
            Err(reason) => {
                warn!("Device provisioning failed in {}: {}", self.state, reason);
                self.link.report(&reason).await;
                self.state = ProvisioningState::Failed(reason.clone());
                Err(MeshError::Provisioning(reason))
            }
        }
    }

    fn advance(&mut self, next: ProvisioningState) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }

    async fn handshake(&mut self, session: &mut Session) -> Step<ProvisionedDevice> {
        let invite = self.link.exchange(None, PduType::Invite).await?;
        if let ProvisioningPdu::Invite { attention_duration } = invite {
            info!("Invited, attention for {}s", attention_duration);
        }
        session.confirmation_inputs.extend(invite.parameters());
        self.advance(ProvisioningState::Capabilities);

        let caps = ProvisioningPdu::Capabilities(self.capabilities);
        session.confirmation_inputs.extend(caps.parameters());
        let start = match self
            .link
            .exchange_ahead(Some(&caps), PduType::Start, Some(PduType::PublicKey))
            .await?
        {
            ProvisioningPdu::Start(start) => start,
            other => return Err(unexpected(PduType::Start, &other)),
        };
        let method =
            AuthMethod::from_start(&start).map_err(|e| FailureReason::InvalidPdu(e.to_string()))?;
        if !method.supported_by(&self.capabilities)
            || (start.uses_oob_public_key() && !self.capabilities.supports_oob_public_key())
        {
            return Err(FailureReason::InvalidPdu(format!(
                "Start asks for unsupported {}",
                method
            )));
        }
        session.confirmation_inputs.extend(ProvisioningPdu::Start(start).parameters());
        session.method = method;
        session.oob_public_key = start.uses_oob_public_key();
        self.advance(ProvisioningState::PublicKeyExchange);

        let peer = match self.link.exchange(None, PduType::PublicKey).await? {
            ProvisioningPdu::PublicKey(key) => key,
            other => return Err(unexpected(PduType::PublicKey, &other)),
        };
        if peer == self.public_key {
            return Err(FailureReason::InvalidPdu("provisioner echoed our public key".into()));
        }
        if !session.oob_public_key {
            self.link.send(&ProvisioningPdu::PublicKey(self.public_key)).await?;
        }
        session.confirmation_inputs.extend_from_slice(&peer);
        session.confirmation_inputs.extend_from_slice(&self.public_key);
        let key_pair = self
            .key_pair
            .take()
            .ok_or_else(|| FailureReason::Internal("key pair already used".into()))?;
        session.ecdh_secret = key_pair
            .agree(&peer)
            .map_err(|e| FailureReason::InvalidPdu(e.to_string()))?;
        self.advance(ProvisioningState::AuthenticationInputs);

        let value = self.auth_value(&method).await?;
        session.auth_value = value.to_bytes();
        let input_complete = ProvisioningPdu::InputComplete;
        let outgoing = matches!(method, AuthMethod::InputOob { .. }).then_some(&input_complete);
        self.advance(ProvisioningState::Confirmation);

        let peer_confirmation = match self.link.exchange(outgoing, PduType::Confirmation).await? {
            ProvisioningPdu::Confirmation(value) => value,
            other => return Err(unexpected(PduType::Confirmation, &other)),
        };
        session.prepare_confirmation()?;
        session.accept_peer_confirmation(peer_confirmation)?;
        self.advance(ProvisioningState::Random);

        let ours = ProvisioningPdu::Confirmation(session.confirmation);
        let peer_random = match self.link.exchange(Some(&ours), PduType::Random).await? {
            ProvisioningPdu::Random(value) => value,
            other => return Err(unexpected(PduType::Random, &other)),
        };
        session.verify_peer(peer_random)?;
        self.advance(ProvisioningState::DataDistribution);

        let ours = ProvisioningPdu::Random(session.random);
        let sealed = match self.link.exchange(Some(&ours), PduType::Data).await? {
            ProvisioningPdu::Data(sealed) => sealed,
            other => return Err(unexpected(PduType::Data, &other)),
        };
        let keys = session.keys(&session.peer_random, &session.random);
        let data = ProvisioningData::open(&sealed, &keys.session_key, &keys.session_nonce)
            .map_err(|e| match e {
                MeshError::AuthenticationFailure => FailureReason::DecryptionFailed,
                other => FailureReason::InvalidPdu(other.to_string()),
            })?;
        self.link.send(&ProvisioningPdu::Complete).await?;

        Ok(ProvisionedDevice {
            device_key: KeyStore::derive_device_key(&session.ecdh_secret, &keys.provisioning_salt),
            data,
            method,
        })
    }

    async fn auth_value(&self, method: &AuthMethod) -> Step<AuthValue> {
        let oob_error = |e: MeshError| FailureReason::Oob(e.to_string());
        let value = match method {
            AuthMethod::NoOob => AuthValue::None,
            AuthMethod::OutputOob { .. } => {
                let value = method.generate_value().map_err(internal)?;
                self.oob.display(method, &value).await.map_err(oob_error)?;
                value
            }
            AuthMethod::StaticOob | AuthMethod::InputOob { .. } => {
                self.oob.auth_value(method).await.map_err(oob_error)?
            }
        };
        if !value.matches(method) {
            return Err(FailureReason::Oob(format!("{:?} does not fit {}", value, method)));
        }
        Ok(value)
    }
}
