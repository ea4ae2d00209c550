//! Provisioning: turning an unprovisioned device into a node
//!
//! Each session is a sequential state machine:
//!
//! ```text
//! Invite -> Capabilities -> PublicKeyExchange -> AuthenticationInputs
//!        -> Confirmation -> Random -> DataDistribution -> Complete
//! ```
//!
//! Any non-terminal state can end in `Failed(reason)`. The only suspension
//! point is the channel receive; the session context is threaded through
//! every transition.

pub mod auth;
pub mod channel;
pub mod device;
pub mod pdu;
pub mod provisioner;

pub use auth::{AuthMethod, AuthPolicy, AuthValue, MemoryOob, OobProvider};
pub use channel::{MpscChannel, ProvisioningChannel};
pub use device::{ProvisionedDevice, Provisionee};
pub use pdu::{Capabilities, ErrorCode, PduType, ProvisioningData, ProvisioningPdu};
pub use provisioner::{ProvisioningOutcome, ProvisioningRequest, Provisioner};

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::crypto::{self, ecdh::SharedSecret, Key, Nonce};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    Invite,
    Capabilities,
    PublicKeyExchange,
    AuthenticationInputs,
    Confirmation,
    Random,
    DataDistribution,
    Complete,
    Failed(FailureReason),
}

impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// What arrived in place of the expected PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedPdu {
    Pdu(PduType),
    /// Unknown type octet or wrong parameter length
    Malformed,
}

impl From<PduType> for ReceivedPdu {
    fn from(pdu_type: PduType) -> Self {
        ReceivedPdu::Pdu(pdu_type)
    }
}

impl fmt::Display for ReceivedPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceivedPdu::Pdu(pdu_type) => write!(f, "{}", pdu_type),
            ReceivedPdu::Malformed => write!(f, "malformed"),
        }
    }
}

/// Why a provisioning attempt ended without a node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("unexpected {received} PDU while waiting for {expected}")]
    UnexpectedPdu {
        expected: PduType,
        received: ReceivedPdu,
    },

    #[error("invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("confirmation mismatch")]
    ConfirmationMismatch,

    #[error("provisioning data did not decrypt")]
    DecryptionFailed,

    #[error("no response from peer")]
    Timeout,

    #[error("peer reported {0}")]
    RemoteFailure(ErrorCode),

    #[error("no unicast address block for {0} element(s)")]
    CannotAssignAddresses(u8),

    #[error("device does not support {0:?} authentication")]
    UnsupportedAuthMethod(AuthPolicy),

    #[error("out-of-band exchange failed: {0}")]
    Oob(String),

    #[error("provisioning link closed")]
    LinkClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl FailureReason {
    /// Code to report to the peer in a Failed PDU; `None` when the peer
    /// cannot be told (link gone, or the peer failed first)
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            FailureReason::UnexpectedPdu {
                received: ReceivedPdu::Malformed,
                ..
            } => Some(ErrorCode::InvalidFormat),
            FailureReason::UnexpectedPdu { .. } => Some(ErrorCode::UnexpectedPdu),
            FailureReason::InvalidPdu(_) => Some(ErrorCode::InvalidFormat),
            FailureReason::ConfirmationMismatch => Some(ErrorCode::ConfirmationFailed),
            FailureReason::DecryptionFailed => Some(ErrorCode::DecryptionFailed),
            FailureReason::CannotAssignAddresses(_) => Some(ErrorCode::CannotAssignAddresses),
            FailureReason::UnsupportedAuthMethod(_) | FailureReason::Oob(_) => {
                Some(ErrorCode::UnexpectedError)
            }
            FailureReason::Internal(_) => Some(ErrorCode::OutOfResources),
            FailureReason::Timeout | FailureReason::RemoteFailure(_) | FailureReason::LinkClosed => {
                None
            }
        }
    }
}

pub(crate) type Step<T> = std::result::Result<T, FailureReason>;

fn internal(e: crate::error::MeshError) -> FailureReason {
    FailureReason::Internal(e.to_string())
}

/// Per-attempt settings
#[derive(Debug, Clone)]
pub struct ProvisioningSettings {
    /// How long to wait for each PDU
    pub timeout: Duration,
    /// Re-sends of the current PDU before giving up
    pub max_retries: u32,
    pub attention_duration: u8,
    pub auth_policy: AuthPolicy,
    /// Use the device's OOB public key when it offers one
    pub use_oob_public_key: bool,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            attention_duration: 5,
            auth_policy: AuthPolicy::default(),
            use_oob_public_key: false,
        }
    }
}

/// Secrets and transcript accumulated during one attempt. Wiped on drop.
#[derive(Default)]
pub(crate) struct Session {
    /// Invite || Capabilities || Start || provisioner key || device key
    pub confirmation_inputs: Vec<u8>,
    pub capabilities: Capabilities,
    pub method: AuthMethod,
    pub oob_public_key: bool,
    pub ecdh_secret: SharedSecret,
    pub auth_value: [u8; 16],
    pub confirmation_salt: [u8; 16],
    pub confirmation_key: Key,
    /// Our random and confirmation
    pub random: [u8; 16],
    pub confirmation: [u8; 16],
    pub peer_confirmation: [u8; 16],
    pub peer_random: [u8; 16],
}

/// Keys derived once both random values are known
pub(crate) struct SessionKeys {
    pub session_key: Key,
    pub session_nonce: Nonce,
    pub provisioning_salt: [u8; 16],
}

impl Session {
    /// ConfirmationSalt, ConfirmationKey, our random and confirmation value
    pub fn prepare_confirmation(&mut self) -> Step<()> {
        self.confirmation_salt = crypto::confirmation_salt(&self.confirmation_inputs);
        self.confirmation_key = crypto::confirmation_key(&self.ecdh_secret, &self.confirmation_salt);
        self.random = crypto::ecdh::random_bytes().map_err(internal)?;
        self.confirmation = crypto::confirmation(&self.confirmation_key, &self.random, &self.auth_value);
        Ok(())
    }

    /// Store the peer's confirmation. A peer echoing our own value back is
    /// treated as a mismatch.
    pub fn accept_peer_confirmation(&mut self, value: [u8; 16]) -> Step<()> {
        if value == self.confirmation {
            return Err(FailureReason::ConfirmationMismatch);
        }
        self.peer_confirmation = value;
        Ok(())
    }

    /// Check the peer's confirmation against its revealed random
    pub fn verify_peer(&mut self, peer_random: [u8; 16]) -> Step<()> {
        crypto::verify_confirmation(
            &self.confirmation_key,
            &peer_random,
            &self.auth_value,
            &self.peer_confirmation,
        )
        .map_err(|_| FailureReason::ConfirmationMismatch)?;
        self.peer_random = peer_random;
        Ok(())
    }

    pub fn keys(&self, random_provisioner: &[u8; 16], random_device: &[u8; 16]) -> SessionKeys {
        let provisioning_salt =
            crypto::provisioning_salt(&self.confirmation_salt, random_provisioner, random_device);
        SessionKeys {
            session_key: crypto::session_key(&self.ecdh_secret, &provisioning_salt),
            session_nonce: crypto::session_nonce(&self.ecdh_secret, &provisioning_salt),
            provisioning_salt,
        }
    }
}

impl Session {
    fn wipe(&mut self) {
        self.confirmation_inputs.fill(0);
        self.confirmation_inputs.clear();
        self.ecdh_secret.fill(0);
        self.auth_value.fill(0);
        self.confirmation_salt.fill(0);
        self.confirmation_key.fill(0);
        self.random.fill(0);
        self.confirmation.fill(0);
        self.peer_confirmation.fill(0);
        self.peer_random.fill(0);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.session_key.fill(0);
        self.session_nonce.fill(0);
        self.provisioning_salt.fill(0);
    }
}

/// PDU exchange over a channel with timeout handling.
///
/// Everything sent since the peer's last accepted PDU is kept as the
/// pending batch. A timeout re-sends the whole batch, so a PDU that expects
/// no answer (Start) travels again together with the one after it.
pub(crate) struct Link<C> {
    channel: C,
    timeout: Duration,
    max_retries: u32,
    /// Every PDU accepted during this attempt, oldest first
    received: Vec<Vec<u8>>,
    pending: Vec<Vec<u8>>,
}

impl<C: ProvisioningChannel> Link<C> {
    pub fn new(channel: C, timeout: Duration, max_retries: u32) -> Self {
        Self {
            channel,
            timeout,
            max_retries,
            received: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    pub async fn send(&mut self, pdu: &ProvisioningPdu) -> Step<()> {
        debug!("TX {}", pdu);
        let bytes = pdu.encode();
        self.channel
            .send(bytes.clone())
            .await
            .map_err(|_| FailureReason::LinkClosed)?;
        self.pending.push(bytes);
        Ok(())
    }

    async fn resend_pending(&mut self) -> Step<()> {
        for bytes in self.pending.clone() {
            self.channel
                .send(bytes)
                .await
                .map_err(|_| FailureReason::LinkClosed)?;
        }
        Ok(())
    }

    /// Tell the peer why we gave up; errors are ignored since the attempt
    /// is already over
    pub async fn report(&mut self, reason: &FailureReason) {
        if let Some(code) = reason.error_code() {
            if self.send(&ProvisioningPdu::Failed(code)).await.is_err() {
                debug!("Could not report {} to peer", code);
            }
        }
    }

    /// Send `outgoing` (if any) and wait for a PDU of type `expected`.
    /// On timeout the pending batch is sent again, up to `max_retries` times.
    pub async fn exchange(
        &mut self,
        outgoing: Option<&ProvisioningPdu>,
        expected: PduType,
    ) -> Step<ProvisioningPdu> {
        self.exchange_ahead(outgoing, expected, None).await
    }

    /// Like [`Link::exchange`], but a PDU of type `ahead` is dropped instead
    /// of failing the attempt. The peer sends it right after `expected`
    /// without waiting for an answer, so seeing it first means `expected`
    /// was lost and both will come again.
    pub async fn exchange_ahead(
        &mut self,
        outgoing: Option<&ProvisioningPdu>,
        expected: PduType,
        ahead: Option<PduType>,
    ) -> Step<ProvisioningPdu> {
        if let Some(pdu) = outgoing {
            self.send(pdu).await?;
        }

        let mut retries = 0;
        loop {
            let data = match self.channel.receive(self.timeout).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    if retries >= self.max_retries {
                        return Err(FailureReason::Timeout);
                    }
                    retries += 1;
                    warn!(
                        "No {} PDU within {:?}, retry {}/{}",
                        expected, self.timeout, retries, self.max_retries
                    );
                    self.resend_pending().await?;
                    continue;
                }
                Err(_) => return Err(FailureReason::LinkClosed),
            };

            // The peer repeating its last PDU means our answer was lost
            if self.received.last() == Some(&data) {
                debug!("Duplicate PDU while waiting for {}", expected);
                self.resend_pending().await?;
                continue;
            }
            if self.received.contains(&data) {
                trace!("Stale duplicate while waiting for {}", expected);
                continue;
            }

            let pdu = match ProvisioningPdu::decode(&data) {
                Ok(pdu) => pdu,
                Err(e) => {
                    debug!("Malformed PDU while waiting for {}: {}", expected, e);
                    return Err(FailureReason::UnexpectedPdu {
                        expected,
                        received: ReceivedPdu::Malformed,
                    });
                }
            };
            debug!("RX {}", pdu);
            return match pdu {
                ProvisioningPdu::Failed(code) if expected != PduType::Failed => {
                    Err(FailureReason::RemoteFailure(code))
                }
                pdu if pdu.pdu_type() == expected => {
                    self.received.push(data);
                    self.pending.clear();
                    Ok(pdu)
                }
                pdu if Some(pdu.pdu_type()) == ahead => {
                    debug!("{} arrived before {}, waiting for both again", pdu, expected);
                    continue;
                }
                other => Err(unexpected(expected, &other)),
            };
        }
    }

    /// After the last PDU of a successful attempt: keep answering
    /// retransmissions of the final received PDU for `grace`, or until the
    /// peer closes the link
    pub async fn linger(&mut self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return;
            }
            match self.channel.receive(left).await {
                Ok(Some(data)) if self.received.last() == Some(&data) => {
                    debug!("Peer repeated its last PDU, answering again");
                    if self.resend_pending().await.is_err() {
                        return;
                    }
                }
                Ok(Some(_)) => trace!("Ignoring PDU after completion"),
                Ok(None) | Err(_) => return,
            }
        }
    }
}

/// Shorthand for the "wrong variant" arm after [`Link::exchange`]
pub(crate) fn unexpected(expected: PduType, received: &ProvisioningPdu) -> FailureReason {
    FailureReason::UnexpectedPdu {
        expected,
        received: received.pdu_type().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::channel::MpscChannel;

    #[test]
    fn test_failure_codes() {
        assert_eq!(
            FailureReason::ConfirmationMismatch.error_code(),
            Some(ErrorCode::ConfirmationFailed)
        );
        assert_eq!(FailureReason::Timeout.error_code(), None);
        assert_eq!(
            FailureReason::RemoteFailure(ErrorCode::DecryptionFailed).error_code(),
            None
        );
        assert_eq!(
            FailureReason::CannotAssignAddresses(3).to_string(),
            "no unicast address block for 3 element(s)"
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProvisioningState::Invite.to_string(), "Invite");
        assert_eq!(
            ProvisioningState::Failed(FailureReason::Timeout).to_string(),
            "Failed(no response from peer)"
        );
        assert!(ProvisioningState::Complete.is_terminal());
        assert!(!ProvisioningState::Random.is_terminal());
    }

    // Session implements Drop, so no struct update syntax
    fn shared_session() -> Session {
        let mut session = Session::default();
        session.confirmation_inputs = vec![0x05; 145];
        session.ecdh_secret = [0x33; 32];
        session
    }

    #[test]
    fn test_session_confirmation_cross_check() {
        let mut provisioner = shared_session();
        let mut device = shared_session();
        provisioner.prepare_confirmation().unwrap();
        device.prepare_confirmation().unwrap();

        provisioner.accept_peer_confirmation(device.confirmation).unwrap();
        device.accept_peer_confirmation(provisioner.confirmation).unwrap();
        provisioner.verify_peer(device.random).unwrap();
        device.verify_peer(provisioner.random).unwrap();

        let a = provisioner.keys(&provisioner.random, &device.random);
        let b = device.keys(&provisioner.random, &device.random);
        assert_eq!(a.session_key, b.session_key);
        assert_eq!(a.session_nonce, b.session_nonce);

        // Wrong random fails verification
        let mut other = shared_session();
        other.prepare_confirmation().unwrap();
        other.accept_peer_confirmation(device.confirmation).unwrap();
        assert_eq!(other.verify_peer([0u8; 16]), Err(FailureReason::ConfirmationMismatch));
    }

    #[test]
    fn test_malformed_pdu_is_unexpected() {
        let reason = FailureReason::UnexpectedPdu {
            expected: PduType::Capabilities,
            received: ReceivedPdu::Malformed,
        };
        assert_eq!(reason.error_code(), Some(ErrorCode::InvalidFormat));
        assert_eq!(
            reason.to_string(),
            "unexpected malformed PDU while waiting for Capabilities"
        );
    }

    #[test]
    fn test_session_wipe_clears_transcript() {
        let mut session = shared_session();
        session.prepare_confirmation().unwrap();
        session.accept_peer_confirmation([0x44; 16]).unwrap();
        session.wipe();

        assert!(session.confirmation_inputs.is_empty());
        assert_eq!(session.ecdh_secret, [0u8; 32]);
        assert_eq!(session.confirmation_salt, [0u8; 16]);
        assert_eq!(session.confirmation_key, [0u8; 16]);
        assert_eq!(session.confirmation, [0u8; 16]);
        assert_eq!(session.peer_confirmation, [0u8; 16]);
        assert_eq!(session.random, [0u8; 16]);
    }

    #[tokio::test]
    async fn test_link_rejects_garbage() {
        let (channel, mut peer) = MpscChannel::pair(4);
        let mut link = Link::new(channel, Duration::from_millis(200), 0);
        peer.send(vec![0x01, 0x02]).await.unwrap();
        assert_eq!(
            link.exchange(None, PduType::Capabilities).await.unwrap_err(),
            FailureReason::UnexpectedPdu {
                expected: PduType::Capabilities,
                received: ReceivedPdu::Malformed,
            }
        );
    }

    #[tokio::test]
    async fn test_link_resends_whole_batch() {
        let (channel, mut peer) = MpscChannel::pair(8);
        let mut link = Link::new(channel, Duration::from_millis(50), 1);
        let task = tokio::spawn(async move {
            let caps = Capabilities {
                num_elements: 1,
                algorithms: Capabilities::ALGORITHM_P256,
                ..Default::default()
            };
            link.send(&ProvisioningPdu::Capabilities(caps)).await.unwrap();
            link.send(&ProvisioningPdu::Random([0x11; 16])).await.unwrap();
            link.exchange(None, PduType::Confirmation).await
        });

        let mut seen = Vec::new();
        while let Some(data) = peer.receive(Duration::from_millis(200)).await.unwrap() {
            seen.push(ProvisioningPdu::decode(&data).unwrap().pdu_type());
            if seen.len() == 4 {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                PduType::Capabilities,
                PduType::Random,
                PduType::Capabilities,
                PduType::Random
            ]
        );
        assert_eq!(task.await.unwrap().unwrap_err(), FailureReason::Timeout);
    }

    #[tokio::test]
    async fn test_link_skips_pdu_sent_ahead() {
        let (channel, mut peer) = MpscChannel::pair(8);
        let mut link = Link::new(channel, Duration::from_millis(500), 0);
        let start = ProvisioningPdu::Start(pdu::Start {
            algorithm: 0,
            public_key: 0,
            auth_method: 0,
            auth_action: 0,
            auth_size: 0,
        });
        peer.send(ProvisioningPdu::PublicKey([0x22; 64]).encode())
            .await
            .unwrap();
        peer.send(start.encode()).await.unwrap();

        let got = link
            .exchange_ahead(None, PduType::Start, Some(PduType::PublicKey))
            .await
            .unwrap();
        assert_eq!(got, start);
    }

    #[tokio::test]
    async fn test_linger_answers_repeated_pdu() {
        let (channel, mut peer) = MpscChannel::pair(8);
        let mut link = Link::new(channel, Duration::from_millis(500), 0);
        let data = ProvisioningPdu::Random([0x33; 16]).encode();
        peer.send(data.clone()).await.unwrap();
        link.exchange(None, PduType::Random).await.unwrap();
        link.send(&ProvisioningPdu::Complete).await.unwrap();
        let task = tokio::spawn(async move { link.linger(Duration::from_millis(300)).await });

        assert_eq!(
            peer.receive(Duration::from_millis(100)).await.unwrap(),
            Some(ProvisioningPdu::Complete.encode())
        );
        peer.send(data).await.unwrap();
        assert_eq!(
            peer.receive(Duration::from_millis(100)).await.unwrap(),
            Some(ProvisioningPdu::Complete.encode())
        );
        task.await.unwrap();
    }

    #[test]
    fn test_reflected_confirmation_rejected() {
        let mut session = Session::default();
        session.prepare_confirmation().unwrap();
        let own = session.confirmation;
        assert_eq!(
            session.accept_peer_confirmation(own),
            Err(FailureReason::ConfirmationMismatch)
        );
    }
}
