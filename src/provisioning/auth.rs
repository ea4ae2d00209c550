//! Authentication method selection and OOB values

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

use super::pdu::{Capabilities, Start};
use super::FailureReason;
use crate::crypto::ecdh::{random_bytes, PublicKeyBytes};
use crate::error::{MeshError, Result};

/// Largest OOB size the mesh profile allows
pub const MAX_OOB_SIZE: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputAction {
    Blink = 0,
    Beep = 1,
    Vibrate = 2,
    OutputNumeric = 3,
    OutputAlphanumeric = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputAction {
    Push = 0,
    Twist = 1,
    InputNumeric = 2,
    InputAlphanumeric = 3,
}

impl TryFrom<u8> for OutputAction {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OutputAction::Blink),
            1 => Ok(OutputAction::Beep),
            2 => Ok(OutputAction::Vibrate),
            3 => Ok(OutputAction::OutputNumeric),
            4 => Ok(OutputAction::OutputAlphanumeric),
            other => Err(MeshError::malformed(format!("output OOB action {}", other))),
        }
    }
}

impl TryFrom<u8> for InputAction {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(InputAction::Push),
            1 => Ok(InputAction::Twist),
            2 => Ok(InputAction::InputNumeric),
            3 => Ok(InputAction::InputAlphanumeric),
            other => Err(MeshError::malformed(format!("input OOB action {}", other))),
        }
    }
}

/// Authentication method negotiated in the Start PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    #[default]
    NoOob,
    StaticOob,
    OutputOob { action: OutputAction, size: u8 },
    InputOob { action: InputAction, size: u8 },
}

/// Which authentication method the provisioner should pick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPolicy {
    NoOob,
    Static,
    Output,
    Input,
    /// Static if available, then output, then input, then no OOB
    #[default]
    Strongest,
}

impl AuthMethod {
    pub fn code(&self) -> u8 {
        match self {
            AuthMethod::NoOob => 0x00,
            AuthMethod::StaticOob => 0x01,
            AuthMethod::OutputOob { .. } => 0x02,
            AuthMethod::InputOob { .. } => 0x03,
        }
    }

    fn action_and_size(&self) -> (u8, u8) {
        match self {
            AuthMethod::OutputOob { action, size } => (*action as u8, *size),
            AuthMethod::InputOob { action, size } => (*action as u8, *size),
            _ => (0, 0),
        }
    }

    /// Start PDU for this method
    pub fn start(&self, oob_public_key: bool) -> Start {
        let (auth_action, auth_size) = self.action_and_size();
        Start {
            algorithm: 0x00,
            public_key: oob_public_key as u8,
            auth_method: self.code(),
            auth_action,
            auth_size,
        }
    }

    /// Method requested by a received Start PDU
    pub fn from_start(start: &Start) -> Result<Self> {
        let size_ok = (1..=MAX_OOB_SIZE).contains(&start.auth_size);
        match start.auth_method {
            0x00 | 0x01 if start.auth_action != 0 || start.auth_size != 0 => Err(
                MeshError::malformed("action/size must be zero without output or input OOB"),
            ),
            0x00 => Ok(AuthMethod::NoOob),
            0x01 => Ok(AuthMethod::StaticOob),
            0x02 if size_ok => Ok(AuthMethod::OutputOob {
                action: OutputAction::try_from(start.auth_action)?,
                size: start.auth_size,
            }),
            0x03 if size_ok => Ok(AuthMethod::InputOob {
                action: InputAction::try_from(start.auth_action)?,
                size: start.auth_size,
            }),
            _ => Err(MeshError::malformed(format!(
                "authentication method {} with size {}",
                start.auth_method, start.auth_size
            ))),
        }
    }

    /// Whether the device capabilities allow this method
    pub fn supported_by(&self, caps: &Capabilities) -> bool {
        match self {
            AuthMethod::NoOob => true,
            AuthMethod::StaticOob => caps.supports_static_oob(),
            AuthMethod::OutputOob { action, size } => {
                caps.output_oob_action & (1 << *action as u8) != 0 && *size <= caps.output_oob_size
            }
            AuthMethod::InputOob { action, size } => {
                caps.input_oob_action & (1 << *action as u8) != 0 && *size <= caps.input_oob_size
            }
        }
    }

    /// Pick a method the device supports according to `policy`
    pub fn select(caps: &Capabilities, policy: AuthPolicy) -> std::result::Result<Self, FailureReason> {
        let output = output_method(caps);
        let input = input_method(caps);
        let chosen = match policy {
            AuthPolicy::NoOob => Some(AuthMethod::NoOob),
            AuthPolicy::Static => caps.supports_static_oob().then_some(AuthMethod::StaticOob),
            AuthPolicy::Output => output,
            AuthPolicy::Input => input,
            AuthPolicy::Strongest => caps
                .supports_static_oob()
                .then_some(AuthMethod::StaticOob)
                .or(output)
                .or(input)
                .or(Some(AuthMethod::NoOob)),
        };
        chosen.ok_or(FailureReason::UnsupportedAuthMethod(policy))
    }

    /// Numeric or alphanumeric value of `size` characters for output/input OOB
    pub fn generate_value(&self) -> Result<AuthValue> {
        let alphanumeric = matches!(
            self,
            AuthMethod::OutputOob {
                action: OutputAction::OutputAlphanumeric,
                ..
            } | AuthMethod::InputOob {
                action: InputAction::InputAlphanumeric,
                ..
            }
        );
        let (_, size) = self.action_and_size();
        let size = size.clamp(1, MAX_OOB_SIZE) as usize;
        let random: [u8; 8] = random_bytes()?;

        if alphanumeric {
            const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
            let value = random[..size]
                .iter()
                .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
                .collect();
            Ok(AuthValue::Alphanumeric(value))
        } else {
            let modulus = 10u64.pow(size as u32);
            let n = u64::from_be_bytes(random) % modulus;
            // Blink/beep/vibrate/push/twist counts start at 1
            let n = match self {
                AuthMethod::OutputOob {
                    action: OutputAction::OutputNumeric,
                    ..
                }
                | AuthMethod::InputOob {
                    action: InputAction::InputNumeric,
                    ..
                } => n,
                _ => n.max(1),
            };
            Ok(AuthValue::Numeric(n as u32))
        }
    }
}

/// Output OOB preferring a numeric display
fn output_method(caps: &Capabilities) -> Option<AuthMethod> {
    if caps.output_oob_size == 0 {
        return None;
    }
    let size = caps.output_oob_size.min(MAX_OOB_SIZE);
    [
        OutputAction::OutputNumeric,
        OutputAction::OutputAlphanumeric,
        OutputAction::Blink,
        OutputAction::Beep,
        OutputAction::Vibrate,
    ]
    .into_iter()
    .find(|a| caps.output_oob_action & (1 << *a as u8) != 0)
    .map(|action| AuthMethod::OutputOob { action, size })
}

fn input_method(caps: &Capabilities) -> Option<AuthMethod> {
    if caps.input_oob_size == 0 {
        return None;
    }
    let size = caps.input_oob_size.min(MAX_OOB_SIZE);
    [
        InputAction::InputNumeric,
        InputAction::InputAlphanumeric,
        InputAction::Push,
        InputAction::Twist,
    ]
    .into_iter()
    .find(|a| caps.input_oob_action & (1 << *a as u8) != 0)
    .map(|action| AuthMethod::InputOob { action, size })
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::NoOob => write!(f, "No OOB"),
            AuthMethod::StaticOob => write!(f, "Static OOB"),
            AuthMethod::OutputOob { action, size } => write!(f, "Output OOB {:?} ({})", action, size),
            AuthMethod::InputOob { action, size } => write!(f, "Input OOB {:?} ({})", action, size),
        }
    }
}

/// Authentication value entered, displayed or pre-shared out of band
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthValue {
    None,
    Numeric(u32),
    Alphanumeric(String),
    Static([u8; 16]),
}

impl AuthValue {
    /// 16-byte AuthValue: numbers big-endian right aligned, text ASCII left
    /// aligned, zeros for No OOB
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        match self {
            AuthValue::None => {}
            AuthValue::Numeric(n) => out[12..].copy_from_slice(&n.to_be_bytes()),
            AuthValue::Alphanumeric(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(16);
                out[..len].copy_from_slice(&bytes[..len]);
            }
            AuthValue::Static(value) => out = *value,
        }
        out
    }

    /// Whether this kind of value fits the negotiated method
    pub fn matches(&self, method: &AuthMethod) -> bool {
        match (method, self) {
            (AuthMethod::NoOob, AuthValue::None) => true,
            (AuthMethod::StaticOob, AuthValue::Static(_)) => true,
            (
                AuthMethod::OutputOob {
                    action: OutputAction::OutputAlphanumeric,
                    ..
                }
                | AuthMethod::InputOob {
                    action: InputAction::InputAlphanumeric,
                    ..
                },
                AuthValue::Alphanumeric(_),
            ) => true,
            (AuthMethod::OutputOob { action, .. }, AuthValue::Numeric(_)) => {
                *action != OutputAction::OutputAlphanumeric
            }
            (AuthMethod::InputOob { action, .. }, AuthValue::Numeric(_)) => {
                *action != InputAction::InputAlphanumeric
            }
            _ => false,
        }
    }
}

impl fmt::Display for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthValue::None => write!(f, "-"),
            AuthValue::Numeric(n) => write!(f, "{}", n),
            AuthValue::Alphanumeric(s) => write!(f, "{}", s),
            AuthValue::Static(v) => write!(f, "{}", hex::encode(v)),
        }
    }
}

/// Out-of-band collaborator: the user, a QR code, NFC tag and the like
#[async_trait]
pub trait OobProvider: Send + Sync {
    /// Peer public key obtained out of band
    async fn public_key(&self) -> Result<PublicKeyBytes>;

    /// Value the user read from the peer (output OOB), typed in (input OOB)
    /// or the pre-shared static value
    async fn auth_value(&self, method: &AuthMethod) -> Result<AuthValue>;

    /// Show a value for the user to enter or read on the other side
    async fn display(&self, method: &AuthMethod, value: &AuthValue) -> Result<()>;
}

/// In-process OOB channel: whatever one side displays, the other side reads.
/// Shared between a provisioner and a simulated device.
#[derive(Debug)]
pub struct MemoryOob {
    static_value: Option<[u8; 16]>,
    public_key: Option<PublicKeyBytes>,
    shown: watch::Sender<Option<AuthValue>>,
}

impl MemoryOob {
    pub fn new() -> Self {
        let (shown, _) = watch::channel(None);
        Self {
            static_value: None,
            public_key: None,
            shown,
        }
    }

    pub fn with_static_value(mut self, value: [u8; 16]) -> Self {
        self.static_value = Some(value);
        self
    }

    pub fn with_public_key(mut self, key: PublicKeyBytes) -> Self {
        self.public_key = Some(key);
        self
    }
}

impl Default for MemoryOob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OobProvider for MemoryOob {
    async fn public_key(&self) -> Result<PublicKeyBytes> {
        self.public_key
            .ok_or_else(|| MeshError::malformed("no out-of-band public key available"))
    }

    async fn auth_value(&self, method: &AuthMethod) -> Result<AuthValue> {
        match method {
            AuthMethod::NoOob => return Ok(AuthValue::None),
            AuthMethod::StaticOob => {
                return self
                    .static_value
                    .map(AuthValue::Static)
                    .ok_or_else(|| MeshError::malformed("no static OOB value configured"))
            }
            _ => {}
        }

        let mut rx = self.shown.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(value) = current {
                return Ok(value);
            }
            rx.changed()
                .await
                .map_err(|_| MeshError::malformed("OOB channel closed"))?;
        }
    }

    async fn display(&self, _method: &AuthMethod, value: &AuthValue) -> Result<()> {
        self.shown.send_replace(Some(value.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities {
            num_elements: 1,
            algorithms: Capabilities::ALGORITHM_P256,
            ..Default::default()
        }
    }

    #[test]
    fn test_auth_value_encoding() {
        let mut expected = [0u8; 16];
        expected[12..].copy_from_slice(&[0x00, 0x01, 0xE2, 0x40]);
        assert_eq!(AuthValue::Numeric(123456).to_bytes(), expected);

        let mut expected = [0u8; 16];
        expected[..4].copy_from_slice(b"AB12");
        assert_eq!(AuthValue::Alphanumeric("AB12".into()).to_bytes(), expected);

        assert_eq!(AuthValue::None.to_bytes(), [0u8; 16]);
        assert_eq!(AuthValue::Static([9; 16]).to_bytes(), [9; 16]);
    }

    #[test]
    fn test_select_strongest() {
        assert_eq!(AuthMethod::select(&caps(), AuthPolicy::Strongest).unwrap(), AuthMethod::NoOob);

        let output = Capabilities {
            output_oob_size: 6,
            output_oob_action: 1 << OutputAction::OutputNumeric as u8 | 1 << OutputAction::Blink as u8,
            ..caps()
        };
        assert_eq!(
            AuthMethod::select(&output, AuthPolicy::Strongest).unwrap(),
            AuthMethod::OutputOob {
                action: OutputAction::OutputNumeric,
                size: 6
            }
        );

        let with_static = Capabilities {
            static_oob_type: 1,
            ..output
        };
        assert_eq!(
            AuthMethod::select(&with_static, AuthPolicy::Strongest).unwrap(),
            AuthMethod::StaticOob
        );
        assert_eq!(
            AuthMethod::select(&caps(), AuthPolicy::Input),
            Err(FailureReason::UnsupportedAuthMethod(AuthPolicy::Input))
        );
    }

    #[test]
    fn test_start_round_trip_and_validation() {
        let method = AuthMethod::InputOob {
            action: InputAction::InputAlphanumeric,
            size: 4,
        };
        let start = method.start(false);
        assert_eq!((start.auth_method, start.auth_action, start.auth_size), (3, 3, 4));
        assert_eq!(AuthMethod::from_start(&start).unwrap(), method);

        let bad_size = Start { auth_size: 9, ..start };
        assert!(AuthMethod::from_start(&bad_size).is_err());
        let stray_action = AuthMethod::NoOob.start(false);
        let stray_action = Start {
            auth_action: 1,
            ..stray_action
        };
        assert!(AuthMethod::from_start(&stray_action).is_err());
    }

    #[test]
    fn test_supported_by() {
        let input = Capabilities {
            input_oob_size: 2,
            input_oob_action: 1 << InputAction::Push as u8,
            ..caps()
        };
        assert!(AuthMethod::InputOob {
            action: InputAction::Push,
            size: 2
        }
        .supported_by(&input));
        assert!(!AuthMethod::InputOob {
            action: InputAction::Push,
            size: 3
        }
        .supported_by(&input));
        assert!(!AuthMethod::StaticOob.supported_by(&input));
    }

    #[test]
    fn test_generated_values_fit_size() {
        let numeric = AuthMethod::OutputOob {
            action: OutputAction::OutputNumeric,
            size: 4,
        };
        for _ in 0..20 {
            match numeric.generate_value().unwrap() {
                AuthValue::Numeric(n) => assert!(n < 10_000),
                other => panic!("unexpected {:?}", other),
            }
        }
        let text = AuthMethod::InputOob {
            action: InputAction::InputAlphanumeric,
            size: 6,
        };
        let value = text.generate_value().unwrap();
        assert!(value.matches(&text));
        assert!(matches!(value, AuthValue::Alphanumeric(ref s) if s.len() == 6));

        let blink = AuthMethod::OutputOob {
            action: OutputAction::Blink,
            size: 1,
        };
        assert!(matches!(blink.generate_value().unwrap(), AuthValue::Numeric(n) if (1..10).contains(&n)));
    }

    #[tokio::test]
    async fn test_memory_oob_hands_over_displayed_value() {
        let oob = std::sync::Arc::new(MemoryOob::new());
        let method = AuthMethod::OutputOob {
            action: OutputAction::OutputNumeric,
            size: 4,
        };
        let reader = {
            let oob = oob.clone();
            tokio::spawn(async move { oob.auth_value(&method).await })
        };
        oob.display(&method, &AuthValue::Numeric(4242)).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), AuthValue::Numeric(4242));

        assert_eq!(oob.auth_value(&AuthMethod::NoOob).await.unwrap(), AuthValue::None);
        assert!(oob.auth_value(&AuthMethod::StaticOob).await.is_err());
        assert!(oob.public_key().await.is_err());
    }
}
