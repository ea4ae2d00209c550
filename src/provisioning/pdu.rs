//! Provisioning PDU codec
//!
//! Every PDU is a type octet followed by fixed-length parameters:
//!
//! | Type | PDU            | Parameters |
//! |------|----------------|------------|
//! | 0x00 | Invite         | 1  |
//! | 0x01 | Capabilities   | 11 |
//! | 0x02 | Start          | 5  |
//! | 0x03 | Public Key     | 64 |
//! | 0x04 | Input Complete | 0  |
//! | 0x05 | Confirmation   | 16 |
//! | 0x06 | Random         | 16 |
//! | 0x07 | Data           | 33 |
//! | 0x08 | Complete       | 0  |
//! | 0x09 | Failed         | 1  |

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::is_unicast;
use crate::crypto::ecdh::PublicKeyBytes;
use crate::crypto::{self, Key, MicSize, Nonce};
use crate::error::{MeshError, Result};
use crate::keys::MAX_KEY_INDEX;

/// Encrypted provisioning data plus its 64-bit MIC
pub const PROVISIONING_DATA_LEN: usize = 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    Invite = 0x00,
    Capabilities = 0x01,
    Start = 0x02,
    PublicKey = 0x03,
    InputComplete = 0x04,
    Confirmation = 0x05,
    Random = 0x06,
    Data = 0x07,
    Complete = 0x08,
    Failed = 0x09,
}

impl TryFrom<u8> for PduType {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(PduType::Invite),
            0x01 => Ok(PduType::Capabilities),
            0x02 => Ok(PduType::Start),
            0x03 => Ok(PduType::PublicKey),
            0x04 => Ok(PduType::InputComplete),
            0x05 => Ok(PduType::Confirmation),
            0x06 => Ok(PduType::Random),
            0x07 => Ok(PduType::Data),
            0x08 => Ok(PduType::Complete),
            0x09 => Ok(PduType::Failed),
            other => Err(MeshError::malformed(format!(
                "unknown provisioning PDU type 0x{:02X}",
                other
            ))),
        }
    }
}

impl PduType {
    /// Length of the parameters following the type octet
    pub fn parameters_len(self) -> usize {
        match self {
            PduType::Invite => 1,
            PduType::Capabilities => 11,
            PduType::Start => 5,
            PduType::PublicKey => 64,
            PduType::InputComplete => 0,
            PduType::Confirmation => 16,
            PduType::Random => 16,
            PduType::Data => PROVISIONING_DATA_LEN,
            PduType::Complete => 0,
            PduType::Failed => 1,
        }
    }
}

impl fmt::Display for PduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PduType::Invite => "Invite",
            PduType::Capabilities => "Capabilities",
            PduType::Start => "Start",
            PduType::PublicKey => "Public Key",
            PduType::InputComplete => "Input Complete",
            PduType::Confirmation => "Confirmation",
            PduType::Random => "Random",
            PduType::Data => "Data",
            PduType::Complete => "Complete",
            PduType::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Error codes carried by the Provisioning Failed PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    InvalidPdu = 0x01,
    InvalidFormat = 0x02,
    UnexpectedPdu = 0x03,
    ConfirmationFailed = 0x04,
    OutOfResources = 0x05,
    DecryptionFailed = 0x06,
    UnexpectedError = 0x07,
    CannotAssignAddresses = 0x08,
}

impl TryFrom<u8> for ErrorCode {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ErrorCode::InvalidPdu),
            0x02 => Ok(ErrorCode::InvalidFormat),
            0x03 => Ok(ErrorCode::UnexpectedPdu),
            0x04 => Ok(ErrorCode::ConfirmationFailed),
            0x05 => Ok(ErrorCode::OutOfResources),
            0x06 => Ok(ErrorCode::DecryptionFailed),
            0x07 => Ok(ErrorCode::UnexpectedError),
            0x08 => Ok(ErrorCode::CannotAssignAddresses),
            other => Err(MeshError::malformed(format!(
                "reserved provisioning error code 0x{:02X}",
                other
            ))),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, *self as u8)
    }
}

/// Provisioning Capabilities parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub num_elements: u8,
    /// Bit 0: FIPS P-256 Elliptic Curve
    pub algorithms: u16,
    /// Bit 0: public key available out of band
    pub public_key_type: u8,
    /// Bit 0: static OOB information available
    pub static_oob_type: u8,
    pub output_oob_size: u8,
    pub output_oob_action: u16,
    pub input_oob_size: u8,
    pub input_oob_action: u16,
}

impl Capabilities {
    pub const ALGORITHM_P256: u16 = 0x0001;

    pub fn supports_oob_public_key(&self) -> bool {
        self.public_key_type & 0x01 != 0
    }

    pub fn supports_static_oob(&self) -> bool {
        self.static_oob_type & 0x01 != 0
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.num_elements);
        buf.put_u16(self.algorithms);
        buf.put_u8(self.public_key_type);
        buf.put_u8(self.static_oob_type);
        buf.put_u8(self.output_oob_size);
        buf.put_u16(self.output_oob_action);
        buf.put_u8(self.input_oob_size);
        buf.put_u16(self.input_oob_action);
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let caps = Self {
            num_elements: buf.get_u8(),
            algorithms: buf.get_u16(),
            public_key_type: buf.get_u8(),
            static_oob_type: buf.get_u8(),
            output_oob_size: buf.get_u8(),
            output_oob_action: buf.get_u16(),
            input_oob_size: buf.get_u8(),
            input_oob_action: buf.get_u16(),
        };
        if caps.num_elements == 0 {
            return Err(MeshError::malformed("capabilities report zero elements"));
        }
        if caps.algorithms & Self::ALGORITHM_P256 == 0 {
            return Err(MeshError::malformed("device does not support P-256"));
        }
        Ok(caps)
    }
}

/// Provisioning Start parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Start {
    pub algorithm: u8,
    /// 0x00: no OOB public key, 0x01: OOB public key
    pub public_key: u8,
    pub auth_method: u8,
    pub auth_action: u8,
    pub auth_size: u8,
}

impl Start {
    pub fn uses_oob_public_key(&self) -> bool {
        self.public_key == 0x01
    }

    fn get(buf: &mut &[u8]) -> Result<Self> {
        let start = Self {
            algorithm: buf.get_u8(),
            public_key: buf.get_u8(),
            auth_method: buf.get_u8(),
            auth_action: buf.get_u8(),
            auth_size: buf.get_u8(),
        };
        if start.algorithm != 0x00 || start.public_key > 0x01 || start.auth_method > 0x03 {
            return Err(MeshError::malformed(format!("invalid Start parameters {:?}", start)));
        }
        Ok(start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningPdu {
    Invite { attention_duration: u8 },
    Capabilities(Capabilities),
    Start(Start),
    PublicKey(PublicKeyBytes),
    InputComplete,
    Confirmation([u8; 16]),
    Random([u8; 16]),
    Data([u8; PROVISIONING_DATA_LEN]),
    Complete,
    Failed(ErrorCode),
}

impl ProvisioningPdu {
    pub fn pdu_type(&self) -> PduType {
        match self {
            ProvisioningPdu::Invite { .. } => PduType::Invite,
            ProvisioningPdu::Capabilities(_) => PduType::Capabilities,
            ProvisioningPdu::Start(_) => PduType::Start,
            ProvisioningPdu::PublicKey(_) => PduType::PublicKey,
            ProvisioningPdu::InputComplete => PduType::InputComplete,
            ProvisioningPdu::Confirmation(_) => PduType::Confirmation,
            ProvisioningPdu::Random(_) => PduType::Random,
            ProvisioningPdu::Data(_) => PduType::Data,
            ProvisioningPdu::Complete => PduType::Complete,
            ProvisioningPdu::Failed(_) => PduType::Failed,
        }
    }

    /// Parameters without the type octet (what goes into ConfirmationInputs)
    pub fn parameters(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.pdu_type().parameters_len());
        match self {
            ProvisioningPdu::Invite { attention_duration } => buf.put_u8(*attention_duration),
            ProvisioningPdu::Capabilities(caps) => caps.put(&mut buf),
            ProvisioningPdu::Start(start) => {
                buf.put_u8(start.algorithm);
                buf.put_u8(start.public_key);
                buf.put_u8(start.auth_method);
                buf.put_u8(start.auth_action);
                buf.put_u8(start.auth_size);
            }
            ProvisioningPdu::PublicKey(key) => buf.put_slice(key),
            ProvisioningPdu::Confirmation(value) | ProvisioningPdu::Random(value) => {
                buf.put_slice(value)
            }
            ProvisioningPdu::Data(data) => buf.put_slice(data),
            ProvisioningPdu::Failed(code) => buf.put_u8(*code as u8),
            ProvisioningPdu::InputComplete | ProvisioningPdu::Complete => {}
        }
        buf.to_vec()
    }

    pub fn encode(&self) -> Vec<u8> {
        let params = self.parameters();
        let mut out = Vec::with_capacity(1 + params.len());
        out.push(self.pdu_type() as u8);
        out.extend_from_slice(&params);
        out
    }

    /// Decode one PDU. The length must match the type exactly.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&first, rest) = data
            .split_first()
            .ok_or_else(|| MeshError::malformed("empty provisioning PDU"))?;
        // Upper two bits are padding and must be zero
        if first & 0xC0 != 0 {
            return Err(MeshError::malformed(format!("padding bits set in 0x{:02X}", first)));
        }
        let pdu_type = PduType::try_from(first)?;
        if rest.len() != pdu_type.parameters_len() {
            return Err(MeshError::malformed(format!(
                "{} PDU with {} parameter bytes (expected {})",
                pdu_type,
                rest.len(),
                pdu_type.parameters_len()
            )));
        }

        let mut buf = rest;
        let pdu = match pdu_type {
            PduType::Invite => ProvisioningPdu::Invite {
                attention_duration: buf.get_u8(),
            },
            PduType::Capabilities => ProvisioningPdu::Capabilities(Capabilities::get(&mut buf)?),
            PduType::Start => ProvisioningPdu::Start(Start::get(&mut buf)?),
            PduType::PublicKey => ProvisioningPdu::PublicKey(fixed(buf)),
            PduType::InputComplete => ProvisioningPdu::InputComplete,
            PduType::Confirmation => ProvisioningPdu::Confirmation(fixed(buf)),
            PduType::Random => ProvisioningPdu::Random(fixed(buf)),
            PduType::Data => ProvisioningPdu::Data(fixed(buf)),
            PduType::Complete => ProvisioningPdu::Complete,
            PduType::Failed => ProvisioningPdu::Failed(ErrorCode::try_from(buf.get_u8())?),
        };
        Ok(pdu)
    }
}

/// Plaintext of the Provisioning Data PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningData {
    pub net_key: Key,
    pub net_key_index: u16,
    /// Bit 0: key refresh in progress, bit 1: IV update active
    pub flags: u8,
    pub iv_index: u32,
    pub unicast_address: u16,
}

impl ProvisioningData {
    pub const LEN: usize = 25;

    pub fn key_refresh(&self) -> bool {
        self.flags & 0x01 != 0
    }

    pub fn iv_update_active(&self) -> bool {
        self.flags & 0x02 != 0
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(&self.net_key);
        buf.put_u16(self.net_key_index);
        buf.put_u8(self.flags);
        buf.put_u32(self.iv_index);
        buf.put_u16(self.unicast_address);
        fixed(&buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != Self::LEN {
            return Err(MeshError::malformed(format!(
                "provisioning data of {} bytes",
                data.len()
            )));
        }
        let mut buf = &data[16..];
        let parsed = Self {
            net_key: fixed(data),
            net_key_index: buf.get_u16(),
            flags: buf.get_u8(),
            iv_index: buf.get_u32(),
            unicast_address: buf.get_u16(),
        };
        if parsed.net_key_index > MAX_KEY_INDEX || !is_unicast(parsed.unicast_address) {
            return Err(MeshError::malformed(format!(
                "provisioning data with key index {} and address {:04X}",
                parsed.net_key_index, parsed.unicast_address
            )));
        }
        Ok(parsed)
    }

    /// Encrypt with the session key; the result is the Data PDU payload
    pub fn seal(&self, session_key: &Key, session_nonce: &Nonce) -> Result<[u8; PROVISIONING_DATA_LEN]> {
        let (ciphertext, mic) =
            crypto::aes_ccm_encrypt(session_key, session_nonce, &[], &self.encode(), MicSize::Big)?;
        let mut out = [0u8; PROVISIONING_DATA_LEN];
        out[..Self::LEN].copy_from_slice(&ciphertext);
        out[Self::LEN..].copy_from_slice(&mic);
        Ok(out)
    }

    /// Decrypt and parse a Data PDU payload
    pub fn open(
        sealed: &[u8; PROVISIONING_DATA_LEN],
        session_key: &Key,
        session_nonce: &Nonce,
    ) -> Result<Self> {
        let (ciphertext, mic) = sealed.split_at(Self::LEN);
        let plaintext = crypto::aes_ccm_decrypt(session_key, session_nonce, &[], ciphertext, mic)?;
        Self::decode(&plaintext)
    }
}

/// Copy an already length-checked slice into an array
fn fixed<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[..N]);
    out
}

impl fmt::Display for ProvisioningPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningPdu::Invite { attention_duration } => {
                write!(f, "Invite (attention {}s)", attention_duration)
            }
            ProvisioningPdu::Capabilities(caps) => {
                write!(f, "Capabilities ({} elements)", caps.num_elements)
            }
            ProvisioningPdu::Failed(code) => write!(f, "Failed: {}", code),
            other => write!(f, "{}", other.pdu_type()),
        }
    }
}
