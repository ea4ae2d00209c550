//! Upper transport access PDU encryption
//!
//! Application nonce: 0x01 | ASZMIC<<7 | SEQ(3) | SRC | DST | IV Index
//! Device nonce:      0x02 | ASZMIC<<7 | SEQ(3) | SRC | DST | IV Index
//!
//! The access payload is encrypted with AES-CCM under an application key or
//! a device key. TransMIC is 32-bit, or 64-bit for segmented messages with
//! SZMIC set. Virtual destinations add the Label UUID as associated data.

use tracing::trace;

use crate::crypto::{self, Key, MicSize, Nonce};
use crate::error::{MeshError, Result};
use crate::keys::{ApplicationKeyCandidate, DeviceKey};

const NONCE_APPLICATION: u8 = 0x01;
const NONCE_DEVICE: u8 = 0x02;

/// Fields of the message that go into the nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpperTransportContext {
    pub src: u16,
    pub dst: u16,
    /// SEQ of the (first segment of the) message
    pub seq: u32,
    pub iv_index: u32,
    /// 64-bit TransMIC (segmented messages only)
    pub szmic: bool,
}

impl UpperTransportContext {
    fn mic_size(&self) -> MicSize {
        if self.szmic {
            MicSize::Big
        } else {
            MicSize::Small
        }
    }

    fn nonce(&self, nonce_type: u8) -> Nonce {
        let mut nonce = [0u8; 13];
        nonce[0] = nonce_type;
        nonce[1] = (self.szmic as u8) << 7;
        nonce[2..5].copy_from_slice(&self.seq.to_be_bytes()[1..]);
        nonce[5..7].copy_from_slice(&self.src.to_be_bytes());
        nonce[7..9].copy_from_slice(&self.dst.to_be_bytes());
        nonce[9..13].copy_from_slice(&self.iv_index.to_be_bytes());
        nonce
    }
}

/// Key used for an access message
#[derive(Debug, Clone, Copy)]
pub enum AccessKey<'a> {
    Application(&'a Key),
    Device(&'a DeviceKey),
}

impl AccessKey<'_> {
    fn material(&self) -> (&Key, u8) {
        match self {
            AccessKey::Application(key) => (*key, NONCE_APPLICATION),
            AccessKey::Device(DeviceKey(key)) => (key, NONCE_DEVICE),
        }
    }
}

/// Encrypt an access payload; returns `ciphertext || TransMIC`
pub fn encrypt(
    key: AccessKey<'_>,
    ctx: &UpperTransportContext,
    payload: &[u8],
    label_uuid: Option<&[u8; 16]>,
) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(MeshError::malformed("empty access payload"));
    }
    let (key, nonce_type) = key.material();
    let aad = label_uuid.map(|l| l.as_slice()).unwrap_or(&[]);
    let (mut out, mic) =
        crypto::aes_ccm_encrypt(key, &ctx.nonce(nonce_type), aad, payload, ctx.mic_size())?;
    out.extend_from_slice(&mic);
    Ok(out)
}

/// Decrypt `ciphertext || TransMIC`
pub fn decrypt(
    key: AccessKey<'_>,
    ctx: &UpperTransportContext,
    upper: &[u8],
    label_uuid: Option<&[u8; 16]>,
) -> Result<Vec<u8>> {
    let mic_len = ctx.mic_size().len();
    if upper.len() <= mic_len {
        return Err(MeshError::malformed(format!(
            "upper transport PDU of {} bytes",
            upper.len()
        )));
    }
    let (key, nonce_type) = key.material();
    let aad = label_uuid.map(|l| l.as_slice()).unwrap_or(&[]);
    let (ciphertext, mic) = upper.split_at(upper.len() - mic_len);
    crypto::aes_ccm_decrypt(key, &ctx.nonce(nonce_type), aad, ciphertext, mic)
}

/// Try every application key that matched the AID, and every candidate
/// Label UUID for a virtual destination. Returns the application key index
/// and label that authenticated along with the payload.
pub fn decrypt_with_candidates(
    candidates: &[ApplicationKeyCandidate],
    labels: &[[u8; 16]],
    ctx: &UpperTransportContext,
    upper: &[u8],
) -> Result<(u16, Option<[u8; 16]>, Vec<u8>)> {
    let label_options: Vec<Option<&[u8; 16]>> = if labels.is_empty() {
        vec![None]
    } else {
        labels.iter().map(Some).collect()
    };

    for candidate in candidates {
        for label in &label_options {
            match decrypt(AccessKey::Application(&candidate.key), ctx, upper, *label) {
                Ok(payload) => return Ok((candidate.index, label.copied(), payload)),
                Err(MeshError::AuthenticationFailure) => {
                    trace!("Application key {} did not authenticate", candidate.index)
                }
                Err(e) => return Err(e),
            }
        }
    }
    Err(MeshError::AuthenticationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(szmic: bool) -> UpperTransportContext {
        UpperTransportContext {
            src: 0x0003,
            dst: 0x1201,
            seq: 0x07080b,
            iv_index: 0x1234_5678,
            szmic,
        }
    }

    #[test]
    fn test_nonce_layout() {
        let n = ctx(true).nonce(NONCE_DEVICE);
        assert_eq!(
            n,
            [0x02, 0x80, 0x07, 0x08, 0x0b, 0x00, 0x03, 0x12, 0x01, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[test]
    fn test_app_and_device_key_round_trip() {
        let app_key = [0x63u8; 16];
        let dev_key = DeviceKey([0x9du8; 16]);
        let payload = b"\x82\x02\x01\x00";

        let sealed = encrypt(AccessKey::Application(&app_key), &ctx(false), payload, None).unwrap();
        assert_eq!(sealed.len(), payload.len() + 4);
        assert_eq!(
            decrypt(AccessKey::Application(&app_key), &ctx(false), &sealed, None).unwrap(),
            payload
        );

        let sealed = encrypt(AccessKey::Device(&dev_key), &ctx(true), payload, None).unwrap();
        assert_eq!(sealed.len(), payload.len() + 8);
        assert_eq!(
            decrypt(AccessKey::Device(&dev_key), &ctx(true), &sealed, None).unwrap(),
            payload
        );
        // Same key bytes under the other nonce type do not authenticate
        assert_eq!(
            decrypt(AccessKey::Application(&dev_key.0), &ctx(true), &sealed, None),
            Err(MeshError::AuthenticationFailure)
        );
    }

    #[test]
    fn test_label_uuid_is_authenticated() {
        let app_key = [0x11u8; 16];
        let label = [0xABu8; 16];
        let sealed = encrypt(AccessKey::Application(&app_key), &ctx(false), b"hello", Some(&label)).unwrap();
        assert!(decrypt(AccessKey::Application(&app_key), &ctx(false), &sealed, None).is_err());
        assert_eq!(
            decrypt(AccessKey::Application(&app_key), &ctx(false), &sealed, Some(&label)).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_candidates_tried_in_order() {
        let right = ApplicationKeyCandidate {
            index: 4,
            bound_net_index: 0,
            key: [0x44; 16],
            aid: 0x10,
        };
        let wrong = ApplicationKeyCandidate {
            index: 1,
            key: [0x01; 16],
            ..right
        };
        let label = [0x5Au8; 16];
        let sealed = encrypt(AccessKey::Application(&right.key), &ctx(false), b"abc", Some(&label)).unwrap();

        let (index, used_label, payload) =
            decrypt_with_candidates(&[wrong, right], &[[0u8; 16], label], &ctx(false), &sealed).unwrap();
        assert_eq!(index, 4);
        assert_eq!(used_label, Some(label));
        assert_eq!(payload, b"abc");

        assert_eq!(
            decrypt_with_candidates(&[wrong], &[], &ctx(false), &sealed),
            Err(MeshError::AuthenticationFailure)
        );
    }

    #[test]
    fn test_too_short_rejected() {
        assert!(matches!(
            decrypt(AccessKey::Application(&[0u8; 16]), &ctx(false), &[1, 2, 3, 4], None),
            Err(MeshError::ProtocolViolation(_))
        ));
    }
}
