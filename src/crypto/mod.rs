//! Mesh security toolbox
//!
//! AES-CMAC, AES-CCM and the derivation functions built on top of them
//! (s1, k1, k2, k3, k4), plus the provisioning-specific derivations.
//! Everything here is a pure function over fixed-size buffers.

pub mod ecdh;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use ccm::aead::consts::{U13, U4, U8};
use ccm::aead::AeadInPlace;
use ccm::Ccm;
use cmac::{Cmac, Mac};

use crate::error::{MeshError, Result};

/// 128-bit key
pub type Key = [u8; 16];

/// CCM nonce (13 bytes for every mesh nonce type)
pub type Nonce = [u8; 13];

/// NetMIC / TransMIC sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicSize {
    Small = 4,
    Big = 8,
}

impl MicSize {
    pub fn len(self) -> usize {
        self as usize
    }

    pub fn from_len(len: usize) -> Result<Self> {
        match len {
            4 => Ok(MicSize::Small),
            8 => Ok(MicSize::Big),
            other => Err(MeshError::malformed(format!(
                "unsupported MIC size {}",
                other
            ))),
        }
    }
}

type Ccm32 = Ccm<Aes128, U4, U13>;
type Ccm64 = Ccm<Aes128, U8, U13>;

/// AES-CMAC (RFC 4493)
pub fn aes_cmac(key: &Key, message: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Recompute the CMAC of `message` and compare it against `tag` in constant time
pub fn aes_cmac_verify(key: &Key, message: &[u8], tag: &[u8]) -> Result<()> {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(message);
    mac.verify_slice(tag)
        .map_err(|_| MeshError::AuthenticationFailure)
}

/// Single-block AES-128 encryption, the `e` function of the mesh profile
pub fn aes_ecb(key: &Key, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// AES-CCM authenticated encryption; returns `(ciphertext, mic)`
pub fn aes_ccm_encrypt(
    key: &Key,
    nonce: &Nonce,
    additional_data: &[u8],
    plaintext: &[u8],
    mic_size: MicSize,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = plaintext.to_vec();
    let nonce = GenericArray::from_slice(nonce);
    let mic = match mic_size {
        MicSize::Small => Ccm32::new(GenericArray::from_slice(key))
            .encrypt_in_place_detached(nonce, additional_data, &mut buf)
            .map(|tag| tag.to_vec()),
        MicSize::Big => Ccm64::new(GenericArray::from_slice(key))
            .encrypt_in_place_detached(nonce, additional_data, &mut buf)
            .map(|tag| tag.to_vec()),
    }
    .map_err(|_| MeshError::malformed("CCM input too long"))?;
    Ok((buf, mic))
}

/// AES-CCM decryption. The MIC length selects the CCM variant; a MIC that
/// does not verify yields [`MeshError::AuthenticationFailure`].
pub fn aes_ccm_decrypt(
    key: &Key,
    nonce: &Nonce,
    additional_data: &[u8],
    ciphertext: &[u8],
    mic: &[u8],
) -> Result<Vec<u8>> {
    let mut buf = ciphertext.to_vec();
    let nonce = GenericArray::from_slice(nonce);
    // Tag comparison inside `ccm` is constant-time.
    match MicSize::from_len(mic.len())? {
        MicSize::Small => Ccm32::new(GenericArray::from_slice(key)).decrypt_in_place_detached(
            nonce,
            additional_data,
            &mut buf,
            GenericArray::from_slice(mic),
        ),
        MicSize::Big => Ccm64::new(GenericArray::from_slice(key)).decrypt_in_place_detached(
            nonce,
            additional_data,
            &mut buf,
            GenericArray::from_slice(mic),
        ),
    }
    .map_err(|_| MeshError::AuthenticationFailure)?;
    Ok(buf)
}

/// Salt generation: `s1(M) = AES-CMAC(ZERO, M)`
pub fn s1(input: &[u8]) -> [u8; 16] {
    aes_cmac(&[0u8; 16], input)
}

/// `k1(N, SALT, P) = AES-CMAC(AES-CMAC(SALT, N), P)`
pub fn k1(key: &[u8], salt: &[u8; 16], info: &[u8]) -> [u8; 16] {
    let t = aes_cmac(salt, key);
    aes_cmac(&t, info)
}

/// Network key material derived by k2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct K2Output {
    pub nid: u8,
    pub encryption_key: Key,
    pub privacy_key: Key,
}

/// `k2(N, P)`: NID, encryption key and privacy key.
///
/// `p` is `0x00` for the master security credentials.
pub fn k2(network_key: &Key, p: &[u8]) -> K2Output {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, network_key);

    let mut input = Vec::with_capacity(16 + p.len() + 1);
    input.extend_from_slice(p);
    input.push(0x01);
    let t1 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t1);
    input.extend_from_slice(p);
    input.push(0x02);
    let t2 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t2);
    input.extend_from_slice(p);
    input.push(0x03);
    let t3 = aes_cmac(&t, &input);

    K2Output {
        nid: t1[15] & 0x7F,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// `k3(N)`: 64-bit network ID
pub fn k3(network_key: &Key) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = aes_cmac(&salt, network_key);
    let out = aes_cmac(&t, b"id64\x01");
    let mut id = [0u8; 8];
    id.copy_from_slice(&out[8..]);
    id
}

/// `k4(N)`: 6-bit application key identifier
pub fn k4(app_key: &Key) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, app_key);
    aes_cmac(&t, b"id6\x01")[15] & 0x3F
}

/// Identity key used for node identity advertising
pub fn identity_key(network_key: &Key) -> Key {
    k1(network_key, &s1(b"nkik"), b"id128\x01")
}

/// Beacon key used to authenticate secure network beacons
pub fn beacon_key(network_key: &Key) -> Key {
    k1(network_key, &s1(b"nkbk"), b"id128\x01")
}

/// Virtual address of a Label UUID: `0x8000 | (AES-CMAC(s1("vtad"), Label) & 0x3FFF)`
pub fn virtual_address(label_uuid: &[u8; 16]) -> u16 {
    let hash = aes_cmac(&s1(b"vtad"), label_uuid);
    0x8000 | (u16::from_be_bytes([hash[14], hash[15]]) & 0x3FFF)
}

// Provisioning derivations

/// `ConfirmationSalt = s1(ConfirmationInputs)`
pub fn confirmation_salt(confirmation_inputs: &[u8]) -> [u8; 16] {
    s1(confirmation_inputs)
}

pub fn confirmation_key(ecdh_secret: &[u8; 32], confirmation_salt: &[u8; 16]) -> Key {
    k1(ecdh_secret, confirmation_salt, b"prck")
}

/// `AES-CMAC(ConfirmationKey, Random || AuthValue)`
pub fn confirmation(confirmation_key: &Key, random: &[u8; 16], auth_value: &[u8; 16]) -> [u8; 16] {
    let mut msg = [0u8; 32];
    msg[..16].copy_from_slice(random);
    msg[16..].copy_from_slice(auth_value);
    aes_cmac(confirmation_key, &msg)
}

/// Constant-time check of a peer's confirmation value
pub fn verify_confirmation(
    confirmation_key: &Key,
    random: &[u8; 16],
    auth_value: &[u8; 16],
    received: &[u8; 16],
) -> Result<()> {
    let mut msg = [0u8; 32];
    msg[..16].copy_from_slice(random);
    msg[16..].copy_from_slice(auth_value);
    aes_cmac_verify(confirmation_key, &msg, received)
}

/// `ProvisioningSalt = s1(ConfirmationSalt || RandomProvisioner || RandomDevice)`
pub fn provisioning_salt(
    confirmation_salt: &[u8; 16],
    random_provisioner: &[u8; 16],
    random_device: &[u8; 16],
) -> [u8; 16] {
    let mut input = [0u8; 48];
    input[..16].copy_from_slice(confirmation_salt);
    input[16..32].copy_from_slice(random_provisioner);
    input[32..].copy_from_slice(random_device);
    s1(&input)
}

pub fn session_key(ecdh_secret: &[u8; 32], provisioning_salt: &[u8; 16]) -> Key {
    k1(ecdh_secret, provisioning_salt, b"prsk")
}

/// Session nonce: the 13 least significant octets of `k1(.., "prsn")`
pub fn session_nonce(ecdh_secret: &[u8; 32], provisioning_salt: &[u8; 16]) -> Nonce {
    let full = k1(ecdh_secret, provisioning_salt, b"prsn");
    let mut nonce = [0u8; 13];
    nonce.copy_from_slice(&full[3..]);
    nonce
}

pub fn device_key(ecdh_secret: &[u8; 32], provisioning_salt: &[u8; 16]) -> Key {
    k1(ecdh_secret, provisioning_salt, b"prdk")
}
