//! P-256 ECDH for the provisioning key exchange.
//!
//! Public keys travel over the air as the raw 64-byte `X || Y` pair; ring
//! works with the SEC1 uncompressed form, which adds a leading `0x04`.

use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, ECDH_P256};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{MeshError, Result};

/// Raw public key as carried in the Provisioning Public Key PDU
pub type PublicKeyBytes = [u8; 64];

/// ECDH shared secret (x coordinate)
pub type SharedSecret = [u8; 32];

/// One-shot P-256 key pair; consumed by [`EcdhKeyPair::agree`]
pub struct EcdhKeyPair {
    private: EphemeralPrivateKey,
    public: PublicKeyBytes,
}

impl EcdhKeyPair {
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
            .map_err(|_| MeshError::Config("P-256 key generation failed".into()))?;
        let computed = private
            .compute_public_key()
            .map_err(|_| MeshError::Config("P-256 public key computation failed".into()))?;

        let sec1 = computed.as_ref();
        let mut public = [0u8; 64];
        public.copy_from_slice(&sec1[1..65]);

        Ok(Self { private, public })
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public
    }

    /// Compute the shared secret with the peer's public key.
    ///
    /// A peer key that is not a valid curve point is rejected.
    pub fn agree(self, peer: &PublicKeyBytes) -> Result<SharedSecret> {
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(peer);

        let peer = UnparsedPublicKey::new(&ECDH_P256, sec1);
        agreement::agree_ephemeral(self.private, &peer, |secret| {
            let mut out = [0u8; 32];
            out.copy_from_slice(secret);
            out
        })
        .map_err(|_| MeshError::malformed("invalid P-256 public key"))
    }
}

/// Fill a fixed-size buffer from the system CSPRNG
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    SystemRandom::new()
        .fill(&mut out)
        .map_err(|_| MeshError::Config("system random source unavailable".into()))?;
    Ok(out)
}
