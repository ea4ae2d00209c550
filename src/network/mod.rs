//! Network layer: NetMIC authentication, encryption and header obfuscation
//!
//! PDU structure:
//!   IVI(1b)|NID(7b) | CTL(1b)|TTL(7b) | SEQ(3) | SRC(2) | DST(2) | TransportPDU | NetMIC(4 or 8)
//!
//! DST and the transport PDU are encrypted with AES-CCM under the network
//! encryption key; CTL/TTL, SEQ and SRC are then obfuscated with the privacy key.

pub mod iv;
pub mod replay;

use parking_lot::{Mutex, RwLock};
use std::fmt;
use tracing::trace;

use crate::address::{is_unicast, UNASSIGNED_ADDRESS};
use crate::crypto::{self, MicSize};
use crate::error::{MeshError, Result};
use crate::keys::{NetworkKeyCandidate, NetworkKeyMaterial, SharedKeyStore};
use crate::node::Node;
use iv::{IvIndex, SequenceCounter, SEQ_MAX};
use replay::ReplayCache;

/// Largest network PDU carried by the advertising bearer
pub const MAX_NETWORK_PDU: usize = 29;
/// IVI/NID + CTL/TTL + SEQ + SRC + DST
pub const NETWORK_HEADER_LEN: usize = 9;
pub const MAX_TTL: u8 = 0x7F;

/// Decoded (or to-be-encoded) network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Least significant bit of the IV index used
    pub ivi: u8,
    pub nid: u8,
    /// Control message (NetMIC is 64-bit) rather than access message
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: u16,
    pub dst: u16,
    pub transport_pdu: Vec<u8>,
}

impl NetworkPdu {
    /// PDU without security fields; IVI and NID are filled in by [`encode`]
    pub fn new(ctl: bool, ttl: u8, seq: u32, src: u16, dst: u16, transport_pdu: Vec<u8>) -> Self {
        Self {
            ivi: 0,
            nid: 0,
            ctl,
            ttl,
            seq,
            src,
            dst,
            transport_pdu,
        }
    }

    pub fn mic_size(&self) -> MicSize {
        if self.ctl {
            MicSize::Big
        } else {
            MicSize::Small
        }
    }

    fn max_transport_len(ctl: bool) -> usize {
        if ctl {
            MAX_NETWORK_PDU - NETWORK_HEADER_LEN - MicSize::Big.len()
        } else {
            MAX_NETWORK_PDU - NETWORK_HEADER_LEN - MicSize::Small.len()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ttl > MAX_TTL {
            return Err(MeshError::malformed(format!("TTL {} exceeds 127", self.ttl)));
        }
        if self.seq > SEQ_MAX {
            return Err(MeshError::malformed(format!("SEQ {} exceeds 24 bits", self.seq)));
        }
        if !is_unicast(self.src) {
            return Err(MeshError::malformed(format!(
                "SRC {:04X} is not a unicast address",
                self.src
            )));
        }
        if self.dst == UNASSIGNED_ADDRESS {
            return Err(MeshError::malformed("DST is the unassigned address"));
        }
        let max = Self::max_transport_len(self.ctl);
        if self.transport_pdu.is_empty() || self.transport_pdu.len() > max {
            return Err(MeshError::malformed(format!(
                "transport PDU of {} bytes (allowed 1..={})",
                self.transport_pdu.len(),
                max
            )));
        }
        Ok(())
    }
}

impl fmt::Display for NetworkPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} NID=0x{:02X} IVI={} TTL={} SEQ={} SRC={:04X} DST={:04X} TransportPDU={}",
            if self.ctl { "Control" } else { "Access" },
            self.nid,
            self.ivi,
            self.ttl,
            self.seq,
            self.src,
            self.dst,
            hex::encode(&self.transport_pdu)
        )
    }
}

/// `0x00 || CTL|TTL || SEQ || SRC || 0x0000 || IV Index`
fn network_nonce(ctl_ttl: u8, seq: u32, src: u16, iv_index: u32) -> crypto::Nonce {
    let mut nonce = [0u8; 13];
    nonce[0] = 0x00;
    nonce[1] = ctl_ttl;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// `PECB = e(PrivacyKey, 0x0000000000 || IV Index || PrivacyRandom)`
fn pecb(privacy_key: &crypto::Key, iv_index: u32, privacy_random: &[u8]) -> [u8; 16] {
    let mut plaintext = [0u8; 16];
    plaintext[5..9].copy_from_slice(&iv_index.to_be_bytes());
    plaintext[9..16].copy_from_slice(&privacy_random[..7]);
    crypto::aes_ecb(privacy_key, &plaintext)
}

/// Encrypt, authenticate and obfuscate a network PDU
pub fn encode(pdu: &NetworkPdu, material: &NetworkKeyMaterial, iv_index: u32) -> Result<Vec<u8>> {
    pdu.validate()?;
    seal(pdu, material, iv_index)
}

fn seal(pdu: &NetworkPdu, material: &NetworkKeyMaterial, iv_index: u32) -> Result<Vec<u8>> {
    let ctl_ttl = (pdu.ctl as u8) << 7 | pdu.ttl;
    let nonce = network_nonce(ctl_ttl, pdu.seq, pdu.src, iv_index);

    let mut plaintext = Vec::with_capacity(2 + pdu.transport_pdu.len());
    plaintext.extend_from_slice(&pdu.dst.to_be_bytes());
    plaintext.extend_from_slice(&pdu.transport_pdu);
    let (ciphertext, mic) =
        crypto::aes_ccm_encrypt(&material.encryption_key, &nonce, &[], &plaintext, pdu.mic_size())?;

    let mut out = Vec::with_capacity(NETWORK_HEADER_LEN - 2 + ciphertext.len() + mic.len());
    out.push(((iv_index & 1) as u8) << 7 | material.nid);
    out.push(ctl_ttl);
    out.extend_from_slice(&pdu.seq.to_be_bytes()[1..]);
    out.extend_from_slice(&pdu.src.to_be_bytes());
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&mic);

    let pecb = pecb(&material.privacy_key, iv_index, &out[7..14]);
    for (b, p) in out[1..7].iter_mut().zip(pecb.iter()) {
        *b ^= p;
    }
    Ok(out)
}

/// Decode with one candidate material set
fn decode_with(data: &[u8], material: &NetworkKeyMaterial, iv_index: u32) -> Result<NetworkPdu> {
    let pecb = pecb(&material.privacy_key, iv_index, &data[7..14]);
    let mut header = [0u8; 6];
    for (i, h) in header.iter_mut().enumerate() {
        *h = data[1 + i] ^ pecb[i];
    }

    let ctl = header[0] & 0x80 != 0;
    let ttl = header[0] & 0x7F;
    let seq = u32::from_be_bytes([0, header[1], header[2], header[3]]);
    let src = u16::from_be_bytes([header[4], header[5]]);

    let mic_len = if ctl { MicSize::Big.len() } else { MicSize::Small.len() };
    if data.len() < NETWORK_HEADER_LEN + 1 + mic_len {
        return Err(MeshError::AuthenticationFailure);
    }

    let nonce = network_nonce(header[0], seq, src, iv_index);
    let (ciphertext, mic) = data[7..].split_at(data.len() - 7 - mic_len);
    let plaintext = crypto::aes_ccm_decrypt(&material.encryption_key, &nonce, &[], ciphertext, mic)?;

    if !is_unicast(src) {
        return Err(MeshError::malformed(format!("SRC {:04X} is not unicast", src)));
    }
    let dst = u16::from_be_bytes([plaintext[0], plaintext[1]]);
    if dst == UNASSIGNED_ADDRESS {
        return Err(MeshError::malformed("DST is the unassigned address"));
    }

    Ok(NetworkPdu {
        ivi: data[0] >> 7,
        nid: data[0] & 0x7F,
        ctl,
        ttl,
        seq,
        src,
        dst,
        transport_pdu: plaintext[2..].to_vec(),
    })
}

/// Result of a successful decode: the PDU and the key that authenticated it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedNetworkPdu {
    pub pdu: NetworkPdu,
    pub net_key_index: u16,
    pub iv_index: u32,
}

/// Try every candidate whose NID matches; the first one that authenticates wins
pub fn decode(data: &[u8], candidates: &[NetworkKeyCandidate], iv: IvIndex) -> Result<DecodedNetworkPdu> {
    if data.len() < NETWORK_HEADER_LEN + 1 + MicSize::Small.len() || data.len() > MAX_NETWORK_PDU {
        return Err(MeshError::malformed(format!(
            "network PDU of {} bytes",
            data.len()
        )));
    }

    let ivi = data[0] >> 7;
    let nid = data[0] & 0x7F;
    let iv_index = iv.rx_index(ivi).ok_or(MeshError::AuthenticationFailure)?;

    for candidate in candidates.iter().filter(|c| c.material.nid == nid) {
        match decode_with(data, &candidate.material, iv_index) {
            Ok(pdu) => {
                return Ok(DecodedNetworkPdu {
                    pdu,
                    net_key_index: candidate.index,
                    iv_index,
                })
            }
            Err(e) => trace!("Network key {} did not authenticate: {}", candidate.index, e),
        }
    }
    Err(MeshError::AuthenticationFailure)
}

/// Network layer bound to the local node: owns its sequence counter, the
/// IV index and the replay protection list
pub struct NetworkLayer {
    keys: SharedKeyStore,
    iv: RwLock<IvIndex>,
    seq: SequenceCounter,
    replay: Mutex<ReplayCache>,
    /// Primary unicast address of the local node
    address: u16,
}

impl NetworkLayer {
    pub fn new(keys: SharedKeyStore, address: u16, iv: IvIndex, seq: u32, replay_capacity: usize) -> Self {
        Self {
            keys,
            iv: RwLock::new(iv),
            seq: SequenceCounter::new(seq),
            replay: Mutex::new(ReplayCache::new(replay_capacity)),
            address,
        }
    }

    /// Network layer for a stored node, resuming at its persisted SEQ and IV index
    pub fn for_node(keys: SharedKeyStore, node: &Node, replay_capacity: usize) -> Self {
        Self::new(
            keys,
            node.unicast_address,
            node.iv_index,
            node.sequence_number,
            replay_capacity,
        )
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn keys(&self) -> &SharedKeyStore {
        &self.keys
    }

    pub fn iv_index(&self) -> IvIndex {
        *self.iv.read()
    }

    pub fn set_iv_index(&self, iv: IvIndex) {
        *self.iv.write() = iv;
    }

    pub fn sequence(&self) -> &SequenceCounter {
        &self.seq
    }

    /// Encode one PDU from the local node with an already reserved SEQ
    pub fn encode_with_seq(
        &self,
        net_key_index: u16,
        ctl: bool,
        ttl: u8,
        seq: u32,
        dst: u16,
        transport_pdu: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let material = self.keys.read().tx_material(net_key_index)?;
        let iv_index = self.iv.read().tx_index();
        let pdu = NetworkPdu::new(ctl, ttl, seq, self.address, dst, transport_pdu);
        encode(&pdu, &material, iv_index)
    }

    /// Encode one PDU from the local node, taking the next SEQ
    pub fn send(
        &self,
        net_key_index: u16,
        ctl: bool,
        ttl: u8,
        dst: u16,
        transport_pdu: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let seq = self.seq.next(self.address)?;
        self.encode_with_seq(net_key_index, ctl, ttl, seq, dst, transport_pdu)
    }

    /// Decode an incoming PDU. Anything that does not authenticate, or that
    /// replays an old SEQ, is dropped silently.
    pub fn receive(&self, data: &[u8]) -> Option<DecodedNetworkPdu> {
        let decoded = self.authenticate(data)?;
        if self.accept(&decoded, None) {
            Some(decoded)
        } else {
            None
        }
    }

    /// Decode and authenticate without consulting the replay protection list.
    /// PDUs sent by the local node are dropped here.
    pub fn authenticate(&self, data: &[u8]) -> Option<DecodedNetworkPdu> {
        let nid = *data.first()? & 0x7F;
        let candidates = self.keys.read().lookup_network_key_by_nid(nid);
        let iv = *self.iv.read();

        let decoded = match decode(data, &candidates, iv) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!("Dropping network PDU ({} bytes): {}", data.len(), e);
                return None;
            }
        };

        if decoded.pdu.src == self.address {
            trace!("Dropping own PDU SEQ={}", decoded.pdu.seq);
            return None;
        }
        Some(decoded)
    }

    /// Run an authenticated PDU through the replay protection list.
    /// Segments pass the SeqAuth of their message so reordering is tolerated.
    pub fn accept(&self, decoded: &DecodedNetworkPdu, seq_auth: Option<u32>) -> bool {
        let DecodedNetworkPdu { pdu, iv_index, .. } = decoded;
        let mut replay = self.replay.lock();
        let verdict = match seq_auth {
            Some(seq_auth) => replay.accept_segment(pdu.src, *iv_index, pdu.seq, seq_auth),
            None => replay.accept(pdu.src, *iv_index, pdu.seq),
        };
        match verdict {
            Ok(()) => true,
            Err(e) => {
                trace!("Dropping network PDU: {}", e);
                false
            }
        }
    }
}
