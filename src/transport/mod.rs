//! Transport layer
//!
//! Lower transport segmentation and reassembly plus upper transport
//! encryption, on top of [`NetworkLayer`].

pub mod lower;
pub mod reassembly;
pub mod upper;

use dashmap::DashMap;
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::address::{is_unicast, is_virtual};
use crate::crypto;
use crate::error::{KeyRef, MeshError, Result};
use crate::keys::DeviceKey;
use crate::network::{DecodedNetworkPdu, NetworkLayer};
use lower::{seq_auth, segment_access, segment_control, segment_count, LowerTransportPdu, SegmentAck};
use reassembly::{Reassembler, SegmentOutcome, SegmentedKind};
use upper::{AccessKey, UpperTransportContext};

/// Which key secures an outgoing access message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKeySelector {
    /// Application key index; sent on its bound network key
    Application(u16),
    /// Device key of the destination node
    Device { net_key_index: u16 },
}

/// Which key authenticated an incoming access message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKeySource {
    Application(u16),
    Device,
}

/// Access message to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAccess {
    pub dst: u16,
    pub key: AccessKeySelector,
    /// Default TTL when `None`
    pub ttl: Option<u8>,
    /// Required when `dst` is a virtual address
    pub label_uuid: Option<[u8; 16]>,
    pub payload: Vec<u8>,
}

/// Something delivered to the layer above
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Access {
        src: u16,
        dst: u16,
        net_key_index: u16,
        key: AccessKeySource,
        label_uuid: Option<[u8; 16]>,
        payload: Vec<u8>,
    },
    Control {
        src: u16,
        dst: u16,
        opcode: u8,
        params: Vec<u8>,
    },
    SegmentAck {
        src: u16,
        ack: SegmentAck,
    },
}

/// Outcome of receiving one network PDU
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivery {
    pub event: Option<TransportEvent>,
    /// Network PDU carrying a Segment Acknowledgment to send back
    pub ack: Option<Vec<u8>>,
}

pub struct TransportLayer {
    network: NetworkLayer,
    reassembler: Reassembler,
    device_keys: DashMap<u16, DeviceKey>,
    labels: RwLock<Vec<[u8; 16]>>,
    default_ttl: u8,
}

impl TransportLayer {
    pub fn new(network: NetworkLayer, reassembly_timeout: Duration, default_ttl: u8) -> Self {
        Self {
            network,
            reassembler: Reassembler::new(reassembly_timeout),
            device_keys: DashMap::new(),
            labels: RwLock::new(Vec::new()),
            default_ttl,
        }
    }

    pub fn network(&self) -> &NetworkLayer {
        &self.network
    }

    pub fn add_device_key(&self, address: u16, key: DeviceKey) {
        self.device_keys.insert(address, key);
    }

    pub fn remove_device_key(&self, address: u16) -> Option<DeviceKey> {
        self.device_keys.remove(&address).map(|(_, key)| key)
    }

    /// Subscribe to a Label UUID; returns its virtual address
    pub fn add_label(&self, label_uuid: [u8; 16]) -> u16 {
        let mut labels = self.labels.write();
        if !labels.contains(&label_uuid) {
            labels.push(label_uuid);
        }
        crypto::virtual_address(&label_uuid)
    }

    /// Encrypt, segment if needed and network-encode an access message.
    /// Returns the network PDUs in transmission order.
    pub fn send_access(&self, msg: &OutgoingAccess) -> Result<Vec<Vec<u8>>> {
        if is_virtual(msg.dst) {
            match msg.label_uuid {
                Some(label) if crypto::virtual_address(&label) == msg.dst => {}
                _ => {
                    return Err(MeshError::malformed(format!(
                        "no matching Label UUID for virtual address {:04X}",
                        msg.dst
                    )))
                }
            }
        }

        let (key, akf, aid, net_key_index) = match msg.key {
            AccessKeySelector::Application(index) => {
                let app = self.network.keys().read().app_key_for_tx(index)?;
                (app.key, true, app.aid, app.bound_net_index)
            }
            AccessKeySelector::Device { net_key_index } => {
                // Destination node's key, or our own when talking to a configuration client
                let key = self
                    .device_keys
                    .get(&msg.dst)
                    .or_else(|| self.device_keys.get(&self.network.address()))
                    .map(|k| k.0)
                    .ok_or(MeshError::UnknownKey(KeyRef::Device(msg.dst)))?;
                (key, false, 0, net_key_index)
            }
        };
        let device_key = DeviceKey(key);
        let access_key = if akf {
            AccessKey::Application(&key)
        } else {
            AccessKey::Device(&device_key)
        };

        let src = self.network.address();
        let ttl = msg.ttl.unwrap_or(self.default_ttl);
        let upper_len = msg.payload.len() + crypto::MicSize::Small.len();

        if upper_len <= lower::MAX_UNSEGMENTED_ACCESS {
            let seq = self.network.sequence().next(src)?;
            let ctx = self.context(msg.dst, seq, false);
            let upper = upper::encrypt(access_key, &ctx, &msg.payload, msg.label_uuid.as_ref())?;
            let lower = LowerTransportPdu::UnsegmentedAccess { akf, aid, upper }.encode()?;
            let pdu = self
                .network
                .encode_with_seq(net_key_index, false, ttl, seq, msg.dst, lower)?;
            return Ok(vec![pdu]);
        }

        let count = segment_count(upper_len, lower::ACCESS_SEGMENT_LEN);
        if count > lower::MAX_SEGMENTS {
            return Err(MeshError::malformed(format!(
                "access payload of {} bytes is too long",
                msg.payload.len()
            )));
        }
        let first_seq = self.network.sequence().reserve(src, count as u32)?;
        let ctx = self.context(msg.dst, first_seq, false);
        let upper = upper::encrypt(access_key, &ctx, &msg.payload, msg.label_uuid.as_ref())?;
        let seq_zero = (first_seq & lower::SEQ_ZERO_MASK) as u16;

        let segments = segment_access(akf, aid, false, seq_zero, &upper)?;
        debug!(
            "Sending {} byte access message to {:04X} in {} segments",
            msg.payload.len(),
            msg.dst,
            segments.len()
        );
        segments
            .iter()
            .zip(first_seq..)
            .map(|(segment, seq)| {
                self.network
                    .encode_with_seq(net_key_index, false, ttl, seq, msg.dst, segment.encode()?)
            })
            .collect()
    }

    /// Encode a transport control message, segmenting it when it does not
    /// fit an unsegmented control PDU
    pub fn send_control(
        &self,
        net_key_index: u16,
        dst: u16,
        opcode: u8,
        params: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let src = self.network.address();
        let ttl = self.default_ttl;

        if params.len() <= lower::MAX_UNSEGMENTED_CONTROL {
            let lower = LowerTransportPdu::UnsegmentedControl {
                opcode,
                params: params.to_vec(),
            }
            .encode()?;
            return Ok(vec![self.network.send(net_key_index, true, ttl, dst, lower)?]);
        }

        let count = segment_count(params.len(), lower::CONTROL_SEGMENT_LEN);
        if count > lower::MAX_SEGMENTS {
            return Err(MeshError::malformed(format!(
                "control message of {} bytes is too long",
                params.len()
            )));
        }
        let first_seq = self.network.sequence().reserve(src, count as u32)?;
        let seq_zero = (first_seq & lower::SEQ_ZERO_MASK) as u16;
        segment_control(opcode, seq_zero, params)?
            .iter()
            .zip(first_seq..)
            .map(|(segment, seq)| {
                self.network
                    .encode_with_seq(net_key_index, true, ttl, seq, dst, segment.encode()?)
            })
            .collect()
    }

    /// Process one incoming network PDU. Returns `None` when the PDU is
    /// dropped (authentication failure, replay, malformed transport PDU).
    pub fn receive(&self, data: &[u8]) -> Option<Delivery> {
        self.receive_at(data, Instant::now())
    }

    pub fn receive_at(&self, data: &[u8], now: Instant) -> Option<Delivery> {
        let decoded = self.network.authenticate(data)?;
        let lower = match LowerTransportPdu::decode(decoded.pdu.ctl, &decoded.pdu.transport_pdu) {
            Ok(lower) => lower,
            Err(e) => {
                debug!("Dropping transport PDU from {:04X}: {}", decoded.pdu.src, e);
                return None;
            }
        };
        let seq_auth = lower
            .segment_header()
            .and_then(|header| seq_auth(decoded.pdu.seq, header.seq_zero).ok());
        if !self.network.accept(&decoded, seq_auth) {
            return None;
        }
        let DecodedNetworkPdu {
            pdu,
            net_key_index,
            iv_index,
        } = decoded;
        trace!("RX {:04X} -> {:04X}: {}", pdu.src, pdu.dst, lower);

        match lower {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper } => {
                let ctx = UpperTransportContext {
                    src: pdu.src,
                    dst: pdu.dst,
                    seq: pdu.seq,
                    iv_index,
                    szmic: false,
                };
                let event = self.open_access(net_key_index, &ctx, akf, aid, &upper)?;
                Some(Delivery {
                    event: Some(event),
                    ack: None,
                })
            }
            LowerTransportPdu::UnsegmentedControl { opcode, params } => Some(Delivery {
                event: Some(TransportEvent::Control {
                    src: pdu.src,
                    dst: pdu.dst,
                    opcode,
                    params,
                }),
                ack: None,
            }),
            LowerTransportPdu::SegmentAck(ack) => Some(Delivery {
                event: Some(TransportEvent::SegmentAck { src: pdu.src, ack }),
                ack: None,
            }),
            segmented => {
                let outcome = match self
                    .reassembler
                    .receive(pdu.src, pdu.dst, pdu.seq, iv_index, &segmented, now)
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        debug!("Dropping segment from {:04X}: {}", pdu.src, e);
                        return None;
                    }
                };

                // Only messages addressed to a unicast address are acknowledged
                let ack = if is_unicast(pdu.dst) {
                    self.ack_pdu(net_key_index, pdu.src, *outcome.ack())
                } else {
                    None
                };

                let event = match outcome {
                    SegmentOutcome::Complete(message, _) => match message.kind {
                        SegmentedKind::Access { akf, aid, szmic } => {
                            let ctx = UpperTransportContext {
                                src: message.src,
                                dst: message.dst,
                                seq: message.seq_auth,
                                iv_index: message.iv_index,
                                szmic,
                            };
                            self.open_access(net_key_index, &ctx, akf, aid, &message.payload)
                        }
                        SegmentedKind::Control { opcode } => Some(TransportEvent::Control {
                            src: message.src,
                            dst: message.dst,
                            opcode,
                            params: message.payload,
                        }),
                    },
                    _ => None,
                };
                Some(Delivery { event, ack })
            }
        }
    }

    /// Discard partial messages that timed out
    pub fn purge_expired(&self, now: Instant) -> Vec<MeshError> {
        self.reassembler.purge_expired(now)
    }

    fn context(&self, dst: u16, seq: u32, szmic: bool) -> UpperTransportContext {
        UpperTransportContext {
            src: self.network.address(),
            dst,
            seq,
            iv_index: self.network.iv_index().tx_index(),
            szmic,
        }
    }

    fn ack_pdu(&self, net_key_index: u16, dst: u16, ack: SegmentAck) -> Option<Vec<u8>> {
        let encoded = LowerTransportPdu::SegmentAck(ack)
            .encode()
            .and_then(|lower| self.network.send(net_key_index, true, self.default_ttl, dst, lower));
        match encoded {
            Ok(pdu) => Some(pdu),
            Err(e) => {
                debug!("Could not build segment acknowledgment: {}", e);
                None
            }
        }
    }

    fn open_access(
        &self,
        net_key_index: u16,
        ctx: &UpperTransportContext,
        akf: bool,
        aid: u8,
        upper: &[u8],
    ) -> Option<TransportEvent> {
        let result = if akf {
            let candidates: Vec<_> = self
                .network
                .keys()
                .read()
                .lookup_application_key_by_aid(aid)
                .into_iter()
                .filter(|c| c.bound_net_index == net_key_index)
                .collect();
            let labels: Vec<[u8; 16]> = if is_virtual(ctx.dst) {
                let labels: Vec<_> = self
                    .labels
                    .read()
                    .iter()
                    .filter(|l| crypto::virtual_address(l) == ctx.dst)
                    .copied()
                    .collect();
                if labels.is_empty() {
                    trace!("No Label UUID for virtual address {:04X}", ctx.dst);
                    return None;
                }
                labels
            } else {
                Vec::new()
            };
            upper::decrypt_with_candidates(&candidates, &labels, ctx, upper).map(
                |(index, label_uuid, payload)| (AccessKeySource::Application(index), label_uuid, payload),
            )
        } else {
            // Device key of the sender, or of the local node
            [ctx.src, ctx.dst]
                .iter()
                .filter_map(|addr| self.device_keys.get(addr).map(|k| *k))
                .find_map(|key| upper::decrypt(AccessKey::Device(&key), ctx, upper, None).ok())
                .map(|payload| (AccessKeySource::Device, None, payload))
                .ok_or(MeshError::AuthenticationFailure)
        };

        match result {
            Ok((key, label_uuid, payload)) => Some(TransportEvent::Access {
                src: ctx.src,
                dst: ctx.dst,
                net_key_index,
                key,
                label_uuid,
                payload,
            }),
            Err(e) if e.is_silent_drop() => {
                trace!("Dropping access message from {:04X}: {}", ctx.src, e);
                None
            }
            Err(e) => {
                debug!("Dropping access message from {:04X}: {}", ctx.src, e);
                None
            }
        }
    }
}
