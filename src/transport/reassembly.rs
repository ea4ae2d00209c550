//! Reassembly of segmented lower transport PDUs
//!
//! State is keyed by (SRC, SeqZero) and held under a single lock, so that
//! concurrent receive workers never reassemble the same message twice.
//! Every incoming segment also sweeps out partial messages that went quiet
//! for longer than the timeout or were superseded by a newer SeqAuth.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::lower::{
    seq_auth, LowerTransportPdu, SegmentAck, SegmentHeader, ACCESS_SEGMENT_LEN, CONTROL_SEGMENT_LEN,
};
use crate::error::{MeshError, Result};

/// What a reassembled message was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentedKind {
    Access { akf: bool, aid: u8, szmic: bool },
    Control { opcode: u8 },
}

/// Fully reassembled upper transport PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    pub src: u16,
    pub dst: u16,
    /// SEQ of the first segment, used in the upper transport nonce
    pub seq_auth: u32,
    pub iv_index: u32,
    pub kind: SegmentedKind,
    pub payload: Vec<u8>,
}

/// Result of feeding one segment to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// More segments needed; acknowledge what we have so far
    Incomplete(SegmentAck),
    /// Last missing segment arrived
    Complete(ReassembledMessage, SegmentAck),
    /// Segment of a message that was already delivered
    AlreadyComplete(SegmentAck),
}

impl SegmentOutcome {
    pub fn ack(&self) -> &SegmentAck {
        match self {
            SegmentOutcome::Incomplete(ack)
            | SegmentOutcome::Complete(_, ack)
            | SegmentOutcome::AlreadyComplete(ack) => ack,
        }
    }
}

#[derive(Debug)]
struct Partial {
    dst: u16,
    iv_index: u32,
    seq_auth: u32,
    kind: SegmentedKind,
    seg_n: u8,
    received: u32,
    segments: Vec<Option<Vec<u8>>>,
    last_activity: Instant,
}

impl Partial {
    fn ack(&self, seq_zero: u16) -> SegmentAck {
        SegmentAck {
            obo: false,
            seq_zero,
            block_ack: self.received,
        }
    }

    fn is_complete(&self) -> bool {
        self.ack(0).is_complete(self.seg_n)
    }
}

#[derive(Debug, Default)]
struct State {
    partials: HashMap<(u16, u16), Partial>,
    /// Last completed (iv_index, seq_auth, block_ack) per source
    completed: HashMap<u16, (u32, u32, u32)>,
}

/// Reassembly state for all sources
#[derive(Debug)]
pub struct Reassembler {
    timeout: Duration,
    state: Mutex<State>,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(State::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of messages currently being reassembled
    pub fn pending(&self) -> usize {
        self.state.lock().partials.len()
    }

    /// Feed one segment carried by a network PDU from `src` to `dst`
    pub fn receive(
        &self,
        src: u16,
        dst: u16,
        seq: u32,
        iv_index: u32,
        pdu: &LowerTransportPdu,
        now: Instant,
    ) -> Result<SegmentOutcome> {
        let (kind, header, segment) = match pdu {
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                szmic,
                header,
                segment,
            } => (
                SegmentedKind::Access {
                    akf: *akf,
                    aid: *aid,
                    szmic: *szmic,
                },
                header,
                segment,
            ),
            LowerTransportPdu::SegmentedControl {
                opcode,
                header,
                segment,
            } => (SegmentedKind::Control { opcode: *opcode }, header, segment),
            other => {
                return Err(MeshError::malformed(format!(
                    "not a segment: {}",
                    other
                )))
            }
        };
        let SegmentHeader {
            seq_zero,
            seg_o,
            seg_n,
        } = *header;
        let auth = seq_auth(seq, seq_zero)?;

        let mut state = self.state.lock();
        let key = (src, seq_zero);

        if let Some(&(done_iv, done_auth, block)) = state.completed.get(&src) {
            if done_iv == iv_index && done_auth == auth {
                trace!("Segment {} of completed message from {:04X}", seg_o, src);
                return Ok(SegmentOutcome::AlreadyComplete(SegmentAck {
                    obo: false,
                    seq_zero,
                    block_ack: block,
                }));
            }
        }

        let stale: Vec<(u16, u16)> = state
            .partials
            .iter()
            .filter(|(p_key, p)| {
                now.saturating_duration_since(p.last_activity) > self.timeout
                    || (**p_key == key && p.seq_auth != auth)
                    || (p_key.0 == src && (p.iv_index, p.seq_auth) < (iv_index, auth))
            })
            .map(|(key, _)| *key)
            .collect();
        for (stale_src, stale_zero) in stale {
            debug!(
                "Discarding stale reassembly state from {:04X} SeqZero={}",
                stale_src, stale_zero
            );
            state.partials.remove(&(stale_src, stale_zero));
        }

        let partial = state.partials.entry(key).or_insert_with(|| Partial {
            dst,
            iv_index,
            seq_auth: auth,
            kind,
            seg_n,
            received: 0,
            segments: vec![None; seg_n as usize + 1],
            last_activity: now,
        });

        if partial.seg_n != seg_n || partial.kind != kind {
            return Err(MeshError::malformed(format!(
                "segment {} from {:04X} disagrees with SegN {} of SeqZero {}",
                seg_o, src, partial.seg_n, seq_zero
            )));
        }
        let capacity = match kind {
            SegmentedKind::Access { .. } => ACCESS_SEGMENT_LEN,
            SegmentedKind::Control { .. } => CONTROL_SEGMENT_LEN,
        };
        if seg_o < seg_n && segment.len() != capacity {
            return Err(MeshError::malformed(format!(
                "segment {} of {} carries {} bytes",
                seg_o, seg_n, segment.len()
            )));
        }
        if partial.segments[seg_o as usize].is_none() {
            partial.segments[seg_o as usize] = Some(segment.clone());
            partial.received |= 1 << seg_o;
        }
        partial.last_activity = now;

        if !partial.is_complete() {
            return Ok(SegmentOutcome::Incomplete(partial.ack(seq_zero)));
        }

        let ack = partial.ack(seq_zero);
        let partial = match state.partials.remove(&key) {
            Some(p) => p,
            None => return Ok(SegmentOutcome::Incomplete(ack)),
        };
        state
            .completed
            .insert(src, (partial.iv_index, partial.seq_auth, ack.block_ack));

        let payload = partial.segments.into_iter().flatten().flatten().collect();
        debug!(
            "Reassembled {} segments from {:04X} (SeqAuth={})",
            partial.seg_n as usize + 1,
            src,
            partial.seq_auth
        );
        Ok(SegmentOutcome::Complete(
            ReassembledMessage {
                src,
                dst: partial.dst,
                seq_auth: partial.seq_auth,
                iv_index: partial.iv_index,
                kind: partial.kind,
                payload,
            },
            ack,
        ))
    }

    /// Drop partial messages that have been inactive longer than the timeout
    pub fn purge_expired(&self, now: Instant) -> Vec<MeshError> {
        let mut state = self.state.lock();
        let timeout = self.timeout;
        let expired: Vec<(u16, u16)> = state
            .partials
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_activity) > timeout)
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .map(|(src, seq_zero)| {
                state.partials.remove(&(src, seq_zero));
                debug!("Reassembly of {:04X} SeqZero={} timed out", src, seq_zero);
                MeshError::ReassemblyTimeout { src, seq_zero }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::lower::segment_access;

    fn segments(len: usize, seq_zero: u16) -> (Vec<u8>, Vec<LowerTransportPdu>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        let segs = segment_access(true, 0x21, false, seq_zero, &data).unwrap();
        (data, segs)
    }

    #[test]
    fn test_reassembles_out_of_order() {
        let r = Reassembler::new(Duration::from_secs(10));
        let now = Instant::now();
        let (data, segs) = segments(30, 100);
        assert_eq!(segs.len(), 3);

        let out = r.receive(0x0005, 0x0001, 102, 0, &segs[2], now).unwrap();
        assert_eq!(out.ack().block_ack, 0b100);
        let out = r.receive(0x0005, 0x0001, 103, 0, &segs[0], now).unwrap();
        assert_eq!(out.ack().block_ack, 0b101);
        assert_eq!(r.pending(), 1);

        match r.receive(0x0005, 0x0001, 104, 0, &segs[1], now).unwrap() {
            SegmentOutcome::Complete(msg, ack) => {
                assert_eq!(msg.payload, data);
                assert_eq!(msg.seq_auth, 100);
                assert_eq!(msg.dst, 0x0001);
                assert_eq!(
                    msg.kind,
                    SegmentedKind::Access {
                        akf: true,
                        aid: 0x21,
                        szmic: false
                    }
                );
                assert_eq!(ack.block_ack, 0b111);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_duplicate_segments_are_idempotent() {
        let r = Reassembler::new(Duration::from_secs(10));
        let now = Instant::now();
        let (data, segs) = segments(20, 7);

        r.receive(2, 1, 7, 0, &segs[0], now).unwrap();
        let again = r.receive(2, 1, 8, 0, &segs[0], now).unwrap();
        assert_eq!(again, SegmentOutcome::Incomplete(SegmentAck { obo: false, seq_zero: 7, block_ack: 1 }));

        let done = r.receive(2, 1, 9, 0, &segs[1], now).unwrap();
        assert!(matches!(done, SegmentOutcome::Complete(ref m, _) if m.payload == data));

        // Late retransmission is acknowledged but not delivered again
        let late = r.receive(2, 1, 10, 0, &segs[1], now).unwrap();
        assert_eq!(late, SegmentOutcome::AlreadyComplete(SegmentAck { obo: false, seq_zero: 7, block_ack: 0b11 }));
    }

    #[test]
    fn test_conflicting_seg_n_rejected() {
        let r = Reassembler::new(Duration::from_secs(10));
        let now = Instant::now();
        let (_, three) = segments(30, 50);
        let (_, two) = segments(20, 50);

        r.receive(4, 1, 50, 0, &three[0], now).unwrap();
        assert!(matches!(
            r.receive(4, 1, 51, 0, &two[1], now),
            Err(MeshError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_inactivity_timeout() {
        let r = Reassembler::new(Duration::from_millis(100));
        let start = Instant::now();
        let (data, segs) = segments(24, 9);

        r.receive(3, 1, 9, 0, &segs[0], start).unwrap();
        assert!(r.purge_expired(start + Duration::from_millis(50)).is_empty());
        let dropped = r.purge_expired(start + Duration::from_millis(200));
        assert_eq!(dropped, vec![MeshError::ReassemblyTimeout { src: 3, seq_zero: 9 }]);
        assert_eq!(r.pending(), 0);

        // Sender retransmits everything and it completes
        let later = start + Duration::from_millis(300);
        r.receive(3, 1, 10, 0, &segs[0], later).unwrap();
        let done = r.receive(3, 1, 11, 0, &segs[1], later).unwrap();
        assert!(matches!(done, SegmentOutcome::Complete(ref m, _) if m.payload == data));
    }

    #[test]
    fn test_stale_state_discarded_on_new_segment() {
        let r = Reassembler::new(Duration::from_millis(100));
        let start = Instant::now();
        let (_, segs) = segments(24, 9);

        r.receive(3, 1, 9, 0, &segs[0], start).unwrap();
        let out = r
            .receive(3, 1, 10, 0, &segs[1], start + Duration::from_secs(1))
            .unwrap();
        // Old segment 0 was discarded with the stale state
        assert_eq!(out, SegmentOutcome::Incomplete(SegmentAck { obo: false, seq_zero: 9, block_ack: 0b10 }));
    }

    #[test]
    fn test_abandoned_messages_do_not_accumulate() {
        let r = Reassembler::new(Duration::from_millis(100));
        let start = Instant::now();

        for i in 0..500u16 {
            let seq_zero = i * 4;
            let (_, segs) = segments(24, seq_zero);
            let at = start + Duration::from_secs(i as u64);
            r.receive(3, 1, seq_zero as u32, 0, &segs[0], at).unwrap();
        }
        assert_eq!(r.pending(), 1);
    }

    #[test]
    fn test_newer_message_cancels_older_from_same_source() {
        let r = Reassembler::new(Duration::from_secs(10));
        let now = Instant::now();
        let (_, old) = segments(24, 20);
        let (data, new) = segments(24, 40);

        r.receive(6, 1, 20, 0, &old[0], now).unwrap();
        r.receive(8, 1, 20, 0, &old[0], now).unwrap();
        r.receive(6, 1, 40, 0, &new[0], now).unwrap();
        // Source 8 is unaffected
        assert_eq!(r.pending(), 2);

        let done = r.receive(6, 1, 41, 0, &new[1], now).unwrap();
        assert!(matches!(done, SegmentOutcome::Complete(ref m, _) if m.payload == data));
        assert_eq!(r.pending(), 1);
    }

    #[test]
    fn test_rejects_unsegmented() {
        let r = Reassembler::new(Duration::from_secs(1));
        let pdu = LowerTransportPdu::UnsegmentedAccess {
            akf: false,
            aid: 0,
            upper: vec![1, 2, 3, 4, 5],
        };
        assert!(r.receive(1, 2, 3, 0, &pdu, Instant::now()).is_err());
    }
}
