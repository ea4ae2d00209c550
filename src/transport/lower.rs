//! Lower transport PDU codec and segmentation
//!
//! Unsegmented access:   SEG=0 | AKF | AID(6)  + upper transport PDU (≤15)
//! Segmented access:     SEG=1 | AKF | AID(6)  + SZMIC | SeqZero(13) | SegO(5) | SegN(5) + segment (≤12)
//! Unsegmented control:  SEG=0 | Opcode(7)     + parameters (≤11)
//! Segmented control:    SEG=1 | Opcode(7)     + RFU | SeqZero(13) | SegO(5) | SegN(5) + segment (≤8)
//! Segment acknowledge:  SEG=0 | 0x00          + OBO | SeqZero(13) | RFU(2) + BlockAck(32)

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::error::{MeshError, Result};

pub const MAX_SEGMENTS: usize = 32;
pub const ACCESS_SEGMENT_LEN: usize = 12;
pub const CONTROL_SEGMENT_LEN: usize = 8;
pub const MAX_UNSEGMENTED_ACCESS: usize = 15;
pub const MAX_UNSEGMENTED_CONTROL: usize = 11;
pub const SEQ_ZERO_MASK: u32 = 0x1FFF;

/// Control opcode of the Segment Acknowledgment message
pub const OPCODE_SEGMENT_ACK: u8 = 0x00;

/// Segmentation fields shared by segmented access and control PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// 13 least significant bits of the SeqAuth
    pub seq_zero: u16,
    /// Index of this segment
    pub seg_o: u8,
    /// Index of the last segment (total − 1)
    pub seg_n: u8,
}

impl SegmentHeader {
    fn put(&self, flag: bool, buf: &mut BytesMut) {
        buf.put_u8((flag as u8) << 7 | ((self.seq_zero >> 6) & 0x7F) as u8);
        buf.put_u8(((self.seq_zero & 0x3F) as u8) << 2 | (self.seg_o >> 3) & 0x03);
        buf.put_u8((self.seg_o & 0x07) << 5 | self.seg_n & 0x1F);
    }

    fn get(buf: &mut &[u8]) -> (bool, Self) {
        let b1 = buf.get_u8();
        let b2 = buf.get_u8();
        let b3 = buf.get_u8();
        let header = Self {
            seq_zero: ((b1 & 0x7F) as u16) << 6 | (b2 >> 2) as u16,
            seg_o: (b2 & 0x03) << 3 | b3 >> 5,
            seg_n: b3 & 0x1F,
        };
        (b1 & 0x80 != 0, header)
    }
}

/// Segment Acknowledgment message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    /// Sent by a friend on behalf of a low power node
    pub obo: bool,
    pub seq_zero: u16,
    /// Bit n set = segment n received
    pub block_ack: u32,
}

impl SegmentAck {
    pub fn is_complete(&self, seg_n: u8) -> bool {
        let all = if seg_n >= 31 {
            u32::MAX
        } else {
            (1u32 << (seg_n + 1)) - 1
        };
        self.block_ack & all == all
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    UnsegmentedAccess {
        akf: bool,
        aid: u8,
        upper: Vec<u8>,
    },
    SegmentedAccess {
        akf: bool,
        aid: u8,
        szmic: bool,
        header: SegmentHeader,
        segment: Vec<u8>,
    },
    UnsegmentedControl {
        opcode: u8,
        params: Vec<u8>,
    },
    SegmentedControl {
        opcode: u8,
        header: SegmentHeader,
        segment: Vec<u8>,
    },
    SegmentAck(SegmentAck),
}

impl LowerTransportPdu {
    /// CTL bit the network PDU carrying this must have
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::UnsegmentedControl { .. } | Self::SegmentedControl { .. } | Self::SegmentAck(_)
        )
    }

    pub fn is_segmented(&self) -> bool {
        matches!(self, Self::SegmentedAccess { .. } | Self::SegmentedControl { .. })
    }

    pub fn segment_header(&self) -> Option<&SegmentHeader> {
        match self {
            Self::SegmentedAccess { header, .. } | Self::SegmentedControl { header, .. } => {
                Some(header)
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Self::UnsegmentedAccess { akf, aid, upper } => {
                if upper.is_empty() || upper.len() > MAX_UNSEGMENTED_ACCESS {
                    return Err(MeshError::malformed(format!(
                        "unsegmented access PDU of {} bytes",
                        upper.len()
                    )));
                }
                buf.put_u8((*akf as u8) << 6 | aid & 0x3F);
                buf.put_slice(upper);
            }
            Self::SegmentedAccess {
                akf,
                aid,
                szmic,
                header,
                segment,
            } => {
                check_segment(header, segment, ACCESS_SEGMENT_LEN)?;
                buf.put_u8(0x80 | (*akf as u8) << 6 | aid & 0x3F);
                header.put(*szmic, &mut buf);
                buf.put_slice(segment);
            }
            Self::UnsegmentedControl { opcode, params } => {
                if *opcode == OPCODE_SEGMENT_ACK || *opcode > 0x7F {
                    return Err(MeshError::malformed(format!("control opcode 0x{:02X}", opcode)));
                }
                if params.len() > MAX_UNSEGMENTED_CONTROL {
                    return Err(MeshError::malformed(format!(
                        "unsegmented control PDU of {} bytes",
                        params.len()
                    )));
                }
                buf.put_u8(*opcode);
                buf.put_slice(params);
            }
            Self::SegmentedControl {
                opcode,
                header,
                segment,
            } => {
                if *opcode > 0x7F {
                    return Err(MeshError::malformed(format!("control opcode 0x{:02X}", opcode)));
                }
                check_segment(header, segment, CONTROL_SEGMENT_LEN)?;
                buf.put_u8(0x80 | opcode);
                header.put(false, &mut buf);
                buf.put_slice(segment);
            }
            Self::SegmentAck(ack) => {
                buf.put_u8(OPCODE_SEGMENT_ACK);
                buf.put_u8((ack.obo as u8) << 7 | ((ack.seq_zero >> 6) & 0x7F) as u8);
                buf.put_u8(((ack.seq_zero & 0x3F) as u8) << 2);
                buf.put_u32(ack.block_ack);
            }
        }
        Ok(buf.to_vec())
    }

    /// Decode the transport PDU of a network PDU with the given CTL bit
    pub fn decode(ctl: bool, data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(MeshError::malformed("empty lower transport PDU"));
        }
        let mut buf = data;
        let first = buf.get_u8();
        let seg = first & 0x80 != 0;

        match (ctl, seg) {
            (false, false) => {
                if buf.remaining() > MAX_UNSEGMENTED_ACCESS || !buf.has_remaining() {
                    return Err(MeshError::malformed(format!(
                        "unsegmented access PDU of {} bytes",
                        buf.remaining()
                    )));
                }
                Ok(Self::UnsegmentedAccess {
                    akf: first & 0x40 != 0,
                    aid: first & 0x3F,
                    upper: buf.to_vec(),
                })
            }
            (false, true) => {
                if buf.remaining() < 4 {
                    return Err(MeshError::malformed("segmented access PDU too short"));
                }
                let (szmic, header) = SegmentHeader::get(&mut buf);
                let segment = buf.to_vec();
                check_segment(&header, &segment, ACCESS_SEGMENT_LEN)?;
                Ok(Self::SegmentedAccess {
                    akf: first & 0x40 != 0,
                    aid: first & 0x3F,
                    szmic,
                    header,
                    segment,
                })
            }
            (true, false) if first & 0x7F == OPCODE_SEGMENT_ACK => {
                if buf.remaining() != 6 {
                    return Err(MeshError::malformed(format!(
                        "segment acknowledgment of {} bytes",
                        data.len()
                    )));
                }
                let b1 = buf.get_u8();
                let b2 = buf.get_u8();
                Ok(Self::SegmentAck(SegmentAck {
                    obo: b1 & 0x80 != 0,
                    seq_zero: ((b1 & 0x7F) as u16) << 6 | (b2 >> 2) as u16,
                    block_ack: buf.get_u32(),
                }))
            }
            (true, false) => {
                if buf.remaining() > MAX_UNSEGMENTED_CONTROL {
                    return Err(MeshError::malformed(format!(
                        "unsegmented control PDU of {} bytes",
                        data.len()
                    )));
                }
                Ok(Self::UnsegmentedControl {
                    opcode: first & 0x7F,
                    params: buf.to_vec(),
                })
            }
            (true, true) => {
                if buf.remaining() < 4 {
                    return Err(MeshError::malformed("segmented control PDU too short"));
                }
                let (_rfu, header) = SegmentHeader::get(&mut buf);
                let segment = buf.to_vec();
                check_segment(&header, &segment, CONTROL_SEGMENT_LEN)?;
                Ok(Self::SegmentedControl {
                    opcode: first & 0x7F,
                    header,
                    segment,
                })
            }
        }
    }
}

fn check_segment(header: &SegmentHeader, segment: &[u8], max: usize) -> Result<()> {
    if header.seg_o > header.seg_n {
        return Err(MeshError::malformed(format!(
            "SegO {} beyond SegN {}",
            header.seg_o, header.seg_n
        )));
    }
    if header.seq_zero as u32 > SEQ_ZERO_MASK || header.seg_n as usize >= MAX_SEGMENTS {
        return Err(MeshError::malformed("segment header field out of range"));
    }
    if segment.is_empty() || segment.len() > max {
        return Err(MeshError::malformed(format!(
            "segment of {} bytes (allowed 1..={})",
            segment.len(),
            max
        )));
    }
    Ok(())
}

impl fmt::Display for LowerTransportPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsegmentedAccess { akf, aid, upper } => {
                write!(f, "Access AKF={} AID=0x{:02X} {} bytes", *akf as u8, aid, upper.len())
            }
            Self::SegmentedAccess {
                akf, aid, header, segment, ..
            } => write!(
                f,
                "Access segment {}/{} SeqZero={} AKF={} AID=0x{:02X} {} bytes",
                header.seg_o,
                header.seg_n,
                header.seq_zero,
                *akf as u8,
                aid,
                segment.len()
            ),
            Self::UnsegmentedControl { opcode, params } => {
                write!(f, "Control 0x{:02X} {} bytes", opcode, params.len())
            }
            Self::SegmentedControl {
                opcode, header, ..
            } => write!(
                f,
                "Control 0x{:02X} segment {}/{} SeqZero={}",
                opcode, header.seg_o, header.seg_n, header.seq_zero
            ),
            Self::SegmentAck(ack) => write!(
                f,
                "SegmentAck SeqZero={} BlockAck=0x{:08X}",
                ack.seq_zero, ack.block_ack
            ),
        }
    }
}

/// Number of segments needed for `len` bytes at `capacity` bytes per segment
pub fn segment_count(len: usize, capacity: usize) -> usize {
    (len + capacity - 1) / capacity
}

fn split(data: &[u8], capacity: usize, seq_zero: u16) -> Result<Vec<(SegmentHeader, Vec<u8>)>> {
    let count = segment_count(data.len(), capacity);
    if count == 0 || count > MAX_SEGMENTS {
        return Err(MeshError::malformed(format!(
            "{} bytes need {} segments (allowed 1..={})",
            data.len(),
            count,
            MAX_SEGMENTS
        )));
    }
    let seg_n = (count - 1) as u8;
    let seq_zero = (seq_zero as u32 & SEQ_ZERO_MASK) as u16;
    Ok(data
        .chunks(capacity)
        .enumerate()
        .map(|(i, chunk)| {
            (
                SegmentHeader {
                    seq_zero,
                    seg_o: i as u8,
                    seg_n,
                },
                chunk.to_vec(),
            )
        })
        .collect())
}

/// Split an encrypted upper transport access PDU into segments
pub fn segment_access(
    akf: bool,
    aid: u8,
    szmic: bool,
    seq_zero: u16,
    upper: &[u8],
) -> Result<Vec<LowerTransportPdu>> {
    Ok(split(upper, ACCESS_SEGMENT_LEN, seq_zero)?
        .into_iter()
        .map(|(header, segment)| LowerTransportPdu::SegmentedAccess {
            akf,
            aid,
            szmic,
            header,
            segment,
        })
        .collect())
}

/// Split a transport control message into segments
pub fn segment_control(opcode: u8, seq_zero: u16, params: &[u8]) -> Result<Vec<LowerTransportPdu>> {
    Ok(split(params, CONTROL_SEGMENT_LEN, seq_zero)?
        .into_iter()
        .map(|(header, segment)| LowerTransportPdu::SegmentedControl {
            opcode,
            header,
            segment,
        })
        .collect())
}

/// Recover the 24-bit SeqAuth (SEQ of the first segment) from the SEQ of
/// any segment and the SeqZero it carries
pub fn seq_auth(seq: u32, seq_zero: u16) -> Result<u32> {
    let candidate = (seq & !SEQ_ZERO_MASK) | (seq_zero as u32 & SEQ_ZERO_MASK);
    if candidate <= seq {
        Ok(candidate)
    } else {
        candidate
            .checked_sub(SEQ_ZERO_MASK + 1)
            .ok_or_else(|| MeshError::malformed(format!("SeqZero {} ahead of SEQ {}", seq_zero, seq)))
    }
}
