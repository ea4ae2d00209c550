//! Replay protection list
//!
//! Remembers the last (IV index, SEQ) accepted from each source address.
//! A PDU is accepted only if it is strictly newer. The list is bounded;
//! when full, the least recently updated source is evicted.
//!
//! Segments of one segmented message may arrive out of SEQ order, so those
//! are judged by the SeqAuth of the message they belong to instead.

use std::collections::HashMap;

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, Copy)]
struct Entry {
    iv_index: u32,
    seq: u32,
    /// SeqAuth of the newest message accepted from this source
    seq_auth: u32,
    touched: u64,
}

#[derive(Debug)]
pub struct ReplayCache {
    capacity: usize,
    entries: HashMap<u16, Entry>,
    clock: u64,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    /// Check that `(iv_index, seq)` is newer than anything seen from `src`
    /// without recording it
    pub fn check(&self, src: u16, iv_index: u32, seq: u32) -> Result<()> {
        match self.entries.get(&src) {
            Some(e) if iv_index < e.iv_index || (iv_index == e.iv_index && seq <= e.seq) => {
                Err(MeshError::Replay { src, seq })
            }
            _ => Ok(()),
        }
    }

    /// Check and record
    pub fn accept(&mut self, src: u16, iv_index: u32, seq: u32) -> Result<()> {
        self.check(src, iv_index, seq)?;
        self.record(src, iv_index, seq, seq);
        Ok(())
    }

    /// Check and record one segment of the message identified by `seq_auth`.
    /// A segment with a SEQ at or below the newest seen is still accepted
    /// when it belongs to the newest message from `src` or a later one.
    pub fn accept_segment(&mut self, src: u16, iv_index: u32, seq: u32, seq_auth: u32) -> Result<()> {
        let (seq, seq_auth) = match self.entries.get(&src) {
            Some(e) if iv_index == e.iv_index && seq <= e.seq => {
                if seq_auth < e.seq_auth {
                    return Err(MeshError::Replay { src, seq });
                }
                (e.seq, seq_auth)
            }
            _ => {
                self.check(src, iv_index, seq)?;
                (seq, seq_auth)
            }
        };
        self.record(src, iv_index, seq, seq_auth);
        Ok(())
    }

    fn record(&mut self, src: u16, iv_index: u32, seq: u32, seq_auth: u32) {
        if !self.entries.contains_key(&src) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(src, _)| *src)
            {
                self.entries.remove(&oldest);
            }
        }

        self.clock += 1;
        self.entries.insert(
            src,
            Entry {
                iv_index,
                seq,
                seq_auth,
                touched: self.clock,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_increasing_seq() {
        let mut cache = ReplayCache::new(8);
        cache.accept(0x0003, 0, 10).unwrap();
        assert_eq!(
            cache.accept(0x0003, 0, 10),
            Err(MeshError::Replay { src: 0x0003, seq: 10 })
        );
        assert!(cache.accept(0x0003, 0, 9).is_err());
        cache.accept(0x0003, 0, 11).unwrap();
        // Other sources are independent
        cache.accept(0x0004, 0, 1).unwrap();
    }

    #[test]
    fn test_newer_iv_index_resets_seq() {
        let mut cache = ReplayCache::new(8);
        cache.accept(0x0003, 1, 500).unwrap();
        cache.accept(0x0003, 2, 0).unwrap();
        assert!(cache.accept(0x0003, 1, 501).is_err());
    }

    #[test]
    fn test_reordered_segments_of_current_message() {
        let mut cache = ReplayCache::new(8);
        // Segments of SeqAuth 40 sent with SEQ 40 and 41, received in reverse
        cache.accept_segment(0x0005, 0, 41, 40).unwrap();
        cache.accept_segment(0x0005, 0, 40, 40).unwrap();
        // Unsegmented traffic still has to move past the highest SEQ
        assert!(cache.accept(0x0005, 0, 41).is_err());
        cache.accept(0x0005, 0, 42).unwrap();
        // A late segment of an older message is a replay
        assert_eq!(
            cache.accept_segment(0x0005, 0, 39, 38),
            Err(MeshError::Replay { src: 0x0005, seq: 39 })
        );
    }

    #[test]
    fn test_bounded_capacity_evicts_oldest() {
        let mut cache = ReplayCache::new(2);
        cache.accept(1, 0, 5).unwrap();
        cache.accept(2, 0, 5).unwrap();
        cache.accept(1, 0, 6).unwrap();
        cache.accept(3, 0, 5).unwrap();
        assert_eq!(cache.len(), 2);
        // Source 2 was least recently updated and got evicted
        assert!(cache.check(2, 0, 1).is_ok());
        assert!(cache.check(1, 0, 6).is_err());
    }
}
