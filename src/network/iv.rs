//! IV index and sequence number state

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{MeshError, Result};

/// Largest 24-bit sequence number
pub const SEQ_MAX: u32 = 0x00FF_FFFF;

/// Network IV index with the IV Update procedure flag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvIndex {
    pub index: u32,
    /// IV Update in progress: transmit with `index - 1`, accept both
    #[serde(default)]
    pub update_active: bool,
}

impl IvIndex {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            update_active: false,
        }
    }

    /// IV index used for outgoing PDUs
    pub fn tx_index(&self) -> u32 {
        if self.update_active {
            self.index.saturating_sub(1)
        } else {
            self.index
        }
    }

    /// IV index to use for an incoming PDU carrying the given IVI bit.
    /// Returns `None` when the bit points below index 0.
    pub fn rx_index(&self, ivi: u8) -> Option<u32> {
        if (self.index & 1) as u8 == ivi & 1 {
            Some(self.index)
        } else {
            self.index.checked_sub(1)
        }
    }

    /// Enter the IV Update in Progress state
    pub fn begin_update(&mut self) {
        if !self.update_active {
            self.index = self.index.wrapping_add(1);
            self.update_active = true;
        }
    }

    /// Return to normal operation; transmission switches to the new index
    pub fn complete_update(&mut self) {
        self.update_active = false;
    }

    /// Flags byte bit 1 in provisioning data
    pub fn flags(&self) -> u8 {
        if self.update_active {
            0x02
        } else {
            0x00
        }
    }
}

/// Monotonic 24-bit sequence counter with atomic increment-and-read
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU32,
}

impl SequenceCounter {
    pub fn new(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }

    /// Take the next sequence number. Fails once the 24-bit space is used up;
    /// the owner then has to go through an IV update and [`reset`](Self::reset).
    pub fn next(&self, src: u16) -> Result<u32> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |seq| {
                (seq <= SEQ_MAX).then_some(seq + 1)
            })
            .map_err(|_| MeshError::SequenceExhausted(src))
    }

    /// Reserve `count` consecutive sequence numbers, returning the first
    pub fn reserve(&self, src: u16, count: u32) -> Result<u32> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |seq| {
                let end = seq.checked_add(count)?;
                (count > 0 && end - 1 <= SEQ_MAX).then_some(end)
            })
            .map_err(|_| MeshError::SequenceExhausted(src))
    }

    /// Sequence number the next PDU will carry (the value to persist)
    pub fn current(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.next.store(0, Ordering::Release);
    }
}
