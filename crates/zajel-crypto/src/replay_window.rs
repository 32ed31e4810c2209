//! Sliding window for replay protection (RFC 4303 style).
//!
//! Tracks the highest accepted sequence number and a 64-bit bitmap of the
//! sequence numbers directly below it. Bit 0 is `highest`, bit `n` is
//! `highest - n`.
//!
//! # Rules
//!
//! - Sequence numbers start at 1; `0` is always rejected
//! - Anything at or below `highest - 64` is rejected as too old
//! - A sequence number already marked in the bitmap is rejected
//! - Advancing by 64 or more resets the bitmap to just the new highest
//!
//! The struct is two integers. Its size does not depend on how many or in
//! what order sequence numbers arrive.
//!
//! # Thread Safety
//!
//! Not synchronized; owned by a single peer session.

/// Number of sequence numbers tracked below the highest.
pub const WINDOW_SIZE: u32 = 64;

/// Sliding anti-replay window for one receive direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    /// Highest sequence number accepted (0 = nothing yet)
    highest: u32,
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check without recording. Returns true if `accept` would succeed.
    pub fn check(&self, seq: u32) -> bool {
        if seq == 0 {
            return false;
        }
        if seq > self.highest {
            return true;
        }
        let offset = self.highest - seq;
        if offset >= WINDOW_SIZE {
            return false;
        }
        self.bitmap & (1u64 << offset) == 0
    }

    /// Record `seq`. Returns false for zero, too-old, or duplicate values.
    pub fn accept(&mut self, seq: u32) -> bool {
        if seq == 0 {
            return false;
        }

        // Ahead of window - advance
        if seq > self.highest {
            let shift = seq - self.highest;
            if shift >= WINDOW_SIZE {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.highest = seq;
            return true;
        }

        // seq <= highest - WINDOW_SIZE
        let offset = self.highest - seq;
        if offset >= WINDOW_SIZE {
            return false;
        }

        let mask = 1u64 << offset;
        if self.bitmap & mask != 0 {
            return false;
        }
        self.bitmap |= mask;
        true
    }

    pub fn highest(&self) -> u32 {
        self.highest
    }

    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = 0;
    }
}
