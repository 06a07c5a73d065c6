//! Circular (micro)frame numbers
//!
//! The host frame counter is 14 bits wide and wraps. Ordering between two
//! frame numbers is only meaningful within half the counter range, so all
//! comparisons use the high bit of the masked difference.

/// Largest frame number; also the counter mask.
pub const FRAME_NUMBER_MAX: u16 = 0x3FFF;

/// High bit of a masked frame difference; set when the difference wrapped.
pub const FRAME_NUMBER_HIGH_BIT: u16 = 0x2000;

/// Microframes per full-speed frame, as a shift.
pub const MICROFRAMES_PER_FRAME_SHIFT: u32 = 3;

/// Microframe bits forced on for interrupt start splits so they are issued
/// from the last microframe of a frame.
pub const INTERRUPT_SPLIT_FRAME_MASK: u16 = 0x7;

/// A value of the host frame counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameNumber(u16);

impl FrameNumber {
    /// Wrap a raw counter value into the 14-bit frame space.
    pub const fn new(raw: u32) -> Self {
        Self((raw & FRAME_NUMBER_MAX as u32) as u16)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// `self + delta`, wrapped.
    pub const fn wrapping_add(self, delta: u32) -> Self {
        Self::new(self.0 as u32 + delta)
    }

    /// Circular `self < other`.
    pub const fn is_before(self, other: Self) -> bool {
        (self.0.wrapping_sub(other.0) & FRAME_NUMBER_MAX) & FRAME_NUMBER_HIGH_BIT != 0
    }

    /// Circular `self >= other`.
    pub const fn has_reached(self, other: Self) -> bool {
        !self.is_before(other)
    }

    /// Microframe index within the current frame.
    pub const fn microframe(self) -> u16 {
        self.0 & INTERRUPT_SPLIT_FRAME_MASK
    }

    /// The last microframe of the frame containing `self`.
    pub const fn last_microframe(self) -> Self {
        Self(self.0 | INTERRUPT_SPLIT_FRAME_MASK)
    }

    pub const fn is_even(self) -> bool {
        self.0 & 1 == 0
    }

    /// The earlier of two frames, circularly.
    pub const fn earliest(self, other: Self) -> Self {
        if other.is_before(self) { other } else { self }
    }
}
