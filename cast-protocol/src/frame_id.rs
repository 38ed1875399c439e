//! Frame Identifiers
//!
//! Frames carry a monotonically increasing logical counter. Only the low 8
//! bits travel on the wire, so receivers of a truncated id re-expand it
//! against an id they already know.

use crate::expand::{expand_greater_than, expand_less_than_or_equal, expand_nearest};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

const TRUNCATED_BITS: u32 = 8;

/// Logical frame identifier
///
/// The first frame of a stream is `FrameId::first()`. The value one before
/// that (`FrameId::first() - 1`) is used as the initial checkpoint, meaning
/// "no frames resolved yet".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct FrameId(i64);

impl FrameId {
    #[inline]
    pub const fn new(value: i64) -> Self {
        FrameId(value)
    }

    /// Id of the first frame in a stream
    #[inline]
    pub const fn first() -> Self {
        FrameId(0)
    }

    #[inline]
    pub fn value(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn next(self) -> Self {
        FrameId(self.0 + 1)
    }

    #[inline]
    pub fn previous(self) -> Self {
        FrameId(self.0 - 1)
    }

    /// Truncated wire representation
    #[inline]
    pub fn lower_8_bits(self) -> u8 {
        self.0 as u8
    }

    /// Low 32 bits, used as the per-frame cipher counter
    #[inline]
    pub fn lower_32_bits(self) -> u32 {
        self.0 as u32
    }

    /// Expand a truncated id to the nearest frame id around `self`
    pub fn expand(self, lower_8_bits: u8) -> FrameId {
        FrameId(expand_nearest(self.0, lower_8_bits as u64, TRUNCATED_BITS))
    }

    /// Expand a truncated id to the greatest frame id not after `self`
    pub fn expand_less_than_or_equal(self, lower_8_bits: u8) -> FrameId {
        FrameId(expand_less_than_or_equal(
            self.0,
            lower_8_bits as u64,
            TRUNCATED_BITS,
        ))
    }

    /// Expand a truncated id to the first frame id after `self`
    pub fn expand_greater_than(self, lower_8_bits: u8) -> FrameId {
        FrameId(expand_greater_than(
            self.0,
            lower_8_bits as u64,
            TRUNCATED_BITS,
        ))
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

impl Add<i64> for FrameId {
    type Output = FrameId;

    fn add(self, rhs: i64) -> FrameId {
        FrameId(self.0 + rhs)
    }
}

impl AddAssign<i64> for FrameId {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl Sub<i64> for FrameId {
    type Output = FrameId;

    fn sub(self, rhs: i64) -> FrameId {
        FrameId(self.0 - rhs)
    }
}

impl SubAssign<i64> for FrameId {
    fn sub_assign(&mut self, rhs: i64) {
        self.0 -= rhs;
    }
}

impl Sub for FrameId {
    type Output = i64;

    /// Number of frames between two ids
    fn sub(self, rhs: FrameId) -> i64 {
        self.0 - rhs.0
    }
}
