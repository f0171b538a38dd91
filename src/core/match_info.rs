//! Match-tag codec.
//!
//! A 64-bit application tag travels as two 32-bit words, `match_a` holding
//! the high half and `match_b` the low half. Both words go through
//! [`WireField`] so byte-order handling composes with the rest of the body.

use crate::core::wire::{WireField, WireReader};
use crate::error::Result;
use bytes::BufMut;

/// Application-level 64-bit message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MatchInfo(pub u64);

impl MatchInfo {
    /// Split into `(match_a, match_b)`.
    #[inline]
    pub const fn split(self) -> (u32, u32) {
        ((self.0 >> 32) as u32, self.0 as u32)
    }

    /// Inverse of [`MatchInfo::split`].
    #[inline]
    pub const fn join(match_a: u32, match_b: u32) -> Self {
        MatchInfo(((match_a as u64) << 32) | match_b as u64)
    }

    /// True if `self` and `other` agree on every bit set in `mask`.
    #[inline]
    pub const fn matches(self, other: MatchInfo, mask: u64) -> bool {
        (self.0 & mask) == (other.0 & mask)
    }

    pub fn encode<B: BufMut>(self, dst: &mut B) {
        let (a, b) = self.split();
        a.put(dst);
        b.put(dst);
    }

    pub fn decode(src: &mut WireReader) -> Result<Self> {
        let a = src.field::<u32>()?;
        let b = src.field::<u32>()?;
        Ok(Self::join(a, b))
    }
}

impl From<u64> for MatchInfo {
    fn from(v: u64) -> Self {
        MatchInfo(v)
    }
}
