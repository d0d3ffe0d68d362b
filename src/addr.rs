//! Element addressing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a graph element: a segment number and an offset
/// inside that segment.
///
/// Both halves are 1-based; the all-zero pair is reserved as [`Addr::EMPTY`]
/// and never refers to a live element.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Addr {
    /// Segment number (1-based).
    pub seg: u16,
    /// Offset within the segment (1-based).
    pub offset: u16,
}

impl Addr {
    /// The reserved empty address.
    pub const EMPTY: Self = Self { seg: 0, offset: 0 };

    /// Creates an address from its parts.
    #[must_use]
    pub const fn new(seg: u16, offset: u16) -> Self {
        Self { seg, offset }
    }

    /// Returns true for the empty sentinel.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.seg == 0 && self.offset == 0
    }

    /// Packs the address into a single 32-bit key.
    #[must_use]
    pub const fn pack(self) -> u32 {
        ((self.seg as u32) << 16) | self.offset as u32
    }

    /// Inverse of [`Addr::pack`].
    #[must_use]
    pub const fn unpack(key: u32) -> Self {
        Self {
            seg: (key >> 16) as u16,
            offset: (key & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seg, self.offset)
    }
}

impl From<Addr> for u32 {
    fn from(addr: Addr) -> Self {
        addr.pack()
    }
}
