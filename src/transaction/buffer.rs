//! Per-transaction record of what a commit will touch.

use std::collections::HashSet;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::addr::Addr;

/// What changed on an existing element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModifiedFlags(u8);

impl ModifiedFlags {
    /// Element type was changed.
    pub const TYPE: Self = Self(0x01);
    /// Link content was replaced.
    pub const CONTENT: Self = Self(0x02);
    /// A connector leaving the element was added.
    pub const OUTGOING: Self = Self(0x04);
    /// A connector entering the element was added.
    pub const INCOMING: Self = Self(0x08);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ModifiedFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ModifiedFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ModifiedFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// One existing element changed by the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedElement {
    /// The element.
    pub addr: Addr,
    /// Number of changes staged after the first, starting at zero.
    pub version: u32,
    /// Union of every staged change.
    pub flags: ModifiedFlags,
}

/// Created, modified and removed sets of a transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionBuffer {
    created: Vec<usize>,
    modified: Vec<ModifiedElement>,
    removed: Vec<Addr>,
}

impl TransactionBuffer {
    /// Records staged element `index`. Repeats are ignored.
    pub fn created_add(&mut self, index: usize) {
        if !self.created.contains(&index) {
            self.created.push(index);
        }
    }

    /// Records a change on `addr`, bumping its version and merging flags.
    ///
    /// Returns the version now recorded for `addr`.
    pub fn modified_add(&mut self, addr: Addr, flags: ModifiedFlags) -> u32 {
        if let Some(entry) = self.modified.iter_mut().find(|m| m.addr == addr) {
            entry.version += 1;
            entry.flags |= flags;
            return entry.version;
        }
        self.modified.push(ModifiedElement {
            addr,
            version: 0,
            flags,
        });
        0
    }

    /// Records `addr` for removal. Repeats are ignored.
    pub fn removed_add(&mut self, addr: Addr) {
        if !self.removed.contains(&addr) {
            self.removed.push(addr);
        }
    }

    /// Staged creations, in staging order.
    #[must_use]
    pub fn created(&self) -> &[usize] {
        &self.created
    }

    /// Change record of `addr`, if any.
    #[must_use]
    pub fn modified(&self, addr: Addr) -> Option<&ModifiedElement> {
        self.modified.iter().find(|m| m.addr == addr)
    }

    /// Elements staged for removal, in staging order.
    #[must_use]
    pub fn removed(&self) -> &[Addr] {
        &self.removed
    }

    /// Every existing element the transaction touches.
    #[must_use]
    pub fn elements(&self) -> HashSet<Addr> {
        self.modified
            .iter()
            .map(|m| m.addr)
            .chain(self.removed.iter().copied())
            .collect()
    }

    /// True if nothing was staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}
