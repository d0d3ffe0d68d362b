//! Access bitsets.
//!
//! The same bits are used for three things: a context's global rights, its
//! rights inside one permitted structure, and the access level stored on an
//! element. A context holds a right when `(held & required) == required`.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

/// Bitset of access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u16);

impl Permissions {
    /// No rights.
    pub const NONE: Self = Self(0);
    /// The actor passed authentication.
    pub const AUTHENTICATED: Self = Self(0x1);
    /// Read elements.
    pub const READ: Self = Self(0x4);
    /// Create and modify elements.
    pub const WRITE: Self = Self(0x8);
    /// Erase elements.
    pub const ERASE: Self = Self(0x10);
    /// Read access levels of elements.
    pub const READ_PERMISSIONS: Self = Self(0x20);
    /// Change access levels of elements.
    pub const WRITE_PERMISSIONS: Self = Self(0x40);
    /// Erase elements guarded by an access level.
    pub const ERASE_PERMISSIONS: Self = Self(0x80);
    /// The whole permission-data tier.
    pub const ALL_PERMISSIONS: Self = Self(0x20 | 0x40 | 0x80);
    /// Element-level marker: the structure scopes local rights.
    pub const PERMITTED_STRUCTURE: Self = Self(0x100);

    /// Wraps raw bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if every bit of `required` is held.
    #[must_use]
    pub const fn contains(self, required: Self) -> bool {
        self.0 & required.0 == required.0
    }

    /// True if no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Adds `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Removes `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Tier check: within `tier`, the holder must have every bit the
    /// element demands.
    #[must_use]
    pub const fn covers(self, element: Self, tier: Self) -> bool {
        let held = self.0 & tier.0;
        let demanded = element.0 & tier.0;
        held & demanded == demanded
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permissions {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for Permissions {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Kind of action an actor may be granted through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    /// Reading elements.
    Read,
    /// Generating elements.
    Generate,
    /// Erasing elements.
    Erase,
    /// Reading access levels.
    ReadPermissions,
    /// Generating access levels.
    GeneratePermissions,
    /// Erasing access levels.
    ErasePermissions,
}

impl ActionClass {
    /// Every action class.
    pub const ALL: [Self; 6] = [
        Self::Read,
        Self::Generate,
        Self::Erase,
        Self::ReadPermissions,
        Self::GeneratePermissions,
        Self::ErasePermissions,
    ];

    /// Rights granted by the class.
    #[must_use]
    pub const fn permissions(self) -> Permissions {
        match self {
            Self::Read => Permissions::READ,
            Self::Generate => Permissions::WRITE,
            Self::Erase => Permissions::ERASE,
            Self::ReadPermissions => Permissions::READ_PERMISSIONS,
            Self::GeneratePermissions => Permissions::WRITE_PERMISSIONS,
            Self::ErasePermissions => Permissions::ERASE_PERMISSIONS,
        }
    }

    /// System identifier of the class keynode.
    #[must_use]
    pub const fn idtf(self) -> &'static str {
        match self {
            Self::Read => "action_read_from_sc_memory",
            Self::Generate => "action_generate_in_sc_memory",
            Self::Erase => "action_erase_in_sc_memory",
            Self::ReadPermissions => "action_read_permissions_from_sc_memory",
            Self::GeneratePermissions => "action_generate_permissions_in_sc_memory",
            Self::ErasePermissions => "action_erase_permissions_from_sc_memory",
        }
    }
}

/// Outcome of a structure-scoped check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalCheck {
    /// A permitted structure containing the element grants the rights.
    Granted,
    /// A permitted structure contains the element but does not grant them.
    Denied,
    /// No permitted structure contains the element.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_contains_requires_every_bit() {
        let held = Permissions::READ | Permissions::WRITE;
        assert!(held.contains(Permissions::READ));
        assert!(!held.contains(Permissions::READ | Permissions::ERASE));
        assert!(held.contains(Permissions::NONE));
    }

    #[test]
    fn test_insert_remove() {
        let mut p = Permissions::NONE;
        p.insert(Permissions::AUTHENTICATED | Permissions::ERASE);
        p.remove(Permissions::AUTHENTICATED);
        assert_eq!(p, Permissions::ERASE);
    }

    #[test]
    fn test_covers_tier() {
        let element = Permissions::WRITE_PERMISSIONS | Permissions::PERMITTED_STRUCTURE;
        assert!(!Permissions::READ.covers(element, Permissions::WRITE_PERMISSIONS));
        assert!(Permissions::WRITE_PERMISSIONS.covers(element, Permissions::WRITE_PERMISSIONS));
        // Unguarded elements demand nothing.
        assert!(Permissions::NONE.covers(Permissions::NONE, Permissions::ERASE_PERMISSIONS));
    }

    #[test]
    fn test_action_classes_distinct() {
        let mut all = Permissions::NONE;
        for class in ActionClass::ALL {
            assert!(!all.contains(class.permissions()));
            all |= class.permissions();
        }
        assert!(all.contains(Permissions::ALL_PERMISSIONS));
    }

    proptest! {
        #[test]
        fn prop_covers_is_contains_within_tier(held in any::<u16>(), el in any::<u16>(), tier in any::<u16>()) {
            let (h, e, t) = (Permissions(held), Permissions(el), Permissions(tier));
            prop_assert_eq!(h.covers(e, t), (h & t).contains(e & t));
        }
    }
}
