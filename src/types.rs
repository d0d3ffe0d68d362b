//! Element type bitmasks.
//!
//! A type is a set of orthogonal bit groups: the element class (node, link,
//! connector kind), constancy, and for connectors actuality, permanence and
//! polarity. Node subtypes reuse the connector-only bits, so the meaning of
//! a bit depends on the class bits alongside it.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

/// Bitmask describing what an element is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementType(u16);

impl ElementType {
    /// No bits set; matches every type in filters.
    pub const UNKNOWN: Self = Self(0);

    // Element classes
    /// Plain node.
    pub const NODE: Self = Self(0x1);
    /// Content-bearing link.
    pub const LINK: Self = Self(0x2);
    /// Undirected connector.
    pub const COMMON_EDGE: Self = Self(0x4);
    /// Directed connector.
    pub const COMMON_ARC: Self = Self(0x8);
    /// Directed membership connector.
    pub const MEMBERSHIP_ARC: Self = Self(0x10);

    // Constancy
    /// Constant element.
    pub const CONST: Self = Self(0x20);
    /// Variable element.
    pub const VAR: Self = Self(0x40);

    // Connector polarity
    /// Positive membership.
    pub const POS: Self = Self(0x80);
    /// Negative membership.
    pub const NEG: Self = Self(0x100);
    /// Fuzzy membership.
    pub const FUZ: Self = Self(0x200);

    // Connector permanence and actuality
    /// Temporary membership.
    pub const TEMP: Self = Self(0x400);
    /// Actual membership.
    pub const ACTUAL: Self = Self(0x4000);
    /// Inactual membership.
    pub const INACTUAL: Self = Self(0x8000);
    /// Permanent membership (implies actual).
    pub const PERM: Self = Self(0x4000 | 0x800);

    // Node subtypes
    /// Tuple node.
    pub const TUPLE: Self = Self(0x80);
    /// Structure node.
    pub const STRUCTURE: Self = Self(0x100);
    /// Role relation node.
    pub const ROLE: Self = Self(0x200);
    /// Non-role relation node.
    pub const NOROLE: Self = Self(0x400);
    /// Class node.
    pub const CLASS: Self = Self(0x800);
    /// Superclass node.
    pub const SUPERCLASS: Self = Self(0x1000);
    /// Material node.
    pub const MATERIAL: Self = Self(0x2000);

    // Masks
    /// All connector kinds.
    pub const CONNECTOR_MASK: Self = Self(0x4 | 0x8 | 0x10);
    /// Directed connector kinds.
    pub const ARC_MASK: Self = Self(0x8 | 0x10);
    /// Element classes.
    pub const ELEMENT_MASK: Self = Self(0x1 | 0x2 | 0x4 | 0x8 | 0x10);
    /// Constancy group.
    pub const CONSTANCY_MASK: Self = Self(0x20 | 0x40);
    /// Actuality group.
    pub const ACTUALITY_MASK: Self = Self(0x4000 | 0x8000);
    /// Permanence group.
    pub const PERMANENCY_MASK: Self = Self(0x4000 | 0x800 | 0x400);
    /// Polarity group.
    pub const POSITIVITY_MASK: Self = Self(0x80 | 0x100 | 0x200);
    /// Node subtype group.
    pub const NODE_MASK: Self = Self(0x80 | 0x100 | 0x200 | 0x400 | 0x800 | 0x1000 | 0x2000);

    // Common combinations
    /// Constant node.
    pub const CONST_NODE: Self = Self(0x20 | 0x1);
    /// Constant structure node.
    pub const CONST_NODE_STRUCTURE: Self = Self(0x20 | 0x1 | 0x100);
    /// Constant class node.
    pub const CONST_NODE_CLASS: Self = Self(0x20 | 0x1 | 0x800);
    /// Constant non-role relation node.
    pub const CONST_NODE_NOROLE: Self = Self(0x20 | 0x1 | 0x400);
    /// Constant link.
    pub const CONST_LINK: Self = Self(0x20 | 0x2);
    /// Constant common arc.
    pub const CONST_COMMON_ARC: Self = Self(0x20 | 0x8);
    /// Constant common edge.
    pub const CONST_COMMON_EDGE: Self = Self(0x20 | 0x4);
    /// Constant positive membership arc.
    pub const CONST_POS_ARC: Self = Self(0x20 | 0x80 | 0x10);
    /// Constant negative membership arc.
    pub const CONST_NEG_ARC: Self = Self(0x20 | 0x100 | 0x10);
    /// Constant permanent positive membership arc.
    pub const CONST_PERM_POS_ARC: Self = Self(0x20 | 0x4800 | 0x80 | 0x10);
    /// Constant permanent negative membership arc.
    pub const CONST_PERM_NEG_ARC: Self = Self(0x20 | 0x4800 | 0x100 | 0x10);
    /// Constant temporary positive membership arc.
    pub const CONST_TEMP_POS_ARC: Self = Self(0x20 | 0x400 | 0x80 | 0x10);
    /// Constant temporary negative membership arc.
    pub const CONST_TEMP_NEG_ARC: Self = Self(0x20 | 0x400 | 0x100 | 0x10);

    /// Creates a type from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if every bit of `sub` is present.
    #[must_use]
    pub const fn has_subtype(self, sub: Self) -> bool {
        self.0 & sub.0 == sub.0
    }

    /// True if any bit of `mask` is present.
    #[must_use]
    pub const fn has_any(self, mask: Self) -> bool {
        self.0 & mask.0 != 0
    }

    /// Node (not link, not connector).
    #[must_use]
    pub const fn is_node(self) -> bool {
        self.has_subtype(Self::NODE)
    }

    /// Link.
    #[must_use]
    pub const fn is_link(self) -> bool {
        self.has_subtype(Self::LINK)
    }

    /// Any connector kind.
    #[must_use]
    pub const fn is_connector(self) -> bool {
        self.has_any(Self::CONNECTOR_MASK)
    }

    /// Undirected connector.
    #[must_use]
    pub const fn is_edge(self) -> bool {
        self.has_subtype(Self::COMMON_EDGE)
    }

    /// Directed connector.
    #[must_use]
    pub const fn is_arc(self) -> bool {
        self.has_any(Self::ARC_MASK)
    }

    /// Constant element.
    #[must_use]
    pub const fn is_const(self) -> bool {
        self.has_subtype(Self::CONST)
    }

    /// Positive connector.
    #[must_use]
    pub const fn is_pos(self) -> bool {
        self.has_subtype(Self::POS)
    }

    /// Negative connector.
    #[must_use]
    pub const fn is_neg(self) -> bool {
        self.has_subtype(Self::NEG)
    }

    /// Structure node.
    #[must_use]
    pub const fn is_structure(self) -> bool {
        self.is_node() && self.has_subtype(Self::STRUCTURE)
    }

    /// True if a `filter` mask accepts this connector type.
    ///
    /// An empty filter accepts everything.
    #[must_use]
    pub const fn matches_filter(self, filter: Self) -> bool {
        filter.0 & self.0 == filter.0
    }

    /// True if an element of this type may be retyped to `target`.
    ///
    /// Set groups must stay equal; unset groups may be filled in. Elements
    /// never change class.
    #[must_use]
    pub fn is_extendable_to(self, target: Self) -> bool {
        if conflicts(self, target, Self::CONSTANCY_MASK) {
            return false;
        }

        if self.is_connector() {
            if !target.is_connector() {
                return false;
            }
            if self.is_edge() != target.is_edge() {
                return false;
            }
            if conflicts(self, target, Self::ARC_MASK) {
                return false;
            }
            return !conflicts(self, target, Self::ACTUALITY_MASK)
                && !conflicts(self, target, Self::PERMANENCY_MASK)
                && !conflicts(self, target, Self::POSITIVITY_MASK);
        }

        if self.is_link() {
            return target.is_link() && !target.is_connector() && !target.is_node();
        }

        if self.is_node() {
            return target.is_node()
                && !target.is_connector()
                && !target.is_link()
                && !conflicts(self, target, Self::NODE_MASK);
        }

        !conflicts(self, target, Self::ELEMENT_MASK)
    }
}

fn conflicts(current: ElementType, target: ElementType, mask: ElementType) -> bool {
    let cur = current.0 & mask.0;
    cur != 0 && cur != target.0 & mask.0
}

impl BitOr for ElementType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ElementType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ElementType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for ElementType {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_class_predicates() {
        assert!(ElementType::CONST_NODE.is_node());
        assert!(!ElementType::CONST_NODE.is_connector());
        assert!(ElementType::CONST_LINK.is_link());
        assert!(ElementType::CONST_POS_ARC.is_connector());
        assert!(ElementType::CONST_POS_ARC.is_arc());
        assert!(!ElementType::CONST_POS_ARC.is_edge());
        assert!(ElementType::CONST_COMMON_EDGE.is_edge());
        assert!(ElementType::CONST_NODE_STRUCTURE.is_structure());
        assert!(!ElementType::CONST_POS_ARC.is_structure());
    }

    #[test]
    fn test_perm_implies_actual() {
        assert!(ElementType::PERM.has_subtype(ElementType::ACTUAL));
        assert!(ElementType::CONST_PERM_POS_ARC.has_subtype(ElementType::CONST_POS_ARC));
    }

    #[test]
    fn test_filter_matching() {
        let arc = ElementType::CONST_TEMP_POS_ARC;
        assert!(arc.matches_filter(ElementType::UNKNOWN));
        assert!(arc.matches_filter(ElementType::MEMBERSHIP_ARC));
        assert!(arc.matches_filter(ElementType::CONST_POS_ARC));
        assert!(!arc.matches_filter(ElementType::CONST_NEG_ARC));
        assert!(!arc.matches_filter(ElementType::COMMON_ARC));
    }

    #[test]
    fn test_extendable_fills_unset_groups() {
        let bare_arc = ElementType::MEMBERSHIP_ARC;
        assert!(bare_arc.is_extendable_to(ElementType::CONST_POS_ARC));
        assert!(ElementType::CONST_POS_ARC.is_extendable_to(ElementType::CONST_PERM_POS_ARC));
        assert!(ElementType::NODE.is_extendable_to(ElementType::CONST_NODE_CLASS));
        assert!(ElementType::UNKNOWN.is_extendable_to(ElementType::CONST_NODE));
    }

    #[test]
    fn test_extendable_rejects_conflicts() {
        assert!(!ElementType::CONST_POS_ARC.is_extendable_to(ElementType::CONST_NEG_ARC));
        assert!(!ElementType::CONST_NODE.is_extendable_to(ElementType::CONST_POS_ARC));
        assert!(!ElementType::CONST_NODE.is_extendable_to(ElementType::VAR | ElementType::NODE));
        assert!(!ElementType::CONST_COMMON_EDGE.is_extendable_to(ElementType::CONST_COMMON_ARC));
        assert!(!ElementType::CONST_NODE_CLASS.is_extendable_to(ElementType::CONST_NODE_STRUCTURE));
        assert!(!ElementType::CONST_LINK.is_extendable_to(ElementType::CONST_NODE));
    }

    proptest! {
        #[test]
        fn prop_extendable_is_reflexive(bits in any::<u16>()) {
            let ty = ElementType::from_bits(bits);
            let classes = [
                ElementType::NODE,
                ElementType::LINK,
                ElementType::COMMON_EDGE,
                ElementType::COMMON_ARC,
                ElementType::MEMBERSHIP_ARC,
            ];
            let class_count = classes.iter().filter(|c| ty.has_subtype(**c)).count();
            prop_assume!(class_count <= 1);
            prop_assert!(ty.is_extendable_to(ty));
        }

        #[test]
        fn prop_empty_filter_accepts_all(bits in any::<u16>()) {
            prop_assert!(ElementType::from_bits(bits).matches_filter(ElementType::UNKNOWN));
        }
    }
}
