//! The fixed-size element record stored in every segment slot.

use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::context::Permissions;
use crate::types::ElementType;

/// Lifecycle bits of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementState(u16);

impl ElementState {
    /// Erase has been requested; the element is dead to lookups.
    pub const REQUEST_ERASURE: Self = Self(0x1);
    /// The slot holds a live element.
    pub const EXISTS: Self = Self(0x2);
    /// Before-erase events were already issued for this element.
    pub const ERASABLE: Self = Self(0x200);

    /// True if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// A node, link or connector.
///
/// Connectors thread two intrusive lists: the outgoing list of `begin` through
/// `prev_out`/`next_out`, and the incoming list of `end` through
/// `prev_in`/`next_in`. Every element heads its own lists with `first_out` and
/// `first_in`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Element {
    /// Type bits.
    pub ty: ElementType,
    /// Lifecycle bits.
    pub state: ElementState,
    /// Access-level bits guarding the element itself.
    pub permissions: Permissions,
    /// Outstanding references; the slot is released when this reaches zero.
    pub ref_count: u32,
    /// Connector source.
    pub begin: Addr,
    /// Connector target.
    pub end: Addr,
    /// Head of the outgoing connector list.
    pub first_out: Addr,
    /// Head of the incoming connector list.
    pub first_in: Addr,
    /// Previous connector in `begin`'s outgoing list.
    pub prev_out: Addr,
    /// Next connector in `begin`'s outgoing list.
    pub next_out: Addr,
    /// Previous connector in `end`'s incoming list.
    pub prev_in: Addr,
    /// Next connector in `end`'s incoming list.
    pub next_in: Addr,
    /// Length of the outgoing list.
    pub out_count: u32,
    /// Length of the incoming list.
    pub in_count: u32,
}

impl Element {
    /// A freshly appended element: existing, untyped, owned once.
    #[must_use]
    pub fn fresh() -> Self {
        Self {
            state: ElementState::EXISTS,
            ref_count: 1,
            ..Self::default()
        }
    }

    /// True if the slot holds an element that has not been erased.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.state.contains(ElementState::EXISTS)
            && !self.state.contains(ElementState::REQUEST_ERASURE)
    }

    /// Endpoints of a connector.
    #[must_use]
    pub const fn connector_info(&self) -> Option<ConnectorInfo> {
        if self.ty.is_connector() {
            Some(ConnectorInfo {
                ty: self.ty,
                begin: self.begin,
                end: self.end,
            })
        } else {
            None
        }
    }
}

/// Type and endpoints of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectorInfo {
    /// Connector type.
    pub ty: ElementType,
    /// Source element.
    pub begin: Addr,
    /// Target element.
    pub end: Addr,
}
