//! Event tags, subscription ids and callback arguments.
//!
//! These types are serializable so event traces can be logged or shipped to
//! an outer front-end unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::addr::Addr;
use crate::types::ElementType;

/// Unique identifier for a subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of structural change a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A connector touching the element was created (either end).
    AfterGenerateConnector,
    /// A directed connector leaving the element was created.
    AfterGenerateOutgoingArc,
    /// A directed connector entering the element was created.
    AfterGenerateIncomingArc,
    /// An undirected connector touching the element was created.
    AfterGenerateEdge,
    /// A connector touching the element is about to be erased.
    BeforeEraseConnector,
    /// A directed connector leaving the element is about to be erased.
    BeforeEraseOutgoingArc,
    /// A directed connector entering the element is about to be erased.
    BeforeEraseIncomingArc,
    /// An undirected connector touching the element is about to be erased.
    BeforeEraseEdge,
    /// The element itself is about to be erased.
    BeforeEraseElement,
    /// The content of the link is about to change.
    BeforeChangeLinkContent,
}

impl EventType {
    /// Every event type.
    pub const ALL: [Self; 10] = [
        Self::AfterGenerateConnector,
        Self::AfterGenerateOutgoingArc,
        Self::AfterGenerateIncomingArc,
        Self::AfterGenerateEdge,
        Self::BeforeEraseConnector,
        Self::BeforeEraseOutgoingArc,
        Self::BeforeEraseIncomingArc,
        Self::BeforeEraseEdge,
        Self::BeforeEraseElement,
        Self::BeforeChangeLinkContent,
    ];

    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AfterGenerateConnector => "after_generate_connector",
            Self::AfterGenerateOutgoingArc => "after_generate_outgoing_arc",
            Self::AfterGenerateIncomingArc => "after_generate_incoming_arc",
            Self::AfterGenerateEdge => "after_generate_edge",
            Self::BeforeEraseConnector => "before_erase_connector",
            Self::BeforeEraseOutgoingArc => "before_erase_outgoing_arc",
            Self::BeforeEraseIncomingArc => "before_erase_incoming_arc",
            Self::BeforeEraseEdge => "before_erase_edge",
            Self::BeforeEraseElement => "before_erase_element",
            Self::BeforeChangeLinkContent => "before_change_link_content",
        }
    }

    /// True for the before-erase family.
    #[must_use]
    pub const fn is_erase(self) -> bool {
        matches!(
            self,
            Self::BeforeEraseConnector
                | Self::BeforeEraseOutgoingArc
                | Self::BeforeEraseIncomingArc
                | Self::BeforeEraseEdge
                | Self::BeforeEraseElement
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened, delivered to every matching callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventArgs {
    /// Event kind.
    pub event_type: EventType,
    /// Subscribed element the event is reported on.
    pub element: Addr,
    /// Changed connector, or empty for element-level events.
    pub connector: Addr,
    /// Type of the changed connector (of the element for element-level events).
    pub connector_type: ElementType,
    /// Element at the other end of the connector.
    pub other: Addr,
    /// Actor of the context that caused the change.
    pub actor: Addr,
}

impl EventArgs {
    /// An event on `element` with no connector.
    #[must_use]
    pub const fn new(event_type: EventType, element: Addr) -> Self {
        Self {
            event_type,
            element,
            connector: Addr::EMPTY,
            connector_type: ElementType::UNKNOWN,
            other: Addr::EMPTY,
            actor: Addr::EMPTY,
        }
    }

    /// Sets the changed connector and its type.
    #[must_use]
    pub fn connector(mut self, connector: Addr, ty: ElementType) -> Self {
        self.connector = connector;
        self.connector_type = ty;
        self
    }

    /// Sets the element at the other end.
    #[must_use]
    pub fn other(mut self, other: Addr) -> Self {
        self.other = other;
        self
    }

    /// Sets the acting actor.
    #[must_use]
    pub fn actor(mut self, actor: Addr) -> Self {
        self.actor = actor;
        self
    }
}
