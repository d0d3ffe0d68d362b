//! Element storage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 SegmentStore                  │
//! ├──────────────────────────────────────────────┤
//! │  ┌───────────┐ ┌───────────┐                  │
//! │  │ Segment 1 │ │ Segment 2 │ ...  (lazy)      │
//! │  └───────────┘ └───────────┘                  │
//! │  ┌──────────────────┐ ┌───────────────────┐   │
//! │  │  MonitorTable    │ │ process segments  │   │
//! │  │ (per-address RW) │ │ (per thread)      │   │
//! │  └──────────────────┘ └───────────────────┘   │
//! └──────────────────────────────────────────────┘
//!        LinkContentStore        snapshot codec
//! ```

mod content;
mod element;
mod segment;
pub mod snapshot;
mod store;

pub use content::{read_stream, ContentStream, LinkContentStore, MemoryStream};
pub use element::{ConnectorInfo, Element, ElementState};
pub use segment::Segment;
pub use store::{SegmentStore, Stats};
