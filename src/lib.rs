//! # kyrograph - segment-addressed graph memory
//!
//! kyrograph stores a typed graph of nodes, links and connectors in
//! fixed-capacity segments, notifies subscribers of changes on a worker
//! pool, and gates every operation by per-actor rights that are themselves
//! derived from relation arcs in the graph.
//!
//! ## Core Concepts
//!
//! - **Addr**: stable (segment, offset) identifier of an element
//! - **Element**: a node, a link carrying content, or a connector between two elements
//! - **Subscription**: a standing registration for one event type on one address
//! - **MemoryContext**: an actor's session, carrying its rights and its event mode
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kyrograph::{ElementType, Memory, MemoryConfig};
//!
//! let memory = Memory::initialize(MemoryConfig::default())?;
//! let ctx = memory.system_context();
//!
//! let a = memory.node_new(&ctx, ElementType::CONST_NODE)?;
//! let b = memory.node_new(&ctx, ElementType::CONST_NODE)?;
//! let arc = memory.connector_new(&ctx, ElementType::CONST_POS_ARC, a, b)?;
//!
//! memory.erase(&ctx, a)?; // also erases `arc`
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Addressing, types and errors
pub mod addr;
pub mod config;
pub mod error;
pub mod types;

// Storage and synchronization
pub mod storage;
pub mod sync;

// Events, contexts and the public surface
pub mod context;
pub mod engine;
pub mod event;
pub mod memory;
pub mod transaction;

// Re-export primary types at crate root for convenience
pub use addr::Addr;
pub use config::MemoryConfig;
pub use context::{ActionClass, ContextId, ContextManager, Keynodes, MemoryContext, Permissions};
pub use engine::GraphEngine;
pub use error::{GraphError, GraphResult, ResultCode};
pub use event::{
    ComplexSubscription, Condition, EventArgs, EventCallback, EventStream, EventType, Lifecycle,
    Subscription, SubscriptionId,
};
pub use memory::Memory;
pub use storage::{ConnectorInfo, ContentStream, Element, ElementState, MemoryStream, Stats};
pub use transaction::{
    ModifiedFlags, Transaction, TransactionBuffer, TransactionId, TransactionManager, TransactionState,
    TransactionStats, TxnAddr,
};
pub use types::ElementType;
