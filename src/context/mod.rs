//! Contexts and permissions.
//!
//! A [`MemoryContext`] is one actor's session. Its rights are not set by
//! callers: they follow relation arcs in the graph, watched by internal
//! subscriptions (see `handlers`). Rights come in two scopes, global and
//! per permitted structure; a permitted structure containing an element is
//! conclusive, global rights decide otherwise.

#[allow(clippy::module_inception)]
mod context;
pub(crate) mod handlers;
mod keynodes;
mod manager;
mod permissions;

pub(crate) use context::Intercept;
pub use context::{ContextId, MemoryContext, PendingEmission};
pub use keynodes::{IdentifierRegistry, Keynodes};
pub use manager::ContextManager;
pub use permissions::{ActionClass, LocalCheck, Permissions};
