//! Change notifications.
//!
//! ```text
//! mutation ──► RegistrationManager::matching ──► EmissionManager queue
//!                                                   │
//!                                    worker threads ┴─► Subscription::dispatch
//! ```
//!
//! Subscriptions are destroyed in two steps: they are marked and unlinked
//! from the registry immediately, and released by the emission manager once
//! no queued or running task still refers to them.

mod complex;
mod emission;
mod registry;
mod stream;
mod subscription;
mod types;

pub use complex::{ComplexFn, ComplexSubscription, Condition};
pub use emission::{Continuation, EmissionManager, EmissionStats};
pub use registry::RegistrationManager;
pub use stream::EventStream;
pub use subscription::{
    ConnectorFn, DeleteFn, EventCallback, EventFn, Lifecycle, Subscription, SubscriptionBuilder,
};
pub use types::{EventArgs, EventType, SubscriptionId};
