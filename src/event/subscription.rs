//! Standing registrations for change notifications.
//!
//! A subscription moves through [`Lifecycle::Active`] →
//! [`Lifecycle::PendingDestroy`] → [`Lifecycle::Freed`]. A dispatch holds the
//! subscription's monitor for reading from the lifecycle check until the
//! callback returns, and marking for destroy takes it for writing, so once a
//! subscription leaves `Active` no new callback begins for it and the delete
//! hook never overlaps a running callback. A destroy requested from inside
//! the subscription's own callback takes effect when that callback returns.
//! The emission manager releases the subscription only when no task still
//! holds a reference to it.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::addr::Addr;
use crate::error::{GraphError, GraphResult};
use crate::event::types::{EventArgs, EventType, SubscriptionId};
use crate::sync::Monitor;
use crate::types::ElementType;

/// Callback receiving the changed connector and the element at its other end.
pub type ConnectorFn = dyn Fn(&Subscription, Addr, Addr) -> GraphResult<()> + Send + Sync;

/// Callback receiving the full event, including the acting actor.
pub type EventFn = dyn Fn(&Subscription, &EventArgs) -> GraphResult<()> + Send + Sync;

/// Called once when the subscription is destroyed or its element is erased.
pub type DeleteFn = dyn FnOnce(&Subscription) + Send + Sync;

/// The code run for a matching event.
#[derive(Clone)]
pub enum EventCallback {
    /// `(subscription, connector, other)`.
    Connector(Arc<ConnectorFn>),
    /// `(subscription, event)`.
    Event(Arc<EventFn>),
}

impl EventCallback {
    /// Wraps a connector-shaped callback.
    pub fn connector<F>(f: F) -> Self
    where
        F: Fn(&Subscription, Addr, Addr) -> GraphResult<()> + Send + Sync + 'static,
    {
        Self::Connector(Arc::new(f))
    }

    /// Wraps an event-shaped callback.
    pub fn event<F>(f: F) -> Self
    where
        F: Fn(&Subscription, &EventArgs) -> GraphResult<()> + Send + Sync + 'static,
    {
        Self::Event(Arc::new(f))
    }

    fn invoke(&self, sub: &Subscription, args: &EventArgs) -> GraphResult<()> {
        match self {
            Self::Connector(f) => f(sub, args.connector, args.other),
            Self::Event(f) => f(sub, args),
        }
    }
}

impl fmt::Debug for EventCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connector(_) => f.write_str("EventCallback::Connector"),
            Self::Event(_) => f.write_str("EventCallback::Event"),
        }
    }
}

/// Subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Lifecycle {
    /// Receives events.
    Active,
    /// Unlinked from the registry, waiting for in-flight callbacks to drain.
    PendingDestroy,
    /// Released by the emission manager.
    Freed,
}

impl Lifecycle {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::PendingDestroy,
            _ => Self::Freed,
        }
    }
}

struct SubscriptionState {
    lifecycle: Lifecycle,
    on_delete: Option<Box<DeleteFn>>,
}

thread_local! {
    /// Subscriptions whose callback is running on this thread.
    static DISPATCHING: RefCell<Vec<SubscriptionId>> = const { RefCell::new(Vec::new()) };
}

/// Records a running callback on the current thread until dropped.
struct DispatchMark(SubscriptionId);

impl DispatchMark {
    fn enter(id: SubscriptionId) -> Self {
        DISPATCHING.with(|running| running.borrow_mut().push(id));
        Self(id)
    }

    fn is_running_here(id: SubscriptionId) -> bool {
        DISPATCHING.with(|running| running.borrow().contains(&id))
    }
}

impl Drop for DispatchMark {
    fn drop(&mut self) {
        DISPATCHING.with(|running| {
            let mut running = running.borrow_mut();
            if let Some(pos) = running.iter().rposition(|id| *id == self.0) {
                running.remove(pos);
            }
        });
    }
}

/// A registration to be notified of changes touching one address.
pub struct Subscription {
    id: SubscriptionId,
    addr: Addr,
    event_type: EventType,
    filter: ElementType,
    data: Option<Arc<dyn Any + Send + Sync>>,
    callback: EventCallback,
    state: Monitor<SubscriptionState>,
    // Readable without the monitor, so a callback may inspect its own
    // subscription while a destroyer is queued on the monitor.
    lifecycle: AtomicU8,
    destroy_requested: AtomicBool,
    created_at: DateTime<Utc>,
    dispatched: AtomicU64,
}

impl Subscription {
    /// Starts building a subscription on `addr` for `event_type`.
    pub fn builder(addr: Addr, event_type: EventType, callback: EventCallback) -> SubscriptionBuilder {
        SubscriptionBuilder {
            addr,
            event_type,
            callback,
            filter: ElementType::UNKNOWN,
            data: None,
            on_delete: None,
        }
    }

    /// Subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Subscribed address.
    #[must_use]
    pub const fn addr(&self) -> Addr {
        self.addr
    }

    /// Subscribed event type.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Connector-type filter; empty accepts every type.
    #[must_use]
    pub const fn filter(&self) -> ElementType {
        self.filter
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// User data attached at creation, if it has type `T`.
    #[must_use]
    pub fn data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|d| d.downcast_ref::<T>())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, state: &mut SubscriptionState, lifecycle: Lifecycle) {
        state.lifecycle = lifecycle;
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    /// True while the subscription receives events.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    /// Number of callbacks started for this subscription.
    #[must_use]
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// True if the event is addressed to this subscription and passes the type filter.
    #[must_use]
    pub fn accepts(&self, args: &EventArgs) -> bool {
        args.element == self.addr
            && args.event_type == self.event_type
            && args.connector_type.matches_filter(self.filter)
    }

    /// Runs the callback unless the subscription has left `Active`.
    ///
    /// Returns `None` when skipped.
    pub(crate) fn dispatch(&self, args: &EventArgs) -> Option<GraphResult<()>> {
        let result = {
            let state = self.state.read();
            if state.lifecycle != Lifecycle::Active {
                return None;
            }
            self.dispatched.fetch_add(1, Ordering::Relaxed);
            let _mark = DispatchMark::enter(self.id);
            self.callback.invoke(self, args)
        };
        self.finish_requested_destroy();
        Some(result)
    }

    /// Applies a destroy requested by this subscription's own callback.
    pub(crate) fn finish_requested_destroy(&self) {
        if self.destroy_requested.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.mark_for_destroy() {
                debug!(id = %self.id, error = %e, "requested destroy already applied");
            }
        }
    }

    fn already(&self, lifecycle: Lifecycle) -> GraphError {
        GraphError::invalid_state(format!("subscription {} is already {lifecycle:?}", self.id))
    }

    /// Moves `Active` to `PendingDestroy` and runs the delete callback.
    ///
    /// Called from inside this subscription's own callback, the transition
    /// is recorded and applied once the callback returns.
    pub(crate) fn mark_for_destroy(&self) -> GraphResult<()> {
        if DispatchMark::is_running_here(self.id) {
            let lifecycle = self.lifecycle();
            if lifecycle != Lifecycle::Active || self.destroy_requested.swap(true, Ordering::AcqRel) {
                return Err(self.already(lifecycle));
            }
            return Ok(());
        }
        let on_delete = {
            let mut state = self.state.write();
            if state.lifecycle != Lifecycle::Active {
                return Err(self.already(state.lifecycle));
            }
            self.set_lifecycle(&mut state, Lifecycle::PendingDestroy);
            state.on_delete.take()
        };
        if let Some(on_delete) = on_delete {
            on_delete(self);
        }
        Ok(())
    }

    /// Terminal transition performed by the emission manager.
    pub(crate) fn mark_freed(&self) {
        let mut state = self.state.write();
        self.set_lifecycle(&mut state, Lifecycle::Freed);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("event_type", &self.event_type)
            .field("filter", &self.filter)
            .field("callback", &self.callback)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Subscription`].
#[must_use]
pub struct SubscriptionBuilder {
    addr: Addr,
    event_type: EventType,
    callback: EventCallback,
    filter: ElementType,
    data: Option<Arc<dyn Any + Send + Sync>>,
    on_delete: Option<Box<DeleteFn>>,
}

impl SubscriptionBuilder {
    /// Only deliver events whose connector type contains every bit of `filter`.
    pub const fn filter(mut self, filter: ElementType) -> Self {
        self.filter = filter;
        self
    }

    /// Attaches user data retrievable with [`Subscription::data`].
    pub fn data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    /// Runs `f` once when the subscription is destroyed or its element erased.
    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Subscription) + Send + Sync + 'static,
    {
        self.on_delete = Some(Box::new(f));
        self
    }

    /// Subscribed address.
    #[must_use]
    pub const fn addr(&self) -> Addr {
        self.addr
    }

    /// Finishes the subscription in the `Active` state.
    pub fn build(self) -> Arc<Subscription> {
        Arc::new(Subscription {
            id: SubscriptionId::new(),
            addr: self.addr,
            event_type: self.event_type,
            filter: self.filter,
            data: self.data,
            callback: self.callback,
            state: Monitor::new(SubscriptionState {
                lifecycle: Lifecycle::Active,
                on_delete: self.on_delete,
            }),
            lifecycle: AtomicU8::new(Lifecycle::Active as u8),
            destroy_requested: AtomicBool::new(false),
            created_at: Utc::now(),
            dispatched: AtomicU64::new(0),
        })
    }
}
