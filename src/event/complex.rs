//! Subscriptions that fire once a set of conditions has been met.
//!
//! A [`ComplexSubscription`] owns one ordinary member [`Subscription`] per
//! condition. Each member records the first event it receives in the
//! current round and ignores repeats. Once every member has recorded an
//! event the round is complete: the recorded events are handed to the
//! callback in condition order and a new round begins.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

use crate::addr::Addr;
use crate::error::{GraphError, GraphResult};
use crate::event::subscription::{EventCallback, Lifecycle, Subscription};
use crate::event::types::{EventArgs, EventType, SubscriptionId};
use crate::types::ElementType;

/// Callback receiving one event per condition, in condition order.
pub type ComplexFn = dyn Fn(&ComplexSubscription, &[EventArgs]) -> GraphResult<()> + Send + Sync;

/// One condition of a complex subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition {
    /// Watched element.
    pub addr: Addr,
    /// Awaited event.
    pub event_type: EventType,
    /// Connector-type filter; empty accepts every type.
    pub filter: ElementType,
}

impl Condition {
    /// A condition accepting every connector type.
    #[must_use]
    pub const fn new(addr: Addr, event_type: EventType) -> Self {
        Self {
            addr,
            event_type,
            filter: ElementType::UNKNOWN,
        }
    }

    /// Narrows the condition to connectors of type `filter`.
    #[must_use]
    pub const fn filter(mut self, filter: ElementType) -> Self {
        self.filter = filter;
        self
    }
}

/// A subscription over several conditions, notified when all of them hold.
pub struct ComplexSubscription {
    id: SubscriptionId,
    members: Vec<Arc<Subscription>>,
    round: Mutex<Vec<Option<EventArgs>>>,
    callback: Arc<ComplexFn>,
    activations: AtomicU64,
}

impl ComplexSubscription {
    /// Builds the subscription and its members. Nothing is registered yet.
    pub fn new<F>(conditions: &[Condition], callback: F) -> GraphResult<Arc<Self>>
    where
        F: Fn(&ComplexSubscription, &[EventArgs]) -> GraphResult<()> + Send + Sync + 'static,
    {
        if conditions.is_empty() {
            return Err(GraphError::invalid_params("complex subscription needs a condition"));
        }
        if let Some(c) = conditions.iter().find(|c| c.addr.is_empty()) {
            return Err(GraphError::AddrIsNotValid { addr: c.addr });
        }
        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let members = conditions
                .iter()
                .enumerate()
                .map(|(slot, c)| {
                    let owner = Weak::clone(weak);
                    let callback = EventCallback::event(move |_, args| match owner.upgrade() {
                        Some(owner) => owner.record(slot, *args),
                        None => Ok(()),
                    });
                    Subscription::builder(c.addr, c.event_type, callback)
                        .filter(c.filter)
                        .build()
                })
                .collect();
            Self {
                id: SubscriptionId::new(),
                members,
                round: Mutex::new(vec![None; conditions.len()]),
                callback: Arc::new(callback),
                activations: AtomicU64::new(0),
            }
        }))
    }

    fn record(&self, slot: usize, args: EventArgs) -> GraphResult<()> {
        let completed = {
            // Slots hold plain values.
            let mut round = self.round.lock().unwrap_or_else(PoisonError::into_inner);
            if round[slot].is_some() {
                return Ok(());
            }
            round[slot] = Some(args);
            if round.iter().any(Option::is_none) {
                return Ok(());
            }
            round.iter_mut().filter_map(Option::take).collect::<Vec<_>>()
        };
        self.activations.fetch_add(1, Ordering::Relaxed);
        debug!(id = %self.id, conditions = completed.len(), "complex subscription activated");
        (self.callback)(self, &completed)
    }

    /// Subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Member subscriptions, one per condition.
    #[must_use]
    pub fn members(&self) -> &[Arc<Subscription>] {
        &self.members
    }

    /// Number of completed rounds.
    #[must_use]
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Conditions met in the current round.
    #[must_use]
    pub fn pending(&self) -> usize {
        let round = self.round.lock().unwrap_or_else(PoisonError::into_inner);
        round.iter().filter(|slot| slot.is_some()).count()
    }

    /// `Active` while every member is, `Freed` once every member is,
    /// `PendingDestroy` otherwise.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        let states: Vec<Lifecycle> = self.members.iter().map(|m| m.lifecycle()).collect();
        if states.iter().all(|l| *l == Lifecycle::Active) {
            Lifecycle::Active
        } else if states.iter().all(|l| *l == Lifecycle::Freed) {
            Lifecycle::Freed
        } else {
            Lifecycle::PendingDestroy
        }
    }

    /// True while every condition can still be met.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }
}

impl fmt::Debug for ComplexSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplexSubscription")
            .field("id", &self.id)
            .field("members", &self.members.len())
            .field("activations", &self.activations())
            .finish_non_exhaustive()
    }
}
