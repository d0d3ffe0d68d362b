//! Address → subscriptions table.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::addr::Addr;
use crate::error::{GraphError, GraphResult};
use crate::event::emission::EmissionManager;
use crate::event::subscription::Subscription;
use crate::event::types::{EventArgs, EventType, SubscriptionId};
use crate::sync::Monitor;

type Table = HashMap<Addr, Vec<Arc<Subscription>>>;

/// Keeps every live subscription under the address it watches.
///
/// Lists preserve registration order, which is the order events for one
/// mutation are handed to the emission queue. `None` marks a torn-down
/// manager.
#[derive(Debug)]
pub struct RegistrationManager {
    table: Monitor<Option<Table>>,
}

impl Default for RegistrationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Monitor::new(Some(HashMap::new())),
        }
    }

    fn torn_down() -> GraphError {
        GraphError::invalid_state("event registry is shut down")
    }

    /// Appends `sub` to the list of its address.
    pub fn register(&self, sub: Arc<Subscription>) -> GraphResult<()> {
        if !sub.is_active() {
            return Err(GraphError::invalid_state(format!(
                "subscription {} is not active",
                sub.id()
            )));
        }
        let mut table = self.table.write();
        let table = table.as_mut().ok_or_else(Self::torn_down)?;
        debug!(id = %sub.id(), addr = %sub.addr(), event = %sub.event_type(), "registered subscription");
        table.entry(sub.addr()).or_default().push(sub);
        Ok(())
    }

    /// Removes `sub`; drops the address key once its list is empty.
    pub fn unregister(&self, sub: &Subscription) -> GraphResult<Arc<Subscription>> {
        let mut table = self.table.write();
        let table = table.as_mut().ok_or_else(Self::torn_down)?;
        let not_registered = || GraphError::invalid_state(format!("subscription {} is not registered", sub.id()));

        let list = table.get_mut(&sub.addr()).ok_or_else(not_registered)?;
        let idx = list
            .iter()
            .position(|s| s.id() == sub.id())
            .ok_or_else(not_registered)?;
        let removed = list.remove(idx);
        if list.is_empty() {
            table.remove(&sub.addr());
        }
        Ok(removed)
    }

    /// Subscriptions on `addr` for `event_type`, in registration order.
    #[must_use]
    pub fn lookup(&self, addr: Addr, event_type: EventType) -> Vec<Arc<Subscription>> {
        self.table
            .read()
            .as_ref()
            .and_then(|t| t.get(&addr))
            .map(|list| {
                list.iter()
                    .filter(|s| s.event_type() == event_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Subscriptions accepting `args`, in registration order.
    #[must_use]
    pub fn matching(&self, args: &EventArgs) -> Vec<Arc<Subscription>> {
        self.table
            .read()
            .as_ref()
            .and_then(|t| t.get(&args.element))
            .map(|list| list.iter().filter(|s| s.accepts(args)).cloned().collect())
            .unwrap_or_default()
    }

    /// True if anything is registered on `addr`.
    #[must_use]
    pub fn has_subscriptions(&self, addr: Addr) -> bool {
        self.table
            .read()
            .as_ref()
            .is_some_and(|t| t.contains_key(&addr))
    }

    /// Finds a registered subscription by id.
    #[must_use]
    pub fn find(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.table
            .read()
            .as_ref()?
            .values()
            .flatten()
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table
            .read()
            .as_ref()
            .map_or(0, |t| t.values().map(Vec::len).sum())
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregisters and destroys `sub`; its memory is reclaimed by `emission`
    /// once no callback holds it.
    pub fn destroy(&self, sub: &Subscription, emission: &EmissionManager) -> GraphResult<()> {
        let owned = self.unregister(sub)?;
        owned.mark_for_destroy()?;
        debug!(id = %owned.id(), "subscription marked for destroy");
        emission.defer_free(owned);
        Ok(())
    }

    /// Detaches every subscription watching `addr`, runs their delete
    /// callbacks and hands them to `emission` for deferred release.
    ///
    /// Returns the number of subscriptions detached.
    pub fn notify_element_deleted(&self, addr: Addr, emission: &EmissionManager) -> usize {
        let detached = {
            let mut table = self.table.write();
            table.as_mut().and_then(|t| t.remove(&addr)).unwrap_or_default()
        };
        let count = detached.len();
        for sub in detached {
            // Already-marked subscriptions are only queued for release.
            let _ = sub.mark_for_destroy();
            emission.defer_free(sub);
        }
        if count > 0 {
            debug!(%addr, count, "detached subscriptions of deleted element");
        }
        count
    }

    /// Tears the registry down and returns what was still registered.
    pub fn shutdown(&self) -> Vec<Arc<Subscription>> {
        self.table
            .write()
            .take()
            .map(|t| t.into_values().flatten().collect())
            .unwrap_or_default()
    }

    /// True after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.table.read().is_none()
    }
}
