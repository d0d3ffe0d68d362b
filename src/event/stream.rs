use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::addr::Addr;
use crate::error::{GraphError, GraphResult};
use crate::event::emission::EmissionManager;
use crate::event::registry::RegistrationManager;
use crate::event::subscription::{EventCallback, Subscription};
use crate::event::types::{EventArgs, EventType, SubscriptionId};
use crate::types::ElementType;

/// A subscription that forwards its events into a channel.
///
/// Dropping this stream attempts best-effort unregistration.
#[derive(Debug)]
pub struct EventStream {
    sub: Arc<Subscription>,
    rx: Receiver<EventArgs>,
    registry: Weak<RegistrationManager>,
    emission: Weak<EmissionManager>,
    unregistered: AtomicBool,
}

impl EventStream {
    /// Registers a forwarding subscription on `addr`.
    ///
    /// Events arriving while `capacity` events are buffered fail their
    /// callback and are counted as failed by the emission manager.
    pub(crate) fn open(
        registry: &Arc<RegistrationManager>,
        emission: &Arc<EmissionManager>,
        addr: Addr,
        event_type: EventType,
        filter: ElementType,
        capacity: usize,
    ) -> GraphResult<Self> {
        let (tx, rx) = bounded::<EventArgs>(capacity.max(1));
        let sub = Subscription::builder(addr, event_type, forward(tx))
            .filter(filter)
            .build();
        registry.register(Arc::clone(&sub))?;
        Ok(Self {
            sub,
            rx,
            registry: Arc::downgrade(registry),
            emission: Arc::downgrade(emission),
            unregistered: AtomicBool::new(false),
        })
    }

    /// The subscription id backing this stream.
    #[must_use]
    pub fn subscription_id(&self) -> SubscriptionId {
        self.sub.id()
    }

    /// The subscription backing this stream.
    #[must_use]
    pub const fn subscription(&self) -> &Arc<Subscription> {
        &self.sub
    }

    /// Best-effort explicit unregistration. Idempotent.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(registry), Some(emission)) = (self.registry.upgrade(), self.emission.upgrade()) {
            // The element may already be erased, which detached it.
            let _ = registry.destroy(&self.sub, &emission);
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> GraphResult<EventArgs> {
        self.rx.recv().map_err(|_| GraphError::invalid_state("event stream disconnected"))
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> GraphResult<EventArgs> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => GraphError::NoResult,
            RecvTimeoutError::Disconnected => GraphError::invalid_state("event stream disconnected"),
        })
    }

    /// Next buffered event, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<EventArgs> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn forward(tx: Sender<EventArgs>) -> EventCallback {
    EventCallback::event(move |_, args| match tx.try_send(*args) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => Ok(()),
        Err(TrySendError::Full(_)) => Err(GraphError::failed("event stream buffer is full")),
    })
}
