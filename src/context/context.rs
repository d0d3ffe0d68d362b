//! Per-actor session handles.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::context::permissions::Permissions;
use crate::event::{Continuation, EventArgs};
use crate::sync::Monitor;

/// Identifier of a live context. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(u32);

impl ContextId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Events of one mutation held back while the context is pending.
pub struct PendingEmission {
    /// Events in emission order.
    pub events: Vec<EventArgs>,
    /// Work to run once the events have been delivered.
    pub then: Option<Continuation>,
}

impl fmt::Debug for PendingEmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEmission")
            .field("events", &self.events)
            .field("then", &self.then.is_some())
            .finish()
    }
}

/// What the context decided about an emission.
#[derive(Debug)]
pub(crate) enum Intercept {
    /// Blocking: the events are discarded; the payload is handed back.
    Dropped(PendingEmission),
    /// Pending: queued until `pending_end`.
    Queued,
    /// Deliver now.
    Pass(PendingEmission),
}

#[derive(Debug, Default)]
struct ContextState {
    pending: bool,
    blocking: bool,
    global: Permissions,
    local: HashMap<Addr, Permissions>,
    queue: VecDeque<PendingEmission>,
    ref_count: u32,
}

/// A logical actor's session: its rights and its event mode.
#[derive(Debug)]
pub struct MemoryContext {
    id: ContextId,
    actor: Addr,
    system: bool,
    state: Monitor<ContextState>,
    created_at: DateTime<Utc>,
}

impl MemoryContext {
    pub(crate) fn new(
        id: ContextId,
        actor: Addr,
        system: bool,
        global: Permissions,
        local: HashMap<Addr, Permissions>,
    ) -> Self {
        Self {
            id,
            actor,
            system,
            state: Monitor::new(ContextState {
                global,
                local,
                ref_count: 1,
                ..ContextState::default()
            }),
            created_at: Utc::now(),
        }
    }

    /// Context id.
    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    /// The actor this context acts for; empty for the system context.
    #[must_use]
    pub const fn actor(&self) -> Addr {
        self.actor
    }

    /// True for the system context, which bypasses permission checks.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        self.system
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Rights across the whole graph.
    #[must_use]
    pub fn global_permissions(&self) -> Permissions {
        self.state.read().global
    }

    /// Rights inside `structure`, if any were granted.
    #[must_use]
    pub fn local_permissions(&self, structure: Addr) -> Option<Permissions> {
        self.state.read().local.get(&structure).copied()
    }

    /// True if no structure-scoped rights were ever granted.
    #[must_use]
    pub fn has_no_local_permissions(&self) -> bool {
        self.state.read().local.is_empty()
    }

    /// True while events are held back.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.read().pending
    }

    /// True while events are discarded.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.state.read().blocking
    }

    /// Number of held-back emissions.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.read().queue.len()
    }

    /// Outstanding handles.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.state.read().ref_count
    }

    pub(crate) fn grant_global(&self, permissions: Permissions) {
        self.state.write().global.insert(permissions);
    }

    pub(crate) fn revoke_global(&self, permissions: Permissions) {
        self.state.write().global.remove(permissions);
    }

    pub(crate) fn grant_local(&self, structure: Addr, permissions: Permissions) {
        self.state
            .write()
            .local
            .entry(structure)
            .or_default()
            .insert(permissions);
    }

    pub(crate) fn revoke_local(&self, structure: Addr, permissions: Permissions) {
        if let Some(held) = self.state.write().local.get_mut(&structure) {
            held.remove(permissions);
        }
    }

    pub(crate) fn acquire(&self) -> u32 {
        let mut state = self.state.write();
        state.ref_count += 1;
        state.ref_count
    }

    pub(crate) fn release(&self) -> u32 {
        let mut state = self.state.write();
        state.ref_count = state.ref_count.saturating_sub(1);
        state.ref_count
    }

    pub(crate) fn pending_begin(&self) {
        self.state.write().pending = true;
    }

    /// Replays held-back emissions in FIFO order and clears the flag, all
    /// under the context's write lock. Continuations `replay` hands back are
    /// returned for the caller to run after the lock is gone.
    pub(crate) fn pending_end<F>(&self, mut replay: F) -> Vec<Continuation>
    where
        F: FnMut(PendingEmission) -> Option<Continuation>,
    {
        let mut state = self.state.write();
        let mut unclaimed = Vec::new();
        while let Some(emission) = state.queue.pop_front() {
            if let Some(then) = replay(emission) {
                unclaimed.push(then);
            }
        }
        state.pending = false;
        unclaimed
    }

    pub(crate) fn blocking_begin(&self) {
        self.state.write().blocking = true;
    }

    pub(crate) fn blocking_end(&self) {
        self.state.write().blocking = false;
    }

    /// Decides, atomically with the mode flags, what happens to `emission`.
    pub(crate) fn intercept(&self, emission: PendingEmission) -> Intercept {
        let mut state = self.state.write();
        if state.blocking {
            return Intercept::Dropped(emission);
        }
        if state.pending {
            state.queue.push_back(emission);
            return Intercept::Queued;
        }
        Intercept::Pass(emission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use std::sync::Arc;

    fn ctx() -> MemoryContext {
        MemoryContext::new(ContextId::new(3), Addr::new(1, 1), false, Permissions::NONE, HashMap::new())
    }

    #[test]
    fn test_context_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MemoryContext>();
        assert_send_sync::<Arc<MemoryContext>>();

        let ctx = Arc::new(ctx());
        ctx.pending_begin();
        let held = PendingEmission {
            events: vec![EventArgs::new(EventType::BeforeEraseElement, Addr::new(1, 2))],
            then: Some(Box::new(|| Ok(()))),
        };
        assert!(matches!(ctx.intercept(held), Intercept::Queued));
        let remote = Arc::clone(&ctx);
        let queued = std::thread::spawn(move || remote.pending_len()).join().unwrap();
        assert_eq!(queued, 1);
    }

    fn emission(n: u16) -> PendingEmission {
        PendingEmission {
            events: vec![EventArgs::new(EventType::AfterGenerateConnector, Addr::new(1, n))],
            then: None,
        }
    }

    #[test]
    fn test_blocking_drops_before_pending_queues() {
        let ctx = ctx();
        ctx.pending_begin();
        ctx.blocking_begin();
        assert!(matches!(ctx.intercept(emission(1)), Intercept::Dropped(_)));
        assert_eq!(ctx.pending_len(), 0);

        ctx.blocking_end();
        assert!(matches!(ctx.intercept(emission(2)), Intercept::Queued));
        assert_eq!(ctx.pending_len(), 1);
    }

    #[test]
    fn test_pending_end_replays_in_order() {
        let ctx = ctx();
        ctx.pending_begin();
        for n in 1..=3 {
            assert!(matches!(ctx.intercept(emission(n)), Intercept::Queued));
        }
        let mut seen = Vec::new();
        let left = ctx.pending_end(|p| {
            seen.push(p.events[0].element.offset);
            None
        });
        assert!(left.is_empty());
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(!ctx.is_pending());
        assert!(matches!(ctx.intercept(emission(4)), Intercept::Pass(_)));
    }

    #[test]
    fn test_permission_updates() {
        let ctx = ctx();
        let s = Addr::new(2, 2);
        ctx.grant_global(Permissions::READ | Permissions::WRITE);
        ctx.revoke_global(Permissions::WRITE);
        assert_eq!(ctx.global_permissions(), Permissions::READ);

        assert!(ctx.has_no_local_permissions());
        ctx.grant_local(s, Permissions::ERASE);
        assert_eq!(ctx.local_permissions(s), Some(Permissions::ERASE));
        ctx.revoke_local(s, Permissions::ERASE);
        assert_eq!(ctx.local_permissions(s), Some(Permissions::NONE));
    }

    #[test]
    fn test_ref_counting() {
        let ctx = ctx();
        assert_eq!(ctx.acquire(), 2);
        assert_eq!(ctx.release(), 1);
        assert_eq!(ctx.release(), 0);
        assert_eq!(ctx.release(), 0);
    }
}
