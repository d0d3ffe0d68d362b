//! Erase path.
//!
//! Erasing an element first announces the erasure of it and of every
//! connector reachable through incidence lists. An element whose before-erase
//! events reached a subscriber (or were held back by a pending context) is
//! left in place; the event batch carries a continuation that re-runs the
//! erase once the subscribers have returned. Everything else is released
//! immediately, connectors before the elements they hang on.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::addr::Addr;
use crate::context::MemoryContext;
use crate::engine::GraphEngine;
use crate::error::{GraphError, GraphResult};
use crate::event::{Continuation, EventArgs, EventType};
use crate::storage::{Element, ElementState};
use crate::sync::LockMode;

impl GraphEngine {
    /// Erases `root` and every connector attached to it, directly or through
    /// other connectors.
    pub fn erase(&self, ctx: &Arc<MemoryContext>, root: Addr) -> GraphResult<()> {
        self.store.resolve(root)?;

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root]);
        let mut order = Vec::new();
        let mut doomed = HashSet::new();

        while let Some(cur) = queue.pop_front() {
            if !seen.insert(cur) {
                continue;
            }
            let Ok(el) = self.store.resolve(cur) else {
                continue;
            };
            if el.state.contains(ElementState::ERASABLE) {
                if self.awaiting().contains(&cur) {
                    continue;
                }
            } else if self.announce(ctx, root, cur, &el)? {
                continue;
            }

            doomed.insert(cur);
            order.push(cur);
            queue.extend(self.store.outgoing(cur).unwrap_or_default());
            queue.extend(self.store.incoming(cur).unwrap_or_default());
        }

        // An element still carrying a connector that waits on its
        // subscribers must outlive it.
        loop {
            let blocked: Vec<Addr> = doomed
                .iter()
                .copied()
                .filter(|addr| self.has_surviving_connector(*addr, &doomed))
                .collect();
            if blocked.is_empty() {
                break;
            }
            for addr in blocked {
                doomed.remove(&addr);
            }
        }

        for addr in order.into_iter().rev().filter(|a| doomed.contains(a)) {
            // A continuation running on a worker may have got there first.
            match self.erase_element(addr) {
                Ok(()) | Err(GraphError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Marks `cur` erasable and emits its before-erase events. Returns true
    /// if the erase of `cur` was handed to the continuation.
    fn announce(&self, ctx: &Arc<MemoryContext>, root: Addr, cur: Addr, el: &Element) -> GraphResult<bool> {
        {
            let _guard = self.store.lock(cur, LockMode::Write);
            if self
                .store
                .update(cur, |el| el.state.insert(ElementState::ERASABLE))
                .is_err()
            {
                return Ok(false);
            }
        }

        self.awaiting().insert(cur);
        let then = self.erase_continuation(ctx, root, cur);
        let left = self.emit(ctx, erase_events(cur, el), Some(then))?;
        if left.is_some() {
            self.awaiting().remove(&cur);
            return Ok(false);
        }
        debug!(addr = %cur, "erase deferred until subscribers return");
        Ok(true)
    }

    fn erase_continuation(&self, ctx: &Arc<MemoryContext>, root: Addr, cur: Addr) -> Continuation {
        let engine = self.self_ref.clone();
        let ctx = Arc::clone(ctx);
        Box::new(move || {
            let Some(engine) = engine.upgrade() else {
                return Ok(());
            };
            engine.awaiting().remove(&cur);
            for target in [root, cur] {
                match engine.erase(&ctx, target) {
                    Ok(()) | Err(GraphError::NotFound { .. } | GraphError::AddrIsNotValid { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }

    fn has_surviving_connector(&self, addr: Addr, doomed: &HashSet<Addr>) -> bool {
        let incident = self
            .store
            .outgoing(addr)
            .unwrap_or_default()
            .into_iter()
            .chain(self.store.incoming(addr).unwrap_or_default());
        incident
            .filter(|conn| !doomed.contains(conn))
            .any(|conn| self.store.resolve(conn).is_ok())
    }

    /// Physically erases one element.
    ///
    /// Connectors linked to it after the walk are erased with it.
    pub(crate) fn erase_element(&self, addr: Addr) -> GraphResult<()> {
        let el = {
            let _guard = self.store.lock(addr, LockMode::Write);
            let el = self.store.resolve_raw(addr)?;
            if el.state.contains(ElementState::REQUEST_ERASURE) {
                return Ok(());
            }
            self.store
                .update(addr, |el| el.state.insert(ElementState::REQUEST_ERASURE))?;
            el
        };

        let stragglers: Vec<Addr> = self
            .store
            .outgoing(addr)?
            .into_iter()
            .chain(self.store.incoming(addr)?)
            .filter(|conn| *conn != addr)
            .collect();
        for conn in stragglers {
            match self.erase_element(conn) {
                Ok(()) | Err(GraphError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if el.ty.is_connector() {
            self.store.unlink_connector(addr)?;
        }
        if el.ty.is_link() {
            self.contents.remove(addr)?;
        }
        self.registry.notify_element_deleted(addr, &self.emission);
        self.awaiting().remove(&addr);

        let _guard = self.store.lock(addr, LockMode::Write);
        self.store.unref_locked(addr)?;
        debug!(%addr, ty = %el.ty, "erased element");
        Ok(())
    }
}

/// Before-erase events of one element: the connector events on both
/// endpoints, the directional events, then the element event itself.
fn erase_events(addr: Addr, el: &Element) -> Vec<EventArgs> {
    let mut events = Vec::with_capacity(5);
    if let Some(info) = el.connector_info() {
        let on = |event_type, element, other| {
            EventArgs::new(event_type, element)
                .connector(addr, info.ty)
                .other(other)
        };
        events.push(on(EventType::BeforeEraseConnector, info.begin, info.end));
        if info.begin != info.end {
            events.push(on(EventType::BeforeEraseConnector, info.end, info.begin));
        }
        if info.ty.is_edge() {
            events.push(on(EventType::BeforeEraseEdge, info.begin, info.end));
            if info.begin != info.end {
                events.push(on(EventType::BeforeEraseEdge, info.end, info.begin));
            }
        } else {
            events.push(on(EventType::BeforeEraseOutgoingArc, info.begin, info.end));
            events.push(on(EventType::BeforeEraseIncomingArc, info.end, info.begin));
        }
    }
    events.push(EventArgs::new(EventType::BeforeEraseElement, addr).connector(Addr::EMPTY, el.ty));
    events
}
