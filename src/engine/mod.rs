//! Mutation paths coupling the store, the subscription registry and the
//! emission workers.
//!
//! The engine performs no permission checks; [`crate::Memory`] gates every
//! call before it reaches this layer. Every mutation that emits events is
//! given the acting context so pending and blocking modes apply.

mod erase;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::addr::Addr;
use crate::config::MemoryConfig;
use crate::context::{Intercept, MemoryContext, PendingEmission, Permissions};
use crate::error::{GraphError, GraphResult};
use crate::event::{Continuation, EmissionManager, EventArgs, EventType, RegistrationManager, Subscription};
use crate::storage::snapshot::Snapshot;
use crate::storage::{ConnectorInfo, Element, ElementState, LinkContentStore, SegmentStore, Stats};
use crate::sync::LockMode;
use crate::types::ElementType;

/// Graph engine shared by the facade, the permission handlers and the
/// continuations run on event workers.
#[derive(Debug)]
pub struct GraphEngine {
    store: Arc<SegmentStore>,
    contents: LinkContentStore,
    registry: Arc<RegistrationManager>,
    emission: Arc<EmissionManager>,
    /// Elements whose before-erase events are still being delivered.
    awaiting: Mutex<HashSet<Addr>>,
    self_ref: Weak<Self>,
}

impl GraphEngine {
    /// Creates an empty store and starts the event workers.
    pub fn start(config: &MemoryConfig) -> GraphResult<Arc<Self>> {
        let store = Arc::new(SegmentStore::new(config));
        let emission = Arc::new(EmissionManager::start(config.event_workers(), Arc::clone(&store))?);
        info!(
            max_segments = config.max_segments,
            segment_capacity = store.segment_capacity(),
            workers = emission.worker_count(),
            "graph engine started"
        );
        Ok(Arc::new_cyclic(|me| Self {
            store,
            contents: LinkContentStore::new(config.max_searchable_content),
            registry: Arc::new(RegistrationManager::new()),
            emission,
            awaiting: Mutex::new(HashSet::new()),
            self_ref: me.clone(),
        }))
    }

    /// The element store.
    #[must_use]
    pub const fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// The subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<RegistrationManager> {
        &self.registry
    }

    /// The emission workers.
    #[must_use]
    pub const fn emission(&self) -> &Arc<EmissionManager> {
        &self.emission
    }

    // Holds plain addresses only.
    fn awaiting(&self) -> MutexGuard<'_, HashSet<Addr>> {
        self.awaiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Creates a node. `ty` may carry node subtypes and constancy bits.
    pub fn node_new(&self, ty: ElementType) -> GraphResult<Addr> {
        if ty.has_any(ElementType::LINK | ElementType::CONNECTOR_MASK) {
            return Err(GraphError::invalid_type(ty.bits(), "node type expected"));
        }
        self.append_typed(ty | ElementType::NODE)
    }

    /// Creates a link with no content.
    pub fn link_new(&self, ty: ElementType) -> GraphResult<Addr> {
        if ty.has_any(ElementType::NODE | ElementType::CONNECTOR_MASK) {
            return Err(GraphError::invalid_type(ty.bits(), "link type expected"));
        }
        self.append_typed(ty | ElementType::LINK)
    }

    fn append_typed(&self, ty: ElementType) -> GraphResult<Addr> {
        let (addr, guard) = self.store.append()?;
        self.store.update(addr, |el| el.ty = ty)?;
        drop(guard);
        Ok(addr)
    }

    /// Creates a connector from `begin` to `end` and announces it on both
    /// endpoints.
    ///
    /// Both endpoints are validated before anything is allocated.
    pub fn connector_new(&self, ctx: &MemoryContext, ty: ElementType, begin: Addr, end: Addr) -> GraphResult<Addr> {
        if !ty.is_connector() {
            return Err(GraphError::invalid_type(ty.bits(), "connector type expected"));
        }
        for endpoint in [begin, end] {
            if endpoint.is_empty() {
                return Err(GraphError::AddrIsNotValid { addr: endpoint });
            }
            self.store.resolve(endpoint)?;
        }

        let (addr, guard) = self.store.append()?;
        self.store.update(addr, |el| {
            el.ty = ty;
            el.begin = begin;
            el.end = end;
        })?;
        drop(guard);
        if let Err(e) = self.store.link_connector(addr) {
            // An endpoint was erased between validation and linking.
            self.store.unref(addr)?;
            return Err(e);
        }

        self.emit(ctx, creation_events(addr, ty, begin, end), None)?;
        Ok(addr)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// True if `addr` refers to a live element.
    #[must_use]
    pub fn is_element(&self, addr: Addr) -> bool {
        self.store.resolve(addr).is_ok()
    }

    /// Copy of a live element.
    pub fn resolve(&self, addr: Addr) -> GraphResult<Element> {
        let _guard = self.store.lock(addr, LockMode::Read);
        self.store.resolve(addr)
    }

    /// Type of a live element.
    pub fn element_type(&self, addr: Addr) -> GraphResult<ElementType> {
        self.resolve(addr).map(|el| el.ty)
    }

    /// Type and endpoints of a connector.
    pub fn connector_info(&self, addr: Addr) -> GraphResult<ConnectorInfo> {
        self.resolve(addr)?
            .connector_info()
            .ok_or(GraphError::ElementIsNotConnector { addr })
    }

    /// Connectors leaving `addr`, most recent first.
    pub fn outgoing(&self, addr: Addr) -> GraphResult<Vec<Addr>> {
        self.store.resolve(addr)?;
        self.store.outgoing(addr)
    }

    /// Connectors entering `addr`, most recent first.
    pub fn incoming(&self, addr: Addr) -> GraphResult<Vec<Addr>> {
        self.store.resolve(addr)?;
        self.store.incoming(addr)
    }

    /// Number of connectors leaving `addr`.
    pub fn outgoing_count(&self, addr: Addr) -> GraphResult<u32> {
        self.resolve(addr).map(|el| el.out_count)
    }

    /// Number of connectors entering `addr`.
    pub fn incoming_count(&self, addr: Addr) -> GraphResult<u32> {
        self.resolve(addr).map(|el| el.in_count)
    }

    /// Retypes an element within its class.
    pub fn change_subtype(&self, addr: Addr, ty: ElementType) -> GraphResult<()> {
        let _guard = self.store.lock(addr, LockMode::Write);
        let el = self.store.resolve(addr)?;
        if !el.ty.is_extendable_to(ty) {
            return Err(GraphError::invalid_type(
                ty.bits(),
                format!("{} cannot become {ty}", el.ty),
            ));
        }
        self.store.update(addr, |el| el.ty = ty)
    }

    /// True if `addr` is being erased or already gone.
    #[must_use]
    pub fn is_being_erased(&self, addr: Addr) -> bool {
        self.store.resolve_raw(addr).map_or(true, |el| {
            el.state.contains(ElementState::ERASABLE) || el.state.contains(ElementState::REQUEST_ERASURE)
        })
    }

    /// Live element counts.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.store.stats()
    }

    // ------------------------------------------------------------------
    // Access levels
    // ------------------------------------------------------------------

    /// Access level stored on `addr`.
    pub fn element_permissions(&self, addr: Addr) -> GraphResult<Permissions> {
        self.resolve(addr).map(|el| el.permissions)
    }

    /// Adds bits to the access level of `addr`.
    pub fn add_element_permissions(&self, addr: Addr, permissions: Permissions) -> GraphResult<()> {
        let _guard = self.store.lock(addr, LockMode::Write);
        self.store.resolve(addr)?;
        self.store.update(addr, |el| el.permissions.insert(permissions))
    }

    /// Structures scoping local rights that contain `addr`: begins of
    /// positive constant arcs into `addr` marked as permitted structures.
    pub fn permitted_structures(&self, addr: Addr) -> GraphResult<Vec<Addr>> {
        let mut structures = Vec::new();
        for conn in self.store.incoming(addr)? {
            let Ok(arc) = self.store.resolve(conn) else {
                continue;
            };
            if !arc.ty.matches_filter(ElementType::CONST_POS_ARC) {
                continue;
            }
            let permitted = self
                .store
                .resolve(arc.begin)
                .is_ok_and(|s| s.permissions.contains(Permissions::PERMITTED_STRUCTURE));
            if permitted {
                structures.push(arc.begin);
            }
        }
        Ok(structures)
    }

    // ------------------------------------------------------------------
    // Link content
    // ------------------------------------------------------------------

    fn check_link(&self, addr: Addr) -> GraphResult<Element> {
        let el = self.resolve(addr)?;
        if el.ty.is_link() {
            Ok(el)
        } else {
            Err(GraphError::ElementIsNotLink { addr })
        }
    }

    /// Replaces the content of a link, announcing the change first.
    pub fn set_link_content(&self, ctx: &MemoryContext, addr: Addr, bytes: Vec<u8>) -> GraphResult<()> {
        let el = self.check_link(addr)?;
        let event = EventArgs::new(EventType::BeforeChangeLinkContent, addr).connector(Addr::EMPTY, el.ty);
        self.emit(ctx, vec![event], None)?;
        self.contents.set(addr, bytes)
    }

    /// Content of a link; empty if none was set.
    pub fn link_content(&self, addr: Addr) -> GraphResult<Vec<u8>> {
        self.check_link(addr)?;
        Ok(self.contents.get(addr)?.map(|b| b.to_vec()).unwrap_or_default())
    }

    /// Live links whose content equals `bytes`.
    pub fn find_links(&self, bytes: &[u8]) -> GraphResult<Vec<Addr>> {
        Ok(self
            .contents
            .find(bytes)?
            .into_iter()
            .filter(|addr| self.is_element(*addr))
            .collect())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn matching(&self, events: &[EventArgs]) -> Vec<(Arc<Subscription>, EventArgs)> {
        events
            .iter()
            .flat_map(|args| {
                self.registry
                    .matching(args)
                    .into_iter()
                    .map(move |sub| (sub, *args))
            })
            .collect()
    }

    /// Delivers `events` on behalf of `ctx`.
    ///
    /// Nothing is held back when no subscription matches. Otherwise a
    /// blocking context drops the events, a pending context queues them
    /// with `then`, and any other context hands them to the workers, which
    /// run `then` after the last callback. The continuation is returned
    /// when it was not taken by either path.
    pub fn emit(
        &self,
        ctx: &MemoryContext,
        events: Vec<EventArgs>,
        then: Option<Continuation>,
    ) -> GraphResult<Option<Continuation>> {
        let events: Vec<EventArgs> = events.into_iter().map(|e| e.actor(ctx.actor())).collect();
        let work = self.matching(&events);
        if work.is_empty() {
            return Ok(then);
        }
        match ctx.intercept(PendingEmission { events, then }) {
            Intercept::Dropped(emission) => {
                debug!(context = %ctx.id(), count = emission.events.len(), "blocking context dropped events");
                Ok(emission.then)
            }
            Intercept::Queued => Ok(None),
            Intercept::Pass(emission) => {
                let (_, left) = self.emission.submit_batch(work, emission.then)?;
                Ok(left)
            }
        }
    }

    /// Starts holding back events of `ctx`.
    pub fn pending_begin(&self, ctx: &MemoryContext) {
        ctx.pending_begin();
    }

    /// Replays the events held back by `ctx` in emission order and leaves
    /// pending mode.
    ///
    /// Subscriptions are matched again at replay time, so those destroyed
    /// in the meantime receive nothing.
    pub fn pending_end(&self, ctx: &MemoryContext) -> GraphResult<()> {
        let mut failure = None;
        let unclaimed = ctx.pending_end(|emission| {
            let work = self.matching(&emission.events);
            match self.emission.submit_batch(work, emission.then) {
                Ok((_, left)) => left,
                Err(e) => {
                    failure.get_or_insert(e);
                    None
                }
            }
        });
        for then in unclaimed {
            then()?;
        }
        failure.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Copies every live element and link content.
    pub fn snapshot(&self) -> GraphResult<Snapshot> {
        let elements = self.store.live_elements();
        let contents = self
            .contents
            .entries()?
            .into_iter()
            .filter(|(addr, _)| self.is_element(*addr))
            .collect();
        Ok(Snapshot::new(self.store.segment_capacity(), elements, contents))
    }

    /// Loads a snapshot into an empty engine.
    pub fn restore(&self, snapshot: &Snapshot) -> GraphResult<()> {
        if snapshot.segment_capacity != self.store.segment_capacity() {
            return Err(GraphError::invalid_params(format!(
                "snapshot segment capacity {} differs from configured {}",
                snapshot.segment_capacity,
                self.store.segment_capacity()
            )));
        }
        self.store.restore(&snapshot.elements)?;
        for (addr, bytes) in snapshot.decoded_contents()? {
            self.contents.set(addr, bytes)?;
        }
        info!(elements = snapshot.elements.len(), "restored snapshot");
        Ok(())
    }

    /// Stops the workers and releases every subscription.
    pub fn shutdown(&self) {
        self.emission.shutdown();
        let leftover = self.registry.shutdown();
        let count = leftover.len();
        for sub in leftover {
            // Workers are gone, so nothing can still be running it.
            let _ = sub.mark_for_destroy();
            sub.mark_freed();
        }
        if count > 0 {
            debug!(count, "released subscriptions still registered at shutdown");
        }
    }
}

/// Events announcing a new connector: the directional events first, then
/// the connector event, on each distinct endpoint.
fn creation_events(conn: Addr, ty: ElementType, begin: Addr, end: Addr) -> Vec<EventArgs> {
    let on = |event_type, element, other| EventArgs::new(event_type, element).connector(conn, ty).other(other);
    let mut events = Vec::with_capacity(4);
    if ty.is_edge() {
        events.push(on(EventType::AfterGenerateEdge, begin, end));
        if begin != end {
            events.push(on(EventType::AfterGenerateEdge, end, begin));
        }
    } else {
        events.push(on(EventType::AfterGenerateOutgoingArc, begin, end));
        events.push(on(EventType::AfterGenerateIncomingArc, end, begin));
    }
    events.push(on(EventType::AfterGenerateConnector, begin, end));
    if begin != end {
        events.push(on(EventType::AfterGenerateConnector, end, begin));
    }
    events
}
