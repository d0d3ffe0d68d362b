//! Context-gated entry point.
//!
//! Every operation takes the acting [`MemoryContext`] and is checked in the
//! same order: authentication, then data rights on the addresses touched
//! (structure-scoped first, global otherwise), then the permission-data
//! tier when the operation reads, writes or erases guarded elements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::addr::Addr;
use crate::config::MemoryConfig;
use crate::context::handlers;
use crate::context::{ContextManager, IdentifierRegistry, Keynodes, MemoryContext, Permissions};
use crate::engine::GraphEngine;
use crate::error::{GraphError, GraphResult};
use crate::event::{ComplexSubscription, EventArgs, EventStream, EventType, Subscription};
use crate::storage::snapshot::{self, Snapshot};
use crate::storage::{read_stream, ConnectorInfo, ContentStream, MemoryStream, Stats};
use crate::transaction::{Transaction, TransactionManager, TransactionStats, TxnAddr, TxnOp};
use crate::types::ElementType;

/// How long shutdown waits for callbacks still running.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// A running graph memory.
#[derive(Debug)]
pub struct Memory {
    config: MemoryConfig,
    engine: Arc<GraphEngine>,
    contexts: Arc<ContextManager>,
    idtfs: IdentifierRegistry,
    keynodes: Arc<Keynodes>,
    transactions: TransactionManager,
    shut_down: AtomicBool,
}

impl Memory {
    /// Starts the store and the event workers, loads the saved snapshot
    /// unless `clear` is set, resolves the keynodes and installs the
    /// permission handlers.
    pub fn initialize(config: MemoryConfig) -> GraphResult<Self> {
        config.validate()?;
        let engine = GraphEngine::start(&config)?;
        let idtfs = IdentifierRegistry::new()?;

        if let Some(path) = config.snapshot_path().filter(|_| !config.clear) {
            match snapshot::load(&path) {
                Ok(Some(saved)) => {
                    engine.restore(&saved)?;
                    for (idtf, addr) in saved.identifiers.iter().filter(|(_, a)| engine.is_element(*a)) {
                        idtfs.register(idtf, *addr)?;
                    }
                }
                Ok(None) => debug!(path = %path.display(), "no snapshot to load"),
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable snapshot"),
            }
        }

        let keynodes = Arc::new(Keynodes::resolve(&engine, &idtfs)?);
        let contexts = Arc::new(ContextManager::new(config.user_mode));
        let installed = handlers::install(&engine, &contexts, &keynodes)?;
        let transactions = TransactionManager::start(config.transaction_threads, Arc::clone(&engine))?;

        info!(
            user_mode = config.user_mode,
            elements = engine.stats().total(),
            handlers = installed.len(),
            "memory initialized"
        );
        Ok(Self {
            config,
            engine,
            contexts,
            idtfs,
            keynodes,
            transactions,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Configuration this memory was started with.
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The underlying engine, unchecked.
    #[must_use]
    pub const fn engine(&self) -> &Arc<GraphEngine> {
        &self.engine
    }

    /// The context registry.
    #[must_use]
    pub const fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    /// Well-known nodes of the permission model.
    #[must_use]
    pub fn keynodes(&self) -> &Keynodes {
        &self.keynodes
    }

    // ------------------------------------------------------------------
    // Gates
    // ------------------------------------------------------------------

    fn authenticated(&self, ctx: &MemoryContext) -> GraphResult<()> {
        if self.contexts.is_authenticated(ctx) {
            Ok(())
        } else {
            Err(GraphError::ContextIsNotAuthenticated { context: ctx.id() })
        }
    }

    fn require_global(&self, ctx: &MemoryContext, required: Permissions) -> GraphResult<()> {
        if self.contexts.check_global(ctx, required) {
            Ok(())
        } else {
            Err(denied(ctx, required, Addr::EMPTY))
        }
    }

    fn require(&self, ctx: &MemoryContext, required: Permissions, addr: Addr) -> GraphResult<()> {
        if self.contexts.bypasses(ctx) {
            return Ok(());
        }
        let structures = if ctx.has_no_local_permissions() {
            Vec::new()
        } else {
            self.engine.permitted_structures(addr).unwrap_or_default()
        };
        if self.contexts.check_local_and_global(ctx, required, &structures) {
            Ok(())
        } else {
            Err(denied(ctx, required, addr))
        }
    }

    fn require_tier(&self, ctx: &MemoryContext, addr: Addr, tier: Permissions) -> GraphResult<()> {
        if self.contexts.bypasses(ctx) {
            return Ok(());
        }
        let element = self.engine.element_permissions(addr)?;
        if self.contexts.check_tier(ctx, element, tier) {
            Ok(())
        } else {
            Err(tier_denied(ctx, tier, addr))
        }
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    /// The context that bypasses every check.
    #[must_use]
    pub fn system_context(&self) -> Arc<MemoryContext> {
        self.contexts.system_context()
    }

    /// Creates the context of `actor`.
    pub fn context_new(&self, actor: Addr) -> GraphResult<Arc<MemoryContext>> {
        self.contexts.new_context(actor)
    }

    /// Returns the context of `actor`, creating it if needed.
    pub fn context_resolve(&self, actor: Addr) -> GraphResult<Arc<MemoryContext>> {
        self.contexts.resolve(actor)
    }

    /// Releases one reference on `ctx`. Returns true if it was destroyed.
    pub fn context_free(&self, ctx: &MemoryContext) -> GraphResult<bool> {
        self.contexts.free(ctx)
    }

    /// Creates a fresh guest user, marked as such in the graph and
    /// authenticated, and returns its context.
    pub fn guest_context(&self) -> GraphResult<Arc<MemoryContext>> {
        let system = self.system_context();
        let guest = self.engine.node_new(ElementType::CONST_NODE)?;
        let arc = self.engine.connector_new(
            &system,
            ElementType::CONST_TEMP_POS_ARC,
            self.keynodes.concept_guest_user,
            guest,
        )?;
        self.engine.add_element_permissions(arc, Permissions::ALL_PERMISSIONS)?;
        self.contexts.grant_global(guest, Permissions::AUTHENTICATED);
        debug!(%guest, "created guest user");
        self.contexts.new_context(guest)
    }

    /// Holds back events emitted by `ctx` until [`Memory::pending_end`].
    pub fn pending_begin(&self, ctx: &MemoryContext) {
        self.engine.pending_begin(ctx);
    }

    /// Delivers the events held back by `ctx`, in emission order.
    pub fn pending_end(&self, ctx: &MemoryContext) -> GraphResult<()> {
        self.engine.pending_end(ctx)
    }

    /// Discards events emitted by `ctx` until [`Memory::blocking_end`].
    pub fn blocking_begin(&self, ctx: &MemoryContext) {
        ctx.blocking_begin();
    }

    /// Leaves blocking mode. Events discarded meanwhile stay discarded.
    pub fn blocking_end(&self, ctx: &MemoryContext) {
        ctx.blocking_end();
    }

    // ------------------------------------------------------------------
    // Elements
    // ------------------------------------------------------------------

    /// True if `addr` is a live element.
    pub fn is_element(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<bool> {
        self.authenticated(ctx)?;
        self.require_global(ctx, Permissions::READ)?;
        Ok(self.engine.is_element(addr))
    }

    /// Creates a node.
    pub fn node_new(&self, ctx: &MemoryContext, ty: ElementType) -> GraphResult<Addr> {
        self.authenticated(ctx)?;
        self.engine.node_new(ty)
    }

    /// Creates an empty link.
    pub fn link_new(&self, ctx: &MemoryContext, ty: ElementType) -> GraphResult<Addr> {
        self.authenticated(ctx)?;
        self.engine.link_new(ty)
    }

    /// Creates a connector from `begin` to `end`.
    ///
    /// A positive constant arc out of a structure where `ctx` may write
    /// needs nothing more; anything else needs write rights on both
    /// endpoints. Positive temporary arcs also need the write tier on
    /// `begin`.
    pub fn connector_new(&self, ctx: &MemoryContext, ty: ElementType, begin: Addr, end: Addr) -> GraphResult<Addr> {
        self.authenticated(ctx)?;
        self.connector_gate(ctx, ty, Some(begin), Some(end))?;
        self.engine.connector_new(ctx, ty, begin, end)
    }

    /// Rights needed for a connector between the endpoints that already exist.
    fn connector_gate(&self, ctx: &MemoryContext, ty: ElementType, begin: Option<Addr>, end: Option<Addr>) -> GraphResult<()> {
        let into_structure = begin.is_some_and(|begin| self.contexts.has_local(ctx, Permissions::WRITE, begin))
            && ty.matches_filter(ElementType::CONST_POS_ARC);
        if !into_structure {
            for addr in begin.into_iter().chain(end) {
                self.require(ctx, Permissions::WRITE, addr)?;
            }
        }
        match begin {
            Some(begin) if ty.has_subtype(ElementType::CONST_TEMP_POS_ARC) => {
                self.require_tier(ctx, begin, Permissions::WRITE_PERMISSIONS)
            }
            _ => Ok(()),
        }
    }

    /// Erases `addr` and every connector attached to it.
    pub fn erase(&self, ctx: &Arc<MemoryContext>, addr: Addr) -> GraphResult<()> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::ERASE, addr)?;
        self.require_tier(ctx, addr, Permissions::ERASE_PERMISSIONS)?;
        self.engine.erase(ctx, addr)
    }

    /// Type of `addr`.
    pub fn element_type(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<ElementType> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        self.engine.element_type(addr)
    }

    /// Retypes `addr` within its class.
    pub fn change_element_subtype(&self, ctx: &MemoryContext, addr: Addr, ty: ElementType) -> GraphResult<()> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::WRITE, addr)?;
        self.engine.change_subtype(addr, ty)
    }

    /// Type and endpoints of a connector. Both endpoints must be readable.
    pub fn connector_info(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<ConnectorInfo> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        let info = self.engine.connector_info(addr)?;
        self.require(ctx, Permissions::READ, info.begin)?;
        self.require(ctx, Permissions::READ, info.end)?;
        Ok(info)
    }

    /// Begin of a connector.
    pub fn connector_begin(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<Addr> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        let begin = self.engine.connector_info(addr)?.begin;
        self.require(ctx, Permissions::READ, begin)?;
        Ok(begin)
    }

    /// End of a connector.
    pub fn connector_end(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<Addr> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        let end = self.engine.connector_info(addr)?.end;
        self.require(ctx, Permissions::READ, end)?;
        Ok(end)
    }

    /// Connectors leaving `addr`, most recent first.
    pub fn outgoing(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<Vec<Addr>> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        self.engine.outgoing(addr)
    }

    /// Connectors entering `addr`, most recent first.
    pub fn incoming(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<Vec<Addr>> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        self.engine.incoming(addr)
    }

    /// Number of connectors leaving `addr`.
    pub fn outgoing_count(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<u32> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        self.engine.outgoing_count(addr)
    }

    /// Number of connectors entering `addr`.
    pub fn incoming_count(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<u32> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        self.engine.incoming_count(addr)
    }

    // ------------------------------------------------------------------
    // Link content
    // ------------------------------------------------------------------

    /// Replaces the content of a link with the whole of `stream`.
    ///
    /// Overwriting discards the old content, so erase rights are needed as
    /// well as write rights.
    pub fn set_link_content(&self, ctx: &MemoryContext, addr: Addr, stream: &mut dyn ContentStream) -> GraphResult<()> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::ERASE, addr)?;
        self.require(ctx, Permissions::WRITE, addr)?;
        let bytes = read_stream(stream)?;
        self.engine.set_link_content(ctx, addr, bytes)
    }

    /// Content of a link.
    pub fn link_content(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<MemoryStream> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        self.engine.link_content(addr).map(MemoryStream::new)
    }

    /// Links whose content equals `bytes`.
    pub fn find_links_with_content(&self, ctx: &MemoryContext, bytes: &[u8]) -> GraphResult<Vec<Addr>> {
        self.authenticated(ctx)?;
        self.engine.find_links(bytes)
    }

    // ------------------------------------------------------------------
    // Access levels
    // ------------------------------------------------------------------

    /// Access level stored on `addr`.
    pub fn element_permissions(&self, ctx: &MemoryContext, addr: Addr) -> GraphResult<Permissions> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        self.require_tier(ctx, addr, Permissions::READ_PERMISSIONS)?;
        self.engine.element_permissions(addr)
    }

    /// Adds `permissions` to the access level of `addr`.
    pub fn set_element_permissions(&self, ctx: &MemoryContext, addr: Addr, permissions: Permissions) -> GraphResult<()> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::WRITE, addr)?;
        self.require_tier(ctx, addr, Permissions::WRITE_PERMISSIONS)?;
        self.engine.add_element_permissions(addr, permissions)
    }

    // ------------------------------------------------------------------
    // System identifiers
    // ------------------------------------------------------------------

    /// Binds `idtf` to `addr`.
    pub fn set_system_identifier(&self, ctx: &MemoryContext, addr: Addr, idtf: &str) -> GraphResult<()> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::WRITE, addr)?;
        self.engine.resolve(addr)?;
        self.idtfs.register(idtf, addr)
    }

    /// Live element bound to `idtf`.
    #[must_use]
    pub fn resolve_keynode(&self, idtf: &str) -> Option<Addr> {
        self.idtfs.resolve(idtf).filter(|addr| self.engine.is_element(*addr))
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Registers `sub`. The subscribed element must exist and be readable.
    pub fn subscribe(&self, ctx: &MemoryContext, sub: &Arc<Subscription>) -> GraphResult<()> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, sub.addr())?;
        self.engine.resolve(sub.addr())?;
        self.engine.registry().register(Arc::clone(sub))
    }

    /// Destroys `sub`. Its memory is reclaimed once no callback still uses it.
    pub fn unsubscribe(&self, sub: &Subscription) -> GraphResult<()> {
        self.engine.registry().destroy(sub, self.engine.emission())
    }

    /// Registers every member of `complex`. Each watched element must exist
    /// and be readable; nothing is registered when one is not.
    pub fn subscribe_complex(&self, ctx: &MemoryContext, complex: &Arc<ComplexSubscription>) -> GraphResult<()> {
        self.authenticated(ctx)?;
        for member in complex.members() {
            self.require(ctx, Permissions::READ, member.addr())?;
            self.engine.resolve(member.addr())?;
        }
        let registry = self.engine.registry();
        for (idx, member) in complex.members().iter().enumerate() {
            if let Err(e) = registry.register(Arc::clone(member)) {
                for registered in &complex.members()[..idx] {
                    let _ = registry.destroy(registered, self.engine.emission());
                }
                return Err(e);
            }
        }
        debug!(id = %complex.id(), members = complex.members().len(), "registered complex subscription");
        Ok(())
    }

    /// Destroys every member of `complex` still active.
    pub fn unsubscribe_complex(&self, complex: &ComplexSubscription) -> GraphResult<()> {
        let mut result = Ok(());
        for member in complex.members().iter().filter(|m| m.is_active()) {
            if let Err(e) = self.engine.registry().destroy(member, self.engine.emission()) {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Opens a channel-backed subscription on `addr`.
    pub fn subscribe_stream(
        &self,
        ctx: &MemoryContext,
        addr: Addr,
        event_type: EventType,
        filter: ElementType,
        capacity: usize,
    ) -> GraphResult<EventStream> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::READ, addr)?;
        self.engine.resolve(addr)?;
        EventStream::open(
            self.engine.registry(),
            self.engine.emission(),
            addr,
            event_type,
            filter,
            capacity,
        )
    }

    /// Delivers a caller-built event on behalf of `ctx`.
    pub fn emit(&self, ctx: &MemoryContext, args: EventArgs) -> GraphResult<()> {
        self.authenticated(ctx)?;
        self.require(ctx, Permissions::WRITE, args.element)?;
        if let Some(then) = self.engine.emit(ctx, vec![args], None)? {
            then()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Opens a transaction acting as `ctx`.
    pub fn transaction_new(&self, ctx: &Arc<MemoryContext>) -> GraphResult<Arc<Transaction>> {
        self.authenticated(ctx)?;
        Ok(self.transactions.begin(Arc::clone(ctx)))
    }

    /// Checks every staged operation against the transaction's context and
    /// queues it. Rights are checked as the single-step operations check
    /// them; operands created by the transaction itself need none.
    pub fn transaction_commit(&self, txn: &Arc<Transaction>) -> GraphResult<()> {
        let ctx = txn.context();
        self.authenticated(ctx)?;
        let existing = |addr: TxnAddr| match addr {
            TxnAddr::Existing(addr) => Some(addr),
            TxnAddr::Staged(_) => None,
        };
        for op in txn.ops() {
            match op {
                TxnOp::NodeNew { .. } | TxnOp::LinkNew { .. } => {}
                TxnOp::ConnectorNew { ty, begin, end } => {
                    self.connector_gate(ctx, ty, existing(begin), existing(end))?;
                }
                TxnOp::SetSubtype { addr, .. } => self.require(ctx, Permissions::WRITE, addr)?,
                TxnOp::SetLinkContent { link, .. } => {
                    if let Some(link) = existing(link) {
                        self.require(ctx, Permissions::ERASE, link)?;
                        self.require(ctx, Permissions::WRITE, link)?;
                    }
                }
                TxnOp::Erase { addr } => {
                    self.require(ctx, Permissions::ERASE, addr)?;
                    self.require_tier(ctx, addr, Permissions::ERASE_PERMISSIONS)?;
                }
            }
        }
        self.transactions.commit(txn)
    }

    /// Transaction counters.
    #[must_use]
    pub fn transaction_stats(&self) -> TransactionStats {
        self.transactions.stats()
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Live element counts.
    pub fn stats(&self, ctx: &MemoryContext) -> GraphResult<Stats> {
        self.authenticated(ctx)?;
        self.require_global(ctx, Permissions::READ)?;
        Ok(self.engine.stats())
    }

    /// Number of segments allocated so far.
    #[must_use]
    pub fn segments_count(&self) -> u16 {
        self.engine.store().segments_count()
    }

    /// Waits until no event callback is queued or running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.engine.emission().wait_idle(timeout)
    }

    /// Writes the snapshot to the configured repository.
    ///
    /// Fails with `InvalidParams` when no repository path is set.
    pub fn save(&self, ctx: &MemoryContext) -> GraphResult<()> {
        self.authenticated(ctx)?;
        self.require_global(ctx, Permissions::WRITE)?;
        self.persist()
    }

    fn snapshot(&self) -> GraphResult<Snapshot> {
        Ok(self.engine.snapshot()?.with_identifiers(self.idtfs.entries()))
    }

    fn persist(&self) -> GraphResult<()> {
        let path = self
            .config
            .snapshot_path()
            .ok_or_else(|| GraphError::invalid_params("no repository path configured"))?;
        let snapshot = self.snapshot()?;
        snapshot::save(&path, &snapshot)?;
        info!(path = %path.display(), elements = snapshot.elements.len(), "memory saved");
        Ok(())
    }

    /// Runs queued transactions and drains the event workers, then releases
    /// every subscription and context and saves the snapshot when a
    /// repository path is set. Idempotent.
    pub fn shutdown(&self) -> GraphResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.transactions.shutdown();
        if !self.wait_idle(SHUTDOWN_DRAIN) {
            warn!("event callbacks still running at shutdown");
        }
        self.engine.shutdown();
        let result = if self.config.repo_path.is_some() {
            self.persist()
        } else {
            Ok(())
        };
        let alive = self.contexts.shutdown();
        info!(alive_contexts = alive, "memory shut down");
        result
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "shutdown on drop failed");
        }
    }
}

fn denied(ctx: &MemoryContext, required: Permissions, addr: Addr) -> GraphError {
    let context = ctx.id();
    if required == Permissions::ERASE {
        GraphError::NoErasePermission { context, addr }
    } else if required == Permissions::WRITE {
        GraphError::NoWritePermission { context, addr }
    } else {
        GraphError::NoReadPermission { context, addr }
    }
}

fn tier_denied(ctx: &MemoryContext, tier: Permissions, addr: Addr) -> GraphError {
    let context = ctx.id();
    if tier == Permissions::ERASE_PERMISSIONS {
        GraphError::NoPermissionToErasePermissions { context, addr }
    } else if tier == Permissions::WRITE_PERMISSIONS {
        GraphError::NoPermissionToWritePermissions { context, addr }
    } else {
        GraphError::NoPermissionToReadPermissions { context, addr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;

    fn memory(user_mode: bool) -> Memory {
        Memory::initialize(MemoryConfig {
            user_mode,
            max_event_threads: 2,
            ..MemoryConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_system_context_bypasses_checks() {
        let memory = memory(true);
        let system = memory.system_context();
        let node = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
        assert_eq!(memory.element_type(&system, node).unwrap(), ElementType::CONST_NODE);
        assert!(memory.is_element(&system, node).unwrap());
    }

    #[test]
    fn test_unauthenticated_context_rejected() {
        let memory = memory(true);
        let system = memory.system_context();
        let user = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
        let ctx = memory.context_new(user).unwrap();

        let err = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap_err();
        assert_eq!(err.code(), ResultCode::ContextIsNotAuthenticated);
        memory.context_free(&ctx).unwrap();
    }

    #[test]
    fn test_guest_is_authenticated_without_rights() {
        let memory = memory(true);
        let guest = memory.guest_context().unwrap();
        let node = memory.node_new(&guest, ElementType::CONST_NODE).unwrap();

        let err = memory.element_type(&guest, node).unwrap_err();
        assert_eq!(err.code(), ResultCode::NoReadPermission);
        let err = memory.erase(&guest, node).unwrap_err();
        assert_eq!(err.code(), ResultCode::NoErasePermission);
        assert!(memory.engine().is_element(node));
    }

    #[test]
    fn test_tier_guards_keynodes() {
        let memory = memory(true);
        let system = memory.system_context();
        let user = memory.node_new(&system, ElementType::CONST_NODE).unwrap();
        memory.contexts().grant_global(
            user,
            Permissions::AUTHENTICATED | Permissions::READ | Permissions::WRITE | Permissions::ERASE,
        );
        let ctx = memory.context_new(user).unwrap();

        let keynode = memory.keynodes().concept_authenticated_user;
        let err = memory.erase(&ctx, keynode).unwrap_err();
        assert_eq!(err.code(), ResultCode::NoPermissionToErasePermissions);
        let err = memory.element_permissions(&ctx, keynode).unwrap_err();
        assert_eq!(err.code(), ResultCode::NoPermissionToReadPermissions);
        let err = memory
            .connector_new(&ctx, ElementType::CONST_TEMP_POS_ARC, keynode, user)
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::NoPermissionToWritePermissions);

        let plain = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();
        assert!(memory.element_permissions(&ctx, plain).unwrap().is_empty());
    }

    #[test]
    fn test_link_content_through_streams() {
        let memory = memory(false);
        let ctx = memory.system_context();
        let link = memory.link_new(&ctx, ElementType::CONST_LINK).unwrap();
        memory
            .set_link_content(&ctx, link, &mut MemoryStream::from_text("hello"))
            .unwrap();

        assert_eq!(memory.link_content(&ctx, link).unwrap().as_bytes(), b"hello");
        assert_eq!(memory.find_links_with_content(&ctx, b"hello").unwrap(), vec![link]);
    }

    #[test]
    fn test_system_identifiers() {
        let memory = memory(false);
        let ctx = memory.system_context();
        let node = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();
        memory.set_system_identifier(&ctx, node, "my_node").unwrap();
        assert_eq!(memory.resolve_keynode("my_node"), Some(node));
        assert_eq!(
            memory.resolve_keynode("concept_guest_user"),
            Some(memory.keynodes().concept_guest_user)
        );

        let other = memory.node_new(&ctx, ElementType::CONST_NODE).unwrap();
        let err = memory.set_system_identifier(&ctx, other, "my_node").unwrap_err();
        assert_eq!(err.code(), ResultCode::DuplicatedSystemIdentifier);
        let err = memory.set_system_identifier(&ctx, other, "bad name").unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidSystemIdentifier);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let memory = memory(false);
        memory.shutdown().unwrap();
        memory.shutdown().unwrap();
    }

    #[test]
    fn test_save_without_repo_fails() {
        let memory = memory(false);
        let err = memory.save(&memory.system_context()).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParams);
    }
}
