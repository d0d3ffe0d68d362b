//! Context registry and permission checks.
//!
//! Rights are cached per actor, so that a context created later starts with
//! whatever the graph already granted, and mirrored into the actor's live
//! context when there is one.
//!
//! Lock order is registry, then cache. Creation seeds from the caches while
//! holding the registry for writing, and rights updates hold it for reading
//! while they change the cache and the live context, so no update can fall
//! between a seed and the registration it seeds.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::addr::Addr;
use crate::context::context::{ContextId, MemoryContext};
use crate::context::permissions::{LocalCheck, Permissions};
use crate::error::{GraphError, GraphResult};
use crate::sync::Monitor;

#[derive(Debug, Default)]
struct Registry {
    by_actor: HashMap<Addr, Arc<MemoryContext>>,
    by_id: HashMap<ContextId, Arc<MemoryContext>>,
    last_id: u32,
}

impl Registry {
    /// Next free id after `last_id`, wrapping and skipping zero.
    fn next_id(&mut self) -> Option<ContextId> {
        let start = self.last_id;
        let mut candidate = start;
        loop {
            candidate = candidate.wrapping_add(1);
            if candidate == start {
                return None;
            }
            if candidate != 0 && !self.by_id.contains_key(&ContextId::new(candidate)) {
                self.last_id = candidate;
                return Some(ContextId::new(candidate));
            }
        }
    }
}

type LocalTable = HashMap<Addr, HashMap<Addr, Permissions>>;

/// Owns every context and the per-actor permission caches.
#[derive(Debug)]
pub struct ContextManager {
    user_mode: bool,
    registry: Monitor<Option<Registry>>,
    global_cache: Monitor<HashMap<Addr, Permissions>>,
    local_cache: Monitor<LocalTable>,
    system: Arc<MemoryContext>,
}

impl ContextManager {
    /// Creates the manager and its system context.
    ///
    /// With `user_mode` off every context passes every check.
    #[must_use]
    pub fn new(user_mode: bool) -> Self {
        let mut registry = Registry::default();
        let system_id = registry.next_id().unwrap_or(ContextId::new(1));
        let system = Arc::new(MemoryContext::new(
            system_id,
            Addr::EMPTY,
            true,
            Permissions::from_bits(u16::MAX),
            HashMap::new(),
        ));
        registry.by_id.insert(system_id, Arc::clone(&system));
        Self {
            user_mode,
            registry: Monitor::new(Some(registry)),
            global_cache: Monitor::new(HashMap::new()),
            local_cache: Monitor::new(HashMap::new()),
            system,
        }
    }

    /// True if permission checks are enforced.
    #[must_use]
    pub const fn user_mode(&self) -> bool {
        self.user_mode
    }

    /// The context used by the engine itself.
    #[must_use]
    pub fn system_context(&self) -> Arc<MemoryContext> {
        Arc::clone(&self.system)
    }

    fn torn_down() -> GraphError {
        GraphError::invalid_state("context manager is shut down")
    }

    /// Creates the context of `actor`, seeded from the cached rights.
    ///
    /// Fails with `InvalidState` if the actor already has one.
    pub fn new_context(&self, actor: Addr) -> GraphResult<Arc<MemoryContext>> {
        if actor.is_empty() {
            return Err(GraphError::invalid_params("context actor must not be empty"));
        }
        let mut registry = self.registry.write();
        let registry = registry.as_mut().ok_or_else(Self::torn_down)?;
        if registry.by_actor.contains_key(&actor) {
            return Err(GraphError::invalid_state(format!("actor {actor} already has a context")));
        }
        let global = self.user_global_permissions(actor);
        let local = self.local_cache.read().get(&actor).cloned().unwrap_or_default();
        let id = registry
            .next_id()
            .ok_or_else(|| GraphError::invalid_state("no free context ids"))?;
        let ctx = Arc::new(MemoryContext::new(id, actor, false, global, local));
        registry.by_actor.insert(actor, Arc::clone(&ctx));
        registry.by_id.insert(id, Arc::clone(&ctx));
        debug!(%id, %actor, %global, "created context");
        Ok(ctx)
    }

    /// The live context of `actor`.
    #[must_use]
    pub fn get(&self, actor: Addr) -> Option<Arc<MemoryContext>> {
        self.registry.read().as_ref()?.by_actor.get(&actor).cloned()
    }

    /// The live context with `id`.
    #[must_use]
    pub fn get_by_id(&self, id: ContextId) -> Option<Arc<MemoryContext>> {
        self.registry.read().as_ref()?.by_id.get(&id).cloned()
    }

    /// Returns the context of `actor`, creating it if needed, and takes a
    /// reference on it.
    pub fn resolve(&self, actor: Addr) -> GraphResult<Arc<MemoryContext>> {
        {
            let registry = self.registry.read();
            let registry = registry.as_ref().ok_or_else(Self::torn_down)?;
            // Taken under the registry lock so a concurrent free cannot
            // destroy it in between.
            if let Some(ctx) = registry.by_actor.get(&actor) {
                ctx.acquire();
                return Ok(Arc::clone(ctx));
            }
        }
        match self.new_context(actor) {
            Ok(ctx) => Ok(ctx),
            // Lost a creation race: take a reference on the winner.
            Err(GraphError::InvalidState { .. }) if self.get(actor).is_some() => self.resolve(actor),
            Err(e) => Err(e),
        }
    }

    /// Drops a reference; the context is destroyed when none remain.
    ///
    /// Returns true if the context was destroyed.
    pub fn free(&self, ctx: &MemoryContext) -> GraphResult<bool> {
        if ctx.is_system() {
            return Err(GraphError::invalid_params("the system context cannot be freed"));
        }
        let mut registry = self.registry.write();
        let registry = registry.as_mut().ok_or_else(Self::torn_down)?;
        if !registry.by_id.contains_key(&ctx.id()) {
            return Err(GraphError::invalid_state(format!("{} is not registered", ctx.id())));
        }
        if ctx.release() > 0 {
            return Ok(false);
        }
        registry.by_id.remove(&ctx.id());
        registry.by_actor.remove(&ctx.actor());
        debug!(id = %ctx.id(), actor = %ctx.actor(), "destroyed context");
        Ok(true)
    }

    /// Number of live user contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.read().as_ref().map_or(0, |r| r.by_actor.len())
    }

    /// True if no user context is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Rights
    // ------------------------------------------------------------------

    /// Cached global rights of `actor`.
    #[must_use]
    pub fn user_global_permissions(&self, actor: Addr) -> Permissions {
        self.global_cache.read().get(&actor).copied().unwrap_or_default()
    }

    /// Cached rights of `actor` inside `structure`.
    #[must_use]
    pub fn user_local_permissions(&self, actor: Addr, structure: Addr) -> Permissions {
        self.local_cache
            .read()
            .get(&actor)
            .and_then(|t| t.get(&structure))
            .copied()
            .unwrap_or_default()
    }

    /// Runs `update` on the cache and the live context of `actor` while the
    /// registry is held for reading.
    fn update_rights(&self, actor: Addr, update: impl FnOnce(Option<&MemoryContext>)) {
        let registry = self.registry.read();
        let live = registry.as_ref().and_then(|r| r.by_actor.get(&actor));
        update(live.map(Arc::as_ref));
    }

    /// Adds global rights to `actor` and its live context.
    pub fn grant_global(&self, actor: Addr, permissions: Permissions) {
        self.update_rights(actor, |live| {
            self.global_cache.write().entry(actor).or_default().insert(permissions);
            if let Some(ctx) = live {
                ctx.grant_global(permissions);
            }
        });
        debug!(%actor, %permissions, "granted global permissions");
    }

    /// Removes global rights from `actor` and its live context.
    pub fn revoke_global(&self, actor: Addr, permissions: Permissions) {
        self.update_rights(actor, |live| {
            if let Some(held) = self.global_cache.write().get_mut(&actor) {
                held.remove(permissions);
            }
            if let Some(ctx) = live {
                ctx.revoke_global(permissions);
            }
        });
        debug!(%actor, %permissions, "revoked global permissions");
    }

    /// Adds rights inside `structure` to `actor` and its live context.
    pub fn grant_local(&self, actor: Addr, structure: Addr, permissions: Permissions) {
        self.update_rights(actor, |live| {
            self.local_cache
                .write()
                .entry(actor)
                .or_default()
                .entry(structure)
                .or_default()
                .insert(permissions);
            if let Some(ctx) = live {
                ctx.grant_local(structure, permissions);
            }
        });
        debug!(%actor, %structure, %permissions, "granted local permissions");
    }

    /// Removes rights inside `structure` from `actor` and its live context.
    pub fn revoke_local(&self, actor: Addr, structure: Addr, permissions: Permissions) {
        self.update_rights(actor, |live| {
            if let Some(held) = self
                .local_cache
                .write()
                .get_mut(&actor)
                .and_then(|t| t.get_mut(&structure))
            {
                held.remove(permissions);
            }
            if let Some(ctx) = live {
                ctx.revoke_local(structure, permissions);
            }
        });
        debug!(%actor, %structure, %permissions, "revoked local permissions");
    }

    // ------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------

    /// True if `ctx` skips every check.
    #[must_use]
    pub fn bypasses(&self, ctx: &MemoryContext) -> bool {
        !self.user_mode || ctx.is_system()
    }

    /// True if `ctx` passed authentication.
    #[must_use]
    pub fn is_authenticated(&self, ctx: &MemoryContext) -> bool {
        self.bypasses(ctx) || ctx.global_permissions().contains(Permissions::AUTHENTICATED)
    }

    /// True if `ctx` holds `required` across the whole graph.
    #[must_use]
    pub fn check_global(&self, ctx: &MemoryContext, required: Permissions) -> bool {
        self.bypasses(ctx) || ctx.global_permissions().contains(required)
    }

    /// True if `structure` itself is a structure where `ctx` holds `required`.
    #[must_use]
    pub fn has_local(&self, ctx: &MemoryContext, required: Permissions, structure: Addr) -> bool {
        self.bypasses(ctx)
            || ctx
                .local_permissions(structure)
                .is_some_and(|held| held.contains(required))
    }

    /// Structure-scoped check over the permitted structures containing an
    /// element. Any structure granting `required` wins.
    #[must_use]
    pub fn check_local(&self, ctx: &MemoryContext, required: Permissions, structures: &[Addr]) -> LocalCheck {
        if self.bypasses(ctx) {
            return LocalCheck::Granted;
        }
        if ctx.has_no_local_permissions() || structures.is_empty() {
            return LocalCheck::Unknown;
        }
        let granted = structures.iter().any(|s| {
            ctx.local_permissions(*s)
                .is_some_and(|held| held.contains(required))
        });
        if granted {
            LocalCheck::Granted
        } else {
            LocalCheck::Denied
        }
    }

    /// Local check first; global rights decide only when no permitted
    /// structure contains the element.
    #[must_use]
    pub fn check_local_and_global(&self, ctx: &MemoryContext, required: Permissions, structures: &[Addr]) -> bool {
        match self.check_local(ctx, required, structures) {
            LocalCheck::Granted => true,
            LocalCheck::Denied => false,
            LocalCheck::Unknown => self.check_global(ctx, required),
        }
    }

    /// Permission-data tier check against an element's access level.
    #[must_use]
    pub fn check_tier(&self, ctx: &MemoryContext, element: Permissions, tier: Permissions) -> bool {
        self.bypasses(ctx) || ctx.global_permissions().covers(element, tier)
    }

    /// Tears the registry down. Returns the number of user contexts that
    /// were still alive.
    pub fn shutdown(&self) -> usize {
        let Some(registry) = self.registry.write().take() else {
            return 0;
        };
        let alive = registry.by_actor.len();
        if alive > 0 {
            warn!(alive, "contexts were not freed before shutdown");
        }
        alive
    }
}
