//! Internal subscriptions that keep the permission caches in step with the
//! graph.
//!
//! ```text
//! concept_authentication_request_user ──pos──► user        grant AUTHENTICATED
//! concept_authenticated_user ──pos-temp──► user            (erased) revoke
//! nrel_user_action_class ──pos──► (user ──► action_class)  grant global
//! nrel_user_action_class_within_sc_structure
//!     ──pos──► (user ──► (action_class ──► structure))     grant local
//! ```
//!
//! Callbacks run on event workers and mutate the graph through the system
//! context.

use std::sync::{Arc, Weak};

use tracing::{debug, info};

use crate::addr::Addr;
use crate::context::keynodes::Keynodes;
use crate::context::manager::ContextManager;
use crate::context::permissions::Permissions;
use crate::engine::GraphEngine;
use crate::error::{GraphError, GraphResult};
use crate::event::{EventArgs, EventCallback, EventType, Subscription};
use crate::types::ElementType;

struct Handlers {
    engine: Weak<GraphEngine>,
    contexts: Arc<ContextManager>,
    keynodes: Arc<Keynodes>,
}

impl Handlers {
    fn engine(&self) -> Option<Arc<GraphEngine>> {
        self.engine.upgrade()
    }

    /// `(begin, end)` of a connector, or `None` if it is gone.
    fn pair(engine: &GraphEngine, conn: Addr) -> Option<(Addr, Addr)> {
        engine.connector_info(conn).ok().map(|info| (info.begin, info.end))
    }

    fn erase_quietly(&self, engine: &GraphEngine, addr: Addr) -> GraphResult<()> {
        match engine.erase(&self.contexts.system_context(), addr) {
            Ok(()) | Err(GraphError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Adds a guarded temporary arc from `from` to `to`.
    fn mark(&self, engine: &GraphEngine, ty: ElementType, from: Addr, to: Addr) -> GraphResult<()> {
        let system = self.contexts.system_context();
        let arc = engine.connector_new(&system, ty, from, to)?;
        engine.add_element_permissions(arc, Permissions::ALL_PERMISSIONS)
    }

    fn on_authentication_request(&self, args: &EventArgs) -> GraphResult<()> {
        let Some(engine) = self.engine() else {
            return Ok(());
        };
        let user = args.other;
        let authenticated = self.keynodes.concept_authenticated_user;

        if engine.is_element(user) {
            engine.add_element_permissions(user, Permissions::ERASE_PERMISSIONS)?;
        }
        self.contexts.grant_global(user, Permissions::AUTHENTICATED);
        self.erase_quietly(&engine, args.connector)?;

        for conn in engine.outgoing(authenticated)? {
            let Ok(info) = engine.connector_info(conn) else {
                continue;
            };
            if info.end == user && info.ty.matches_filter(ElementType::CONST_TEMP_NEG_ARC) {
                self.erase_quietly(&engine, conn)?;
            }
        }
        self.mark(&engine, ElementType::CONST_TEMP_POS_ARC, authenticated, user)?;
        info!(%user, "user authenticated");
        Ok(())
    }

    fn on_authentication_removed(&self, args: &EventArgs) -> GraphResult<()> {
        let Some(engine) = self.engine() else {
            return Ok(());
        };
        let user = args.other;
        self.contexts.revoke_global(user, Permissions::AUTHENTICATED);
        if !engine.is_being_erased(user) {
            self.mark(
                &engine,
                ElementType::CONST_TEMP_NEG_ARC,
                self.keynodes.concept_authenticated_user,
                user,
            )?;
        }
        info!(%user, "user authentication revoked");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Global rights
    // ------------------------------------------------------------------

    /// Applies `(user ──► action_class)` to the global cache.
    fn apply_action_class(&self, engine: &GraphEngine, pair: Addr, grant: bool) {
        let Some((user, class)) = Self::pair(engine, pair) else {
            return;
        };
        let Some(class) = self.keynodes.action_class(class) else {
            debug!(%pair, "relation pair does not end in an action class");
            return;
        };
        if grant {
            self.contexts.grant_global(user, class.permissions());
        } else {
            self.contexts.revoke_global(user, class.permissions());
        }
    }

    fn add_action_class(&self, engine: &GraphEngine, conn: Addr, pair: Addr) -> GraphResult<()> {
        if engine.is_element(conn) {
            engine.add_element_permissions(conn, Permissions::ALL_PERMISSIONS)?;
        }
        self.apply_action_class(engine, pair, true);
        Ok(())
    }

    fn on_action_class_added(&self, args: &EventArgs) -> GraphResult<()> {
        let Some(engine) = self.engine() else {
            return Ok(());
        };
        if args.connector_type.matches_filter(ElementType::CONST_POS_ARC) {
            self.add_action_class(&engine, args.connector, args.other)?;
        } else if args.connector_type.matches_filter(ElementType::CONST_NEG_ARC) {
            self.apply_action_class(&engine, args.other, false);
        }
        Ok(())
    }

    fn on_action_class_removed(&self, args: &EventArgs) -> GraphResult<()> {
        let Some(engine) = self.engine() else {
            return Ok(());
        };
        let pair = args.other;
        self.apply_action_class(&engine, pair, false);
        if !engine.is_being_erased(pair) {
            self.mark(
                &engine,
                ElementType::CONST_TEMP_NEG_ARC,
                self.keynodes.nrel_user_action_class,
                pair,
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local rights
    // ------------------------------------------------------------------

    /// Applies `(user ──► (action_class ──► structure))` to the local cache.
    fn apply_within_structure(&self, engine: &GraphEngine, pair: Addr, grant: bool) -> GraphResult<()> {
        let Some((user, inner)) = Self::pair(engine, pair) else {
            return Ok(());
        };
        let Some((class, structure)) = Self::pair(engine, inner) else {
            return Ok(());
        };
        let Some(class) = self.keynodes.action_class(class) else {
            return Ok(());
        };
        if grant {
            engine.add_element_permissions(structure, Permissions::PERMITTED_STRUCTURE)?;
            self.contexts.grant_local(user, structure, class.permissions());
        } else {
            self.contexts.revoke_local(user, structure, class.permissions());
        }
        Ok(())
    }

    fn add_within_structure(&self, engine: &GraphEngine, conn: Addr, pair: Addr) -> GraphResult<()> {
        if engine.is_element(conn) {
            engine.add_element_permissions(conn, Permissions::ALL_PERMISSIONS)?;
        }
        self.apply_within_structure(engine, pair, true)
    }

    fn on_within_structure_added(&self, args: &EventArgs) -> GraphResult<()> {
        let Some(engine) = self.engine() else {
            return Ok(());
        };
        if args.connector_type.matches_filter(ElementType::CONST_POS_ARC) {
            self.add_within_structure(&engine, args.connector, args.other)
        } else if args.connector_type.matches_filter(ElementType::CONST_NEG_ARC) {
            self.apply_within_structure(&engine, args.other, false)
        } else {
            Ok(())
        }
    }

    fn on_within_structure_removed(&self, args: &EventArgs) -> GraphResult<()> {
        let Some(engine) = self.engine() else {
            return Ok(());
        };
        let pair = args.other;
        self.apply_within_structure(&engine, pair, false)?;
        if !engine.is_being_erased(pair) {
            self.mark(
                &engine,
                ElementType::CONST_TEMP_NEG_ARC,
                self.keynodes.nrel_user_action_class_within_sc_structure,
                pair,
            )?;
        }
        Ok(())
    }

    /// Applies the relation arcs already in the graph, oldest first.
    fn scan(&self, engine: &GraphEngine) -> GraphResult<usize> {
        let mut applied = 0;
        for conn in engine.outgoing(self.keynodes.nrel_user_action_class)?.into_iter().rev() {
            let Ok(info) = engine.connector_info(conn) else {
                continue;
            };
            if info.ty.matches_filter(ElementType::CONST_POS_ARC) {
                self.add_action_class(engine, conn, info.end)?;
                applied += 1;
            }
        }
        let within = self.keynodes.nrel_user_action_class_within_sc_structure;
        for conn in engine.outgoing(within)?.into_iter().rev() {
            let Ok(info) = engine.connector_info(conn) else {
                continue;
            };
            if info.ty.matches_filter(ElementType::CONST_POS_ARC) {
                self.add_within_structure(engine, conn, info.end)?;
                applied += 1;
            } else if info.ty.matches_filter(ElementType::CONST_NEG_ARC) {
                self.apply_within_structure(engine, info.end, false)?;
                applied += 1;
            }
        }
        Ok(applied)
    }
}

type Callback = fn(&Handlers, &EventArgs) -> GraphResult<()>;

/// Registers the permission subscriptions and applies the relation arcs
/// already present. Returns the installed subscriptions.
pub(crate) fn install(
    engine: &Arc<GraphEngine>,
    contexts: &Arc<ContextManager>,
    keynodes: &Arc<Keynodes>,
) -> GraphResult<Vec<Arc<Subscription>>> {
    let handlers = Arc::new(Handlers {
        engine: Arc::downgrade(engine),
        contexts: Arc::clone(contexts),
        keynodes: Arc::clone(keynodes),
    });

    let table: [(Addr, EventType, ElementType, Callback); 6] = [
        (
            keynodes.concept_authentication_request_user,
            EventType::AfterGenerateOutgoingArc,
            ElementType::CONST_POS_ARC,
            Handlers::on_authentication_request,
        ),
        (
            keynodes.concept_authenticated_user,
            EventType::BeforeEraseOutgoingArc,
            ElementType::CONST_POS_ARC,
            Handlers::on_authentication_removed,
        ),
        (
            keynodes.nrel_user_action_class,
            EventType::AfterGenerateOutgoingArc,
            ElementType::UNKNOWN,
            Handlers::on_action_class_added,
        ),
        (
            keynodes.nrel_user_action_class,
            EventType::BeforeEraseOutgoingArc,
            ElementType::CONST_POS_ARC,
            Handlers::on_action_class_removed,
        ),
        (
            keynodes.nrel_user_action_class_within_sc_structure,
            EventType::AfterGenerateOutgoingArc,
            ElementType::UNKNOWN,
            Handlers::on_within_structure_added,
        ),
        (
            keynodes.nrel_user_action_class_within_sc_structure,
            EventType::BeforeEraseOutgoingArc,
            ElementType::CONST_POS_ARC,
            Handlers::on_within_structure_removed,
        ),
    ];

    let mut installed = Vec::with_capacity(table.len());
    for (addr, event_type, filter, callback) in table {
        let handlers = Arc::clone(&handlers);
        let sub = Subscription::builder(
            addr,
            event_type,
            EventCallback::event(move |_, args| callback(&handlers, args)),
        )
        .filter(filter)
        .build();
        engine.registry().register(Arc::clone(&sub))?;
        installed.push(sub);
    }

    let applied = handlers.scan(engine)?;
    info!(subscriptions = installed.len(), applied, "permission handlers installed");
    Ok(installed)
}
