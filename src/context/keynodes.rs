//! Well-known nodes of the permission model and the system-identifier table.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::addr::Addr;
use crate::context::permissions::{ActionClass, Permissions};
use crate::engine::GraphEngine;
use crate::error::{GraphError, GraphResult};
use crate::sync::Monitor;
use crate::types::ElementType;

const IDTF_PATTERN: &str = r"^[a-zA-Z0-9_.\-]+$";

/// Maps system identifiers to addresses.
#[derive(Debug)]
pub struct IdentifierRegistry {
    pattern: Regex,
    table: Monitor<HashMap<String, Addr>>,
}

impl IdentifierRegistry {
    /// Creates an empty table.
    pub fn new() -> GraphResult<Self> {
        let pattern = Regex::new(IDTF_PATTERN)
            .map_err(|e| GraphError::failed(format!("identifier pattern failed to compile: {e}")))?;
        Ok(Self {
            pattern,
            table: Monitor::new(HashMap::new()),
        })
    }

    /// Fails with `InvalidSystemIdentifier` unless `idtf` is non-empty and
    /// uses only letters, digits, `_`, `.` and `-`.
    pub fn validate(&self, idtf: &str) -> GraphResult<()> {
        if self.pattern.is_match(idtf) {
            Ok(())
        } else {
            Err(GraphError::InvalidSystemIdentifier {
                idtf: idtf.to_string(),
            })
        }
    }

    /// Binds `idtf` to `addr`. Rebinding to the same address is a no-op.
    pub fn register(&self, idtf: &str, addr: Addr) -> GraphResult<()> {
        self.validate(idtf)?;
        let mut table = self.table.write();
        match table.get(idtf) {
            Some(bound) if *bound != addr => Err(GraphError::DuplicatedSystemIdentifier {
                idtf: idtf.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                table.insert(idtf.to_string(), addr);
                Ok(())
            }
        }
    }

    /// Drops the binding of `idtf`.
    pub fn unregister(&self, idtf: &str) -> Option<Addr> {
        self.table.write().remove(idtf)
    }

    /// Address bound to `idtf`.
    #[must_use]
    pub fn resolve(&self, idtf: &str) -> Option<Addr> {
        self.table.read().get(idtf).copied()
    }

    /// Every binding, sorted by identifier.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Addr)> {
        let mut entries: Vec<(String, Addr)> = self
            .table
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort();
        entries
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// True if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Addresses of the nodes the permission handlers watch.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keynodes {
    pub concept_authentication_request_user: Addr,
    pub concept_authenticated_user: Addr,
    pub concept_guest_user: Addr,
    pub nrel_user_action_class: Addr,
    pub nrel_user_action_class_within_sc_structure: Addr,
    /// Action-class nodes in [`ActionClass::ALL`] order.
    pub action_classes: Vec<(ActionClass, Addr)>,
}

impl Keynodes {
    /// Finds or creates every keynode and guards it with the whole
    /// permission-data tier.
    ///
    /// Identifiers bound to elements that no longer exist are rebound to
    /// fresh nodes.
    pub fn resolve(engine: &GraphEngine, idtfs: &IdentifierRegistry) -> GraphResult<Self> {
        let node = |idtf: &str, ty: ElementType| -> GraphResult<Addr> {
            let addr = match idtfs.resolve(idtf).filter(|a| engine.is_element(*a)) {
                Some(addr) => addr,
                None => {
                    idtfs.unregister(idtf);
                    let addr = engine.node_new(ty)?;
                    idtfs.register(idtf, addr)?;
                    debug!(idtf, %addr, "created keynode");
                    addr
                }
            };
            engine.add_element_permissions(addr, Permissions::ALL_PERMISSIONS)?;
            Ok(addr)
        };

        let action_classes = ActionClass::ALL
            .iter()
            .map(|class| node(class.idtf(), ElementType::CONST_NODE_CLASS).map(|addr| (*class, addr)))
            .collect::<GraphResult<Vec<_>>>()?;

        Ok(Self {
            concept_authentication_request_user: node(
                "concept_authentication_request_user",
                ElementType::CONST_NODE_CLASS,
            )?,
            concept_authenticated_user: node("concept_authenticated_user", ElementType::CONST_NODE_CLASS)?,
            concept_guest_user: node("concept_guest_user", ElementType::CONST_NODE_CLASS)?,
            nrel_user_action_class: node("nrel_user_action_class", ElementType::CONST_NODE_NOROLE)?,
            nrel_user_action_class_within_sc_structure: node(
                "nrel_user_action_class_within_sc_structure",
                ElementType::CONST_NODE_NOROLE,
            )?,
            action_classes,
        })
    }

    /// Node of `class`.
    #[must_use]
    pub fn action_class_addr(&self, class: ActionClass) -> Addr {
        self.action_classes
            .iter()
            .find(|(c, _)| *c == class)
            .map_or(Addr::EMPTY, |(_, addr)| *addr)
    }

    /// Class represented by `addr`, if it is an action-class node.
    #[must_use]
    pub fn action_class(&self, addr: Addr) -> Option<ActionClass> {
        self.action_classes
            .iter()
            .find(|(_, a)| *a == addr)
            .map(|(class, _)| *class)
    }
}
