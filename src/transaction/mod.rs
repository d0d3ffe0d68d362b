//! Staged batches of mutations applied together on handler threads.
//!
//! A [`Transaction`] records operations without touching the graph. Staged
//! creations are referred to by [`TxnAddr::Staged`] until the commit has run.
//! Committing hands the transaction to the [`TransactionManager`], whose
//! handler threads claim every existing element it touches, apply it through
//! the engine and settle it as executed or failed. A transaction touching an
//! element already claimed by a running transaction fails without applying.
//!
//! On failure, elements created by the transaction are erased again and type
//! and content changes are restored. Erasures run after every other staged
//! operation and are not undone.

mod buffer;
mod manager;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::context::MemoryContext;
use crate::error::{GraphError, GraphResult, ResultCode};
use crate::types::ElementType;

pub use buffer::{ModifiedElement, ModifiedFlags, TransactionBuffer};
pub use manager::{TransactionManager, TransactionStats};

/// Identifier of a transaction, unique per memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// An element operand: already in the graph, or created earlier in the
/// same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnAddr {
    /// A live element.
    Existing(Addr),
    /// The n-th element staged for creation.
    Staged(usize),
}

impl From<Addr> for TxnAddr {
    fn from(addr: Addr) -> Self {
        Self::Existing(addr)
    }
}

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting operations.
    Open,
    /// Queued or running on a handler.
    Committed,
    /// Applied.
    Executed,
    /// Rejected or rolled back.
    Failed,
}

#[derive(Debug, Clone)]
pub(crate) enum TxnOp {
    NodeNew { ty: ElementType },
    LinkNew { ty: ElementType },
    ConnectorNew { ty: ElementType, begin: TxnAddr, end: TxnAddr },
    SetSubtype { addr: Addr, ty: ElementType },
    SetLinkContent { link: TxnAddr, bytes: Vec<u8> },
    Erase { addr: Addr },
}

#[derive(Debug)]
struct Inner {
    state: TransactionState,
    ops: Vec<TxnOp>,
    buffer: TransactionBuffer,
    staged: Vec<ElementType>,
    created: Vec<Addr>,
    failure: Option<(ResultCode, String)>,
}

/// A batch of staged operations owned by one context.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    ctx: Arc<MemoryContext>,
    inner: Mutex<Inner>,
    settled: Condvar,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, ctx: Arc<MemoryContext>) -> Self {
        Self {
            id,
            ctx,
            inner: Mutex::new(Inner {
                state: TransactionState::Open,
                ops: Vec::new(),
                buffer: TransactionBuffer::default(),
                staged: Vec::new(),
                created: Vec::new(),
                failure: None,
            }),
            settled: Condvar::new(),
        }
    }

    // Every update below is a single assignment or push.
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> GraphResult<MutexGuard<'_, Inner>> {
        let inner = self.inner();
        if inner.state == TransactionState::Open {
            Ok(inner)
        } else {
            Err(GraphError::invalid_state(format!("{} is {:?}", self.id, inner.state)))
        }
    }

    /// Transaction id.
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// Context the operations run as.
    #[must_use]
    pub const fn context(&self) -> &Arc<MemoryContext> {
        &self.ctx
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner().state
    }

    /// Copy of the created, modified and removed sets.
    #[must_use]
    pub fn buffer(&self) -> TransactionBuffer {
        self.inner().buffer.clone()
    }

    /// Code and reason of the failure, once failed.
    #[must_use]
    pub fn failure(&self) -> Option<(ResultCode, String)> {
        self.inner().failure.clone()
    }

    /// Live address of `addr` once the transaction has executed.
    #[must_use]
    pub fn resolve(&self, addr: TxnAddr) -> Option<Addr> {
        match addr {
            TxnAddr::Existing(addr) => Some(addr),
            TxnAddr::Staged(index) => self.inner().created.get(index).copied(),
        }
    }

    /// Waits until the transaction is executed or failed. Returns the state
    /// reached, which is still `Committed` (or `Open`) on timeout.
    pub fn wait(&self, timeout: Duration) -> TransactionState {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner();
        while matches!(inner.state, TransactionState::Open | TransactionState::Committed) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let (guard, _) = self
                .settled
                .wait_timeout(inner, left)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
        inner.state
    }

    fn stage(inner: &mut Inner, ty: ElementType, op: TxnOp) -> TxnAddr {
        let index = inner.staged.len();
        inner.staged.push(ty);
        inner.buffer.created_add(index);
        inner.ops.push(op);
        TxnAddr::Staged(index)
    }

    fn operand(inner: &Inner, addr: TxnAddr) -> GraphResult<Option<ElementType>> {
        match addr {
            TxnAddr::Existing(addr) if addr.is_empty() => Err(GraphError::AddrIsNotValid { addr }),
            TxnAddr::Existing(_) => Ok(None),
            TxnAddr::Staged(index) => inner
                .staged
                .get(index)
                .copied()
                .map(Some)
                .ok_or_else(|| GraphError::invalid_params(format!("no staged element {index}"))),
        }
    }

    /// Stages a node.
    pub fn node_new(&self, ty: ElementType) -> GraphResult<TxnAddr> {
        if ty.has_any(ElementType::LINK | ElementType::CONNECTOR_MASK) {
            return Err(GraphError::invalid_type(ty.bits(), "node type expected"));
        }
        let mut inner = self.open()?;
        Ok(Self::stage(&mut inner, ty | ElementType::NODE, TxnOp::NodeNew { ty }))
    }

    /// Stages an empty link.
    pub fn link_new(&self, ty: ElementType) -> GraphResult<TxnAddr> {
        if ty.has_any(ElementType::NODE | ElementType::CONNECTOR_MASK) {
            return Err(GraphError::invalid_type(ty.bits(), "link type expected"));
        }
        let mut inner = self.open()?;
        Ok(Self::stage(&mut inner, ty | ElementType::LINK, TxnOp::LinkNew { ty }))
    }

    /// Stages a connector between two operands.
    pub fn connector_new(
        &self,
        ty: ElementType,
        begin: impl Into<TxnAddr>,
        end: impl Into<TxnAddr>,
    ) -> GraphResult<TxnAddr> {
        let (begin, end) = (begin.into(), end.into());
        if !ty.is_connector() {
            return Err(GraphError::ElementIsNotConnector { addr: Addr::EMPTY });
        }
        let mut inner = self.open()?;
        Self::operand(&inner, begin)?;
        Self::operand(&inner, end)?;
        if let TxnAddr::Existing(addr) = begin {
            inner.buffer.modified_add(addr, ModifiedFlags::OUTGOING);
        }
        if let TxnAddr::Existing(addr) = end {
            inner.buffer.modified_add(addr, ModifiedFlags::INCOMING);
        }
        Ok(Self::stage(&mut inner, ty, TxnOp::ConnectorNew { ty, begin, end }))
    }

    /// Stages a subtype change on a live element.
    pub fn set_subtype(&self, addr: Addr, ty: ElementType) -> GraphResult<()> {
        let mut inner = self.open()?;
        Self::operand(&inner, addr.into())?;
        inner.buffer.modified_add(addr, ModifiedFlags::TYPE);
        inner.ops.push(TxnOp::SetSubtype { addr, ty });
        Ok(())
    }

    /// Stages new content for a link.
    pub fn set_link_content(&self, link: impl Into<TxnAddr>, bytes: impl Into<Vec<u8>>) -> GraphResult<()> {
        let link = link.into();
        let mut inner = self.open()?;
        match Self::operand(&inner, link)? {
            Some(ty) if !ty.is_link() => {
                return Err(GraphError::invalid_type(ty.bits(), "link expected"));
            }
            Some(_) => {}
            None => {
                if let TxnAddr::Existing(addr) = link {
                    inner.buffer.modified_add(addr, ModifiedFlags::CONTENT);
                }
            }
        }
        inner.ops.push(TxnOp::SetLinkContent {
            link,
            bytes: bytes.into(),
        });
        Ok(())
    }

    /// Stages the erasure of a live element.
    pub fn erase(&self, addr: Addr) -> GraphResult<()> {
        let mut inner = self.open()?;
        Self::operand(&inner, addr.into())?;
        inner.buffer.removed_add(addr);
        inner.ops.push(TxnOp::Erase { addr });
        Ok(())
    }

    pub(crate) fn ops(&self) -> Vec<TxnOp> {
        self.inner().ops.clone()
    }

    /// Moves `Open` to `Committed`.
    pub(crate) fn seal(&self) -> GraphResult<()> {
        let mut inner = self.open()?;
        inner.state = TransactionState::Committed;
        Ok(())
    }

    pub(crate) fn settle(&self, outcome: GraphResult<Vec<Addr>>) {
        let mut inner = self.inner();
        match outcome {
            Ok(created) => {
                inner.created = created;
                inner.state = TransactionState::Executed;
            }
            Err(e) => {
                inner.failure = Some((e.code(), e.to_string()));
                inner.state = TransactionState::Failed;
            }
        }
        drop(inner);
        self.settled.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextId, Permissions};
    use std::collections::HashMap;

    fn txn() -> Transaction {
        let ctx = Arc::new(MemoryContext::new(
            ContextId::new(7),
            Addr::new(1, 1),
            false,
            Permissions::default(),
            HashMap::new(),
        ));
        Transaction::new(TransactionId(1), ctx)
    }

    #[test]
    fn test_staging_fills_buffer() {
        let txn = txn();
        let (a, b) = (Addr::new(1, 2), Addr::new(1, 3));
        let node = txn.node_new(ElementType::CONST_NODE).unwrap();
        assert_eq!(node, TxnAddr::Staged(0));
        let arc = txn.connector_new(ElementType::CONST_POS_ARC, a, node).unwrap();
        assert_eq!(arc, TxnAddr::Staged(1));
        txn.connector_new(ElementType::CONST_POS_ARC, a, b).unwrap();
        txn.erase(b).unwrap();

        let buffer = txn.buffer();
        assert_eq!(buffer.created(), &[0, 1, 2]);
        assert_eq!(buffer.modified(a).unwrap().version, 1);
        assert!(buffer.modified(b).unwrap().flags.contains(ModifiedFlags::INCOMING));
        assert_eq!(buffer.removed(), &[b]);
        assert_eq!(txn.ops().len(), 4);
    }

    #[test]
    fn test_operands_validated() {
        let txn = txn();
        let a = Addr::new(1, 2);
        assert_eq!(
            txn.connector_new(ElementType::CONST_NODE, a, a).unwrap_err().code(),
            ResultCode::ElementIsNotConnector
        );
        assert_eq!(
            txn.connector_new(ElementType::CONST_POS_ARC, Addr::EMPTY, a).unwrap_err().code(),
            ResultCode::AddrIsNotValid
        );
        assert_eq!(
            txn.connector_new(ElementType::CONST_POS_ARC, a, TxnAddr::Staged(3)).unwrap_err().code(),
            ResultCode::InvalidParams
        );
        let node = txn.node_new(ElementType::CONST_NODE).unwrap();
        assert_eq!(
            txn.set_link_content(node, b"x".to_vec()).unwrap_err().code(),
            ResultCode::InvalidType
        );
        assert!(txn.buffer().elements().is_empty());
    }

    #[test]
    fn test_sealed_rejects_staging() {
        let txn = txn();
        txn.seal().unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(
            txn.node_new(ElementType::CONST_NODE).unwrap_err().code(),
            ResultCode::InvalidState
        );
        assert_eq!(txn.seal().unwrap_err().code(), ResultCode::InvalidState);
    }

    #[test]
    fn test_settle_wakes_waiter() {
        let txn = Arc::new(txn());
        txn.node_new(ElementType::CONST_NODE).unwrap();
        txn.seal().unwrap();
        assert_eq!(txn.wait(Duration::from_millis(10)), TransactionState::Committed);

        let settler = Arc::clone(&txn);
        let handle = std::thread::spawn(move || settler.settle(Ok(vec![Addr::new(2, 1)])));
        assert_eq!(txn.wait(Duration::from_secs(5)), TransactionState::Executed);
        handle.join().unwrap();
        assert_eq!(txn.resolve(TxnAddr::Staged(0)), Some(Addr::new(2, 1)));
        assert!(txn.failure().is_none());
    }
}
