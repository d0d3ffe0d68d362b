//! Handler threads executing committed transactions.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addr::Addr;
use crate::context::MemoryContext;
use crate::engine::GraphEngine;
use crate::error::{GraphError, GraphResult};
use crate::transaction::{Transaction, TransactionId, TxnAddr, TxnOp};
use crate::types::ElementType;

/// Transaction counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionStats {
    /// Transactions applied.
    pub executed: u64,
    /// Transactions rejected or rolled back.
    pub failed: u64,
}

/// Changes applied so far, undone in reverse if a later step fails.
enum Undo {
    Created(Addr),
    Retyped(Addr, ElementType),
    Content(Addr, Vec<u8>),
}

struct Shared {
    engine: Arc<GraphEngine>,
    /// Existing elements claimed by transactions being applied.
    claimed: Mutex<HashSet<Addr>>,
    executed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    // Holds plain addresses only.
    fn claimed(&self) -> MutexGuard<'_, HashSet<Addr>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, txn: &Transaction, elements: &HashSet<Addr>) -> GraphResult<()> {
        let mut claimed = self.claimed();
        if let Some(addr) = elements.iter().find(|addr| claimed.contains(addr)) {
            return Err(GraphError::invalid_state(format!(
                "{} touches {addr}, which another transaction is applying",
                txn.id()
            )));
        }
        claimed.extend(elements.iter().copied());
        Ok(())
    }

    fn execute(&self, txn: &Transaction) {
        let elements = txn.buffer().elements();
        let outcome = self.claim(txn, &elements).and_then(|()| {
            let applied = panic::catch_unwind(AssertUnwindSafe(|| self.apply(txn)))
                .unwrap_or_else(|_| Err(GraphError::failed("transaction handler panicked")));
            let mut claimed = self.claimed();
            for addr in &elements {
                claimed.remove(addr);
            }
            applied
        });
        match &outcome {
            Ok(created) => {
                self.executed.fetch_add(1, Ordering::Relaxed);
                debug!(id = %txn.id(), created = created.len(), "transaction executed");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(id = %txn.id(), error = %e, "transaction failed");
            }
        }
        txn.settle(outcome);
    }

    fn apply(&self, txn: &Transaction) -> GraphResult<Vec<Addr>> {
        let ops = txn.ops();
        let ctx = txn.context();
        for addr in txn.buffer().elements() {
            self.engine.resolve(addr)?;
        }

        let mut created = Vec::new();
        let mut undo = Vec::new();
        let staged = ops.iter().filter(|op| !matches!(op, TxnOp::Erase { .. }));
        for op in staged {
            if let Err(e) = self.apply_one(ctx, op, &mut created, &mut undo) {
                self.roll_back(ctx, undo);
                return Err(e);
            }
        }
        for op in &ops {
            if let TxnOp::Erase { addr } = op {
                self.engine.erase(ctx, *addr)?;
            }
        }
        Ok(created)
    }

    fn apply_one(
        &self,
        ctx: &Arc<MemoryContext>,
        op: &TxnOp,
        created: &mut Vec<Addr>,
        undo: &mut Vec<Undo>,
    ) -> GraphResult<()> {
        let resolve = |addr: TxnAddr, created: &[Addr]| match addr {
            TxnAddr::Existing(addr) => Ok(addr),
            TxnAddr::Staged(index) => created
                .get(index)
                .copied()
                .ok_or_else(|| GraphError::invalid_params(format!("no staged element {index}"))),
        };
        let new = match op {
            TxnOp::NodeNew { ty } => Some(self.engine.node_new(*ty)?),
            TxnOp::LinkNew { ty } => Some(self.engine.link_new(*ty)?),
            TxnOp::ConnectorNew { ty, begin, end } => {
                let begin = resolve(*begin, created)?;
                let end = resolve(*end, created)?;
                Some(self.engine.connector_new(ctx, *ty, begin, end)?)
            }
            TxnOp::SetSubtype { addr, ty } => {
                let before = self.engine.element_type(*addr)?;
                self.engine.change_subtype(*addr, *ty)?;
                undo.push(Undo::Retyped(*addr, before));
                None
            }
            TxnOp::SetLinkContent { link, bytes } => {
                let link = resolve(*link, created)?;
                let before = self.engine.link_content(link)?;
                self.engine.set_link_content(ctx, link, bytes.clone())?;
                undo.push(Undo::Content(link, before));
                None
            }
            TxnOp::Erase { .. } => None,
        };
        if let Some(addr) = new {
            created.push(addr);
            undo.push(Undo::Created(addr));
        }
        Ok(())
    }

    fn roll_back(&self, ctx: &Arc<MemoryContext>, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match step {
                Undo::Created(addr) => self.engine.erase(ctx, addr),
                Undo::Retyped(addr, ty) => self.engine.change_subtype(addr, ty),
                Undo::Content(addr, bytes) => self.engine.set_link_content(ctx, addr, bytes),
            };
            if let Err(e) = result {
                debug!(error = %e, "rollback step skipped");
            }
        }
    }
}

/// Queue of committed transactions served by a fixed set of handler threads.
pub struct TransactionManager {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    tx: Mutex<Option<Sender<Arc<Transaction>>>>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
    handler_count: usize,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("handler_count", &self.handler_count)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    /// Spawns `handlers` (at least one) transaction threads.
    pub fn start(handlers: usize, engine: Arc<GraphEngine>) -> GraphResult<Self> {
        let handlers = handlers.max(1);
        let (tx, rx) = unbounded::<Arc<Transaction>>();
        let shared = Arc::new(Shared {
            engine,
            claimed: Mutex::new(HashSet::new()),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(handlers);
        for idx in 0..handlers {
            let rx: Receiver<Arc<Transaction>> = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("kyrograph-txn-{idx}"))
                .spawn(move || {
                    while let Ok(txn) = rx.recv() {
                        shared.execute(&txn);
                    }
                })?;
            handles.push(handle);
        }
        info!(handlers, "transaction handlers started");

        Ok(Self {
            shared,
            next_id: AtomicU64::new(0),
            tx: Mutex::new(Some(tx)),
            handlers: Mutex::new(handles),
            handler_count: handlers,
        })
    }

    /// Number of handler threads.
    #[must_use]
    pub const fn handler_count(&self) -> usize {
        self.handler_count
    }

    /// Opens a transaction acting as `ctx`.
    #[must_use]
    pub fn begin(&self, ctx: Arc<MemoryContext>) -> Arc<Transaction> {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(Transaction::new(id, ctx))
    }

    /// Seals `txn` and queues it for a handler.
    pub fn commit(&self, txn: &Arc<Transaction>) -> GraphResult<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| GraphError::poisoned("transactions.tx"))?
            .clone()
            .ok_or_else(|| GraphError::invalid_state("transaction handlers are shut down"))?;
        txn.seal()?;
        if tx.send(Arc::clone(txn)).is_err() {
            let disconnected = || GraphError::invalid_state("transaction queue disconnected");
            txn.settle(Err(disconnected()));
            return Err(disconnected());
        }
        debug!(id = %txn.id(), "transaction committed");
        Ok(())
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            executed: self.shared.executed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Runs every queued transaction, then joins the handlers. Idempotent.
    pub fn shutdown(&self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);

        let handles: Vec<JoinHandle<()>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
