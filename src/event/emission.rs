//! Event emission manager.
//!
//! Matching subscriptions are turned into tasks and sent over an unbounded
//! crossbeam channel to a fixed set of named worker threads. A worker checks
//! the subscription's lifecycle at task start and skips it once the
//! subscription is marked for destroy.
//!
//! Destroyed subscriptions are parked on a deferred-free queue. A parked
//! subscription is released when the queue holds its last strong reference,
//! which means no queued or running task still refers to it.
//!
//! A panicking callback or continuation is counted as a failure and never
//! takes its worker down. Every task settles its batch and the idle count
//! when it is dropped, whether it ran or not.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{GraphError, GraphResult};
use crate::event::subscription::Subscription;
use crate::event::types::EventArgs;
use crate::storage::SegmentStore;
use crate::sync::Monitor;

/// Work run once every task of a batch has finished.
pub type Continuation = Box<dyn FnOnce() -> GraphResult<()> + Send + Sync>;

/// Counts the tasks of one batch and runs the batch continuation after the last.
struct BatchGate {
    remaining: AtomicUsize,
    then: Mutex<Option<Continuation>>,
}

impl BatchGate {
    fn finish(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let then = self
            .then
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(then) = then else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(then)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "event continuation failed"),
            Err(_) => warn!("event continuation panicked"),
        }
    }
}

/// Settles one task: its batch slot, its store process and the idle count.
struct TaskDone {
    shared: Arc<Shared>,
    gate: Option<Arc<BatchGate>>,
    in_process: bool,
}

impl Drop for TaskDone {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.finish();
        }
        if self.in_process {
            self.shared.store.end_process();
        }
        self.shared.reclaim();

        let mut in_flight = self.shared.in_flight();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.shared.idle.notify_all();
        }
    }
}

// Fields drop in order, so the subscription is released before `done`
// reclaims.
struct Task {
    sub: Arc<Subscription>,
    args: EventArgs,
    done: TaskDone,
}

impl Task {
    /// Counts the task as in flight until it is dropped.
    fn new(shared: &Arc<Shared>, sub: Arc<Subscription>, args: EventArgs, gate: Option<Arc<BatchGate>>) -> Self {
        *shared.in_flight() += 1;
        Self {
            sub,
            args,
            done: TaskDone {
                shared: Arc::clone(shared),
                gate,
                in_process: false,
            },
        }
    }
}

/// Emission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmissionStats {
    /// Callbacks that ran and returned success.
    pub dispatched: u64,
    /// Tasks skipped because their subscription was marked for destroy.
    pub skipped: u64,
    /// Callbacks that returned an error.
    pub failed: u64,
    /// Subscriptions waiting on the deferred-free queue.
    pub deferred: usize,
}

struct Shared {
    store: Arc<SegmentStore>,
    running: Monitor<bool>,
    in_flight: Mutex<usize>,
    idle: Condvar,
    deferred: Mutex<VecDeque<Arc<Subscription>>>,
    dispatched: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    // Counters and queue entries cannot be left half-updated by a panic.
    fn in_flight(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deferred(&self) -> MutexGuard<'_, VecDeque<Arc<Subscription>>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, task: Task) {
        let Task { sub, args, mut done } = task;
        self.store.begin_process();
        done.in_process = true;
        match panic::catch_unwind(AssertUnwindSafe(|| sub.dispatch(&args))) {
            Ok(None) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(Ok(()))) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(Err(e))) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(id = %sub.id(), event = %args.event_type, error = %e, "event callback failed");
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(id = %sub.id(), event = %args.event_type, "event callback panicked");
                // A destroy requested before the panic still applies.
                if panic::catch_unwind(AssertUnwindSafe(|| sub.finish_requested_destroy())).is_err() {
                    warn!(id = %sub.id(), "subscription delete callback panicked");
                }
            }
        }
        drop(sub);
        drop(done);
    }

    /// Releases parked subscriptions nothing else refers to.
    fn reclaim(&self) -> usize {
        let mut deferred = self.deferred();
        let before = deferred.len();
        deferred.retain(|sub| {
            if Arc::strong_count(sub) == 1 {
                sub.mark_freed();
                false
            } else {
                true
            }
        });
        before - deferred.len()
    }
}

/// Worker pool delivering subscription callbacks.
pub struct EmissionManager {
    shared: Arc<Shared>,
    tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl std::fmt::Debug for EmissionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmissionManager")
            .field("worker_count", &self.worker_count)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl EmissionManager {
    /// Spawns `workers` (at least one) event threads.
    ///
    /// Callbacks run inside a store process so allocations made by a
    /// callback are accounted like those of the originating call.
    pub fn start(workers: usize, store: Arc<SegmentStore>) -> GraphResult<Self> {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<Task>();
        let shared = Arc::new(Shared {
            store,
            running: Monitor::new(true),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
            deferred: Mutex::new(VecDeque::new()),
            dispatched: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Task> = rx.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("kyrograph-event-{idx}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        shared.run(task);
                    }
                })?;
            handles.push(handle);
        }
        info!(workers, "event emission started");

        Ok(Self {
            shared,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            worker_count: workers,
        })
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// True until [`stop_accepting`](Self::stop_accepting).
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.shared.running.read()
    }

    /// Queues one callback. Returns false if submission has stopped.
    pub fn submit(&self, sub: Arc<Subscription>, args: EventArgs) -> GraphResult<bool> {
        let (queued, _) = self.submit_batch(vec![(sub, args)], None)?;
        Ok(queued == 1)
    }

    /// Queues a batch of callbacks sharing one continuation.
    ///
    /// The continuation runs on a worker after the last task of the batch.
    /// If nothing was queued it is handed back to the caller unclaimed.
    pub fn submit_batch(
        &self,
        work: Vec<(Arc<Subscription>, EventArgs)>,
        then: Option<Continuation>,
    ) -> GraphResult<(usize, Option<Continuation>)> {
        if work.is_empty() {
            return Ok((0, then));
        }
        let running = self.shared.running.read();
        if !*running {
            warn!(count = work.len(), "emission stopped; dropping events");
            return Ok((0, then));
        }
        let tx = self
            .tx
            .lock()
            .map_err(|_| GraphError::poisoned("emission.tx"))?
            .clone()
            .ok_or_else(|| GraphError::invalid_state("emission workers are shut down"))?;

        let count = work.len();
        let gate = then.map(|then| {
            Arc::new(BatchGate {
                remaining: AtomicUsize::new(count),
                then: Mutex::new(Some(then)),
            })
        });
        let mut tasks = work
            .into_iter()
            .map(|(sub, args)| Task::new(&self.shared, sub, args, gate.clone()))
            .collect::<Vec<_>>()
            .into_iter();
        let mut unsent = None;
        for task in tasks.by_ref() {
            if let Err(SendError(task)) = tx.send(task) {
                unsent = Some(task);
                break;
            }
        }
        drop(running);
        if unsent.is_some() {
            // Dropping the unsent tasks settles their batch and idle counts.
            drop(unsent);
            drop(tasks);
            return Err(GraphError::invalid_state("emission channel disconnected"));
        }
        Ok((count, None))
    }

    /// Parks a destroyed subscription until no task refers to it.
    pub fn defer_free(&self, sub: Arc<Subscription>) {
        self.shared.deferred().push_back(sub);
        self.shared.reclaim();
    }

    /// Number of subscriptions waiting to be released.
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.shared.deferred().len()
    }

    /// Stops accepting new work. Already queued tasks still run.
    pub fn stop_accepting(&self) {
        let mut running = self.shared.running.write();
        if *running {
            *running = false;
            debug!("event emission stopped accepting work");
        }
    }

    /// Waits until no task is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.shared.in_flight();
        while *in_flight > 0 {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _) = self
                .shared
                .idle
                .wait_timeout(in_flight, left)
                .unwrap_or_else(PoisonError::into_inner);
            in_flight = guard;
        }
        true
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> EmissionStats {
        EmissionStats {
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            deferred: self.deferred_len(),
        }
    }

    /// Drains queued work, joins the workers and frees every parked
    /// subscription. Idempotent.
    pub fn shutdown(&self) {
        self.stop_accepting();
        // Closing the channel lets workers drain the queue and exit.
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }

        let parked: Vec<Arc<Subscription>> = self.shared.deferred().drain(..).collect();
        let freed = parked.len();
        for sub in parked {
            sub.mark_freed();
        }
        if freed > 0 {
            debug!(freed, "released deferred subscriptions");
        }
    }
}

impl Drop for EmissionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
