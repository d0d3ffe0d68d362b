//! Fair reader/writer monitor.
//!
//! A [`Monitor`] admits requests strictly in arrival order: a reader queued
//! behind a waiting writer does not overtake it. Every monitor carries a
//! process-unique id, and any code path that holds more than one monitor at a
//! time acquires them in ascending id order through [`Monitor::lock_all`] (or
//! the address variant on [`MonitorTable`](super::MonitorTable)).
//!
//! The admission gate is the only source of exclusion. The inner `RwLock`
//! only hands out references to the guarded value and never blocks once the
//! gate has admitted the caller.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Access mode requested from a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

#[derive(Debug, Default)]
struct Gate {
    readers: usize,
    writer: bool,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

impl Gate {
    const fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer,
            LockMode::Write => !self.writer && self.readers == 0,
        }
    }

    fn admit(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Write => self.writer = true,
        }
    }
}

/// Reader/writer lock with FIFO admission and a stable identity.
#[derive(Debug)]
pub struct Monitor<T = ()> {
    id: u64,
    gate: Mutex<Gate>,
    wakeup: Condvar,
    data: RwLock<T>,
}

impl Default for Monitor<()> {
    fn default() -> Self {
        Self::new(())
    }
}

impl<T> Monitor<T> {
    /// Creates a monitor guarding `value`.
    pub fn new(value: T) -> Self {
        Self {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            gate: Mutex::new(Gate::default()),
            wakeup: Condvar::new(),
            data: RwLock::new(value),
        }
    }

    /// Stable id used to order multi-monitor acquisition.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    // The gate only holds counters, so a panic while it was held cannot
    // leave it half-updated.
    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enter(&self, mode: LockMode) {
        let mut gate = self.gate();
        if gate.queue.is_empty() && gate.admits(mode) {
            gate.admit(mode);
            return;
        }

        let ticket = gate.next_ticket;
        gate.next_ticket = gate.next_ticket.wrapping_add(1);
        gate.queue.push_back(ticket);

        loop {
            if gate.queue.front() == Some(&ticket) && gate.admits(mode) {
                gate.queue.pop_front();
                gate.admit(mode);
                let more_waiting = !gate.queue.is_empty();
                drop(gate);
                if more_waiting {
                    // The next queued reader may be admissible too.
                    self.wakeup.notify_all();
                }
                return;
            }
            gate = self
                .wakeup
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn try_enter(&self, mode: LockMode, attempts: u32) -> bool {
        for _ in 0..attempts.max(1) {
            {
                let mut gate = self.gate();
                if gate.queue.is_empty() && gate.admits(mode) {
                    gate.admit(mode);
                    return true;
                }
            }
            thread::yield_now();
        }
        false
    }

    pub(crate) fn leave(&self, mode: LockMode) {
        let mut gate = self.gate();
        match mode {
            LockMode::Read => gate.readers = gate.readers.saturating_sub(1),
            LockMode::Write => gate.writer = false,
        }
        let waiting = !gate.queue.is_empty();
        drop(gate);
        if waiting {
            self.wakeup.notify_all();
        }
    }

    /// Blocks until shared access is granted.
    pub fn read(&self) -> MonitorReadGuard<'_, T> {
        self.enter(LockMode::Read);
        MonitorReadGuard {
            data: self.data.read().unwrap_or_else(PoisonError::into_inner),
            monitor: self,
        }
    }

    /// Blocks until exclusive access is granted.
    pub fn write(&self) -> MonitorWriteGuard<'_, T> {
        self.enter(LockMode::Write);
        MonitorWriteGuard {
            data: self.data.write().unwrap_or_else(PoisonError::into_inner),
            monitor: self,
        }
    }

    /// Tries shared access up to `attempts` times without queueing.
    pub fn try_read(&self, attempts: u32) -> Option<MonitorReadGuard<'_, T>> {
        self.try_enter(LockMode::Read, attempts).then(|| MonitorReadGuard {
            data: self.data.read().unwrap_or_else(PoisonError::into_inner),
            monitor: self,
        })
    }

    /// Tries exclusive access up to `attempts` times without queueing.
    pub fn try_write(&self, attempts: u32) -> Option<MonitorWriteGuard<'_, T>> {
        self.try_enter(LockMode::Write, attempts).then(|| MonitorWriteGuard {
            data: self.data.write().unwrap_or_else(PoisonError::into_inner),
            monitor: self,
        })
    }

    /// Acquires every monitor in `monitors` in ascending id order.
    ///
    /// Duplicates are acquired once. The returned set releases in reverse
    /// order when dropped.
    pub fn lock_all<'m>(monitors: &[&'m Self], mode: LockMode) -> MonitorSet<'m, T> {
        let mut held: Vec<&'m Self> = monitors.to_vec();
        sort_for_acquire(&mut held, |m| m.id());
        for monitor in &held {
            monitor.enter(mode);
        }
        MonitorSet { held, mode }
    }
}

/// Sorts by monitor id and drops duplicates. Every multi-monitor acquisition
/// goes through this ordering.
pub(crate) fn sort_for_acquire<M>(items: &mut Vec<M>, id: impl Fn(&M) -> u64) {
    items.sort_by_key(|m| id(m));
    items.dedup_by_key(|m| id(m));
}

/// Shared access to a monitor's value.
pub struct MonitorReadGuard<'a, T> {
    data: RwLockReadGuard<'a, T>,
    monitor: &'a Monitor<T>,
}

impl<T> Deref for MonitorReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> Drop for MonitorReadGuard<'_, T> {
    fn drop(&mut self) {
        self.monitor.leave(LockMode::Read);
    }
}

/// Exclusive access to a monitor's value.
pub struct MonitorWriteGuard<'a, T> {
    data: RwLockWriteGuard<'a, T>,
    monitor: &'a Monitor<T>,
}

impl<T> Deref for MonitorWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for MonitorWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T> Drop for MonitorWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.monitor.leave(LockMode::Write);
    }
}

/// A group of monitors held together; released in reverse acquisition order.
pub struct MonitorSet<'m, T> {
    held: Vec<&'m Monitor<T>>,
    mode: LockMode,
}

impl<T> MonitorSet<'_, T> {
    /// Number of distinct monitors held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// True if no monitor is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl<T> Drop for MonitorSet<'_, T> {
    fn drop(&mut self) {
        while let Some(monitor) = self.held.pop() {
            monitor.leave(self.mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_ids_are_unique() {
        let a = Monitor::default();
        let b = Monitor::default();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_readers_share() {
        let monitor = Monitor::new(5u32);
        let r1 = monitor.read();
        let r2 = monitor.read();
        assert_eq!(*r1 + *r2, 10);
        assert!(monitor.try_write(3).is_none());
        drop(r1);
        drop(r2);
        assert!(monitor.try_write(1).is_some());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let monitor = Monitor::new(Vec::<u32>::new());
        {
            let mut w = monitor.write();
            w.push(1);
            assert!(monitor.try_read(4).is_none());
        }
        assert_eq!(monitor.read().len(), 1);
    }

    #[test]
    fn test_write_mutual_exclusion() {
        let monitor = Arc::new(Monitor::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let monitor = Arc::clone(&monitor);
                let inside = Arc::clone(&inside);
                let violations = Arc::clone(&violations);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if i % 2 == 0 {
                            let _w = monitor.write();
                            if inside.fetch_add(100, Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            inside.fetch_sub(100, Ordering::SeqCst);
                        } else {
                            let _r = monitor.read();
                            if inside.fetch_add(1, Ordering::SeqCst) >= 100 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_queued_writer_blocks_later_readers() {
        let monitor = Arc::new(Monitor::new(0u32));
        let first = monitor.read();

        let writer = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                *monitor.write() += 1;
            })
        };

        // Wait until the writer is queued behind the reader.
        while monitor.gate().queue.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(monitor.try_read(2).is_none());

        drop(first);
        writer.join().unwrap();
        assert_eq!(*monitor.read(), 1);
    }

    #[test]
    fn test_lock_all_dedupes_and_orders() {
        let a = Monitor::default();
        let b = Monitor::default();
        let set = Monitor::lock_all(&[&b, &a, &b], LockMode::Write);
        assert_eq!(set.len(), 2);
        assert!(a.try_read(1).is_none());
        assert!(b.try_read(1).is_none());
        drop(set);
        assert!(a.try_write(1).is_some());
    }

    #[test]
    fn test_lock_all_opposite_orders_do_not_deadlock() {
        let a = Arc::new(Monitor::default());
        let b = Arc::new(Monitor::default());

        let spawn = |first: Arc<Monitor>, second: Arc<Monitor>| {
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let _set = Monitor::lock_all(&[&*first, &*second], LockMode::Write);
                }
            })
        };
        let t1 = spawn(Arc::clone(&a), Arc::clone(&b));
        let t2 = spawn(b, a);
        t1.join().unwrap();
        t2.join().unwrap();
    }
}
