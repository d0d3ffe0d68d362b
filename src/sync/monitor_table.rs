//! Pool of per-address monitors.
//!
//! Monitors are created on first use and dropped from the table once the last
//! guard referencing them is released, so the table only ever holds monitors
//! for addresses that are currently locked. The table is split into shards;
//! looking up a live monitor takes a shard read lock, and only insertion and
//! recycling take the shard write lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::addr::Addr;
use crate::sync::monitor::{sort_for_acquire, LockMode, Monitor};

const SHARDS: usize = 32;

type Shard = RwLock<HashMap<Addr, Arc<Monitor>>>;

/// Keyed pool handing out one monitor per address.
#[derive(Debug)]
pub struct MonitorTable {
    shards: Box<[Shard]>,
}

impl Default for MonitorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, addr: Addr) -> &Shard {
        let key = addr.pack();
        let mixed = (key ^ (key >> 16)) as usize;
        &self.shards[mixed % SHARDS]
    }

    // Shard maps only see single insert/remove calls, which cannot be left
    // half-applied by a panicking holder.
    fn read_shard(&self, addr: Addr) -> RwLockReadGuard<'_, HashMap<Addr, Arc<Monitor>>> {
        self.shard(addr).read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, addr: Addr) -> RwLockWriteGuard<'_, HashMap<Addr, Arc<Monitor>>> {
        self.shard(addr).write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the monitor for `addr`, creating it if absent.
    pub fn monitor_for(&self, addr: Addr) -> Arc<Monitor> {
        if let Some(monitor) = self.read_shard(addr).get(&addr) {
            return Arc::clone(monitor);
        }
        let mut shard = self.write_shard(addr);
        Arc::clone(shard.entry(addr).or_default())
    }

    // Clones are only taken under a shard lock and released handles are only
    // dropped here under the write lock, so the count seen below is exact.
    fn recycle(&self, addr: Addr, released: Arc<Monitor>) {
        let ptr = Arc::as_ptr(&released);
        let mut shard = self.write_shard(addr);
        drop(released);
        let idle = shard
            .get(&addr)
            .is_some_and(|m| Arc::as_ptr(m) == ptr && Arc::strong_count(m) == 1);
        if idle {
            shard.remove(&addr);
        }
    }

    /// Blocks until `addr` is held in `mode`.
    pub fn lock(&self, addr: Addr, mode: LockMode) -> AddrGuard<'_> {
        let monitor = self.monitor_for(addr);
        monitor.enter(mode);
        AddrGuard {
            table: self,
            addr,
            monitor: Some(monitor),
            mode,
        }
    }

    /// Tries to hold `addr` in `mode`, giving up after `attempts` tries.
    pub fn try_lock(&self, addr: Addr, mode: LockMode, attempts: u32) -> Option<AddrGuard<'_>> {
        let monitor = self.monitor_for(addr);
        if monitor.try_enter(mode, attempts) {
            Some(AddrGuard {
                table: self,
                addr,
                monitor: Some(monitor),
                mode,
            })
        } else {
            self.recycle(addr, monitor);
            None
        }
    }

    /// Holds every non-empty address in `addrs`, acquiring in monitor-id order.
    pub fn lock_all(&self, addrs: &[Addr], mode: LockMode) -> AddrLockSet<'_> {
        let mut held: Vec<(Addr, Arc<Monitor>)> = addrs
            .iter()
            .filter(|addr| !addr.is_empty())
            .map(|&addr| (addr, self.monitor_for(addr)))
            .collect();
        sort_for_acquire(&mut held, |(_, m)| m.id());
        for (_, monitor) in &held {
            monitor.enter(mode);
        }
        AddrLockSet {
            table: self,
            held,
            mode,
        }
    }

    /// Number of monitors currently pooled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// True if no monitor is pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A held address monitor.
#[derive(Debug)]
pub struct AddrGuard<'t> {
    table: &'t MonitorTable,
    addr: Addr,
    monitor: Option<Arc<Monitor>>,
    mode: LockMode,
}

impl AddrGuard<'_> {
    /// The locked address.
    #[must_use]
    pub const fn addr(&self) -> Addr {
        self.addr
    }

    /// The mode the address is held in.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for AddrGuard<'_> {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.leave(self.mode);
            self.table.recycle(self.addr, monitor);
        }
    }
}

/// A group of held address monitors, released in reverse order.
#[derive(Debug)]
pub struct AddrLockSet<'t> {
    table: &'t MonitorTable,
    held: Vec<(Addr, Arc<Monitor>)>,
    mode: LockMode,
}

impl AddrLockSet<'_> {
    /// True if `addr` is part of the set.
    #[must_use]
    pub fn contains(&self, addr: Addr) -> bool {
        self.held.iter().any(|(a, _)| *a == addr)
    }
}

impl Drop for AddrLockSet<'_> {
    fn drop(&mut self) {
        while let Some((addr, monitor)) = self.held.pop() {
            monitor.leave(self.mode);
            self.table.recycle(addr, monitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_same_addr_same_monitor() {
        let table = MonitorTable::new();
        let a = table.monitor_for(Addr::new(1, 1));
        let b = table.monitor_for(Addr::new(1, 1));
        assert!(Arc::ptr_eq(&a, &b));
        let c = table.monitor_for(Addr::new(1, 2));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_idle_monitors_are_recycled() {
        let table = MonitorTable::new();
        {
            let _g1 = table.lock(Addr::new(1, 1), LockMode::Read);
            let _g2 = table.lock(Addr::new(1, 1), LockMode::Read);
            let _g3 = table.lock(Addr::new(2, 9), LockMode::Write);
            assert_eq!(table.len(), 2);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_release_recycles() {
        use std::sync::Barrier;

        let table = Arc::new(MonitorTable::new());
        let addr = Addr::new(4, 4);
        for _ in 0..500 {
            // Both guards are held at the barrier and then released together.
            let barrier = Arc::new(Barrier::new(2));
            let readers: Vec<_> = (0..2)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        let guard = table.lock(addr, LockMode::Read);
                        barrier.wait();
                        drop(guard);
                    })
                })
                .collect();
            for reader in readers {
                reader.join().unwrap();
            }
            assert!(table.is_empty());
        }
    }

    #[test]
    fn test_try_lock_conflict() {
        let table = MonitorTable::new();
        let addr = Addr::new(1, 5);
        let held = table.lock(addr, LockMode::Write);
        assert!(table.try_lock(addr, LockMode::Read, 3).is_none());
        drop(held);
        let guard = table.try_lock(addr, LockMode::Read, 1).unwrap();
        assert_eq!(guard.addr(), addr);
        assert_eq!(guard.mode(), LockMode::Read);
    }

    #[test]
    fn test_lock_all_skips_empty_and_dupes() {
        let table = MonitorTable::new();
        let a = Addr::new(1, 1);
        let set = table.lock_all(&[a, Addr::EMPTY, a, Addr::new(1, 2)], LockMode::Write);
        assert!(set.contains(a));
        assert!(!set.contains(Addr::EMPTY));
        assert!(table.try_lock(a, LockMode::Read, 1).is_none());
        drop(set);
        assert!(table.is_empty());
    }

    #[test]
    fn test_opposite_address_orders_do_not_deadlock() {
        let table = Arc::new(MonitorTable::new());
        let a = Addr::new(1, 1);
        let b = Addr::new(1, 2);

        let t1 = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let _set = table.lock_all(&[a, b], LockMode::Write);
                }
            })
        };
        let t2 = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    let _set = table.lock_all(&[b, a], LockMode::Write);
                }
            })
        };
        t1.join().unwrap();
        t2.join().unwrap();
        assert!(table.is_empty());
    }
}
