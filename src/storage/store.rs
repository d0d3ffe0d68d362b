//! The segment store: slot allocation, lookup, locking and incidence lists.
//!
//! Segments are allocated lazily up to `max_segments`. Allocation prefers, in
//! order: the segment cached by the calling thread's active process, segments
//! with released slots, segments handed back by finished processes, the most
//! recently created segment, and finally a brand new segment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::addr::Addr;
use crate::config::MemoryConfig;
use crate::error::{GraphError, GraphResult};
use crate::storage::element::{Element, ElementState};
use crate::storage::segment::Segment;
use crate::sync::{AddrGuard, AddrLockSet, LockMode, MonitorTable};

#[derive(Debug, Default)]
struct Cursors {
    /// Number of segments created so far.
    count: u16,
    /// Segments returned by finished processes with room left.
    not_engaged: Vec<u16>,
    /// Segments whose released list went from empty to non-empty.
    released: Vec<u16>,
}

#[derive(Debug, Default)]
struct Process {
    depth: u32,
    segment: Option<u16>,
}

/// Element counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Live nodes.
    pub nodes: u64,
    /// Live connectors.
    pub connectors: u64,
    /// Live links.
    pub links: u64,
}

impl Stats {
    /// Live elements of every kind.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.nodes + self.connectors + self.links
    }
}

/// Growable, bounded table of segments.
#[derive(Debug)]
pub struct SegmentStore {
    capacity: u16,
    max_segments: u16,
    try_lock_attempts: u32,
    segments: Box<[OnceLock<Arc<Segment>>]>,
    cursors: Mutex<Cursors>,
    processes: Mutex<HashMap<ThreadId, Process>>,
    monitors: MonitorTable,
}

impl SegmentStore {
    /// Creates an empty store sized by `config`.
    #[must_use]
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            capacity: config.segment_capacity.max(2),
            max_segments: config.max_segments.max(1),
            try_lock_attempts: config.try_lock_attempts.max(1),
            segments: (0..config.max_segments.max(1)).map(|_| OnceLock::new()).collect(),
            cursors: Mutex::new(Cursors::default()),
            processes: Mutex::new(HashMap::new()),
            monitors: MonitorTable::new(),
        }
    }

    // Cursor and process tables only hold plain integers.
    fn cursors(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<ThreadId, Process>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The per-address monitor pool.
    #[must_use]
    pub const fn monitors(&self) -> &MonitorTable {
        &self.monitors
    }

    /// Number of segments created so far.
    #[must_use]
    pub fn segments_count(&self) -> u16 {
        self.cursors().count
    }

    /// Slots per segment.
    #[must_use]
    pub const fn segment_capacity(&self) -> u16 {
        self.capacity
    }

    fn segment(&self, seg: u16) -> Option<&Arc<Segment>> {
        let idx = usize::from(seg).checked_sub(1)?;
        self.segments.get(idx)?.get()
    }

    fn create_segment(&self, cursors: &mut Cursors) -> Option<Arc<Segment>> {
        if cursors.count >= self.max_segments {
            return None;
        }
        let num = cursors.count + 1;
        let segment = Arc::new(Segment::new(num, self.capacity));
        let stored = Arc::clone(self.segments[usize::from(num - 1)].get_or_init(|| segment));
        cursors.count = num;
        info!(segment = num, capacity = self.capacity, "allocated segment");
        Some(stored)
    }

    fn pick_segment(&self, skip: Option<u16>) -> GraphResult<Arc<Segment>> {
        let mut cursors = self.cursors();

        while let Some(num) = cursors.released.pop() {
            if let Some(seg) = self.segment(num).filter(|s| s.has_free()) {
                return Ok(Arc::clone(seg));
            }
        }
        while let Some(num) = cursors.not_engaged.pop() {
            if let Some(seg) = self.segment(num).filter(|s| s.has_free()) {
                return Ok(Arc::clone(seg));
            }
        }
        if let Some(last) = self
            .segment(cursors.count)
            .filter(|s| Some(s.num()) != skip && s.has_free())
        {
            return Ok(Arc::clone(last));
        }
        self.create_segment(&mut cursors)
            .ok_or(GraphError::FullMemory {
                max_segments: self.max_segments,
            })
    }

    fn allocation_segment(&self) -> GraphResult<Arc<Segment>> {
        let me = thread::current().id();
        let cached = self.processes().get(&me).and_then(|p| p.segment);
        if let Some(seg) = cached.and_then(|num| self.segment(num)).filter(|s| s.has_free()) {
            return Ok(Arc::clone(seg));
        }

        let segment = self.pick_segment(cached)?;
        if let Some(process) = self.processes().get_mut(&me) {
            process.segment = Some(segment.num());
        }
        Ok(segment)
    }

    /// Allocates a slot and returns its address write-locked.
    ///
    /// The element starts existing, untyped, with one owner reference.
    pub fn append(&self) -> GraphResult<(Addr, AddrGuard<'_>)> {
        loop {
            let segment = self.allocation_segment()?;
            let Some(offset) = segment.take_slot() else {
                // Another thread drained it between the check and the take.
                continue;
            };
            let addr = Addr::new(segment.num(), offset);
            let guard = self.monitors.lock(addr, LockMode::Write);
            segment.update(offset, |el| *el = Element::fresh());
            return Ok((addr, guard));
        }
    }

    fn check_bounds(&self, addr: Addr) -> GraphResult<&Arc<Segment>> {
        if addr.is_empty() || addr.seg == 0 || addr.seg > self.max_segments {
            return Err(GraphError::AddrIsNotValid { addr });
        }
        let segment = self.segment(addr.seg).ok_or(GraphError::NotFound { addr })?;
        if !segment.contains(addr.offset) {
            return Err(GraphError::AddrIsNotValid { addr });
        }
        Ok(segment)
    }

    /// Looks up a live element.
    pub fn resolve(&self, addr: Addr) -> GraphResult<Element> {
        self.resolve_raw(addr)
            .and_then(|el| if el.is_live() { Ok(el) } else { Err(GraphError::NotFound { addr }) })
    }

    /// Looks up an existing element, including one already marked for erasure.
    pub(crate) fn resolve_raw(&self, addr: Addr) -> GraphResult<Element> {
        let segment = self.check_bounds(addr)?;
        segment
            .load(addr.offset)
            .filter(|el| el.state.contains(ElementState::EXISTS))
            .ok_or(GraphError::NotFound { addr })
    }

    /// Mutates an existing element. The caller holds `addr` for write.
    pub(crate) fn update<R>(&self, addr: Addr, f: impl FnOnce(&mut Element) -> R) -> GraphResult<R> {
        let segment = self.check_bounds(addr)?;
        segment
            .update(addr.offset, |el| {
                if el.state.contains(ElementState::EXISTS) {
                    Some(f(el))
                } else {
                    None
                }
            })
            .flatten()
            .ok_or(GraphError::NotFound { addr })
    }

    /// Blocks until `addr` is held in `mode`.
    pub fn lock(&self, addr: Addr, mode: LockMode) -> AddrGuard<'_> {
        self.monitors.lock(addr, mode)
    }

    /// Tries to hold `addr` with the configured attempt bound.
    pub fn try_lock(&self, addr: Addr, mode: LockMode) -> Option<AddrGuard<'_>> {
        self.monitors.try_lock(addr, mode, self.try_lock_attempts)
    }

    /// Holds all `addrs` in ascending monitor order.
    pub fn lock_all(&self, addrs: &[Addr], mode: LockMode) -> AddrLockSet<'_> {
        self.monitors.lock_all(addrs, mode)
    }

    /// Adds a reference to a live element and returns the new count.
    pub fn ref_element(&self, addr: Addr) -> GraphResult<u32> {
        let _guard = self.lock(addr, LockMode::Write);
        self.resolve(addr)?;
        self.update(addr, |el| {
            el.ref_count += 1;
            el.ref_count
        })
    }

    /// Drops a reference. Returns true if this released the slot.
    ///
    /// Unref of an already released slot is an error.
    pub fn unref(&self, addr: Addr) -> GraphResult<bool> {
        let _guard = self.lock(addr, LockMode::Write);
        self.unref_locked(addr)
    }

    pub(crate) fn unref_locked(&self, addr: Addr) -> GraphResult<bool> {
        let remaining = self.update(addr, |el| {
            el.ref_count = el.ref_count.saturating_sub(1);
            el.ref_count
        })?;
        if remaining > 0 {
            return Ok(false);
        }
        self.release(addr)?;
        Ok(true)
    }

    fn release(&self, addr: Addr) -> GraphResult<()> {
        let segment = Arc::clone(self.check_bounds(addr)?);
        if segment.release_slot(addr.offset) {
            self.cursors().released.push(segment.num());
        }
        debug!(%addr, "released slot");
        Ok(())
    }

    /// Marks the calling thread as running a unit of work that allocates
    /// from its own segment. Nested calls are counted.
    pub fn begin_process(&self) {
        self.processes()
            .entry(thread::current().id())
            .or_default()
            .depth += 1;
    }

    /// Ends the calling thread's process; the outermost call hands its
    /// segment back for reuse.
    pub fn end_process(&self) {
        let me = thread::current().id();
        let mut processes = self.processes();
        let Some(process) = processes.get_mut(&me) else {
            return;
        };
        process.depth = process.depth.saturating_sub(1);
        if process.depth > 0 {
            return;
        }
        let segment = process.segment;
        processes.remove(&me);
        drop(processes);

        if let Some(num) = segment.filter(|&n| self.segment(n).is_some_and(|s| s.has_free())) {
            self.cursors().not_engaged.push(num);
        }
    }

    /// Process depth of the calling thread.
    #[must_use]
    pub fn process_depth(&self) -> u32 {
        self.processes()
            .get(&thread::current().id())
            .map_or(0, |p| p.depth)
    }

    // ------------------------------------------------------------------
    // Incidence lists
    // ------------------------------------------------------------------

    /// Splices `conn` at the head of its begin's outgoing list and its end's
    /// incoming list.
    ///
    /// The list heads are read first and the whole neighbourhood is then
    /// locked as one ordered set; if a head moved in between, the attempt is
    /// retried.
    pub(crate) fn link_connector(&self, conn: Addr) -> GraphResult<()> {
        loop {
            let info = self.resolve_raw(conn)?;
            let (begin, end) = (info.begin, info.end);
            let out_head = self.resolve(begin)?.first_out;
            let in_head = self.resolve(end)?.first_in;

            let _set = self.lock_all(&[conn, begin, end, out_head, in_head], LockMode::Write);
            if self.resolve(begin)?.first_out != out_head || self.resolve(end)?.first_in != in_head {
                continue;
            }

            self.update(conn, |el| {
                el.prev_out = Addr::EMPTY;
                el.next_out = out_head;
                el.prev_in = Addr::EMPTY;
                el.next_in = in_head;
            })?;
            if !out_head.is_empty() {
                self.update(out_head, |el| el.prev_out = conn)?;
            }
            if !in_head.is_empty() {
                self.update(in_head, |el| el.prev_in = conn)?;
            }
            self.update(begin, |el| {
                el.first_out = conn;
                el.out_count += 1;
            })?;
            self.update(end, |el| {
                el.first_in = conn;
                el.in_count += 1;
            })?;
            return Ok(());
        }
    }

    /// Removes `conn` from both lists it is threaded through.
    pub(crate) fn unlink_connector(&self, conn: Addr) -> GraphResult<()> {
        loop {
            let seen = self.resolve_raw(conn)?;
            let lock_set = [
                conn,
                seen.begin,
                seen.end,
                seen.prev_out,
                seen.next_out,
                seen.prev_in,
                seen.next_in,
            ];
            let _set = self.lock_all(&lock_set, LockMode::Write);

            let el = self.resolve_raw(conn)?;
            if (el.prev_out, el.next_out, el.prev_in, el.next_in)
                != (seen.prev_out, seen.next_out, seen.prev_in, seen.next_in)
            {
                continue;
            }

            if el.prev_out.is_empty() {
                self.patch(el.begin, |b| b.first_out = el.next_out)?;
            } else {
                self.patch(el.prev_out, |p| p.next_out = el.next_out)?;
            }
            if !el.next_out.is_empty() {
                self.patch(el.next_out, |n| n.prev_out = el.prev_out)?;
            }
            if el.prev_in.is_empty() {
                self.patch(el.end, |e| e.first_in = el.next_in)?;
            } else {
                self.patch(el.prev_in, |p| p.next_in = el.next_in)?;
            }
            if !el.next_in.is_empty() {
                self.patch(el.next_in, |n| n.prev_in = el.prev_in)?;
            }
            self.patch(el.begin, |b| b.out_count = b.out_count.saturating_sub(1))?;
            self.patch(el.end, |e| e.in_count = e.in_count.saturating_sub(1))?;
            self.update(conn, |c| {
                c.prev_out = Addr::EMPTY;
                c.next_out = Addr::EMPTY;
                c.prev_in = Addr::EMPTY;
                c.next_in = Addr::EMPTY;
            })?;
            return Ok(());
        }
    }

    /// Like `update`, but a neighbour already released by a concurrent erase
    /// is skipped.
    fn patch(&self, addr: Addr, f: impl FnOnce(&mut Element)) -> GraphResult<()> {
        match self.update(addr, f) {
            Ok(()) | Err(GraphError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Connectors leaving `addr`, most recent first.
    pub fn outgoing(&self, addr: Addr) -> GraphResult<Vec<Addr>> {
        let _guard = self.lock(addr, LockMode::Read);
        let head = self.resolve_raw(addr)?;
        let mut out = Vec::with_capacity(head.out_count as usize);
        let mut cur = head.first_out;
        while !cur.is_empty() {
            out.push(cur);
            cur = self.resolve_raw(cur)?.next_out;
        }
        Ok(out)
    }

    /// Connectors entering `addr`, most recent first.
    pub fn incoming(&self, addr: Addr) -> GraphResult<Vec<Addr>> {
        let _guard = self.lock(addr, LockMode::Read);
        let head = self.resolve_raw(addr)?;
        let mut out = Vec::with_capacity(head.in_count as usize);
        let mut cur = head.first_in;
        while !cur.is_empty() {
            out.push(cur);
            cur = self.resolve_raw(cur)?.next_in;
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Whole-store views
    // ------------------------------------------------------------------

    fn created_segments(&self) -> Vec<Arc<Segment>> {
        let count = self.segments_count();
        (1..=count).filter_map(|n| self.segment(n).cloned()).collect()
    }

    /// Live element counts by class.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        for segment in self.created_segments() {
            for (_, el) in segment.live_elements() {
                if el.ty.is_connector() {
                    stats.connectors += 1;
                } else if el.ty.is_link() {
                    stats.links += 1;
                } else if el.ty.is_node() {
                    stats.nodes += 1;
                }
            }
        }
        stats
    }

    /// Every live element with its address.
    #[must_use]
    pub fn live_elements(&self) -> Vec<(Addr, Element)> {
        self.created_segments()
            .iter()
            .flat_map(|segment| {
                let num = segment.num();
                segment
                    .live_elements()
                    .into_iter()
                    .map(move |(offset, el)| (Addr::new(num, offset), el))
            })
            .collect()
    }

    /// Loads elements at fixed addresses into an empty store.
    pub(crate) fn restore(&self, records: &[(Addr, Element)]) -> GraphResult<()> {
        if self.segments_count() != 0 {
            return Err(GraphError::invalid_state("restore into a non-empty store"));
        }
        let top = records.iter().map(|(a, _)| a.seg).max().unwrap_or(0);
        if top > self.max_segments {
            return Err(GraphError::FullMemory {
                max_segments: self.max_segments,
            });
        }
        {
            let mut cursors = self.cursors();
            while cursors.count < top {
                self.create_segment(&mut cursors);
            }
        }
        for (addr, el) in records {
            let segment = self.check_bounds(*addr)?;
            segment.restore(addr.offset, *el);
        }
        for segment in self.created_segments() {
            if segment.rebuild_released() {
                self.cursors().released.push(segment.num());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use crate::types::ElementType;
    use proptest::prelude::*;

    fn small_store(max_segments: u16, capacity: u16) -> SegmentStore {
        SegmentStore::new(&MemoryConfig {
            max_segments,
            segment_capacity: capacity,
            ..MemoryConfig::default()
        })
    }

    fn node(store: &SegmentStore) -> Addr {
        let (addr, _guard) = store.append().unwrap();
        store.update(addr, |el| el.ty = ElementType::CONST_NODE).unwrap();
        addr
    }

    fn connect(store: &SegmentStore, begin: Addr, end: Addr) -> Addr {
        let (addr, guard) = store.append().unwrap();
        store
            .update(addr, |el| {
                el.ty = ElementType::CONST_POS_ARC;
                el.begin = begin;
                el.end = end;
            })
            .unwrap();
        drop(guard);
        store.link_connector(addr).unwrap();
        addr
    }

    #[test]
    fn test_append_resolve_unref() {
        let store = small_store(2, 16);
        let addr = node(&store);
        assert_eq!(store.resolve(addr).unwrap().ty, ElementType::CONST_NODE);
        assert!(store.unref(addr).unwrap());
        assert_eq!(store.resolve(addr).unwrap_err().code(), ResultCode::NotFound);
        assert_eq!(store.unref(addr).unwrap_err().code(), ResultCode::NotFound);
    }

    #[test]
    fn test_ref_balances_unref() {
        let store = small_store(1, 8);
        let addr = node(&store);
        assert_eq!(store.ref_element(addr).unwrap(), 2);
        assert_eq!(store.ref_element(addr).unwrap(), 3);
        assert!(!store.unref(addr).unwrap());
        assert!(!store.unref(addr).unwrap());
        assert!(store.resolve(addr).is_ok());
        assert!(store.unref(addr).unwrap());
        assert!(store.resolve(addr).is_err());
    }

    #[test]
    fn test_invalid_addresses() {
        let store = small_store(2, 4);
        assert_eq!(
            store.resolve(Addr::EMPTY).unwrap_err().code(),
            ResultCode::AddrIsNotValid
        );
        assert_eq!(
            store.resolve(Addr::new(3, 1)).unwrap_err().code(),
            ResultCode::AddrIsNotValid
        );
        assert_eq!(
            store.resolve(Addr::new(1, 1)).unwrap_err().code(),
            ResultCode::NotFound
        );
        node(&store);
        assert_eq!(
            store.resolve(Addr::new(1, 9)).unwrap_err().code(),
            ResultCode::AddrIsNotValid
        );
    }

    #[test]
    fn test_segments_grow_then_exhaust() {
        let store = small_store(2, 2);
        for _ in 0..4 {
            node(&store);
        }
        assert_eq!(store.segments_count(), 2);
        let err = store.append().map(|(a, _)| a).unwrap_err();
        assert_eq!(err.code(), ResultCode::FullMemory);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_released_slots_reused_before_growth() {
        let store = small_store(2, 2);
        let a = node(&store);
        node(&store);
        store.unref(a).unwrap();
        let c = node(&store);
        assert_eq!(c, a);
        assert_eq!(store.segments_count(), 1);
    }

    #[test]
    fn test_process_segment_returned() {
        let store = small_store(4, 8);
        store.begin_process();
        store.begin_process();
        assert_eq!(store.process_depth(), 2);
        let a = node(&store);
        store.end_process();
        let b = node(&store);
        assert_eq!(a.seg, b.seg);
        store.end_process();
        assert_eq!(store.process_depth(), 0);
    }

    #[test]
    fn test_incidence_lists() {
        let store = small_store(1, 32);
        let a = node(&store);
        let b = node(&store);
        let c = node(&store);
        let ab = connect(&store, a, b);
        let ac = connect(&store, a, c);
        let cb = connect(&store, c, b);

        assert_eq!(store.outgoing(a).unwrap(), vec![ac, ab]);
        assert_eq!(store.incoming(b).unwrap(), vec![cb, ab]);
        assert_eq!(store.resolve(a).unwrap().out_count, 2);

        store.unlink_connector(ab).unwrap();
        assert_eq!(store.outgoing(a).unwrap(), vec![ac]);
        assert_eq!(store.incoming(b).unwrap(), vec![cb]);
        assert_eq!(store.resolve(b).unwrap().in_count, 1);

        store.unlink_connector(cb).unwrap();
        assert!(store.incoming(b).unwrap().is_empty());
    }

    #[test]
    fn test_self_loop_links_both_lists() {
        let store = small_store(1, 8);
        let a = node(&store);
        let aa = connect(&store, a, a);
        assert_eq!(store.outgoing(a).unwrap(), vec![aa]);
        assert_eq!(store.incoming(a).unwrap(), vec![aa]);
        store.unlink_connector(aa).unwrap();
        let el = store.resolve(a).unwrap();
        assert_eq!((el.out_count, el.in_count), (0, 0));
    }

    #[test]
    fn test_stats_and_restore() {
        let store = small_store(2, 4);
        let a = node(&store);
        let b = node(&store);
        let gone = node(&store);
        connect(&store, a, b);
        store.unref(gone).unwrap();

        let stats = store.stats();
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.connectors, 1);

        let records = store.live_elements();
        let copy = small_store(2, 4);
        copy.restore(&records).unwrap();
        assert_eq!(copy.stats(), stats);
        assert_eq!(copy.outgoing(a).unwrap().len(), 1);
        // The gap left by the unref'd node is reused.
        let (reused, _) = copy.append().unwrap();
        assert!(reused == gone || reused.offset == 4);
    }

    #[test]
    fn test_try_lock_gives_up() {
        let store = small_store(1, 4);
        let a = node(&store);
        let held = store.lock(a, LockMode::Write);
        assert!(store.try_lock(a, LockMode::Read).is_none());
        drop(held);
        assert!(store.try_lock(a, LockMode::Read).is_some());
    }

    proptest! {
        #[test]
        fn prop_refs_balance_unrefs(extra in 0u32..32) {
            let store = small_store(1, 8);
            let addr = node(&store);
            for _ in 0..extra {
                store.ref_element(addr).unwrap();
            }
            for _ in 0..extra {
                prop_assert!(!store.unref(addr).unwrap());
                prop_assert!(store.resolve(addr).is_ok());
            }
            prop_assert!(store.unref(addr).unwrap());
            prop_assert!(store.resolve(addr).is_err());
            prop_assert!(store.unref(addr).is_err());
        }
    }
}
