//! Fixed-capacity slab of element slots.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::storage::element::Element;

#[derive(Debug, Default)]
struct SlotCursor {
    /// Highest offset ever handed out.
    last_engaged: u16,
    /// Released offsets available for reuse, most recent last.
    released: Vec<u16>,
}

/// A segment of `capacity` slots addressed by offsets `1..=capacity`.
///
/// Slot mutexes only make single-field reads and writes sound; they are held
/// for the duration of a copy. Logical exclusion comes from the address
/// monitors.
#[derive(Debug)]
pub struct Segment {
    num: u16,
    slots: Box<[Mutex<Element>]>,
    cursor: Mutex<SlotCursor>,
}

impl Segment {
    /// Creates segment number `num` with `capacity` empty slots.
    #[must_use]
    pub fn new(num: u16, capacity: u16) -> Self {
        Self {
            num,
            slots: (0..capacity).map(|_| Mutex::new(Element::default())).collect(),
            cursor: Mutex::new(SlotCursor::default()),
        }
    }

    /// Segment number (1-based).
    #[must_use]
    pub const fn num(&self) -> u16 {
        self.num
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> u16 {
        // Built from a u16 count.
        u16::try_from(self.slots.len()).unwrap_or(u16::MAX)
    }

    fn cursor(&self) -> MutexGuard<'_, SlotCursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, offset: u16) -> Option<MutexGuard<'_, Element>> {
        let idx = usize::from(offset).checked_sub(1)?;
        self.slots
            .get(idx)
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// True if `offset` addresses a slot of this segment.
    #[must_use]
    pub fn contains(&self, offset: u16) -> bool {
        offset != 0 && usize::from(offset) <= self.slots.len()
    }

    /// Copy of the slot at `offset`.
    #[must_use]
    pub fn load(&self, offset: u16) -> Option<Element> {
        self.slot(offset).map(|el| *el)
    }

    /// Applies `f` to the slot at `offset`.
    pub fn update<R>(&self, offset: u16, f: impl FnOnce(&mut Element) -> R) -> Option<R> {
        self.slot(offset).map(|mut el| f(&mut el))
    }

    /// True if a slot can still be taken.
    #[must_use]
    pub fn has_free(&self) -> bool {
        let cursor = self.cursor();
        cursor.last_engaged < self.capacity() || !cursor.released.is_empty()
    }

    /// Takes a never-used slot, or failing that a released one.
    pub fn take_slot(&self) -> Option<u16> {
        let mut cursor = self.cursor();
        if cursor.last_engaged < self.capacity() {
            cursor.last_engaged += 1;
            return Some(cursor.last_engaged);
        }
        cursor.released.pop()
    }

    /// Resets the slot and queues it for reuse.
    ///
    /// Returns true if the segment had no released slots before this call.
    pub fn release_slot(&self, offset: u16) -> bool {
        if let Some(mut el) = self.slot(offset) {
            *el = Element::default();
        }
        let mut cursor = self.cursor();
        let was_empty = cursor.released.is_empty();
        cursor.released.push(offset);
        was_empty
    }

    /// Writes a restored element into its slot and advances the engaged cursor.
    pub fn restore(&self, offset: u16, element: Element) {
        if let Some(mut el) = self.slot(offset) {
            *el = element;
        }
        let mut cursor = self.cursor();
        cursor.last_engaged = cursor.last_engaged.max(offset);
    }

    /// Rebuilds the released list from empty slots below the engaged cursor.
    pub fn rebuild_released(&self) -> bool {
        let last = self.cursor().last_engaged;
        let released: Vec<u16> = (1..=last)
            .rev()
            .filter(|&offset| self.load(offset).is_some_and(|el| !el.is_live()))
            .collect();
        let any = !released.is_empty();
        self.cursor().released = released;
        any
    }

    /// Copies of every live element with its offset.
    #[must_use]
    pub fn live_elements(&self) -> Vec<(u16, Element)> {
        let last = self.cursor().last_engaged;
        (1..=last)
            .filter_map(|offset| {
                self.load(offset)
                    .filter(Element::is_live)
                    .map(|el| (offset, el))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engaged_slots_before_released() {
        let segment = Segment::new(1, 3);
        assert_eq!(segment.take_slot(), Some(1));
        assert_eq!(segment.take_slot(), Some(2));
        assert!(segment.release_slot(1));
        assert_eq!(segment.take_slot(), Some(3));
        assert_eq!(segment.take_slot(), Some(1));
        assert_eq!(segment.take_slot(), None);
        assert!(!segment.has_free());
    }

    #[test]
    fn test_release_reports_first_free() {
        let segment = Segment::new(2, 4);
        for _ in 0..4 {
            segment.take_slot().unwrap();
        }
        assert!(segment.release_slot(2));
        assert!(!segment.release_slot(3));
        assert!(segment.has_free());
    }

    #[test]
    fn test_offset_bounds() {
        let segment = Segment::new(1, 2);
        assert!(!segment.contains(0));
        assert!(segment.contains(2));
        assert!(!segment.contains(3));
        assert!(segment.load(3).is_none());
        assert!(segment.update(0, |_| ()).is_none());
    }

    #[test]
    fn test_restore_and_rebuild() {
        let segment = Segment::new(1, 8);
        segment.restore(2, Element::fresh());
        segment.restore(5, Element::fresh());
        assert!(segment.rebuild_released());
        let live: Vec<u16> = segment.live_elements().iter().map(|(o, _)| *o).collect();
        assert_eq!(live, vec![2, 5]);
        // Never-engaged slots first, then the gaps.
        assert_eq!(segment.take_slot(), Some(6));
        segment.take_slot();
        segment.take_slot();
        assert_eq!(segment.take_slot(), Some(1));
    }
}
