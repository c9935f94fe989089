//! Native object handles and the table that hands them out.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Transient handle of a driver object.
///
/// Handles are recycled as soon as their object dies, so two unrelated objects
/// can carry the same value at different times. Identity across a release
/// must go through a `ResourceId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

struct Slot<T> {
    object: T,
    refs: u32,
}

/// Reference-counted object table with lowest-first handle reuse.
pub(crate) struct HandleTable<T> {
    slots: HashMap<u64, Slot<T>>,
    free: BTreeSet<u64>,
    next: u64,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            free: BTreeSet::new(),
            next: 1,
        }
    }

    /// Stores an object with one reference and returns its handle.
    pub fn insert(&mut self, object: T) -> NativeHandle {
        let raw = match self.free.pop_first() {
            Some(raw) => raw,
            None => {
                let raw = self.next;
                self.next += 1;
                raw
            }
        };
        self.slots.insert(raw, Slot { object, refs: 1 });
        NativeHandle(raw)
    }

    pub fn get(&self, handle: NativeHandle) -> Option<&T> {
        self.slots.get(&handle.0).map(|slot| &slot.object)
    }

    pub fn get_mut(&mut self, handle: NativeHandle) -> Option<&mut T> {
        self.slots.get_mut(&handle.0).map(|slot| &mut slot.object)
    }

    pub fn add_ref(&mut self, handle: NativeHandle) -> bool {
        match self.slots.get_mut(&handle.0) {
            Some(slot) => {
                slot.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one reference. Returns the object once the last one is gone.
    pub fn release(&mut self, handle: NativeHandle) -> Option<T> {
        let slot = self.slots.get_mut(&handle.0)?;
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return None;
        }
        let slot = self.slots.remove(&handle.0)?;
        self.free.insert(handle.0);
        Some(slot.object)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_handles_are_reused_lowest_first() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        let c = table.insert("c");
        assert!(table.release(c).is_some());
        assert!(table.release(a).is_some());
        assert_eq!(table.insert("d"), a);
        assert_eq!(table.insert("e"), c);
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_add_ref_delays_release() {
        let mut table = HandleTable::new();
        let a = table.insert(1u32);
        assert!(table.add_ref(a));
        assert!(table.release(a).is_none());
        assert_eq!(table.get(a), Some(&1));
        assert_eq!(table.release(a), Some(1));
        assert!(table.get(a).is_none());
        assert!(table.release(a).is_none());
    }
}
