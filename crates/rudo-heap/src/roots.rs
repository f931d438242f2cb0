//! Root enumeration.
//!
//! Roots are supplied by the embedder through [`RootEnumerator`]. The heap
//! asks every registered enumerator for its roots when marking starts and
//! again in the atomic pause, and before each minor collection.
//!
//! [`RootSet`] is a thread-safe table of persistent handles that the heap
//! always registers; it is enough for embedders without their own stack
//! scanning.

use parking_lot::Mutex;

use crate::address::ObjectRef;

/// Receives roots from a [`RootEnumerator`].
pub trait RootVisitor {
    /// Reports one root. Null roots are never reported.
    fn visit_root(&mut self, object: ObjectRef);
}

impl<F: FnMut(ObjectRef)> RootVisitor for F {
    fn visit_root(&mut self, object: ObjectRef) {
        self(object);
    }
}

/// Embedder-provided source of roots.
///
/// Enumeration runs on the thread driving the collection while every other
/// mutator thread is parked at a safepoint.
pub trait RootEnumerator: Send + Sync {
    /// Reports every current root to `visitor`.
    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor);
}

/// Handle to an entry of a [`RootSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(usize);

#[derive(Debug, Default)]
struct RootTable {
    entries: Vec<Option<ObjectRef>>,
    live: Vec<bool>,
    free: Vec<usize>,
}

/// A table of persistent roots.
#[derive(Debug, Default)]
pub struct RootSet {
    table: Mutex<RootTable>,
}

impl RootSet {
    /// Creates an empty root set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root and returns its handle.
    pub fn add(&self, object: Option<ObjectRef>) -> RootHandle {
        let mut table = self.table.lock();
        if let Some(index) = table.free.pop() {
            table.entries[index] = object;
            table.live[index] = true;
            return RootHandle(index);
        }
        table.entries.push(object);
        table.live.push(true);
        RootHandle(table.entries.len() - 1)
    }

    /// Replaces the object held by `handle`.
    ///
    /// # Panics
    ///
    /// Panics if the handle was removed.
    pub fn set(&self, handle: RootHandle, object: Option<ObjectRef>) {
        let mut table = self.table.lock();
        assert!(table.live[handle.0], "root handle used after removal");
        table.entries[handle.0] = object;
    }

    /// Returns the object held by `handle`.
    #[must_use]
    pub fn get(&self, handle: RootHandle) -> Option<ObjectRef> {
        let table = self.table.lock();
        if table.live[handle.0] {
            table.entries[handle.0]
        } else {
            None
        }
    }

    /// Removes a root. Removing twice is a no-op.
    pub fn remove(&self, handle: RootHandle) {
        let mut table = self.table.lock();
        if table.live[handle.0] {
            table.live[handle.0] = false;
            table.entries[handle.0] = None;
            table.free.push(handle.0);
        }
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.entries.len() - table.free.len()
    }

    /// Returns `true` if no handle is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every root.
    pub fn clear(&self) {
        *self.table.lock() = RootTable::default();
    }
}

impl RootEnumerator for RootSet {
    fn enumerate_roots(&self, visitor: &mut dyn RootVisitor) {
        // Copy out so the visitor can run without holding the table lock.
        let roots: Vec<ObjectRef> = self.table.lock().entries.iter().flatten().copied().collect();
        for root in roots {
            visitor.visit_root(root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn obj(raw: usize) -> ObjectRef {
        ObjectRef::from_address(Address::new(raw)).unwrap()
    }

    #[test]
    fn test_add_remove_reuses_handles() {
        let roots = RootSet::new();
        let a = roots.add(Some(obj(0x1000)));
        let b = roots.add(None);
        assert_eq!(roots.len(), 2);
        roots.remove(a);
        roots.remove(a);
        assert_eq!(roots.len(), 1);
        let c = roots.add(Some(obj(0x2000)));
        assert_eq!(c, a);
        assert_eq!(roots.get(c), Some(obj(0x2000)));
        assert_eq!(roots.get(b), None);
    }

    #[test]
    fn test_enumerate_skips_null() {
        let roots = RootSet::new();
        roots.add(Some(obj(0x1000)));
        roots.add(None);
        let h = roots.add(Some(obj(0x3000)));
        roots.set(h, Some(obj(0x4000)));

        let mut seen = Vec::new();
        roots.enumerate_roots(&mut |o: ObjectRef| seen.push(o));
        assert_eq!(seen, vec![obj(0x1000), obj(0x4000)]);
    }
}
