use slab::Slab;

/// [`Slab`] with a capacity fixed at creation time.
///
/// The ring uses slab keys as completion user_data, so the slab must never
/// reallocate while operations are in flight; a bounded slab also doubles as
/// the in-flight operation limit.
pub struct FixedSlab<T> {
    slab: Slab<T>,
    capacity: usize,
}

impl<T> FixedSlab<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Insert `value` and return its key.
    ///
    /// Panics when the slab is full; callers are expected to check `len()`
    /// against `capacity()` (or reserve up front) before inserting.
    pub fn insert(&mut self, value: T) -> usize {
        assert!(self.slab.len() < self.capacity, "fixed slab overflow");
        self.slab.insert(value)
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        self.slab.get(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        self.slab.get_mut(key)
    }

    pub fn contains(&self, key: usize) -> bool {
        self.slab.contains(key)
    }

    pub fn try_remove(&mut self, key: usize) -> Option<T> {
        self.slab.try_remove(key)
    }

    pub fn remove(&mut self, key: usize) -> T {
        self.slab.remove(key)
    }
}
