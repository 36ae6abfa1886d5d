//! Stable storage for `Job` values, keyed by `JobId`. The `RunQueue` only
//! ever holds ids; this is the one place a `Job` is actually owned, so
//! nothing in the scheduler aliases a raw pointer or index into a moving
//! collection (spec.md §9's "pointer-threaded nodes -> owned collection +
//! index/handle" redesign). Adapted from the reference `SimpleMap`, a
//! `Vec<Option<V>>` keyed by small dense integers rather than a hash map.

use std::ops::{Index, IndexMut};

use crate::JobId;

#[derive(Default)]
pub struct JobTable<V> {
    inner: Vec<Option<V>>,
}

impl<V> JobTable<V> {
    pub fn new() -> Self {
        Self { inner: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    fn index_of(id: JobId) -> usize {
        id as usize
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.inner
            .get(Self::index_of(id))
            .is_some_and(Option::is_some)
    }

    /// Inserts `v` under `id`, growing the backing vector as needed.
    /// Returns the previous value, if `id` was already occupied.
    pub fn insert(&mut self, id: JobId, v: V) -> Option<V> {
        let idx = Self::index_of(id);
        if idx >= self.inner.len() {
            self.inner.resize_with(idx + 1, || None);
        }
        self.inner[idx].replace(v)
    }

    pub fn remove(&mut self, id: JobId) -> Option<V> {
        self.inner.get_mut(Self::index_of(id)).and_then(Option::take)
    }

    pub fn get(&self, id: JobId) -> Option<&V> {
        self.inner.get(Self::index_of(id)).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut V> {
        self.inner.get_mut(Self::index_of(id)).and_then(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.inner.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.iter().filter_map(Option::as_ref)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.inner.iter_mut().filter_map(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobId, &V)> {
        self.inner
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (i as JobId, v)))
    }
}

impl<V> Index<JobId> for JobTable<V> {
    type Output = V;

    fn index(&self, id: JobId) -> &Self::Output {
        self.get(id).expect("no job found for id")
    }
}

impl<V> IndexMut<JobId> for JobTable<V> {
    fn index_mut(&mut self, id: JobId) -> &mut Self::Output {
        self.get_mut(id).expect("no job found for id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trips() {
        let mut table = JobTable::new();
        table.insert(3, "three");
        table.insert(1, "one");
        assert_eq!(table.get(3), Some(&"three"));
        assert_eq!(table.get(1), Some(&"one"));
        assert_eq!(table.get(2), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn remove_clears_the_slot() {
        let mut table = JobTable::new();
        table.insert(5, 42);
        assert_eq!(table.remove(5), Some(42));
        assert_eq!(table.get(5), None);
        assert!(!table.contains(5));
    }

    #[test]
    fn indexing_panics_on_missing_id() {
        let table: JobTable<u8> = JobTable::new();
        let result = std::panic::catch_unwind(|| table[7]);
        assert!(result.is_err());
    }
}
