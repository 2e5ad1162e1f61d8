use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};

/// Concurrent table of registered entries, keyed by a unique integer assigned on insertion.
///
/// Each entry is shared behind an `Arc` and carries its own locking; the table itself only
/// guards membership. Insertion fails once `capacity` entries are present.
pub struct Registry<T> {
    entries: DashMap<usize, Arc<T>>,
    // Entries present or being inserted
    count: AtomicUsize,
    next_key: AtomicUsize,
    capacity: usize,
}

impl<T> Registry<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            next_key: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Allocates a key, builds the entry from it and inserts it.
    pub fn insert_with<F>(&self, make: F) -> Result<Arc<T>>
    where
        F: FnOnce(usize) -> T,
    {
        let capacity = self.capacity;

        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < capacity {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map_err(|_| Error::CapacityExceeded { max: capacity })?;

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        let entry = Arc::new(make(key));

        self.entries.insert(key, Arc::clone(&entry));

        Ok(entry)
    }

    pub fn get(&self, key: usize) -> Option<Arc<T>> {
        self.entries.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, key: usize) -> Option<Arc<T>> {
        let (_, entry) = self.entries.remove(&key)?;

        self.count.fetch_sub(1, Ordering::AcqRel);

        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns every entry present at the time of the call.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique() {
        let registry = Registry::new(8);

        let a = registry.insert_with(|key| key).unwrap();
        let b = registry.insert_with(|key| key).unwrap();

        assert_ne!(*a, *b);
        assert_eq!(registry.len(), 2);
        assert_eq!(*registry.get(*a).unwrap(), *a);
        assert_eq!(*registry.get(*b).unwrap(), *b);
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = Registry::new(2);

        let first = registry.insert_with(|key| key).unwrap();
        registry.insert_with(|key| key).unwrap();

        assert!(matches!(
            registry.insert_with(|key| key),
            Err(Error::CapacityExceeded { max: 2 })
        ));
        assert_eq!(registry.len(), 2);

        // Removal frees a slot, and keys are never reused
        registry.remove(*first).unwrap();
        let third = registry.insert_with(|key| key).unwrap();

        assert_ne!(*third, *first);
        assert!(registry.get(*first).is_none());
    }

    #[test]
    fn remove_missing_is_noop() {
        let registry = Registry::<usize>::new(1);

        assert!(registry.remove(42).is_none());

        // The failed removal must not free capacity
        registry.insert_with(|key| key).unwrap();
        assert!(registry.insert_with(|key| key).is_err());
    }

    #[test]
    fn snapshot_sees_all_entries() {
        let registry = Registry::new(16);

        for _ in 0..5 {
            registry.insert_with(|key| key * 10).unwrap();
        }

        let mut values = registry
            .snapshot()
            .iter()
            .map(|entry| **entry)
            .collect::<Vec<_>>();
        values.sort();

        assert_eq!(values, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn concurrent_inserts_respect_capacity() {
        let registry = Arc::new(Registry::new(10));

        let threads = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| registry.insert_with(|key| key).is_ok())
                        .count()
                })
            })
            .collect::<Vec<_>>();

        let inserted: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();

        assert_eq!(inserted, 10);
        assert_eq!(registry.len(), 10);
    }
}
