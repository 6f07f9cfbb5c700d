//! Fixed-capacity associative container with insertion-order tracking.
//!
//! `BoundedMap` is the one container behind the result cache, the kernel
//! group table and the context directory. Storage for `capacity` entries is
//! reserved at construction and the map never holds more, so steady-state
//! inserts do not allocate.
//!
//! Two insert flavours cover the two overflow policies used in the crate:
//!
//! - [`BoundedMap::insert_evicting`]: drop the oldest entry (FIFO by
//!   insertion) to make room. Used by the result cache.
//! - [`BoundedMap::try_insert`]: refuse the insert when full. Used by tables
//!   whose entries must never disappear behind the caller's back.
//!
//! Overwriting an existing key counts as a fresh insertion and moves the key
//! to the back of the order list.
//!
//! Entries live in a slot arena threaded by a doubly linked order list, so
//! insert, overwrite, remove and eviction are all O(1). The key index is
//! sized at twice the capacity: removals leave tombstones in the hash table,
//! and with at most half of it live a rehash always happens in place.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded map with FIFO insertion order.
#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    /// Unused slot numbers.
    free: Vec<usize>,
    oldest: Option<usize>,
    newest: Option<usize>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    /// Create an empty map holding at most `capacity` entries.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded map capacity must be greater than 0");
        Self {
            index: HashMap::with_capacity(capacity.saturating_mul(2)),
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            oldest: None,
            newest: None,
            capacity,
        }
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// True when a new key could only be inserted by evicting.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Insert or overwrite, evicting the oldest entry when a new key arrives
    /// at a full map. Returns the evicted entry, if any.
    pub fn insert_evicting(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            self.move_to_back(slot);
            if let Some(node) = self.node_mut(slot) {
                node.value = value;
            }
            return None;
        }

        let evicted = if self.is_full() {
            self.pop_oldest()
        } else {
            None
        };
        self.push_back(key, value);
        evicted
    }

    /// Insert or overwrite without evicting.
    ///
    /// Returns the previous value on overwrite, or gives the entry back as
    /// `Err` when the key is new and the map is full.
    pub fn try_insert(&mut self, key: K, value: V) -> Result<Option<V>, (K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            self.move_to_back(slot);
            return Ok(self
                .node_mut(slot)
                .map(|node| std::mem::replace(&mut node.value, value)));
        }

        if self.is_full() {
            return Err((key, value));
        }
        self.push_back(key, value);
        Ok(None)
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.node(slot).map(|node| &node.value)
    }

    /// Look up a value mutably. Does not change insertion order.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.node_mut(slot).map(|node| &mut node.value)
    }

    /// True when `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.release(slot).map(|(_, value)| value)
    }

    /// Remove and return the oldest entry.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let slot = self.oldest?;
        let (key, value) = self.release(slot)?;
        self.index.remove(&key);
        Some((key, value))
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        std::iter::successors(self.oldest, move |&slot| self.node(slot)?.next)
            .filter_map(move |slot| self.node(slot).map(|node| (&node.key, &node.value)))
    }

    /// Remove every entry, keeping the reserved storage.
    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.free.clear();
        self.free.extend((0..self.capacity).rev());
        self.oldest = None;
        self.newest = None;
    }

    fn node(&self, slot: usize) -> Option<&Node<K, V>> {
        self.slots.get(slot)?.as_ref()
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<K, V>> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Place a new key in a free slot at the back of the order list.
    /// The caller has made room.
    fn push_back(&mut self, key: K, value: V) {
        let Some(slot) = self.free.pop() else {
            return;
        };
        self.index.insert(key.clone(), slot);
        if let Some(cell) = self.slots.get_mut(slot) {
            *cell = Some(Node {
                key,
                value,
                prev: None,
                next: None,
            });
        }
        self.link_back(slot);
    }

    /// Unlink `slot` and return its entry to the caller. The index is left
    /// to the caller.
    fn release(&mut self, slot: usize) -> Option<(K, V)> {
        self.unlink(slot);
        let node = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        Some((node.key, node.value))
    }

    fn move_to_back(&mut self, slot: usize) {
        if self.newest != Some(slot) {
            self.unlink(slot);
            self.link_back(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let Some(node) = self.node_mut(slot) else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());

        match prev.and_then(|p| self.node_mut(p)) {
            Some(prev_node) => prev_node.next = next,
            None => self.oldest = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(next_node) => next_node.prev = prev,
            None => self.newest = prev,
        }
    }

    fn link_back(&mut self, slot: usize) {
        let newest = self.newest;
        if let Some(node) = self.node_mut(slot) {
            node.prev = newest;
            node.next = None;
        }
        match newest.and_then(|n| self.node_mut(n)) {
            Some(newest_node) => newest_node.next = Some(slot),
            None => self.oldest = Some(slot),
        }
        self.newest = Some(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_evicting_is_fifo() {
        let mut map = BoundedMap::with_capacity(2);
        assert!(map.insert_evicting(1u64, "a").is_none());
        assert!(map.insert_evicting(2, "b").is_none());
        assert_eq!(map.insert_evicting(3, "c"), Some((1, "a")));
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_overwrite_refreshes_position() {
        let mut map = BoundedMap::with_capacity(2);
        map.insert_evicting(1u64, "a");
        map.insert_evicting(2, "b");
        // Re-saving 1 makes 2 the oldest
        assert!(map.insert_evicting(1, "a2").is_none());
        assert_eq!(map.insert_evicting(3, "c"), Some((2, "b")));
        assert_eq!(map.get(&1), Some(&"a2"));
    }

    #[test]
    fn test_access_does_not_change_order() {
        let mut map = BoundedMap::with_capacity(2);
        map.insert_evicting(1u64, 10);
        map.insert_evicting(2, 20);
        *map.get_mut(&1).unwrap() += 1;
        let _ = map.get(&1);
        assert_eq!(map.insert_evicting(3, 30), Some((1, 11)));
    }

    #[test]
    fn test_try_insert_refuses_when_full() {
        let mut map = BoundedMap::with_capacity(1);
        assert_eq!(map.try_insert(7i32, 'x'), Ok(None));
        assert_eq!(map.try_insert(8, 'y'), Err((8, 'y')));
        assert_eq!(map.try_insert(7, 'z'), Ok(Some('x')));
        assert!(map.is_full());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut map = BoundedMap::with_capacity(3);
        map.insert_evicting(1u64, ());
        map.insert_evicting(2, ());
        map.insert_evicting(3, ());
        assert_eq!(map.remove(&2), Some(()));
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(map.iter().count(), 2);

        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.capacity(), 3);
        assert!(map.pop_oldest().is_none());

        map.insert_evicting(4, ());
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_remove_from_every_position() {
        for victim in 1..=3u64 {
            let mut map = BoundedMap::with_capacity(3);
            for key in 1..=3u64 {
                map.insert_evicting(key, key * 10);
            }
            assert_eq!(map.remove(&victim), Some(victim * 10));
            map.insert_evicting(9, 90);

            let expected: Vec<u64> = (1..=3).filter(|&k| k != victim).chain([9]).collect();
            assert_eq!(map.keys().copied().collect::<Vec<_>>(), expected);
            assert_eq!(map.pop_oldest().map(|(k, _)| k), expected.first().copied());
        }
    }

    #[test]
    fn test_churn_keeps_reserved_storage() {
        let mut map = BoundedMap::with_capacity(5);
        let index_capacity = map.index.capacity();
        let free_capacity = map.free.capacity();

        for key in 0..10_000u64 {
            map.insert_evicting(key, key);
            if key % 7 == 0 {
                map.remove(&(key - key.min(2)));
            }
            if key % 11 == 0 {
                map.insert_evicting(key, key + 1);
            }
        }

        assert!(map.len() <= 5);
        assert_eq!(map.slots.len(), 5);
        assert_eq!(map.index.capacity(), index_capacity);
        assert_eq!(map.free.capacity(), free_capacity);
        let keys: Vec<u64> = map.keys().copied().collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }
}
