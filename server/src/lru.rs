//! Fixed-capacity map with least-recently-used eviction.
//!
//! Entries live in a slab of slots; a hash map finds a key's slot, and the slots
//! are threaded on an intrusive doubly-linked list ordered from most to least
//! recently used. Eviction unlinks the tail and recycles its slot, so the map
//! never grows past `capacity` entries or allocates once warm.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct LruMap<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts or replaces `key` and marks it most recently used.
    ///
    /// Returns the entry evicted to make room, if the map was full.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            if let Some(node) = self.node_mut(slot) {
                node.value = value;
            }
            self.touch(slot);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.pop_lru()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
        evicted
    }

    /// Looks `key` up and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.touch(slot);
        self.node(slot).map(|node| &node.value)
    }

    /// Like [`get`](Self::get), with mutable access.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.touch(slot);
        self.node_mut(slot).map(|node| &mut node.value)
    }

    /// Looks `key` up without changing its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.node(slot).map(|node| &node.value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.release(slot).map(|(_, value)| value)
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let slot = self.tail?;
        let (key, value) = self.release(slot)?;
        self.index.remove(&key);
        Some((key, value))
    }

    /// Removes every entry for which `predicate` returns true and hands them back.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&slot| {
                self.node(slot)
                    .map_or(false, |node| predicate(&node.key, &node.value))
            })
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for slot in doomed {
            if let Some((key, value)) = self.release(slot) {
                self.index.remove(&key);
                removed.push((key, value));
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Entries from most to least recently used.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            map: self,
            cursor: self.head,
        }
    }

    fn node(&self, slot: usize) -> Option<&Node<K, V>> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<K, V>> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    fn touch(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let Some((prev, next)) = self.node(slot).map(|node| (node.prev, node.next)) else {
            return;
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(node) = old_head.and_then(|h| self.node_mut(h)) {
            node.prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    /// Unlinks `slot` and frees it. The caller fixes up `index`.
    fn release(&mut self, slot: usize) -> Option<(K, V)> {
        self.unlink(slot);
        let node = self.nodes.get_mut(slot)?.take()?;
        self.free.push(slot);
        Some((node.key, node.value))
    }
}

pub struct Iter<'a, K, V> {
    map: &'a LruMap<K, V>,
    cursor: Option<usize>,
}

impl<'a, K: Eq + Hash + Clone, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.map.node(self.cursor?)?;
        self.cursor = node.next;
        Some((&node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(map: &LruMap<&'static str, u32>) -> Vec<&'static str> {
        map.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn test_insert_evicts_least_recently_used() {
        let mut map = LruMap::new(2);
        assert_eq!(map.insert("a", 1), None);
        assert_eq!(map.insert("b", 2), None);
        assert_eq!(map.insert("c", 3), Some(("a", 1)));

        assert!(!map.contains_key(&"a"));
        assert!(map.contains_key(&"b"));
        assert!(map.contains_key(&"c"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut map = LruMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.get(&"a"), Some(&1));
        assert_eq!(map.insert("c", 3), Some(("b", 2)));
        assert_eq!(keys(&map), vec!["c", "a"]);
    }

    #[test]
    fn test_peek_does_not_refresh() {
        let mut map = LruMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.peek(&"a"), Some(&1));
        assert_eq!(map.insert("c", 3), Some(("a", 1)));
    }

    #[test]
    fn test_replace_keeps_len_and_refreshes() {
        let mut map = LruMap::new(3);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.insert("a", 10), None);
        assert_eq!(map.len(), 2);
        assert_eq!(keys(&map), vec!["a", "b"]);
        assert_eq!(map.peek(&"a"), Some(&10));
    }

    #[test]
    fn test_remove_recycles_slots() {
        let mut map = LruMap::new(3);
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);
        assert_eq!(map.remove(&"b"), Some(2));
        assert_eq!(map.remove(&"b"), None);
        assert_eq!(keys(&map), vec!["c", "a"]);

        map.insert("d", 4);
        assert_eq!(map.nodes.len(), 3);
        assert_eq!(keys(&map), vec!["d", "c", "a"]);
    }

    #[test]
    fn test_get_mut_and_pop_lru() {
        let mut map = LruMap::new(4);
        map.insert("a", 1);
        map.insert("b", 2);
        if let Some(value) = map.get_mut(&"a") {
            *value += 40;
        }
        assert_eq!(map.pop_lru(), Some(("b", 2)));
        assert_eq!(map.pop_lru(), Some(("a", 41)));
        assert_eq!(map.pop_lru(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_remove_where() {
        let mut map = LruMap::new(8);
        for (i, key) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
            map.insert(key, i as u32);
        }
        let mut removed = map.remove_where(|_, value| value % 2 == 0);
        removed.sort();
        assert_eq!(removed, vec![("a", 0), ("c", 2), ("e", 4)]);
        assert_eq!(keys(&map), vec!["d", "b"]);

        map.insert("f", 5);
        assert_eq!(keys(&map), vec!["f", "d", "b"]);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut map = LruMap::new(0);
        assert_eq!(map.capacity(), 1);
        map.insert("a", 1);
        assert_eq!(map.insert("b", 2), Some(("a", 1)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut map = LruMap::new(2);
        map.insert("a", 1);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        map.insert("b", 2);
        assert_eq!(keys(&map), vec!["b"]);
    }
}
