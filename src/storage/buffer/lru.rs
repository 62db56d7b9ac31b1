use std::hash::Hash;

use linked_hash_map::LinkedHashMap;

/// Keyed LRU cache: a hash index over an access-ordered list. The front of
/// the list is the least-recently-used entry.
pub struct LruCache<K: Eq + Hash, V> {
    items: LinkedHashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new() -> Self {
        Self {
            items: LinkedHashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up `key`, moving the entry to the MRU end on a hit.
    pub fn get_refresh(&mut self, key: &K) -> Option<&V> {
        self.items.get_refresh(key).map(|v| &*v)
    }

    /// Peek without disturbing the access order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.items.get(key)
    }

    /// Insert at the MRU end, replacing and repositioning an existing entry.
    pub fn put(&mut self, key: K, value: V) {
        self.items.remove(&key);
        self.items.insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.items.remove(key)
    }

    /// Evict and return the LRU entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        self.items.pop_front()
    }

    /// Iterate from the LRU end towards the MRU end.
    pub fn iter_lru(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items.iter()
    }

    /// Iterate from the MRU end towards the LRU end.
    pub fn iter_mru(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items.iter().rev()
    }
}

impl<K: Eq + Hash + Clone, V> Default for LruCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_refresh_moves_to_mru() {
        let mut cache = LruCache::new();
        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(3, "c");

        assert_eq!(cache.get_refresh(&1), Some(&"a"));

        // 2 is now the LRU entry
        assert_eq!(cache.pop_lru(), Some((2, "b")));
        assert_eq!(cache.pop_lru(), Some((3, "c")));
        assert_eq!(cache.pop_lru(), Some((1, "a")));
        assert_eq!(cache.pop_lru(), None);
    }

    #[test]
    fn test_put_existing_repositions() {
        let mut cache = LruCache::new();
        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(1, "a2");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.pop_lru(), Some((2, "b")));
        assert_eq!(cache.pop_lru(), Some((1, "a2")));
    }

    #[test]
    fn test_iter_lru_order() {
        let mut cache = LruCache::new();
        cache.put(1, ());
        cache.put(2, ());
        cache.put(3, ());
        cache.get_refresh(&2);

        let order: Vec<i32> = cache.iter_lru().map(|(&k, _)| k).collect();
        assert_eq!(order, vec![1, 3, 2]);

        let rev: Vec<i32> = cache.iter_mru().map(|(&k, _)| k).collect();
        assert_eq!(rev, vec![2, 3, 1]);
    }

    #[test]
    fn test_remove() {
        let mut cache = LruCache::new();
        cache.put(1, "a");
        assert_eq!(cache.remove(&1), Some("a"));
        assert_eq!(cache.remove(&1), None);
        assert!(cache.is_empty());
    }
}
