//! Insertion-ordered index used by both store backends.

use std::collections::{BTreeMap, HashMap};

use super::entry::CacheKey;

/// Per-partition index.  Each key carries the sequence number it was last
/// inserted under; `order` maps sequence numbers back to keys, so iteration
/// over `order` is oldest-first.
#[derive(Debug)]
pub(crate) struct PartitionIndex<V> {
    entries: HashMap<CacheKey, (u64, V)>,
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
    /// Set once the partition has been deleted.  Holders of a stale handle
    /// must not write through it.
    pub(crate) removed: bool,
}

impl<V> Default for PartitionIndex<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            removed: false,
        }
    }
}

impl<V> PartitionIndex<V> {
    pub(crate) fn get(&self, key: &CacheKey) -> Option<&V> {
        self.entries.get(key).map(|(_, v)| v)
    }

    /// Sequence number the next insert will receive.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Insert `value` at the newest position, replacing any previous entry
    /// for `key`.  Returns the replaced value.
    pub(crate) fn insert(&mut self, key: CacheKey, value: V) -> Option<V> {
        let seq = self.next_seq;
        self.insert_at(seq, key, value)
    }

    /// Insert with an explicit sequence number (used when reloading a
    /// persisted partition).
    pub(crate) fn insert_at(&mut self, seq: u64, key: CacheKey, value: V) -> Option<V> {
        self.next_seq = self.next_seq.max(seq + 1);
        let previous = self.entries.insert(key.clone(), (seq, value));
        if let Some((old_seq, _)) = &previous {
            self.order.remove(old_seq);
        }
        self.order.insert(seq, key);
        previous.map(|(_, v)| v)
    }

    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<V> {
        let (seq, value) = self.entries.remove(key)?;
        self.order.remove(&seq);
        Some(value)
    }

    /// Remove the oldest entries until at most `limit` remain.  Returns the
    /// removed entries, oldest first.
    pub(crate) fn trim_oldest(&mut self, limit: usize) -> Vec<(CacheKey, V)> {
        let mut trimmed = Vec::with_capacity(self.entries.len().saturating_sub(limit));
        while self.entries.len() > limit {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some((_, value)) = self.entries.remove(&key) {
                trimmed.push((key, value));
            }
        }
        trimmed
    }

    /// Keys, oldest first.
    pub(crate) fn keys(&self) -> Vec<CacheKey> {
        self.order.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> CacheKey {
        CacheKey::get(path).unwrap()
    }

    #[test]
    fn replace_moves_key_to_newest() {
        let mut index = PartitionIndex::default();
        index.insert(key("/a"), 1);
        index.insert(key("/b"), 2);
        assert_eq!(index.insert(key("/a"), 3), Some(1));
        assert_eq!(index.keys(), vec![key("/b"), key("/a")]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&key("/a")), Some(&3));
    }

    #[test]
    fn insert_at_advances_sequence() {
        let mut index = PartitionIndex::default();
        index.insert_at(41, key("/old"), ());
        assert_eq!(index.next_seq(), 42);
        index.insert(key("/new"), ());
        assert_eq!(index.keys(), vec![key("/old"), key("/new")]);
    }

    #[test]
    fn remove_clears_order() {
        let mut index = PartitionIndex::default();
        index.insert(key("/a"), ());
        assert!(index.remove(&key("/a")).is_some());
        assert!(index.remove(&key("/a")).is_none());
        assert!(index.keys().is_empty());
    }

    #[test]
    fn trim_oldest_drops_the_excess() {
        let mut index = PartitionIndex::default();
        index.insert(key("/a"), 1);
        index.insert(key("/b"), 2);
        index.insert(key("/c"), 3);
        index.insert(key("/a"), 4);

        let trimmed = index.trim_oldest(2);
        assert_eq!(trimmed, vec![(key("/b"), 2)]);
        assert_eq!(index.keys(), vec![key("/c"), key("/a")]);

        assert!(index.trim_oldest(5).is_empty());
        assert_eq!(index.trim_oldest(0).len(), 2);
        assert_eq!(index.len(), 0);
        assert!(index.keys().is_empty());
    }
}
