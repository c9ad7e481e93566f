//! Bounded LRU cache of decoded index nodes, keyed by block index.
//!
//! Guarded by its own lock, separate from the tree's main readers/writer
//! lock: a cache-miss load must not hold the writer lock while it reads and
//! decodes a block, so the cache lock is only ever held around the
//! insert/lookup of a decoded node.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::node::IndexNode;

pub struct IndexCache {
    inner: Mutex<LruCache<u32, Arc<IndexNode>>>,
}

impl IndexCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        IndexCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, block_index: u32) -> Option<Arc<IndexNode>> {
        self.inner.lock().get(&block_index).cloned()
    }

    pub fn insert(&self, block_index: u32, node: Arc<IndexNode>) {
        self.inner.lock().put(block_index, node);
    }

    /// Drop any cached entry for `block_index`: called whenever that block
    /// is freed or rewritten during the current transaction.
    pub fn invalidate(&self, block_index: u32) {
        self.inner.lock().pop(&block_index);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_index_node(begin: u32) -> IndexNode {
        IndexNode {
            level: 0,
            begin_pointer: begin,
            entries: Vec::new(),
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let cache = IndexCache::new(2);
        cache.insert(1, Arc::new(leaf_index_node(10)));
        assert_eq!(cache.get(1).unwrap().begin_pointer, 10);
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn invalidate_evicts_entry() {
        let cache = IndexCache::new(2);
        cache.insert(1, Arc::new(leaf_index_node(10)));
        cache.invalidate(1);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = IndexCache::new(1);
        cache.insert(1, Arc::new(leaf_index_node(1)));
        cache.insert(2, Arc::new(leaf_index_node(2)));
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }
}
