use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;

/// A copy-on-write map for read-mostly tables: readers get a consistent snapshot without
///  locking, writers clone the map and swap it in atomically, retrying on contention.
pub struct AtomicMap<K, V> {
    map: ArcSwap<FxHashMap<K, V>>,
}
impl<K: Hash + Eq + Clone + Send + Sync, V: Clone + Send + Sync> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone + Send + Sync, V: Clone + Send + Sync> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        AtomicMap {
            map: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.load().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.load().contains_key(key)
    }

    /// a consistent snapshot of the map at the time of the call
    pub fn load(&self) -> Arc<FxHashMap<K, V>> {
        self.map.load_full()
    }

    pub fn values(&self) -> Vec<V> {
        self.map.load().values().cloned().collect()
    }

    /// Applies `f` to a copy of the current map and publishes the result. `f` may be called
    ///  more than once if concurrent updates happen, so it must not have side effects.
    pub fn update(&self, f: impl Fn(&mut FxHashMap<K, V>)) {
        self.map.rcu(|old| {
            let mut map = FxHashMap::clone(old);
            f(&mut map);
            map
        });
    }

    /// Removes and returns the entry for `key`, if there is one
    pub fn remove(&self, key: &K) -> Option<V> {
        let prev = self.map.rcu(|old| {
            let mut map = FxHashMap::clone(old);
            map.remove(key);
            map
        });
        prev.get(key).cloned()
    }
}
