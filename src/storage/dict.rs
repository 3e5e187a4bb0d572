//! Sharded Concurrent Dictionary
//!
//! The key space is split across a fixed, power-of-two number of shards.
//! Each shard owns a `HashMap` behind its own `RwLock`, so operations on
//! keys living in different shards never contend. Keys are distributed
//! with FNV-1a, masked by the shard count.
//!
//! A shared atomic counter tracks the number of live keys: it is
//! incremented on insertion (never on update) and decremented on removal,
//! which keeps `len()` O(1).
//!
//! In-place mutation of large values goes through [`RefMut`] entry guards
//! which hold the shard's write lock for their lifetime. Multi-key
//! atomicity is not this type's job; see [`super::lock::KeyLocks`].

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;

use crate::storage::glob::GlobPattern;

const FNV_PRIME: u32 = 16777619;
const FNV_OFFSET_BASIS: u32 = 2166136261;

/// FNV-1a over the key bytes.
pub fn fnv32(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in key.as_bytes() {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u32::from(b);
    }
    hash
}

/// Smallest power of two >= `param`, with a floor of 16.
pub fn compute_capacity(param: usize) -> usize {
    if param <= 16 {
        return 16;
    }
    param.next_power_of_two()
}

/// A string-keyed concurrent map with fixed shards.
pub struct ConcurrentDict<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
    count: AtomicU64,
}

impl<V> ConcurrentDict<V> {
    /// Creates a dictionary with at least `capacity` shards, rounded up to
    /// a power of two (minimum 16).
    pub fn new(capacity: usize) -> Self {
        let shard_count = compute_capacity(capacity);
        let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            count: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for a key.
    #[inline]
    pub fn spread(&self, key: &str) -> usize {
        (fnv32(key) as usize) & (self.shards.len() - 1)
    }

    #[inline]
    fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        &self.shards[self.spread(key)]
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a borrowed view of the value, holding the shard read lock.
    pub fn get_ref<'a>(&'a self, key: &'a str) -> Option<Ref<'a, V>> {
        let guard = self.shard(key).read().unwrap();
        if guard.contains_key(key) {
            Some(Ref { guard, key })
        } else {
            None
        }
    }

    /// Returns a mutable view of the value, holding the shard write lock.
    pub fn get_mut<'a>(&'a self, key: &'a str) -> Option<RefMut<'a, V>> {
        let guard = self.shard(key).write().unwrap();
        if guard.contains_key(key) {
            Some(RefMut { guard, key })
        } else {
            None
        }
    }

    /// Returns a mutable view of the value, inserting `default()` first if
    /// the key is absent.
    pub fn get_or_insert_with<'a>(&'a self, key: &'a str, default: impl FnOnce() -> V) -> RefMut<'a, V> {
        let mut guard = self.shard(key).write().unwrap();
        if !guard.contains_key(key) {
            guard.insert(key.to_string(), default());
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        RefMut { guard, key }
    }

    /// Inserts or updates. Returns 1 when a new key was created, 0 on update.
    pub fn put(&self, key: &str, value: V) -> usize {
        let mut guard = self.shard(key).write().unwrap();
        if guard.insert(key.to_string(), value).is_some() {
            0
        } else {
            self.count.fetch_add(1, Ordering::Relaxed);
            1
        }
    }

    /// Inserts only when the key is absent. Returns 1 on insert, 0 otherwise.
    pub fn put_if_absent(&self, key: &str, value: V) -> usize {
        let mut guard = self.shard(key).write().unwrap();
        if guard.contains_key(key) {
            return 0;
        }
        guard.insert(key.to_string(), value);
        self.count.fetch_add(1, Ordering::Relaxed);
        1
    }

    /// Updates only when the key exists. Returns 1 on update, 0 otherwise.
    pub fn put_if_exists(&self, key: &str, value: V) -> usize {
        let mut guard = self.shard(key).write().unwrap();
        if let Some(slot) = guard.get_mut(key) {
            *slot = value;
            1
        } else {
            0
        }
    }

    /// Removes a key, returning its previous value.
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut guard = self.shard(key).write().unwrap();
        let removed = guard.remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shard(key).read().unwrap().contains_key(key)
    }

    /// Iterates every entry, one shard at a time under its read lock.
    /// Returning `false` from the consumer stops the walk.
    pub fn for_each(&self, mut consumer: impl FnMut(&str, &V) -> bool) {
        for shard in &self.shards {
            let guard = shard.read().unwrap();
            for (key, value) in guard.iter() {
                if !consumer(key, value) {
                    return;
                }
            }
        }
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.to_string());
            true
        });
        keys
    }

    /// Removes everything and resets the counter.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().unwrap().clear();
        }
        self.count.store(0, Ordering::Relaxed);
    }

    fn random_key_from_shard(&self, index: usize) -> Option<String> {
        let guard = self.shards[index].read().unwrap();
        if guard.is_empty() {
            return None;
        }
        let nth = rand::thread_rng().gen_range(0..guard.len());
        guard.keys().nth(nth).cloned()
    }

    /// Randomly sampled keys; may contain duplicates.
    pub fn random_keys(&self, limit: usize) -> Vec<String> {
        if limit >= self.len() {
            return self.keys();
        }
        let mut rng = rand::thread_rng();
        let mut result = Vec::with_capacity(limit);
        while result.len() < limit {
            let index = rng.gen_range(0..self.shards.len());
            if let Some(key) = self.random_key_from_shard(index) {
                result.push(key);
            }
        }
        result
    }

    /// Randomly sampled keys without duplicates.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<String> {
        if limit >= self.len() {
            return self.keys();
        }
        let mut rng = rand::thread_rng();
        let mut seen = std::collections::HashSet::with_capacity(limit);
        while seen.len() < limit {
            let index = rng.gen_range(0..self.shards.len());
            if let Some(key) = self.random_key_from_shard(index) {
                seen.insert(key);
            }
        }
        seen.into_iter().collect()
    }

    /// Cursor-based scan. The cursor is a shard index; the returned cursor
    /// is the next shard to visit, or 0 once the walk is complete. Visits
    /// whole shards, so a full scan needs at most `shard_count` calls.
    pub fn dict_scan(&self, cursor: usize, count: usize, pattern: &GlobPattern) -> (Vec<Vec<u8>>, usize) {
        let size = self.len();
        if pattern.is_match_all() && count >= size {
            let keys = self.keys().into_iter().map(String::into_bytes).collect();
            return (keys, 0);
        }

        let mut result: Vec<Vec<u8>> = Vec::new();
        let shard_count = self.shards.len();
        let mut shard_index = cursor;

        while shard_index < shard_count {
            let guard = self.shards[shard_index].read().unwrap();
            if result.len() + guard.len() > count && shard_index > cursor {
                return (result, shard_index);
            }
            for key in guard.keys() {
                if pattern.is_match_all() || pattern.matches(key.as_bytes()) {
                    result.push(key.clone().into_bytes());
                }
            }
            shard_index += 1;
        }

        (result, 0)
    }
}

impl<V: Clone> ConcurrentDict<V> {
    /// Returns a clone of the value.
    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).read().unwrap().get(key).cloned()
    }
}

impl<V> std::fmt::Debug for ConcurrentDict<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentDict")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}

/// Borrowed view of a single entry, holding the shard read lock.
pub struct Ref<'a, V> {
    guard: RwLockReadGuard<'a, HashMap<String, V>>,
    key: &'a str,
}

impl<V> Deref for Ref<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.guard.get(self.key).expect("entry present while shard lock held")
    }
}

/// Mutable view of a single entry, holding the shard write lock.
pub struct RefMut<'a, V> {
    guard: RwLockWriteGuard<'a, HashMap<String, V>>,
    key: &'a str,
}

impl<V> Deref for RefMut<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.guard.get(self.key).expect("entry present while shard lock held")
    }
}

impl<V> DerefMut for RefMut<'_, V> {
    fn deref_mut(&mut self) -> &mut V {
        self.guard.get_mut(self.key).expect("entry present while shard lock held")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(compute_capacity(0), 16);
        assert_eq!(compute_capacity(16), 16);
        assert_eq!(compute_capacity(17), 32);
        assert_eq!(compute_capacity(1000), 1024);
    }

    #[test]
    fn test_put_get_remove() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);

        assert_eq!(dict.put("a", 1), 1);
        assert_eq!(dict.put("a", 2), 0);
        assert_eq!(dict.get("a"), Some(2));
        assert_eq!(dict.len(), 1);

        assert_eq!(dict.remove("a"), Some(2));
        assert_eq!(dict.remove("a"), None);
        assert_eq!(dict.len(), 0);
    }

    #[test]
    fn test_put_if_absent_and_exists() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);

        assert_eq!(dict.put_if_exists("a", 1), 0);
        assert_eq!(dict.put_if_absent("a", 1), 1);
        assert_eq!(dict.put_if_absent("a", 2), 0);
        assert_eq!(dict.get("a"), Some(1));
        assert_eq!(dict.put_if_exists("a", 3), 1);
        assert_eq!(dict.get("a"), Some(3));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_counter_tracks_inserts_minus_removes() {
        let dict: ConcurrentDict<usize> = ConcurrentDict::new(16);
        for i in 0..100 {
            dict.put(&format!("key{i}"), i);
        }
        assert_eq!(dict.len(), 100);
        for i in 0..40 {
            dict.remove(&format!("key{i}"));
        }
        assert_eq!(dict.len(), 60);
        // Updates must not move the counter
        dict.put("key50", 0);
        assert_eq!(dict.len(), 60);
    }

    #[test]
    fn test_get_mut_in_place() {
        let dict: ConcurrentDict<Vec<i64>> = ConcurrentDict::new(16);
        dict.put("list", vec![1]);
        dict.get_mut("list").unwrap().push(2);
        assert_eq!(dict.get("list"), Some(vec![1, 2]));
    }

    #[test]
    fn test_get_or_insert_with() {
        let dict: ConcurrentDict<Vec<i64>> = ConcurrentDict::new(16);
        dict.get_or_insert_with("list", Vec::new).push(7);
        assert_eq!(dict.len(), 1);
        dict.get_or_insert_with("list", Vec::new).push(8);
        assert_eq!(dict.get("list"), Some(vec![7, 8]));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_for_each_and_keys() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        for i in 0..10 {
            dict.put(&format!("k{i}"), i);
        }
        let mut visited = 0;
        dict.for_each(|_, _| {
            visited += 1;
            true
        });
        assert_eq!(visited, 10);
        assert_eq!(dict.keys().len(), 10);
    }

    #[test]
    fn test_dict_scan_full_walk() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        for i in 0..64 {
            dict.put(&format!("k{i}"), i);
        }

        // pattern "*" with a big enough count returns everything at once
        let (keys, cursor) = dict.dict_scan(0, 1000, &GlobPattern::new("*"));
        assert_eq!(keys.len(), 64);
        assert_eq!(cursor, 0);

        // small count pages through the shards; cursor 0 signals the end
        let mut collected = std::collections::HashSet::new();
        let mut cursor = 0;
        let mut rounds = 0;
        loop {
            let (page, next) = dict.dict_scan(cursor, 4, &GlobPattern::new("k*"));
            for key in page {
                collected.insert(key);
            }
            rounds += 1;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(collected.len(), 64);
        assert!(rounds <= dict.shard_count());
    }

    #[test]
    fn test_random_distinct_keys() {
        let dict: ConcurrentDict<i64> = ConcurrentDict::new(16);
        for i in 0..50 {
            dict.put(&format!("k{i}"), i);
        }
        let sampled = dict.random_distinct_keys(10);
        assert_eq!(sampled.len(), 10);
        let unique: std::collections::HashSet<_> = sampled.iter().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let dict: Arc<ConcurrentDict<String>> = Arc::new(ConcurrentDict::new(64));
        let mut handles = vec![];

        for i in 0..8 {
            let dict = Arc::clone(&dict);
            handles.push(thread::spawn(move || {
                for j in 0..200 {
                    let key = format!("key-{i}-{j}");
                    dict.put(&key, "value".to_string());
                    dict.get(&key);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(dict.len(), 1600);
    }
}
