//! Striped Key Locking
//!
//! Multi-key commands and transactions need atomicity across keys that
//! live in different shards. [`KeyLocks`] provides a fixed table of
//! reader/writer locks, striped by FNV-1a over the key, separate from the
//! dictionary's own shard locks.
//!
//! Deadlock freedom is pure discipline: every caller maps its key batch to
//! a set of stripe indices, deduplicates, sorts ascending, and acquires in
//! that order. Two tasks wanting `{a, b}` and `{b, a}` both take the
//! lowest stripe first, so circular waits cannot form. Release happens in
//! descending order when the returned guard drops.
//!
//! A stripe is taken exclusively when any write key maps to it, and shared
//! otherwise.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::dict::{compute_capacity, fnv32};

/// A fixed table of striped reader/writer locks.
pub struct KeyLocks {
    table: Vec<RwLock<()>>,
}

enum StripeGuard<'a> {
    Read(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Write(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Holds a batch of stripe locks; unlocks in descending stripe order on drop.
pub struct BatchGuard<'a> {
    guards: Vec<StripeGuard<'a>>,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        // Guards were pushed in ascending stripe order; pop to release in
        // the mirror (descending) order.
        while self.guards.pop().is_some() {}
    }
}

impl KeyLocks {
    /// Creates a lock table with at least `size` stripes, rounded up to a
    /// power of two (minimum 16).
    pub fn new(size: usize) -> Self {
        let size = compute_capacity(size);
        let table = (0..size).map(|_| RwLock::new(())).collect();
        Self { table }
    }

    #[inline]
    fn spread(&self, key: &str) -> usize {
        (fnv32(key) as usize) & (self.table.len() - 1)
    }

    /// Deduplicated stripe indices for a key batch, sorted ascending.
    fn to_lock_indices<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Vec<usize> {
        let mut index_set = HashSet::new();
        for key in keys {
            index_set.insert(self.spread(key));
        }
        let mut indices: Vec<usize> = index_set.into_iter().collect();
        indices.sort_unstable();
        indices
    }

    /// Locks a single key exclusively.
    pub fn lock(&self, key: &str) -> BatchGuard<'_> {
        let index = self.spread(key);
        let guard = StripeGuard::Write(self.table[index].write().unwrap());
        BatchGuard { guards: vec![guard] }
    }

    /// Locks write keys exclusively and read keys shared, acquiring
    /// stripes in canonical ascending order. Duplicate keys are allowed.
    pub fn rw_locks(&self, write_keys: &[String], read_keys: &[String]) -> BatchGuard<'_> {
        let indices = self.to_lock_indices(
            write_keys
                .iter()
                .map(String::as_str)
                .chain(read_keys.iter().map(String::as_str)),
        );
        let write_indices: HashSet<usize> = write_keys.iter().map(|k| self.spread(k)).collect();

        let mut guards = Vec::with_capacity(indices.len());
        for index in indices {
            let stripe = &self.table[index];
            if write_indices.contains(&index) {
                guards.push(StripeGuard::Write(stripe.write().unwrap()));
            } else {
                guards.push(StripeGuard::Read(stripe.read().unwrap()));
            }
        }
        BatchGuard { guards }
    }

    /// Locks every key in the batch exclusively.
    pub fn locks(&self, keys: &[String]) -> BatchGuard<'_> {
        self.rw_locks(keys, &[])
    }
}

impl std::fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLocks").field("stripes", &self.table.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_key_lock() {
        let locks = KeyLocks::new(16);
        let guard = locks.lock("a");
        drop(guard);
        let _again = locks.lock("a");
    }

    #[test]
    fn test_shared_readers_do_not_block() {
        let locks = Arc::new(KeyLocks::new(16));
        let keys = vec!["a".to_string(), "b".to_string()];

        let g1 = locks.rw_locks(&[], &keys);
        // A second shared acquisition of the same stripes must succeed
        // while the first is held.
        let g2 = locks.rw_locks(&[], &keys);
        drop(g1);
        drop(g2);
    }

    #[test]
    fn test_opposite_order_batches_do_not_deadlock() {
        let locks = Arc::new(KeyLocks::new(16));
        let mut handles = vec![];

        for i in 0..8 {
            let locks = Arc::clone(&locks);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let batch = if i % 2 == 0 {
                        vec!["a".to_string(), "b".to_string(), "c".to_string()]
                    } else {
                        vec!["c".to_string(), "a".to_string()]
                    };
                    let _guard = locks.locks(&batch);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_write_stripe_excludes_readers() {
        let locks = Arc::new(KeyLocks::new(16));
        let key = vec!["x".to_string()];

        let guard = locks.locks(&key);
        let locks2 = Arc::clone(&locks);
        let key2 = key.clone();
        let reader = thread::spawn(move || {
            let _g = locks2.rw_locks(&[], &key2);
        });

        // Give the reader a moment to park on the stripe.
        thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());
        drop(guard);
        reader.join().unwrap();
    }

    #[test]
    fn test_duplicate_keys_allowed() {
        let locks = KeyLocks::new(16);
        let write = vec!["k".to_string(), "k".to_string()];
        let read = vec!["k".to_string()];
        let _guard = locks.rw_locks(&write, &read);
    }
}
