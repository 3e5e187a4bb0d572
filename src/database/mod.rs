//! Database Core
//!
//! One [`Database`] per logical database index. It owns three concurrent
//! dictionaries: `data` (key to entity), `ttl` (key to absolute expiry in
//! epoch milliseconds), and `versions` (key to write counter for WATCH), plus
//! the striped key-lock table that gives multi-key commands their
//! atomicity.
//!
//! Every command invocation runs the same pipeline:
//!
//! 1. registry lookup by lowercased name
//! 2. arity validation (positive = exact, negative = minimum)
//! 3. `prepare` classifies key arguments into write/read sets
//! 4. version bump for every write key
//! 5. striped locks acquired in canonical order, released on every exit
//! 6. executor runs; mutating executors append themselves to the log
//!
//! Expiration is enforced twice: a time-wheel task per TTL key performs
//! scheduled removal (re-checking the TTL under the key lock, since it
//! may have been updated while the task waited), and `check_expired`
//! evicts lazily on access, which is the authoritative rule.

pub mod hash;
pub mod keys;
pub mod list;
pub mod registry;
pub mod server;
pub mod set;
pub mod strings;
pub mod transaction;
pub mod tx_utils;
pub mod zset;

use std::sync::{Arc, RwLock, Weak};

use bytes::Bytes;
use tracing::debug;

use crate::aof::Persister;
use crate::protocol::{CmdLine, RespValue};
use crate::storage::dict::Ref;
use crate::storage::lock::BatchGuard;
use crate::storage::{ConcurrentDict, DataEntity, DataValue, KeyLocks};
use crate::timewheel::{now_ms, TimeWheel};

use crate::connection::ConnectionState;

const DATA_DICT_SIZE: usize = 1 << 10;
const TTL_DICT_SIZE: usize = 1 << 7;

pub(crate) fn expire_task_key(key: &str) -> String {
    format!("expire:{key}")
}

/// Lowercased command name from a command line.
pub(crate) fn cmd_name(cmdline: &[Bytes]) -> String {
    String::from_utf8_lossy(&cmdline[0]).to_ascii_lowercase()
}

/// Key/member argument as an owned string.
pub(crate) fn arg_str(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

/// Integer argument, or the canonical not-an-integer error.
pub(crate) fn parse_i64(arg: &[u8]) -> Result<i64, RespValue> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(RespValue::not_integer)
}

/// Float argument, or the canonical not-a-float error.
pub(crate) fn parse_f64(arg: &[u8]) -> Result<f64, RespValue> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(RespValue::not_float)
}

/// Arity check: positive means exact argument count (command name
/// included), negative means at least `|arity|`.
pub(crate) fn validate_arity(arity: i32, argc: usize) -> bool {
    let argc = argc as i32;
    if arity >= 0 {
        argc == arity
    } else {
        argc >= -arity
    }
}

/// A single logical database.
pub struct Database {
    index: usize,
    data: ConcurrentDict<DataEntity>,
    ttl: ConcurrentDict<u64>,
    versions: ConcurrentDict<u32>,
    locks: KeyLocks,
    wheel: Arc<TimeWheel>,
    aof: RwLock<Option<Arc<Persister>>>,
}

impl Database {
    pub fn new(index: usize, wheel: Arc<TimeWheel>) -> Arc<Self> {
        Arc::new(Self {
            index,
            data: ConcurrentDict::new(DATA_DICT_SIZE),
            ttl: ConcurrentDict::new(TTL_DICT_SIZE),
            versions: ConcurrentDict::new(DATA_DICT_SIZE),
            locks: KeyLocks::new(DATA_DICT_SIZE),
            wheel,
            aof: RwLock::new(None),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of live keys and number of keys carrying a TTL.
    pub fn sizes(&self) -> (usize, usize) {
        (self.data.len(), self.ttl.len())
    }

    /// Wires the persister in; executors call [`Database::add_aof`] after
    /// successful writes.
    pub fn bind_aof(&self, persister: Arc<Persister>) {
        *self.aof.write().unwrap() = Some(persister);
    }

    pub(crate) fn add_aof(&self, line: CmdLine) {
        if let Some(persister) = self.aof.read().unwrap().as_ref() {
            persister.save_cmd_line(self.index, line);
        }
    }

    /* ---- command execution ---- */

    /// Entry point for key-space commands on this database. Transaction
    /// control commands are routed here too because they interact with
    /// the connection's queue state.
    pub fn exec(self: &Arc<Self>, conn: &mut ConnectionState, cmdline: &[Bytes]) -> RespValue {
        let name = cmd_name(cmdline);
        match name.as_str() {
            "multi" => {
                if cmdline.len() != 1 {
                    return RespValue::arg_num_error(&name);
                }
                return transaction::start_multi(conn);
            }
            "discard" => {
                if cmdline.len() != 1 {
                    return RespValue::arg_num_error(&name);
                }
                return transaction::discard_multi(conn);
            }
            "exec" => {
                if cmdline.len() != 1 {
                    return RespValue::arg_num_error(&name);
                }
                return transaction::exec_multi(self, conn);
            }
            "watch" => {
                if !validate_arity(-2, cmdline.len()) {
                    return RespValue::arg_num_error(&name);
                }
                return transaction::watch(self, conn, &cmdline[1..]);
            }
            _ => {}
        }

        if conn.in_multi_state() {
            return transaction::enqueue_cmd(conn, cmdline);
        }
        self.exec_normal(cmdline)
    }

    /// Full pipeline: lookup, arity, prepare, version bump, striped
    /// locks, executor.
    pub(crate) fn exec_normal(self: &Arc<Self>, cmdline: &[Bytes]) -> RespValue {
        let name = cmd_name(cmdline);
        let Some(cmd) = registry::lookup(&name) else {
            return RespValue::unknown_command(&name);
        };
        if !validate_arity(cmd.arity, cmdline.len()) {
            return RespValue::arg_num_error(&name);
        }

        let (write_keys, read_keys) = (cmd.prepare)(&cmdline[1..]);
        self.add_version(&write_keys);

        let _guard = self.locks.rw_locks(&write_keys, &read_keys);
        (cmd.executor)(self, &cmdline[1..])
    }

    /// Executor invocation without lock acquisition; the caller (the
    /// transaction engine) already holds all involved stripes.
    pub(crate) fn exec_with_lock(self: &Arc<Self>, cmdline: &[Bytes]) -> RespValue {
        let name = cmd_name(cmdline);
        let Some(cmd) = registry::lookup(&name) else {
            return RespValue::unknown_command(&name);
        };
        if !validate_arity(cmd.arity, cmdline.len()) {
            return RespValue::arg_num_error(&name);
        }
        (cmd.executor)(self, &cmdline[1..])
    }

    /// Compensating command sequence for a command, from pre-image state.
    pub(crate) fn undo_logs(&self, cmdline: &[Bytes]) -> Vec<CmdLine> {
        let name = cmd_name(cmdline);
        let Some(cmd) = registry::lookup(&name) else {
            return Vec::new();
        };
        match cmd.undo {
            Some(undo) => undo(self, &cmdline[1..]),
            None => Vec::new(),
        }
    }

    /* ---- locking ---- */

    pub(crate) fn rw_locks(&self, write_keys: &[String], read_keys: &[String]) -> BatchGuard<'_> {
        self.locks.rw_locks(write_keys, read_keys)
    }

    /* ---- versioning ---- */

    pub fn version(&self, key: &str) -> u32 {
        self.versions.get(key).unwrap_or(0)
    }

    pub(crate) fn add_version(&self, keys: &[String]) {
        for key in keys {
            let mut slot = self.versions.get_or_insert_with(key, || 0);
            *slot = slot.wrapping_add(1);
        }
    }

    /* ---- TTL ---- */

    /// Sets the key's expiry and schedules the removal task. The task
    /// re-reads the TTL under the key lock before removing (check-lock-
    /// check): the TTL may have moved while the task waited.
    pub fn expire(self: &Arc<Self>, key: &str, at_ms: u64) {
        self.ttl.put(key, at_ms);
        let weak: Weak<Database> = Arc::downgrade(self);
        let owned = key.to_string();
        self.wheel.at(
            at_ms,
            expire_task_key(key),
            Box::new(move || {
                let Some(db) = weak.upgrade() else { return };
                let keys = vec![owned.clone()];
                let _guard = db.locks.locks(&keys);
                let Some(expire_at) = db.ttl.get(&owned) else { return };
                if now_ms() >= expire_at {
                    debug!(key = %owned, "expired by scheduled task");
                    db.remove(&owned);
                }
            }),
        );
    }

    /// Drops the key's expiry and cancels the pending removal task.
    pub fn persist(&self, key: &str) {
        self.ttl.remove(key);
        self.wheel.cancel(&expire_task_key(key));
    }

    /// Absolute expiry in epoch milliseconds, if set.
    pub fn expire_time(&self, key: &str) -> Option<u64> {
        self.ttl.get(key)
    }

    /// Lazy eviction: removes the key if its TTL is in the past. Returns
    /// whether the key was expired.
    pub fn check_expired(&self, key: &str) -> bool {
        let Some(expire_at) = self.ttl.get(key) else {
            return false;
        };
        if now_ms() >= expire_at {
            self.remove(key);
            true
        } else {
            false
        }
    }

    /* ---- data access ---- */

    /// Whether the key currently exists (after lazy eviction).
    pub fn contains_key(&self, key: &str) -> bool {
        !self.check_expired(key) && self.data.contains_key(key)
    }

    /// Borrowed view of a key's entity, after lazy eviction.
    pub(crate) fn entity_ref<'a>(&'a self, key: &'a str) -> Option<Ref<'a, DataEntity>> {
        self.check_expired(key);
        self.data.get_ref(key)
    }

    /// Runs a closure over the value; `Ok(None)` when the key is absent.
    pub(crate) fn view<R>(
        &self,
        key: &str,
        f: impl FnOnce(&DataValue) -> Result<R, RespValue>,
    ) -> Result<Option<R>, RespValue> {
        self.check_expired(key);
        match self.data.get_ref(key) {
            None => Ok(None),
            Some(entity) => f(&entity.data).map(Some),
        }
    }

    /// Runs a closure over the value mutably; `Ok(None)` when absent.
    pub(crate) fn update<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut DataValue) -> Result<R, RespValue>,
    ) -> Result<Option<R>, RespValue> {
        self.check_expired(key);
        match self.data.get_mut(key) {
            None => Ok(None),
            Some(mut entity) => f(&mut entity.data).map(Some),
        }
    }

    /// Runs a closure over the value mutably, inserting `init()` when the
    /// key is absent. The closure's second argument reports whether the
    /// value was just created.
    pub(crate) fn update_or_init<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> DataValue,
        f: impl FnOnce(&mut DataValue, bool) -> Result<R, RespValue>,
    ) -> Result<R, RespValue> {
        self.check_expired(key);
        let mut created = false;
        let mut entity = self.data.get_or_insert_with(key, || {
            created = true;
            DataEntity::new(init())
        });
        f(&mut entity.data, created)
    }

    pub fn put_entity(&self, key: &str, entity: DataEntity) -> usize {
        self.data.put(key, entity)
    }

    pub fn put_if_exists(&self, key: &str, entity: DataEntity) -> usize {
        self.data.put_if_exists(key, entity)
    }

    pub fn put_if_absent(&self, key: &str, entity: DataEntity) -> usize {
        self.data.put_if_absent(key, entity)
    }

    /// Removes the key, its TTL record, and its pending expiration task.
    /// The version counter is preserved.
    pub fn remove(&self, key: &str) -> Option<DataEntity> {
        let removed = self.data.remove(key);
        self.ttl.remove(key);
        self.wheel.cancel(&expire_task_key(key));
        removed
    }

    /// Removes the given keys; returns how many existed.
    pub fn removes(&self, keys: impl IntoIterator<Item = impl AsRef<str>>) -> usize {
        let mut deleted = 0;
        for key in keys {
            let key = key.as_ref();
            if !self.check_expired(key) && self.remove(key).is_some() {
                deleted += 1;
            }
        }
        deleted
    }

    /// Walks every live entity with its optional expiry.
    pub fn for_each(&self, mut cb: impl FnMut(&str, &DataEntity, Option<u64>) -> bool) {
        self.data.for_each(|key, entity| {
            let expiration = self.ttl.get(key);
            cb(key, entity, expiration)
        });
    }

    pub(crate) fn data_dict(&self) -> &ConcurrentDict<DataEntity> {
        &self.data
    }

    /// Clears all data, TTLs, and pending expiration tasks in place.
    /// Version counters survive, like on any other removal, so watchers
    /// of flushed keys still see the writes that preceded the flush.
    pub fn flush(&self) {
        for key in self.ttl.keys() {
            self.wheel.cancel(&expire_task_key(&key));
        }
        self.data.clear();
        self.ttl.clear();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("index", &self.index)
            .field("keys", &self.data.len())
            .field("ttls", &self.ttl.len())
            .finish()
    }
}
