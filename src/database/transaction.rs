//! Optimistic Transactions
//!
//! WATCH snapshots per-key version counters; MULTI switches the
//! connection into queueing mode; EXEC revalidates the watched versions
//! under the full lock set and either runs the queue or returns an empty
//! array. Runtime failures roll back through the undo log: pre-image
//! command sequences captured before each step, replayed in reverse.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::ConnectionState;
use crate::database::{cmd_name, registry, validate_arity, Database};
use crate::protocol::{CmdLine, RespValue};

/// WATCH key [key ...]; only meaningful outside MULTI.
pub(crate) fn watch(db: &Arc<Database>, conn: &mut ConnectionState, keys: &[Bytes]) -> RespValue {
    if conn.in_multi_state() {
        return RespValue::error("ERR WATCH inside MULTI is not allowed");
    }
    for raw in keys {
        let key = String::from_utf8_lossy(raw).into_owned();
        let version = db.version(&key);
        conn.watching_mut().insert(key, version);
    }
    RespValue::ok()
}

fn is_watching_changed(db: &Database, watching: &std::collections::HashMap<String, u32>) -> bool {
    watching.iter().any(|(key, &snapshot)| db.version(key) != snapshot)
}

pub(crate) fn start_multi(conn: &mut ConnectionState) -> RespValue {
    if conn.in_multi_state() {
        return RespValue::error("ERR MULTI calls can not be nested");
    }
    conn.set_multi_state(true);
    RespValue::ok()
}

pub(crate) fn discard_multi(conn: &mut ConnectionState) -> RespValue {
    if !conn.in_multi_state() {
        return RespValue::error("ERR DISCARD without MULTI");
    }
    conn.clear_queued_cmds();
    conn.set_multi_state(false);
    RespValue::ok()
}

/// Queues a command during MULTI. Validation failures are recorded on the
/// connection and force the eventual EXEC to abort, but the reply is an
/// error immediately.
pub(crate) fn enqueue_cmd(conn: &mut ConnectionState, cmdline: &[Bytes]) -> RespValue {
    let name = cmd_name(cmdline);
    let Some(cmd) = registry::lookup(&name) else {
        let reply = RespValue::unknown_command(&name);
        conn.add_tx_error(&reply);
        return reply;
    };
    if !validate_arity(cmd.arity, cmdline.len()) {
        let reply = RespValue::arg_num_error(&name);
        conn.add_tx_error(&reply);
        return reply;
    }
    conn.enqueue_cmd(cmdline.to_vec());
    RespValue::queued()
}

pub(crate) fn exec_multi(db: &Arc<Database>, conn: &mut ConnectionState) -> RespValue {
    if !conn.in_multi_state() {
        return RespValue::error("ERR EXEC without MULTI");
    }
    conn.set_multi_state(false);

    if conn.has_tx_errors() {
        conn.clear_queued_cmds();
        return RespValue::exec_abort();
    }

    let cmd_lines = conn.take_queued_cmds();
    let watching = conn.take_watching();
    exec_queued(db, &watching, &cmd_lines)
}

/// Runs a validated command queue under the union of all involved key
/// locks, aborting early if any watched key moved.
pub(crate) fn exec_queued(
    db: &Arc<Database>,
    watching: &std::collections::HashMap<String, u32>,
    cmd_lines: &[CmdLine],
) -> RespValue {
    let mut write_keys: Vec<String> = Vec::new();
    let mut read_keys: Vec<String> = Vec::new();
    for cmdline in cmd_lines {
        let name = cmd_name(cmdline);
        let Some(cmd) = registry::lookup(&name) else {
            return RespValue::unknown_command(&name);
        };
        let (write, read) = (cmd.prepare)(&cmdline[1..]);
        write_keys.extend(write);
        read_keys.extend(read);
    }
    read_keys.extend(watching.keys().cloned());

    let guard = db.rw_locks(&write_keys, &read_keys);

    if is_watching_changed(db, watching) {
        drop(guard);
        return RespValue::empty_array();
    }

    let mut results = Vec::with_capacity(cmd_lines.len());
    let mut undo_logs: Vec<Vec<CmdLine>> = Vec::with_capacity(cmd_lines.len());
    let mut aborted = false;

    for cmdline in cmd_lines {
        undo_logs.push(db.undo_logs(cmdline));
        let reply = db.exec_with_lock(cmdline);
        if reply.is_error() {
            aborted = true;
            // the failed command had no effect; don't roll it back
            undo_logs.pop();
            break;
        }
        results.push(reply);
    }

    if !aborted {
        db.add_version(&write_keys);
        drop(guard);
        return RespValue::Array(results);
    }

    for undo in undo_logs.iter().rev() {
        for cmdline in undo {
            db.exec_with_lock(cmdline);
        }
    }
    drop(guard);
    RespValue::exec_abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cmd_line;
    use crate::timewheel::TimeWheel;

    fn test_db() -> Arc<Database> {
        Database::new(0, TimeWheel::start())
    }

    fn run(db: &Arc<Database>, conn: &mut ConnectionState, parts: &[&str]) -> RespValue {
        db.exec(conn, &cmd_line(parts))
    }

    #[tokio::test]
    async fn test_multi_exec_applies_queue() {
        let db = test_db();
        let mut conn = ConnectionState::fake();

        assert_eq!(run(&db, &mut conn, &["MULTI"]), RespValue::ok());
        assert_eq!(run(&db, &mut conn, &["SET", "a", "1"]), RespValue::queued());
        assert_eq!(run(&db, &mut conn, &["SET", "b", "2"]), RespValue::queued());
        // nothing applied while queueing
        assert!(!db.contains_key("a"));

        let reply = run(&db, &mut conn, &["EXEC"]);
        assert_eq!(reply, RespValue::Array(vec![RespValue::ok(), RespValue::ok()]));
        let mut fresh = ConnectionState::fake();
        assert_eq!(run(&db, &mut fresh, &["GET", "b"]), RespValue::bulk_string("2"));
    }

    #[tokio::test]
    async fn test_nested_multi_and_stray_exec() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        run(&db, &mut conn, &["MULTI"]);
        assert!(run(&db, &mut conn, &["MULTI"]).is_error());
        run(&db, &mut conn, &["DISCARD"]);
        assert!(run(&db, &mut conn, &["EXEC"]).is_error());
        assert!(run(&db, &mut conn, &["DISCARD"]).is_error());
    }

    #[tokio::test]
    async fn test_discard_clears_queue() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        run(&db, &mut conn, &["MULTI"]);
        run(&db, &mut conn, &["SET", "a", "1"]);
        assert_eq!(run(&db, &mut conn, &["DISCARD"]), RespValue::ok());
        assert!(!db.contains_key("a"));
        // back in normal mode
        assert_eq!(run(&db, &mut conn, &["SET", "a", "2"]), RespValue::ok());
    }

    #[tokio::test]
    async fn test_enqueue_error_forces_exec_abort() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        run(&db, &mut conn, &["SET", "a", "before"]);

        run(&db, &mut conn, &["MULTI"]);
        run(&db, &mut conn, &["SET", "a", "after"]);
        assert!(run(&db, &mut conn, &["BOGUSCMD", "x"]).is_error());
        assert!(run(&db, &mut conn, &["GET"]).is_error());

        assert_eq!(run(&db, &mut conn, &["EXEC"]), RespValue::exec_abort());
        assert_eq!(run(&db, &mut conn, &["GET", "a"]), RespValue::bulk_string("before"));
    }

    #[tokio::test]
    async fn test_watch_abort_on_concurrent_write() {
        let db = test_db();
        let mut watcher = ConnectionState::fake();
        let mut writer = ConnectionState::fake();

        run(&db, &mut watcher, &["SET", "a", "0"]);
        assert_eq!(run(&db, &mut watcher, &["WATCH", "a"]), RespValue::ok());
        run(&db, &mut watcher, &["MULTI"]);
        run(&db, &mut watcher, &["SET", "a", "1"]);
        run(&db, &mut watcher, &["SET", "b", "1"]);

        // another session touches the watched key between MULTI and EXEC
        run(&db, &mut writer, &["SET", "a", "99"]);

        assert_eq!(run(&db, &mut watcher, &["EXEC"]), RespValue::empty_array());
        assert_eq!(run(&db, &mut watcher, &["GET", "a"]), RespValue::bulk_string("99"));
        assert_eq!(run(&db, &mut watcher, &["GET", "b"]), RespValue::Null);
    }

    #[tokio::test]
    async fn test_watch_unchanged_key_allows_exec() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        run(&db, &mut conn, &["SET", "a", "0"]);
        run(&db, &mut conn, &["WATCH", "a"]);
        run(&db, &mut conn, &["MULTI"]);
        run(&db, &mut conn, &["SET", "a", "1"]);
        assert_eq!(run(&db, &mut conn, &["EXEC"]), RespValue::Array(vec![RespValue::ok()]));
        assert_eq!(run(&db, &mut conn, &["GET", "a"]), RespValue::bulk_string("1"));
    }

    #[tokio::test]
    async fn test_watch_abort_survives_flush() {
        let db = test_db();
        let mut watcher = ConnectionState::fake();
        let mut writer = ConnectionState::fake();

        // watch a key that does not exist yet (version snapshot 0)
        run(&db, &mut watcher, &["WATCH", "a"]);
        run(&db, &mut watcher, &["MULTI"]);
        run(&db, &mut watcher, &["SET", "a", "mine"]);

        // another session writes the key, then the database is flushed;
        // the version counter must not reset to the snapshot value
        run(&db, &mut writer, &["SET", "a", "theirs"]);
        run(&db, &mut writer, &["SET", "a", "theirs-again"]);
        db.flush();

        assert_eq!(run(&db, &mut watcher, &["EXEC"]), RespValue::empty_array());
        assert_eq!(run(&db, &mut watcher, &["GET", "a"]), RespValue::Null);
    }

    #[tokio::test]
    async fn test_watch_inside_multi_rejected() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        run(&db, &mut conn, &["MULTI"]);
        assert!(run(&db, &mut conn, &["WATCH", "a"]).is_error());
    }

    #[tokio::test]
    async fn test_runtime_failure_rolls_back_earlier_steps() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        run(&db, &mut conn, &["SET", "k", "original"]);

        run(&db, &mut conn, &["MULTI"]);
        run(&db, &mut conn, &["SET", "k", "1"]);
        run(&db, &mut conn, &["SET", "k", "2"]);
        // queues fine (arity is dynamic) but fails at run time
        run(&db, &mut conn, &["ZADD", "k", "notafloat", "m"]);

        assert_eq!(run(&db, &mut conn, &["EXEC"]), RespValue::exec_abort());
        assert_eq!(run(&db, &mut conn, &["GET", "k"]), RespValue::bulk_string("original"));
    }

    #[tokio::test]
    async fn test_rollback_restores_collections_and_ttl() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        run(&db, &mut conn, &["ZADD", "z", "1", "a"]);
        run(&db, &mut conn, &["EXPIRE", "z", "1000"]);
        let before = db.expire_time("z");

        run(&db, &mut conn, &["MULTI"]);
        run(&db, &mut conn, &["ZADD", "z", "5", "a"]);
        run(&db, &mut conn, &["DEL", "z"]);
        run(&db, &mut conn, &["ZADD", "z", "bad", "b"]); // fails at run time
        assert_eq!(run(&db, &mut conn, &["EXEC"]), RespValue::exec_abort());

        assert_eq!(run(&db, &mut conn, &["ZSCORE", "z", "a"]), RespValue::bulk_string("1"));
        assert_eq!(db.expire_time("z"), before);
    }

    #[tokio::test]
    async fn test_exec_after_exec_is_an_error() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        run(&db, &mut conn, &["MULTI"]);
        run(&db, &mut conn, &["SET", "a", "1"]);
        run(&db, &mut conn, &["EXEC"]);
        assert!(run(&db, &mut conn, &["EXEC"]).is_error());
    }
}
