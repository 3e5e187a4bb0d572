//! List Commands
//!
//! Sequences over `VecDeque` for O(1) push/pop at both ends. A list that
//! becomes empty is removed from the key space. Negative indices count
//! from the tail, -1 being the last element.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::database::registry::{register, CommandTable, KeyExtra, FLAG_READ_ONLY, FLAG_WRITE};
use crate::database::tx_utils::{read_first_key, rollback_first_key, write_first_key};
use crate::database::{arg_str, parse_i64, Database};
use crate::protocol::{cmd_line_with_name, RespValue};
use crate::storage::DataValue;

fn absolute_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let actual = if index < 0 { len + index } else { index };
    if actual < 0 || actual >= len {
        None
    } else {
        Some(actual as usize)
    }
}

fn push(db: &Arc<Database>, args: &[Bytes], front: bool, name: &str) -> RespValue {
    let key = arg_str(&args[0]);
    let values: Vec<Bytes> = args[1..].to_vec();
    let result = db.update_or_init(
        &key,
        || DataValue::List(VecDeque::new()),
        |value, _| match value {
            DataValue::List(items) => {
                for v in values {
                    if front {
                        items.push_front(v);
                    } else {
                        items.push_back(v);
                    }
                }
                Ok(items.len())
            }
            _ => Err(RespValue::wrong_type()),
        },
    );
    match result {
        Err(reply) => reply,
        Ok(len) => {
            db.add_aof(cmd_line_with_name(name, args));
            RespValue::integer(len as i64)
        }
    }
}

fn exec_lpush(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    push(db, args, true, "LPUSH")
}

fn exec_rpush(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    push(db, args, false, "RPUSH")
}

fn pop(db: &Arc<Database>, args: &[Bytes], front: bool, name: &str) -> RespValue {
    let key = arg_str(&args[0]);
    let result = db.update(&key, |value| match value {
        DataValue::List(items) => {
            let popped = if front { items.pop_front() } else { items.pop_back() };
            Ok((popped, items.is_empty()))
        }
        _ => Err(RespValue::wrong_type()),
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::Null,
        Ok(Some((popped, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            match popped {
                None => RespValue::Null,
                Some(value) => {
                    db.add_aof(cmd_line_with_name(name, args));
                    RespValue::BulkString(value)
                }
            }
        }
    }
}

fn exec_lpop(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    pop(db, args, true, "LPOP")
}

fn exec_rpop(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    pop(db, args, false, "RPOP")
}

fn exec_llen(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match db.view(&key, |value| match value {
        DataValue::List(items) => Ok(items.len()),
        _ => Err(RespValue::wrong_type()),
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some(len)) => RespValue::integer(len as i64),
    }
}

fn exec_lindex(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let index = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(reply) => return reply,
    };
    match db.view(&key, |value| match value {
        DataValue::List(items) => {
            Ok(absolute_index(index, items.len()).and_then(|i| items.get(i).cloned()))
        }
        _ => Err(RespValue::wrong_type()),
    }) {
        Err(reply) => reply,
        Ok(None) | Ok(Some(None)) => RespValue::Null,
        Ok(Some(Some(value))) => RespValue::BulkString(value),
    }
}

fn exec_lrange(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let (start, stop) = match (parse_i64(&args[1]), parse_i64(&args[2])) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };
    match db.view(&key, |value| match value {
        DataValue::List(items) => {
            let len = items.len() as i64;
            let mut from = if start < 0 { len + start } else { start };
            let mut to = if stop < 0 { len + stop } else { stop };
            if from < 0 {
                from = 0;
            }
            if to >= len {
                to = len - 1;
            }
            if from > to || from >= len {
                return Ok(Vec::new());
            }
            Ok(items
                .iter()
                .skip(from as usize)
                .take((to - from + 1) as usize)
                .cloned()
                .collect::<Vec<_>>())
        }
        _ => Err(RespValue::wrong_type()),
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(items)) => RespValue::Array(items.into_iter().map(RespValue::BulkString).collect()),
    }
}

fn exec_lset(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let index = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(reply) => return reply,
    };
    let value = args[2].clone();
    match db.update(&key, |stored| match stored {
        DataValue::List(items) => match absolute_index(index, items.len()) {
            None => Ok(false),
            Some(i) => {
                items[i] = value;
                Ok(true)
            }
        },
        _ => Err(RespValue::wrong_type()),
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::no_such_key(),
        Ok(Some(false)) => RespValue::error("ERR index out of range"),
        Ok(Some(true)) => {
            db.add_aof(cmd_line_with_name("LSET", args));
            RespValue::ok()
        }
    }
}

/// LREM key count value: count > 0 removes head→tail, count < 0
/// tail→head, count = 0 removes all occurrences.
fn exec_lrem(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let count = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(reply) => return reply,
    };
    let needle = args[2].clone();
    let result = db.update(&key, |stored| match stored {
        DataValue::List(items) => {
            let max_remove = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
            let mut removed = 0usize;
            if count >= 0 {
                let mut i = 0;
                while i < items.len() && removed < max_remove {
                    if items[i] == needle {
                        items.remove(i);
                        removed += 1;
                    } else {
                        i += 1;
                    }
                }
            } else {
                let mut i = items.len();
                while i > 0 && removed < max_remove {
                    i -= 1;
                    if items[i] == needle {
                        items.remove(i);
                        removed += 1;
                    }
                }
            }
            Ok((removed, items.is_empty()))
        }
        _ => Err(RespValue::wrong_type()),
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(cmd_line_with_name("LREM", args));
            }
            RespValue::integer(removed as i64)
        }
    }
}

pub(crate) fn register_commands(table: &mut CommandTable) {
    register(table, "lpush", exec_lpush, write_first_key, Some(rollback_first_key), -3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "rpush", exec_rpush, write_first_key, Some(rollback_first_key), -3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "lpop", exec_lpop, write_first_key, Some(rollback_first_key), 2, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "rpop", exec_rpop, write_first_key, Some(rollback_first_key), 2, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "llen", exec_llen, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "lindex", exec_lindex, read_first_key, None, 3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "lrange", exec_lrange, read_first_key, None, 4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "lset", exec_lset, write_first_key, Some(rollback_first_key), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "lrem", exec_lrem, write_first_key, Some(rollback_first_key), 4, FLAG_WRITE, KeyExtra::SINGLE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::protocol::cmd_line;
    use crate::timewheel::TimeWheel;

    fn test_db() -> Arc<Database> {
        Database::new(0, TimeWheel::start())
    }

    fn run(db: &Arc<Database>, parts: &[&str]) -> RespValue {
        let mut conn = ConnectionState::fake();
        db.exec(&mut conn, &cmd_line(parts))
    }

    fn range_members(reply: RespValue) -> Vec<String> {
        let RespValue::Array(items) = reply else { panic!("expected array") };
        items
            .into_iter()
            .map(|item| match item {
                RespValue::BulkString(b) => String::from_utf8_lossy(&b).into_owned(),
                other => panic!("expected bulk string, got {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_push_order() {
        let db = test_db();
        assert_eq!(run(&db, &["LPUSH", "l", "a", "b"]), RespValue::integer(2));
        assert_eq!(run(&db, &["RPUSH", "l", "c"]), RespValue::integer(3));
        // LPUSH a b pushes b last, so b is at the head
        assert_eq!(range_members(run(&db, &["LRANGE", "l", "0", "-1"])), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_pop_and_auto_delete() {
        let db = test_db();
        run(&db, &["RPUSH", "l", "a", "b"]);
        assert_eq!(run(&db, &["LPOP", "l"]), RespValue::bulk_string("a"));
        assert_eq!(run(&db, &["RPOP", "l"]), RespValue::bulk_string("b"));
        assert_eq!(run(&db, &["RPOP", "l"]), RespValue::Null);
        // popping the last element removed the key
        assert_eq!(run(&db, &["TYPE", "l"]), RespValue::simple_string("none"));
    }

    #[tokio::test]
    async fn test_lindex_negative() {
        let db = test_db();
        run(&db, &["RPUSH", "l", "a", "b", "c"]);
        assert_eq!(run(&db, &["LINDEX", "l", "0"]), RespValue::bulk_string("a"));
        assert_eq!(run(&db, &["LINDEX", "l", "-1"]), RespValue::bulk_string("c"));
        assert_eq!(run(&db, &["LINDEX", "l", "3"]), RespValue::Null);
        assert_eq!(run(&db, &["LINDEX", "l", "-4"]), RespValue::Null);
    }

    #[tokio::test]
    async fn test_lrange_clamping() {
        let db = test_db();
        run(&db, &["RPUSH", "l", "a", "b", "c", "d", "e"]);
        assert_eq!(range_members(run(&db, &["LRANGE", "l", "1", "3"])), vec!["b", "c", "d"]);
        assert_eq!(range_members(run(&db, &["LRANGE", "l", "-3", "-1"])), vec!["c", "d", "e"]);
        assert_eq!(range_members(run(&db, &["LRANGE", "l", "0", "100"])).len(), 5);
        assert!(range_members(run(&db, &["LRANGE", "l", "3", "1"])).is_empty());
        assert!(range_members(run(&db, &["LRANGE", "ghost", "0", "-1"])).is_empty());
    }

    #[tokio::test]
    async fn test_lset() {
        let db = test_db();
        run(&db, &["RPUSH", "l", "a", "b", "c"]);
        assert_eq!(run(&db, &["LSET", "l", "1", "B"]), RespValue::ok());
        assert_eq!(run(&db, &["LINDEX", "l", "1"]), RespValue::bulk_string("B"));
        assert_eq!(run(&db, &["LSET", "l", "-1", "C"]), RespValue::ok());
        assert!(run(&db, &["LSET", "l", "10", "X"]).is_error());
        assert_eq!(run(&db, &["LSET", "ghost", "0", "X"]), RespValue::no_such_key());
    }

    #[tokio::test]
    async fn test_lrem_directions() {
        let db = test_db();
        run(&db, &["RPUSH", "l", "a", "b", "a", "c", "a"]);
        assert_eq!(run(&db, &["LREM", "l", "2", "a"]), RespValue::integer(2));
        assert_eq!(range_members(run(&db, &["LRANGE", "l", "0", "-1"])), vec!["b", "c", "a"]);

        run(&db, &["DEL", "l"]);
        run(&db, &["RPUSH", "l", "a", "b", "a", "c", "a"]);
        assert_eq!(run(&db, &["LREM", "l", "-2", "a"]), RespValue::integer(2));
        assert_eq!(range_members(run(&db, &["LRANGE", "l", "0", "-1"])), vec!["a", "b", "c"]);

        assert_eq!(run(&db, &["LREM", "l", "0", "a"]), RespValue::integer(1));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let db = test_db();
        run(&db, &["SET", "s", "v"]);
        assert_eq!(run(&db, &["LPUSH", "s", "x"]), RespValue::wrong_type());
        assert_eq!(run(&db, &["LLEN", "s"]), RespValue::wrong_type());
    }
}
