//! Hash Commands
//!
//! Field → byte-string mappings. A hash that loses its last field is
//! removed from the key space.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::database::registry::{register, CommandTable, KeyExtra, FLAG_READ_ONLY, FLAG_WRITE};
use crate::database::tx_utils::{read_first_key, rollback_hash_fields, write_first_key};
use crate::database::{arg_str, parse_i64, Database};
use crate::protocol::{cmd_line_with_name, CmdLine, RespValue};
use crate::storage::{DataValue, GlobPattern};

fn with_hash<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&HashMap<String, Bytes>) -> R,
) -> Result<Option<R>, RespValue> {
    db.view(key, |value| match value {
        DataValue::Hash(map) => Ok(f(map)),
        _ => Err(RespValue::wrong_type()),
    })
}

fn exec_hset(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let field = arg_str(&args[1]);
    let value = args[2].clone();
    let result = db.update_or_init(
        &key,
        || DataValue::Hash(HashMap::new()),
        |stored, _| match stored {
            DataValue::Hash(map) => Ok(map.insert(field, value).is_none()),
            _ => Err(RespValue::wrong_type()),
        },
    );
    match result {
        Err(reply) => reply,
        Ok(inserted) => {
            db.add_aof(cmd_line_with_name("HSET", args));
            RespValue::integer(i64::from(inserted))
        }
    }
}

fn exec_hsetnx(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let field = arg_str(&args[1]);
    let value = args[2].clone();
    let result = db.update_or_init(
        &key,
        || DataValue::Hash(HashMap::new()),
        |stored, _| match stored {
            DataValue::Hash(map) => {
                if map.contains_key(&field) {
                    Ok(false)
                } else {
                    map.insert(field, value);
                    Ok(true)
                }
            }
            _ => Err(RespValue::wrong_type()),
        },
    );
    match result {
        Err(reply) => reply,
        Ok(inserted) => {
            if inserted {
                db.add_aof(cmd_line_with_name("HSET", args));
            }
            RespValue::integer(i64::from(inserted))
        }
    }
}

fn exec_hget(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let field = arg_str(&args[1]);
    match with_hash(db, &key, |map| map.get(&field).cloned()) {
        Err(reply) => reply,
        Ok(None) | Ok(Some(None)) => RespValue::Null,
        Ok(Some(Some(value))) => RespValue::BulkString(value),
    }
}

fn exec_hexists(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let field = arg_str(&args[1]);
    match with_hash(db, &key, |map| map.contains_key(&field)) {
        Err(reply) => reply,
        Ok(Some(true)) => RespValue::integer(1),
        _ => RespValue::integer(0),
    }
}

fn exec_hdel(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let fields: Vec<String> = args[1..].iter().map(arg_str).collect();
    let result = db.update(&key, |stored| match stored {
        DataValue::Hash(map) => {
            let mut deleted = 0;
            for field in &fields {
                if map.remove(field).is_some() {
                    deleted += 1;
                }
            }
            Ok((deleted, map.is_empty()))
        }
        _ => Err(RespValue::wrong_type()),
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some((deleted, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            if deleted > 0 {
                db.add_aof(cmd_line_with_name("HDEL", args));
            }
            RespValue::integer(deleted)
        }
    }
}

fn undo_hdel(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    let fields: Vec<String> = args[1..].iter().map(arg_str).collect();
    rollback_hash_fields(db, &key, fields.iter().map(String::as_str))
}

fn undo_hset(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    let field = arg_str(&args[1]);
    rollback_hash_fields(db, &key, [field.as_str()])
}

fn exec_hlen(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match with_hash(db, &key, HashMap::len) {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some(len)) => RespValue::integer(len as i64),
    }
}

fn exec_hstrlen(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let field = arg_str(&args[1]);
    match with_hash(db, &key, |map| map.get(&field).map(|v| v.len()).unwrap_or(0)) {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some(len)) => RespValue::integer(len as i64),
    }
}

fn exec_hmset(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    if args.len() % 2 != 1 {
        return RespValue::syntax_error();
    }
    let key = arg_str(&args[0]);
    let result = db.update_or_init(
        &key,
        || DataValue::Hash(HashMap::new()),
        |stored, _| match stored {
            DataValue::Hash(map) => {
                for pair in args[1..].chunks(2) {
                    map.insert(arg_str(&pair[0]), pair[1].clone());
                }
                Ok(())
            }
            _ => Err(RespValue::wrong_type()),
        },
    );
    match result {
        Err(reply) => reply,
        Ok(()) => {
            db.add_aof(cmd_line_with_name("HMSET", args));
            RespValue::ok()
        }
    }
}

fn undo_hmset(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    let fields: Vec<String> = args[1..].iter().step_by(2).map(arg_str).collect();
    rollback_hash_fields(db, &key, fields.iter().map(String::as_str))
}

fn exec_hmget(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let fields: Vec<String> = args[1..].iter().map(arg_str).collect();
    match with_hash(db, &key, |map| {
        fields
            .iter()
            .map(|field| match map.get(field) {
                Some(value) => RespValue::BulkString(value.clone()),
                None => RespValue::Null,
            })
            .collect::<Vec<_>>()
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::Array(fields.iter().map(|_| RespValue::Null).collect()),
        Ok(Some(replies)) => RespValue::Array(replies),
    }
}

fn exec_hkeys(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match with_hash(db, &key, |map| {
        map.keys().map(|k| k.as_bytes().to_vec()).collect::<Vec<_>>()
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(fields)) => RespValue::bulk_array(fields),
    }
}

fn exec_hvals(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match with_hash(db, &key, |map| {
        map.values().cloned().map(RespValue::BulkString).collect::<Vec<_>>()
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(values)) => RespValue::Array(values),
    }
}

fn exec_hgetall(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match with_hash(db, &key, |map| {
        let mut replies = Vec::with_capacity(map.len() * 2);
        for (field, value) in map {
            replies.push(RespValue::bulk_string(field.as_bytes().to_vec()));
            replies.push(RespValue::BulkString(value.clone()));
        }
        replies
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(replies)) => RespValue::Array(replies),
    }
}

fn exec_hincrby(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let field = arg_str(&args[1]);
    let delta = match parse_i64(&args[2]) {
        Ok(n) => n,
        Err(reply) => return reply,
    };
    let result = db.update(&key, |stored| match stored {
        DataValue::Hash(map) => {
            let Some(current) = map.get(&field) else {
                return Err(RespValue::no_such_key());
            };
            let current = parse_i64(current)?;
            let next = current.checked_add(delta).ok_or_else(RespValue::not_integer)?;
            let bytes = Bytes::from(next.to_string().into_bytes());
            map.insert(field.clone(), bytes.clone());
            Ok(bytes)
        }
        _ => Err(RespValue::wrong_type()),
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::no_such_key(),
        Ok(Some(bytes)) => {
            db.add_aof(cmd_line_with_name("HINCRBY", args));
            RespValue::BulkString(bytes)
        }
    }
}

/// HRANDFIELD key [count [WITHVALUES]]: positive count samples distinct
/// fields, negative count may repeat.
fn exec_hrandfield(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    if args.len() > 3 {
        return RespValue::syntax_error();
    }
    let key = arg_str(&args[0]);

    let with_values = match args.get(2) {
        None => false,
        Some(opt) if arg_str(opt).eq_ignore_ascii_case("withvalues") => true,
        Some(_) => return RespValue::syntax_error(),
    };
    let count = match args.get(1) {
        None => 1i64,
        Some(raw) => match parse_i64(raw) {
            Ok(n) => n,
            Err(reply) => return reply,
        },
    };
    if count == 0 {
        return RespValue::empty_array();
    }

    match with_hash(db, &key, |map| {
        let mut rng = rand::thread_rng();
        let all: Vec<&String> = map.keys().collect();
        let chosen: Vec<String> = if count > 0 {
            let mut shuffled = all.clone();
            shuffled.shuffle(&mut rng);
            shuffled.into_iter().take(count as usize).cloned().collect()
        } else {
            (0..count.unsigned_abs() as usize)
                .filter_map(|_| {
                    if all.is_empty() {
                        None
                    } else {
                        Some(all[rng.gen_range(0..all.len())].clone())
                    }
                })
                .collect()
        };

        let mut replies = Vec::new();
        for field in chosen {
            let value = map.get(&field).cloned();
            replies.push(RespValue::bulk_string(field.into_bytes()));
            if with_values {
                if let Some(value) = value {
                    replies.push(RespValue::BulkString(value));
                }
            }
        }
        replies
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(replies)) => RespValue::Array(replies),
    }
}

/// HSCAN key cursor [MATCH pattern] [COUNT n]. The hash is small enough
/// to return in one page; the reply cursor is always 0.
fn exec_hscan(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    if arg_str(&args[1]).parse::<usize>().is_err() {
        return RespValue::not_integer();
    }

    let mut pattern = "*".to_string();
    let mut i = 2;
    while i < args.len() {
        let opt = arg_str(&args[i]).to_ascii_lowercase();
        if i + 1 >= args.len() {
            return RespValue::syntax_error();
        }
        match opt.as_str() {
            "count" => {
                if arg_str(&args[i + 1]).parse::<usize>().is_err() {
                    return RespValue::not_integer();
                }
            }
            "match" => pattern = arg_str(&args[i + 1]),
            _ => return RespValue::syntax_error(),
        }
        i += 2;
    }

    let key = arg_str(&args[0]);
    let glob = GlobPattern::new(&pattern);
    match with_hash(db, &key, |map| {
        let mut pairs: Vec<Vec<u8>> = Vec::new();
        for (field, value) in map {
            if glob.is_match_all() || glob.matches(field.as_bytes()) {
                pairs.push(field.as_bytes().to_vec());
                pairs.push(value.to_vec());
            }
        }
        pairs
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::Array(vec![
            RespValue::bulk_string("0"),
            RespValue::empty_array(),
        ]),
        Ok(Some(pairs)) => RespValue::Array(vec![
            RespValue::bulk_string("0"),
            RespValue::bulk_array(pairs),
        ]),
    }
}

pub(crate) fn register_commands(table: &mut CommandTable) {
    register(table, "hset", exec_hset, write_first_key, Some(undo_hset), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "hsetnx", exec_hsetnx, write_first_key, Some(undo_hset), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "hget", exec_hget, read_first_key, None, 3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hexists", exec_hexists, read_first_key, None, 3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hdel", exec_hdel, write_first_key, Some(undo_hdel), -3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "hlen", exec_hlen, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hstrlen", exec_hstrlen, read_first_key, None, 3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hmset", exec_hmset, write_first_key, Some(undo_hmset), -4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "hmget", exec_hmget, read_first_key, None, -3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hkeys", exec_hkeys, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hvals", exec_hvals, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hgetall", exec_hgetall, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hincrby", exec_hincrby, write_first_key, Some(undo_hset), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "hrandfield", exec_hrandfield, read_first_key, None, -2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "hscan", exec_hscan, read_first_key, None, -3, FLAG_READ_ONLY, KeyExtra::SINGLE);
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

    #[tokio::test]
    async fn test_hset_hget() {
        let db = test_db();
        assert_eq!(run(&db, &["HSET", "h", "f", "v"]), RespValue::integer(1));
        assert_eq!(run(&db, &["HSET", "h", "f", "v2"]), RespValue::integer(0));
        assert_eq!(run(&db, &["HGET", "h", "f"]), RespValue::bulk_string("v2"));
        assert_eq!(run(&db, &["HGET", "h", "ghost"]), RespValue::Null);
        assert_eq!(run(&db, &["HGET", "ghost", "f"]), RespValue::Null);
    }

    #[tokio::test]
    async fn test_hsetnx() {
        let db = test_db();
        assert_eq!(run(&db, &["HSETNX", "h", "f", "v"]), RespValue::integer(1));
        assert_eq!(run(&db, &["HSETNX", "h", "f", "other"]), RespValue::integer(0));
        assert_eq!(run(&db, &["HGET", "h", "f"]), RespValue::bulk_string("v"));
    }

    #[tokio::test]
    async fn test_scenario_hash_lifecycle() {
        let db = test_db();
        assert_eq!(run(&db, &["HSET", "h", "f1", "v1"]), RespValue::integer(1));
        assert_eq!(run(&db, &["HMSET", "h", "f2", "v2", "f3", "v3"]), RespValue::ok());
        match run(&db, &["HGETALL", "h"]) {
            RespValue::Array(items) => assert_eq!(items.len(), 6),
            other => panic!("unexpected HGETALL reply {other:?}"),
        }
        assert_eq!(run(&db, &["HDEL", "h", "f1", "f2"]), RespValue::integer(2));
        assert_eq!(run(&db, &["HLEN", "h"]), RespValue::integer(1));
    }

    #[tokio::test]
    async fn test_hdel_removes_empty_hash() {
        let db = test_db();
        run(&db, &["HSET", "h", "f", "v"]);
        assert_eq!(run(&db, &["HDEL", "h", "f"]), RespValue::integer(1));
        assert_eq!(run(&db, &["TYPE", "h"]), RespValue::simple_string("none"));
    }

    #[tokio::test]
    async fn test_hmget_and_strlen() {
        let db = test_db();
        run(&db, &["HMSET", "h", "a", "123", "b", "xy"]);
        assert_eq!(
            run(&db, &["HMGET", "h", "a", "ghost", "b"]),
            RespValue::Array(vec![
                RespValue::bulk_string("123"),
                RespValue::Null,
                RespValue::bulk_string("xy"),
            ])
        );
        assert_eq!(run(&db, &["HSTRLEN", "h", "a"]), RespValue::integer(3));
        assert_eq!(run(&db, &["HSTRLEN", "h", "ghost"]), RespValue::integer(0));
    }

    #[tokio::test]
    async fn test_hkeys_hvals() {
        let db = test_db();
        run(&db, &["HMSET", "h", "a", "1", "b", "2"]);
        match run(&db, &["HKEYS", "h"]) {
            RespValue::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected HKEYS reply {other:?}"),
        }
        match run(&db, &["HVALS", "h"]) {
            RespValue::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected HVALS reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hincrby() {
        let db = test_db();
        run(&db, &["HSET", "h", "n", "10"]);
        assert_eq!(run(&db, &["HINCRBY", "h", "n", "5"]), RespValue::bulk_string("15"));
        assert_eq!(run(&db, &["HINCRBY", "h", "n", "-20"]), RespValue::bulk_string("-5"));
        assert_eq!(run(&db, &["HINCRBY", "h", "ghost", "1"]), RespValue::no_such_key());
        run(&db, &["HSET", "h", "s", "abc"]);
        assert_eq!(run(&db, &["HINCRBY", "h", "s", "1"]), RespValue::not_integer());
    }

    #[tokio::test]
    async fn test_hrandfield() {
        let db = test_db();
        run(&db, &["HMSET", "h", "a", "1", "b", "2", "c", "3"]);
        match run(&db, &["HRANDFIELD", "h", "2"]) {
            RespValue::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected reply {other:?}"),
        }
        match run(&db, &["HRANDFIELD", "h", "-5"]) {
            RespValue::Array(items) => assert_eq!(items.len(), 5),
            other => panic!("unexpected reply {other:?}"),
        }
        match run(&db, &["HRANDFIELD", "h", "2", "WITHVALUES"]) {
            RespValue::Array(items) => assert_eq!(items.len(), 4),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hscan_match() {
        let db = test_db();
        run(&db, &["HMSET", "h", "user:1", "a", "user:2", "b", "other", "c"]);
        let reply = run(&db, &["HSCAN", "h", "0", "MATCH", "user:*"]);
        let RespValue::Array(parts) = reply else { panic!("bad HSCAN reply") };
        assert_eq!(parts[0], RespValue::bulk_string("0"));
        let RespValue::Array(pairs) = &parts[1] else { panic!("bad pairs") };
        assert_eq!(pairs.len(), 4);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let db = test_db();
        run(&db, &["SET", "s", "v"]);
        assert_eq!(run(&db, &["HSET", "s", "f", "v"]), RespValue::wrong_type());
        assert_eq!(run(&db, &["HGETALL", "s"]), RespValue::wrong_type());
    }
}
