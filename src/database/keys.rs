//! Generic Key Commands
//!
//! Key lifecycle: DEL/EXISTS/TYPE/RENAME, the expiry family, and the
//! KEYS/SCAN walkers. Expiry commands log an absolute PEXPIREAT so the
//! replayed deadline matches the original wall-clock instant.

use std::sync::Arc;

use bytes::Bytes;

use crate::aof::marshal::make_expire_cmd;
use crate::database::registry::{register, CommandTable, KeyExtra, FLAG_READ_ONLY, FLAG_WRITE};
use crate::database::tx_utils::{
    no_prepare, prepare_rename, read_all_keys, read_first_key, rollback_given_keys, to_ttl_cmd,
    write_all_keys, write_first_key,
};
use crate::database::{arg_str, parse_i64, Database};
use crate::protocol::{cmd_line_with_name, CmdLine, RespValue};
use crate::storage::GlobPattern;
use crate::timewheel::now_ms;

fn exec_del(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let keys: Vec<String> = args.iter().map(arg_str).collect();
    let deleted = db.removes(&keys);
    if deleted > 0 {
        db.add_aof(cmd_line_with_name("DEL", args));
    }
    RespValue::integer(deleted as i64)
}

fn undo_del(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let keys: Vec<String> = args.iter().map(arg_str).collect();
    rollback_given_keys(db, keys.iter().map(String::as_str))
}

fn exec_exists(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let mut found = 0;
    for raw in args {
        if db.contains_key(&arg_str(raw)) {
            found += 1;
        }
    }
    RespValue::integer(found)
}

fn exec_type(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let result = match db.entity_ref(&key) {
        None => RespValue::simple_string("none"),
        Some(entity) => RespValue::simple_string(entity.data.type_name()),
    };
    result
}

fn exec_rename(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let src = arg_str(&args[0]);
    let dest = arg_str(&args[1]);

    if db.check_expired(&src) || !db.data_dict().contains_key(&src) {
        return RespValue::no_such_key();
    }
    let ttl = db.expire_time(&src);
    let Some(entity) = db.remove(&src) else {
        return RespValue::no_such_key();
    };
    db.persist(&dest);
    db.put_entity(&dest, entity);
    if let Some(at_ms) = ttl {
        db.expire(&dest, at_ms);
    }
    db.add_aof(cmd_line_with_name("RENAME", args));
    RespValue::ok()
}

fn exec_renamenx(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let src = arg_str(&args[0]);
    let dest = arg_str(&args[1]);

    if !db.contains_key(&src) {
        return RespValue::integer(0);
    }
    if db.contains_key(&dest) {
        return RespValue::integer(0);
    }
    let ttl = db.expire_time(&src);
    let Some(entity) = db.remove(&src) else {
        return RespValue::integer(0);
    };
    db.put_entity(&dest, entity);
    if let Some(at_ms) = ttl {
        db.expire(&dest, at_ms);
    }
    db.add_aof(cmd_line_with_name("RENAMENX", args));
    RespValue::integer(1)
}

fn undo_rename(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let src = arg_str(&args[0]);
    let dest = arg_str(&args[1]);
    rollback_given_keys(db, [src.as_str(), dest.as_str()])
}

/// Shared body of the four relative/absolute expiry commands.
fn set_expiry(db: &Arc<Database>, args: &[Bytes], at_ms: u64) -> RespValue {
    let key = arg_str(&args[0]);
    if !db.contains_key(&key) {
        return RespValue::integer(0);
    }
    db.expire(&key, at_ms);
    db.add_aof(make_expire_cmd(&key, at_ms));
    RespValue::integer(1)
}

fn exec_expire(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    match parse_i64(&args[1]) {
        Ok(seconds) => set_expiry(db, args, now_ms().saturating_add_signed(seconds.saturating_mul(1000))),
        Err(reply) => reply,
    }
}

fn exec_pexpire(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    match parse_i64(&args[1]) {
        Ok(ms) => set_expiry(db, args, now_ms().saturating_add_signed(ms)),
        Err(reply) => reply,
    }
}

fn exec_expireat(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    match parse_i64(&args[1]) {
        Ok(at_secs) => set_expiry(db, args, (at_secs.max(0) as u64).saturating_mul(1000)),
        Err(reply) => reply,
    }
}

fn exec_pexpireat(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    match parse_i64(&args[1]) {
        Ok(at_ms) => set_expiry(db, args, at_ms.max(0) as u64),
        Err(reply) => reply,
    }
}

fn undo_expire(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    vec![to_ttl_cmd(db, &key)]
}

fn exec_expiretime(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    if !db.contains_key(&key) {
        return RespValue::integer(-2);
    }
    match db.expire_time(&key) {
        None => RespValue::integer(-1),
        Some(at_ms) => RespValue::integer((at_ms / 1000) as i64),
    }
}

fn remaining_ms(db: &Database, key: &str) -> Option<i64> {
    db.expire_time(key).map(|at_ms| at_ms.saturating_sub(now_ms()) as i64)
}

fn exec_ttl(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    if !db.contains_key(&key) {
        return RespValue::integer(-2);
    }
    match remaining_ms(db, &key) {
        None => RespValue::integer(-1),
        Some(ms) => RespValue::integer((ms as f64 / 1000.0).round() as i64),
    }
}

fn exec_pttl(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    if !db.contains_key(&key) {
        return RespValue::integer(-2);
    }
    match remaining_ms(db, &key) {
        None => RespValue::integer(-1),
        Some(ms) => RespValue::integer(ms),
    }
}

fn exec_persist(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    if !db.contains_key(&key) {
        return RespValue::integer(0);
    }
    if db.expire_time(&key).is_none() {
        return RespValue::integer(0);
    }
    db.persist(&key);
    db.add_aof(cmd_line_with_name("PERSIST", args));
    RespValue::integer(1)
}

fn exec_keys(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let pattern = GlobPattern::new(&arg_str(&args[0]));
    let mut result: Vec<Vec<u8>> = Vec::new();
    db.data_dict().for_each(|key, _| {
        if pattern.is_match_all() || pattern.matches(key.as_bytes()) {
            result.push(key.as_bytes().to_vec());
        }
        true
    });
    // filter out anything that is only alive because nothing read it yet
    result.retain(|key| !db.check_expired(&String::from_utf8_lossy(key)));
    RespValue::bulk_array(result)
}

/// SCAN cursor [MATCH pattern] [COUNT n] [TYPE t]
fn exec_scan(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let Ok(cursor) = arg_str(&args[0]).parse::<usize>() else {
        return RespValue::error("ERR invalid cursor");
    };

    let mut count = 10usize;
    let mut pattern = "*".to_string();
    let mut scan_type: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let opt = arg_str(&args[i]).to_ascii_lowercase();
        if i + 1 >= args.len() {
            return RespValue::syntax_error();
        }
        match opt.as_str() {
            "count" => match arg_str(&args[i + 1]).parse::<usize>() {
                Ok(n) => count = n,
                Err(_) => return RespValue::syntax_error(),
            },
            "match" => pattern = arg_str(&args[i + 1]),
            "type" => scan_type = Some(arg_str(&args[i + 1]).to_ascii_lowercase()),
            _ => return RespValue::syntax_error(),
        }
        i += 2;
    }

    let (mut keys, next_cursor) = db
        .data_dict()
        .dict_scan(cursor, count, &GlobPattern::new(&pattern));

    if let Some(wanted) = scan_type {
        keys.retain(|raw| {
            let key = String::from_utf8_lossy(raw).into_owned();
            db.entity_ref(&key)
                .map(|entity| entity.data.type_name() == wanted)
                .unwrap_or(false)
        });
    }

    RespValue::Array(vec![
        RespValue::bulk_string(next_cursor.to_string()),
        RespValue::bulk_array(keys),
    ])
}

pub(crate) fn register_commands(table: &mut CommandTable) {
    register(table, "del", exec_del, write_all_keys, Some(undo_del), -2, FLAG_WRITE, KeyExtra::ALL);
    register(table, "exists", exec_exists, read_all_keys, None, -2, FLAG_READ_ONLY, KeyExtra::ALL);
    register(table, "type", exec_type, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "rename", exec_rename, prepare_rename, Some(undo_rename), 3, FLAG_WRITE, KeyExtra::SRC_DEST);
    register(table, "renamenx", exec_renamenx, prepare_rename, Some(undo_rename), 3, FLAG_WRITE, KeyExtra::SRC_DEST);
    register(table, "expire", exec_expire, write_first_key, Some(undo_expire), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "expireat", exec_expireat, write_first_key, Some(undo_expire), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "pexpire", exec_pexpire, write_first_key, Some(undo_expire), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "pexpireat", exec_pexpireat, write_first_key, Some(undo_expire), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "expiretime", exec_expiretime, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "ttl", exec_ttl, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "pttl", exec_pttl, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "persist", exec_persist, write_first_key, Some(undo_expire), 2, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "keys", exec_keys, no_prepare, None, 2, FLAG_READ_ONLY, KeyExtra::NONE);
    register(table, "scan", exec_scan, no_prepare, None, -2, FLAG_READ_ONLY, KeyExtra::NONE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::protocol::cmd_line;
    use crate::timewheel::TimeWheel;
    use std::time::Duration;

    fn test_db() -> Arc<Database> {
        Database::new(0, TimeWheel::start())
    }

    fn run(db: &Arc<Database>, parts: &[&str]) -> RespValue {
        let mut conn = ConnectionState::fake();
        db.exec(&mut conn, &cmd_line(parts))
    }

    #[tokio::test]
    async fn test_del_exists() {
        let db = test_db();
        run(&db, &["SET", "a", "1"]);
        run(&db, &["SET", "b", "2"]);
        assert_eq!(run(&db, &["EXISTS", "a", "b", "c"]), RespValue::integer(2));
        assert_eq!(run(&db, &["DEL", "a", "b", "c"]), RespValue::integer(2));
        assert_eq!(run(&db, &["EXISTS", "a"]), RespValue::integer(0));
    }

    #[tokio::test]
    async fn test_type() {
        let db = test_db();
        run(&db, &["SET", "s", "v"]);
        run(&db, &["RPUSH", "l", "v"]);
        run(&db, &["HSET", "h", "f", "v"]);
        run(&db, &["SADD", "st", "m"]);
        run(&db, &["ZADD", "z", "1", "m"]);
        assert_eq!(run(&db, &["TYPE", "s"]), RespValue::simple_string("string"));
        assert_eq!(run(&db, &["TYPE", "l"]), RespValue::simple_string("list"));
        assert_eq!(run(&db, &["TYPE", "h"]), RespValue::simple_string("hash"));
        assert_eq!(run(&db, &["TYPE", "st"]), RespValue::simple_string("set"));
        assert_eq!(run(&db, &["TYPE", "z"]), RespValue::simple_string("zset"));
        assert_eq!(run(&db, &["TYPE", "nope"]), RespValue::simple_string("none"));
    }

    #[tokio::test]
    async fn test_rename_moves_value_and_ttl() {
        let db = test_db();
        run(&db, &["SET", "src", "v"]);
        run(&db, &["EXPIRE", "src", "100"]);
        assert_eq!(run(&db, &["RENAME", "src", "dst"]), RespValue::ok());
        assert_eq!(run(&db, &["GET", "src"]), RespValue::Null);
        assert_eq!(run(&db, &["GET", "dst"]), RespValue::bulk_string("v"));
        assert!(db.expire_time("dst").is_some());
        assert!(db.expire_time("src").is_none());
        assert_eq!(run(&db, &["RENAME", "ghost", "dst"]), RespValue::no_such_key());
    }

    #[tokio::test]
    async fn test_renamenx_refuses_existing_dest() {
        let db = test_db();
        run(&db, &["SET", "a", "1"]);
        run(&db, &["SET", "b", "2"]);
        assert_eq!(run(&db, &["RENAMENX", "a", "b"]), RespValue::integer(0));
        assert_eq!(run(&db, &["RENAMENX", "a", "c"]), RespValue::integer(1));
        assert_eq!(run(&db, &["GET", "c"]), RespValue::bulk_string("1"));
    }

    #[tokio::test]
    async fn test_expire_ttl_persist() {
        let db = test_db();
        run(&db, &["SET", "k", "v"]);
        assert_eq!(run(&db, &["TTL", "k"]), RespValue::integer(-1));
        assert_eq!(run(&db, &["EXPIRE", "k", "100"]), RespValue::integer(1));

        let ttl = match run(&db, &["TTL", "k"]) {
            RespValue::Integer(n) => n,
            other => panic!("unexpected TTL reply {other:?}"),
        };
        assert!(ttl <= 100 && ttl >= 99, "ttl was {ttl}");

        assert_eq!(run(&db, &["PERSIST", "k"]), RespValue::integer(1));
        assert_eq!(run(&db, &["PERSIST", "k"]), RespValue::integer(0));
        assert_eq!(run(&db, &["TTL", "k"]), RespValue::integer(-1));
        assert_eq!(run(&db, &["TTL", "ghost"]), RespValue::integer(-2));
        assert_eq!(run(&db, &["EXPIRE", "ghost", "10"]), RespValue::integer(0));
    }

    #[tokio::test]
    async fn test_expired_key_reports_minus_two() {
        let db = test_db();
        run(&db, &["SET", "k", "v"]);
        run(&db, &["PEXPIRE", "k", "30"]);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(run(&db, &["GET", "k"]), RespValue::Null);
        assert_eq!(run(&db, &["TTL", "k"]), RespValue::integer(-2));
    }

    #[tokio::test]
    async fn test_expiretime_and_pexpireat() {
        let db = test_db();
        run(&db, &["SET", "k", "v"]);
        let at_ms = now_ms() + 90_000;
        assert_eq!(run(&db, &["PEXPIREAT", "k", &at_ms.to_string()]), RespValue::integer(1));
        assert_eq!(run(&db, &["EXPIRETIME", "k"]), RespValue::integer((at_ms / 1000) as i64));
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let db = test_db();
        run(&db, &["MSET", "hello", "1", "hallo", "2", "world", "3"]);
        let reply = run(&db, &["KEYS", "h?llo"]);
        match reply {
            RespValue::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected KEYS reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scan_completes_within_shard_count() {
        let db = test_db();
        let mut conn = ConnectionState::fake();
        for i in 0..100 {
            db.exec(&mut conn, &cmd_line(&["SET", &format!("k{i}"), "v"]));
        }

        let mut seen = std::collections::HashSet::new();
        let mut cursor = "0".to_string();
        let mut calls = 0;
        loop {
            let reply = run(&db, &["SCAN", &cursor, "COUNT", "10"]);
            let RespValue::Array(parts) = reply else { panic!("bad SCAN reply") };
            let RespValue::BulkString(next) = &parts[0] else { panic!("bad cursor") };
            let RespValue::Array(keys) = &parts[1] else { panic!("bad key list") };
            for key in keys {
                if let RespValue::BulkString(b) = key {
                    seen.insert(b.clone());
                }
            }
            calls += 1;
            cursor = String::from_utf8_lossy(next).into_owned();
            if cursor == "0" {
                break;
            }
        }
        assert_eq!(seen.len(), 100);
        assert!(calls <= db.data_dict().shard_count());
    }

    #[tokio::test]
    async fn test_scan_type_filter() {
        let db = test_db();
        run(&db, &["SET", "s1", "v"]);
        run(&db, &["RPUSH", "l1", "v"]);
        let reply = run(&db, &["SCAN", "0", "COUNT", "100", "TYPE", "list"]);
        let RespValue::Array(parts) = reply else { panic!("bad SCAN reply") };
        let RespValue::Array(keys) = &parts[1] else { panic!("bad key list") };
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0], RespValue::bulk_string("l1"));
    }
}
