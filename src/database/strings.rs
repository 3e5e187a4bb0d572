//! String Commands
//!
//! GET/SET and friends. SET understands the EX/PX/NX/XX options; the
//! log records an absolute PEXPIREAT alongside the SET so replay is
//! immune to timing.

use std::sync::Arc;

use bytes::Bytes;

use crate::database::registry::{register, CommandTable, KeyExtra, FLAG_READ_ONLY, FLAG_WRITE};
use crate::database::tx_utils::{
    prepare_mset, read_all_keys, read_first_key, rollback_first_key, rollback_given_keys,
    write_first_key,
};
use crate::database::{arg_str, parse_i64, Database};
use crate::protocol::{cmd_line_with_name, CmdLine, RespValue};
use crate::storage::{DataEntity, DataValue};
use crate::timewheel::now_ms;

fn get_as_string(db: &Database, key: &str) -> Result<Option<Bytes>, RespValue> {
    db.view(key, |value| match value {
        DataValue::String(b) => Ok(b.clone()),
        _ => Err(RespValue::wrong_type()),
    })
}

fn exec_get(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match get_as_string(db, &key) {
        Err(reply) => reply,
        Ok(None) => RespValue::Null,
        Ok(Some(value)) => RespValue::BulkString(value),
    }
}

#[derive(PartialEq)]
enum SetPolicy {
    Upsert,
    InsertOnly,
    UpdateOnly,
}

/// SET key value [EX seconds | PX milliseconds] [NX | XX]
fn exec_set(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let value = args[1].clone();

    let mut policy = SetPolicy::Upsert;
    let mut ttl_ms: Option<u64> = None;

    let mut i = 2;
    while i < args.len() {
        let opt = arg_str(&args[i]).to_ascii_uppercase();
        match opt.as_str() {
            "NX" => {
                if policy == SetPolicy::UpdateOnly {
                    return RespValue::syntax_error();
                }
                policy = SetPolicy::InsertOnly;
                i += 1;
            }
            "XX" => {
                if policy == SetPolicy::InsertOnly {
                    return RespValue::syntax_error();
                }
                policy = SetPolicy::UpdateOnly;
                i += 1;
            }
            "EX" | "PX" => {
                if ttl_ms.is_some() || i + 1 >= args.len() {
                    return RespValue::syntax_error();
                }
                let raw = match parse_i64(&args[i + 1]) {
                    Ok(n) => n,
                    Err(reply) => return reply,
                };
                if raw <= 0 {
                    return RespValue::error("ERR invalid expire time in 'set' command");
                }
                let ms = if opt == "EX" { raw.saturating_mul(1000) } else { raw };
                ttl_ms = Some(ms as u64);
                i += 2;
            }
            _ => return RespValue::syntax_error(),
        }
    }

    let entity = DataEntity::new(DataValue::String(value));
    let stored = match policy {
        SetPolicy::Upsert => {
            db.put_entity(&key, entity);
            1
        }
        SetPolicy::InsertOnly => db.put_if_absent(&key, entity),
        SetPolicy::UpdateOnly => db.put_if_exists(&key, entity),
    };

    if stored == 0 {
        return RespValue::Null;
    }

    db.add_aof(cmd_line_with_name("SET", &args[..2]));
    match ttl_ms {
        Some(ms) => {
            let at = now_ms() + ms;
            db.expire(&key, at);
            db.add_aof(crate::aof::marshal::make_expire_cmd(&key, at));
        }
        None => db.persist(&key),
    }
    RespValue::ok()
}

fn exec_setnx(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let inserted = db.put_if_absent(&key, DataEntity::new(DataValue::String(args[1].clone())));
    if inserted > 0 {
        db.add_aof(cmd_line_with_name("SETNX", args));
    }
    RespValue::integer(inserted as i64)
}

fn set_with_relative_ttl(db: &Arc<Database>, args: &[Bytes], unit_ms: i64, name: &str) -> RespValue {
    let key = arg_str(&args[0]);
    let raw = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(reply) => return reply,
    };
    if raw <= 0 {
        return RespValue::error(format!("ERR invalid expire time in '{name}' command"));
    }
    let value = args[2].clone();
    db.put_entity(&key, DataEntity::new(DataValue::String(value.clone())));
    let at = now_ms() + (raw.saturating_mul(unit_ms)) as u64;
    db.expire(&key, at);
    db.add_aof(vec![
        Bytes::from_static(b"SET"),
        args[0].clone(),
        value,
    ]);
    db.add_aof(crate::aof::marshal::make_expire_cmd(&key, at));
    RespValue::ok()
}

fn exec_setex(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    set_with_relative_ttl(db, args, 1000, "setex")
}

fn exec_psetex(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    set_with_relative_ttl(db, args, 1, "psetex")
}

fn exec_mset(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    if args.len() % 2 != 0 {
        return RespValue::arg_num_error("mset");
    }
    for pair in args.chunks(2) {
        let key = arg_str(&pair[0]);
        db.put_entity(&key, DataEntity::new(DataValue::String(pair[1].clone())));
        db.persist(&key);
    }
    db.add_aof(cmd_line_with_name("MSET", args));
    RespValue::ok()
}

fn exec_msetnx(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    if args.len() % 2 != 0 {
        return RespValue::arg_num_error("msetnx");
    }
    for pair in args.chunks(2) {
        if db.contains_key(&arg_str(&pair[0])) {
            return RespValue::integer(0);
        }
    }
    for pair in args.chunks(2) {
        db.put_entity(&arg_str(&pair[0]), DataEntity::new(DataValue::String(pair[1].clone())));
    }
    db.add_aof(cmd_line_with_name("MSETNX", args));
    RespValue::integer(1)
}

fn exec_mget(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let replies = args
        .iter()
        .map(|raw| {
            let key = arg_str(raw);
            match get_as_string(db, &key) {
                Ok(Some(value)) => RespValue::BulkString(value),
                // wrong-typed keys read as nil here, by convention
                _ => RespValue::Null,
            }
        })
        .collect();
    RespValue::Array(replies)
}

fn exec_getset(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let old = match get_as_string(db, &key) {
        Err(reply) => return reply,
        Ok(old) => old,
    };
    db.put_entity(&key, DataEntity::new(DataValue::String(args[1].clone())));
    db.persist(&key);
    db.add_aof(cmd_line_with_name("SET", args));
    match old {
        Some(value) => RespValue::BulkString(value),
        None => RespValue::Null,
    }
}

fn exec_getdel(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let old = match get_as_string(db, &key) {
        Err(reply) => return reply,
        Ok(None) => return RespValue::Null,
        Ok(Some(value)) => value,
    };
    db.remove(&key);
    db.add_aof(cmd_line_with_name("DEL", &args[..1]));
    RespValue::BulkString(old)
}

fn incr_by(db: &Arc<Database>, args: &[Bytes], delta: i64, name: &str) -> RespValue {
    let key = arg_str(&args[0]);
    let result = db.update_or_init(
        &key,
        || DataValue::String(Bytes::from_static(b"0")),
        |value, _| match value {
            DataValue::String(b) => {
                let current = parse_i64(b)?;
                let next = current.checked_add(delta).ok_or_else(RespValue::not_integer)?;
                *b = Bytes::from(next.to_string().into_bytes());
                Ok(next)
            }
            _ => Err(RespValue::wrong_type()),
        },
    );
    match result {
        Err(reply) => reply,
        Ok(next) => {
            db.add_aof(cmd_line_with_name(name, args));
            RespValue::integer(next)
        }
    }
}

fn exec_incr(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    incr_by(db, args, 1, "INCR")
}

fn exec_incrby(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    match parse_i64(&args[1]) {
        Ok(delta) => incr_by(db, args, delta, "INCRBY"),
        Err(reply) => reply,
    }
}

fn exec_decr(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    incr_by(db, args, -1, "DECR")
}

fn exec_decrby(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    match parse_i64(&args[1]) {
        Ok(delta) => incr_by(db, args, delta.wrapping_neg(), "DECRBY"),
        Err(reply) => reply,
    }
}

fn exec_append(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let suffix = args[1].clone();
    let result = db.update_or_init(
        &key,
        || DataValue::String(Bytes::new()),
        |value, _| match value {
            DataValue::String(b) => {
                let mut joined = Vec::with_capacity(b.len() + suffix.len());
                joined.extend_from_slice(b);
                joined.extend_from_slice(&suffix);
                let len = joined.len();
                *b = Bytes::from(joined);
                Ok(len)
            }
            _ => Err(RespValue::wrong_type()),
        },
    );
    match result {
        Err(reply) => reply,
        Ok(len) => {
            db.add_aof(cmd_line_with_name("APPEND", args));
            RespValue::integer(len as i64)
        }
    }
}

fn exec_strlen(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match get_as_string(db, &key) {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some(value)) => RespValue::integer(value.len() as i64),
    }
}

fn undo_mset(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let keys: Vec<String> = args.iter().step_by(2).map(arg_str).collect();
    rollback_given_keys(db, keys.iter().map(String::as_str))
}

pub(crate) fn register_commands(table: &mut CommandTable) {
    register(table, "get", exec_get, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "set", exec_set, write_first_key, Some(rollback_first_key), -3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "setnx", exec_setnx, write_first_key, Some(rollback_first_key), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "setex", exec_setex, write_first_key, Some(rollback_first_key), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "psetex", exec_psetex, write_first_key, Some(rollback_first_key), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "mset", exec_mset, prepare_mset, Some(undo_mset), -3, FLAG_WRITE, KeyExtra::PAIRS);
    register(table, "msetnx", exec_msetnx, prepare_mset, Some(undo_mset), -3, FLAG_WRITE, KeyExtra::PAIRS);
    register(table, "mget", exec_mget, read_all_keys, None, -2, FLAG_READ_ONLY, KeyExtra::ALL);
    register(table, "getset", exec_getset, write_first_key, Some(rollback_first_key), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "getdel", exec_getdel, write_first_key, Some(rollback_first_key), 2, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "incr", exec_incr, write_first_key, Some(rollback_first_key), 2, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "incrby", exec_incrby, write_first_key, Some(rollback_first_key), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "decr", exec_decr, write_first_key, Some(rollback_first_key), 2, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "decrby", exec_decrby, write_first_key, Some(rollback_first_key), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "append", exec_append, write_first_key, Some(rollback_first_key), 3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "strlen", exec_strlen, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
}
