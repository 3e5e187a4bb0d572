//! Set Commands
//!
//! Deduplicated string bags, including the INTER/UNION/DIFF algebra and
//! their STORE variants. SPOP is logged as an SREM of the members it
//! actually removed, so replay stays deterministic.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::database::registry::{register, CommandTable, KeyExtra, FLAG_READ_ONLY, FLAG_WRITE};
use crate::database::tx_utils::{
    prepare_set_calculate, prepare_set_calculate_store, read_first_key, rollback_first_key,
    rollback_set_members, write_first_key,
};
use crate::database::{arg_str, parse_i64, Database};
use crate::protocol::{cmd_line_with_name, CmdLine, RespValue};
use crate::storage::{DataEntity, DataValue, GlobPattern};

fn with_set<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&HashSet<String>) -> R,
) -> Result<Option<R>, RespValue> {
    db.view(key, |value| match value {
        DataValue::Set(set) => Ok(f(set)),
        _ => Err(RespValue::wrong_type()),
    })
}

fn exec_sadd(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let members: Vec<String> = args[1..].iter().map(arg_str).collect();
    let result = db.update_or_init(
        &key,
        || DataValue::Set(HashSet::new()),
        |stored, _| match stored {
            DataValue::Set(set) => {
                let mut added = 0;
                for member in members {
                    if set.insert(member) {
                        added += 1;
                    }
                }
                Ok(added)
            }
            _ => Err(RespValue::wrong_type()),
        },
    );
    match result {
        Err(reply) => reply,
        Ok(added) => {
            if added > 0 {
                db.add_aof(cmd_line_with_name("SADD", args));
            }
            RespValue::integer(added)
        }
    }
}

fn exec_srem(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let members: Vec<String> = args[1..].iter().map(arg_str).collect();
    let result = db.update(&key, |stored| match stored {
        DataValue::Set(set) => {
            let mut removed = 0;
            for member in &members {
                if set.remove(member) {
                    removed += 1;
                }
            }
            Ok((removed, set.is_empty()))
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
                db.add_aof(cmd_line_with_name("SREM", args));
            }
            RespValue::integer(removed)
        }
    }
}

fn undo_set_change(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    let members: Vec<String> = args[1..].iter().map(arg_str).collect();
    rollback_set_members(db, &key, members.iter().map(String::as_str))
}

fn exec_smembers(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match with_set(db, &key, |set| {
        set.iter().map(|m| m.as_bytes().to_vec()).collect::<Vec<_>>()
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(members)) => RespValue::bulk_array(members),
    }
}

fn exec_sismember(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let member = arg_str(&args[1]);
    match with_set(db, &key, |set| set.contains(&member)) {
        Err(reply) => reply,
        Ok(Some(true)) => RespValue::integer(1),
        _ => RespValue::integer(0),
    }
}

fn exec_scard(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match with_set(db, &key, HashSet::len) {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some(len)) => RespValue::integer(len as i64),
    }
}

/// SPOP key [count]
fn exec_spop(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    if args.len() > 2 {
        return RespValue::syntax_error();
    }
    let key = arg_str(&args[0]);
    let count = match args.get(1) {
        None => None,
        Some(raw) => match parse_i64(raw) {
            Ok(n) if n >= 0 => Some(n as usize),
            Ok(_) => return RespValue::error("ERR value is out of range, must be positive"),
            Err(reply) => return reply,
        },
    };

    let wanted = count.unwrap_or(1);
    let result = db.update(&key, |stored| match stored {
        DataValue::Set(set) => {
            let mut members: Vec<String> = set.iter().cloned().collect();
            members.shuffle(&mut rand::thread_rng());
            members.truncate(wanted);
            for member in &members {
                set.remove(member);
            }
            Ok((members, set.is_empty()))
        }
        _ => Err(RespValue::wrong_type()),
    });

    match result {
        Err(reply) => reply,
        Ok(None) => {
            if count.is_some() {
                RespValue::empty_array()
            } else {
                RespValue::Null
            }
        }
        Ok(Some((popped, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            if !popped.is_empty() {
                let mut log = vec![Bytes::from_static(b"SREM"), args[0].clone()];
                log.extend(popped.iter().map(|m| Bytes::copy_from_slice(m.as_bytes())));
                db.add_aof(log);
            }
            match count {
                None => match popped.into_iter().next() {
                    Some(member) => RespValue::bulk_string(member.into_bytes()),
                    None => RespValue::Null,
                },
                Some(_) => {
                    RespValue::bulk_array(popped.into_iter().map(String::into_bytes).collect())
                }
            }
        }
    }
}

/// SRANDMEMBER key [count]: positive count distinct, negative may repeat.
fn exec_srandmember(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    if args.len() > 2 {
        return RespValue::syntax_error();
    }
    let key = arg_str(&args[0]);
    let count = match args.get(1) {
        None => None,
        Some(raw) => match parse_i64(raw) {
            Ok(n) => Some(n),
            Err(reply) => return reply,
        },
    };

    match with_set(db, &key, |set| {
        let mut rng = rand::thread_rng();
        let all: Vec<&String> = set.iter().collect();
        match count {
            None => all
                .choose(&mut rng)
                .map(|m| vec![m.as_bytes().to_vec()])
                .unwrap_or_default(),
            Some(n) if n >= 0 => {
                let mut shuffled = all.clone();
                shuffled.shuffle(&mut rng);
                shuffled
                    .into_iter()
                    .take(n as usize)
                    .map(|m| m.as_bytes().to_vec())
                    .collect()
            }
            Some(n) => (0..n.unsigned_abs() as usize)
                .filter_map(|_| {
                    if all.is_empty() {
                        None
                    } else {
                        Some(all[rng.gen_range(0..all.len())].as_bytes().to_vec())
                    }
                })
                .collect(),
        }
    }) {
        Err(reply) => reply,
        Ok(None) => {
            if count.is_some() {
                RespValue::empty_array()
            } else {
                RespValue::Null
            }
        }
        Ok(Some(members)) => match count {
            None => match members.into_iter().next() {
                Some(member) => RespValue::bulk_string(member),
                None => RespValue::Null,
            },
            Some(_) => RespValue::bulk_array(members),
        },
    }
}

enum SetOp {
    Inter,
    Union,
    Diff,
}

/// Loads each source set (missing keys read as empty) and folds them.
fn calculate(db: &Database, keys: &[Bytes], op: &SetOp) -> Result<HashSet<String>, RespValue> {
    let mut result: Option<HashSet<String>> = None;
    for raw in keys {
        let key = arg_str(raw);
        let members = match with_set(db, &key, |set| set.clone())? {
            Some(set) => set,
            None => HashSet::new(),
        };
        result = Some(match result {
            None => members,
            Some(acc) => match op {
                SetOp::Inter => acc.intersection(&members).cloned().collect(),
                SetOp::Union => acc.union(&members).cloned().collect(),
                SetOp::Diff => acc.difference(&members).cloned().collect(),
            },
        });
    }
    Ok(result.unwrap_or_default())
}

fn exec_calculate(db: &Arc<Database>, args: &[Bytes], op: SetOp) -> RespValue {
    match calculate(db, args, &op) {
        Err(reply) => reply,
        Ok(result) => {
            RespValue::bulk_array(result.into_iter().map(String::into_bytes).collect())
        }
    }
}

fn exec_calculate_store(db: &Arc<Database>, args: &[Bytes], op: SetOp, name: &str) -> RespValue {
    let dest = arg_str(&args[0]);
    let result = match calculate(db, &args[1..], &op) {
        Err(reply) => reply,
        Ok(result) => {
            let len = result.len();
            if result.is_empty() {
                db.remove(&dest);
                db.add_aof(cmd_line_with_name("DEL", &args[..1]));
            } else {
                db.put_entity(&dest, DataEntity::new(DataValue::Set(result)));
                db.persist(&dest);
                db.add_aof(cmd_line_with_name(name, args));
            }
            RespValue::integer(len as i64)
        }
    };
    result
}

fn exec_sinter(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    exec_calculate(db, args, SetOp::Inter)
}

fn exec_sunion(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    exec_calculate(db, args, SetOp::Union)
}

fn exec_sdiff(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    exec_calculate(db, args, SetOp::Diff)
}

fn exec_sinterstore(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    exec_calculate_store(db, args, SetOp::Inter, "SINTERSTORE")
}

fn exec_sunionstore(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    exec_calculate_store(db, args, SetOp::Union, "SUNIONSTORE")
}

fn exec_sdiffstore(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    exec_calculate_store(db, args, SetOp::Diff, "SDIFFSTORE")
}

/// SSCAN key cursor [MATCH pattern] [COUNT n]; one page, cursor 0.
fn exec_sscan(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
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
    match with_set(db, &key, |set| {
        set.iter()
            .filter(|m| glob.is_match_all() || glob.matches(m.as_bytes()))
            .map(|m| m.as_bytes().to_vec())
            .collect::<Vec<_>>()
    }) {
        Err(reply) => reply,
        Ok(found) => RespValue::Array(vec![
            RespValue::bulk_string("0"),
            RespValue::bulk_array(found.unwrap_or_default()),
        ]),
    }
}

pub(crate) fn register_commands(table: &mut CommandTable) {
    register(table, "sadd", exec_sadd, write_first_key, Some(undo_set_change), -3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "srem", exec_srem, write_first_key, Some(undo_set_change), -3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "smembers", exec_smembers, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "sismember", exec_sismember, read_first_key, None, 3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "scard", exec_scard, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "spop", exec_spop, write_first_key, Some(rollback_first_key), -2, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "srandmember", exec_srandmember, read_first_key, None, -2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "sinter", exec_sinter, prepare_set_calculate, None, -2, FLAG_READ_ONLY, KeyExtra::ALL);
    register(table, "sunion", exec_sunion, prepare_set_calculate, None, -2, FLAG_READ_ONLY, KeyExtra::ALL);
    register(table, "sdiff", exec_sdiff, prepare_set_calculate, None, -2, FLAG_READ_ONLY, KeyExtra::ALL);
    register(table, "sinterstore", exec_sinterstore, prepare_set_calculate_store, Some(rollback_first_key), -3, FLAG_WRITE, KeyExtra::ALL);
    register(table, "sunionstore", exec_sunionstore, prepare_set_calculate_store, Some(rollback_first_key), -3, FLAG_WRITE, KeyExtra::ALL);
    register(table, "sdiffstore", exec_sdiffstore, prepare_set_calculate_store, Some(rollback_first_key), -3, FLAG_WRITE, KeyExtra::ALL);
    register(table, "sscan", exec_sscan, read_first_key, None, -3, FLAG_READ_ONLY, KeyExtra::SINGLE);
}
