//! Sorted-Set Commands
//!
//! Rank, score-range, and lexicographic-range queries over the skiplist
//! sorted set. Rank arguments follow the usual negative-offset
//! convention and are clamped to the set bounds; score and lex range
//! endpoints are parsed as [`Border`]s with exclusivity and ±infinity.

use std::sync::Arc;

use bytes::Bytes;

use crate::database::registry::{register, CommandTable, KeyExtra, FLAG_READ_ONLY, FLAG_WRITE};
use crate::database::tx_utils::{
    read_first_key, rollback_first_key, rollback_zset_fields, write_first_key,
};
use crate::database::{arg_str, parse_f64, parse_i64, Database};
use crate::protocol::{cmd_line_with_name, CmdLine, RespValue};
use crate::storage::{
    format_score, parse_lex_border, parse_score_border, Border, DataValue, Element, GlobPattern,
    SortedSet,
};

fn with_zset<R>(db: &Database, key: &str, f: impl FnOnce(&SortedSet) -> R) -> Result<Option<R>, RespValue> {
    db.view(key, |value| match value {
        DataValue::SortedSet(zset) => Ok(f(zset)),
        _ => Err(RespValue::wrong_type()),
    })
}

fn with_zset_mut<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&mut SortedSet) -> R,
) -> Result<Option<R>, RespValue> {
    db.update(key, |value| match value {
        DataValue::SortedSet(zset) => Ok(f(zset)),
        _ => Err(RespValue::wrong_type()),
    })
}

fn with_zset_init<R>(
    db: &Database,
    key: &str,
    f: impl FnOnce(&mut SortedSet) -> R,
) -> Result<R, RespValue> {
    db.update_or_init(
        key,
        || DataValue::SortedSet(SortedSet::new()),
        |value, _| match value {
            DataValue::SortedSet(zset) => Ok(f(zset)),
            _ => Err(RespValue::wrong_type()),
        },
    )
}

/// Member or member/score reply rows.
fn elements_reply(elements: Vec<Element>, with_scores: bool) -> RespValue {
    let mut rows = Vec::with_capacity(elements.len() * if with_scores { 2 } else { 1 });
    for element in elements {
        rows.push(RespValue::bulk_string(element.member.into_bytes()));
        if with_scores {
            rows.push(RespValue::bulk_string(format_score(element.score).into_bytes()));
        }
    }
    RespValue::Array(rows)
}

fn exec_zadd(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    if args.len() % 2 != 1 {
        return RespValue::arg_num_error("zadd");
    }
    let key = arg_str(&args[0]);
    let pairs = (args.len() - 1) / 2;

    let mut elements = Vec::with_capacity(pairs);
    for i in 0..pairs {
        let score = match parse_f64(&args[2 * i + 1]) {
            Ok(score) => score,
            Err(reply) => return reply,
        };
        elements.push((arg_str(&args[2 * i + 2]), score));
    }

    let result = with_zset_init(db, &key, |zset| {
        let mut added = 0;
        for (member, score) in elements {
            if zset.add(&member, score) {
                added += 1;
            }
        }
        added
    });
    match result {
        Err(reply) => reply,
        Ok(added) => {
            db.add_aof(cmd_line_with_name("ZADD", args));
            RespValue::integer(added)
        }
    }
}

fn undo_zadd(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    let members: Vec<String> = args[2..].iter().step_by(2).map(arg_str).collect();
    rollback_zset_fields(db, &key, members.iter().map(String::as_str))
}

fn exec_zscore(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let member = arg_str(&args[1]);
    match with_zset(db, &key, |zset| zset.score(&member)) {
        Err(reply) => reply,
        Ok(None) | Ok(Some(None)) => RespValue::Null,
        Ok(Some(Some(score))) => RespValue::bulk_string(format_score(score).into_bytes()),
    }
}

fn exec_zincrby(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let delta = match parse_f64(&args[1]) {
        Ok(delta) => delta,
        Err(reply) => return reply,
    };
    let member = arg_str(&args[2]);

    let result = with_zset_mut(db, &key, |zset| {
        zset.score(&member).map(|score| {
            let next = score + delta;
            zset.add(&member, next);
            next
        })
    });
    match result {
        Err(reply) => reply,
        Ok(None) | Ok(Some(None)) => RespValue::error("ERR field doesn't exist"),
        Ok(Some(Some(next))) => {
            db.add_aof(cmd_line_with_name("ZINCRBY", args));
            RespValue::bulk_string(format_score(next).into_bytes())
        }
    }
}

fn undo_zincr(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    let member = arg_str(&args[2]);
    rollback_zset_fields(db, &key, [member.as_str()])
}

fn rank(db: &Arc<Database>, args: &[Bytes], desc: bool) -> RespValue {
    let key = arg_str(&args[0]);
    let member = arg_str(&args[1]);
    match with_zset(db, &key, |zset| zset.rank(&member, desc)) {
        Err(reply) => reply,
        Ok(None) => RespValue::Null,
        Ok(Some(-1)) => RespValue::Null,
        Ok(Some(rank)) => RespValue::integer(rank),
    }
}

fn exec_zrank(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    rank(db, args, false)
}

fn exec_zrevrank(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    rank(db, args, true)
}

fn exec_zcard(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    match with_zset(db, &key, SortedSet::len) {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some(len)) => RespValue::integer(len as i64),
    }
}

/// Normalizes signed start/stop rank bounds to `[start, stop)` over
/// `size`, the shared ZRANGE/ZREMRANGEBYRANK convention.
fn normalize_rank_bounds(mut start: i64, mut stop: i64, size: i64) -> Option<(u64, u64)> {
    if start < -size {
        start = 0;
    } else if start < 0 {
        start += size;
    } else if start >= size {
        return None;
    }
    if stop < -size {
        stop = 0;
    } else if stop < 0 {
        stop += size + 1;
    } else if stop < size {
        stop += 1;
    } else {
        stop = size;
    }
    if stop < start {
        stop = start;
    }
    Some((start as u64, stop as u64))
}

fn range_by_rank(db: &Arc<Database>, args: &[Bytes], desc: bool, name: &str) -> RespValue {
    if args.len() != 3 && args.len() != 4 {
        return RespValue::arg_num_error(name);
    }
    let with_scores = match args.get(3) {
        None => false,
        Some(opt) if arg_str(opt).eq_ignore_ascii_case("withscores") => true,
        Some(_) => return RespValue::syntax_error(),
    };
    let (start, stop) = match (parse_i64(&args[1]), parse_i64(&args[2])) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };

    let key = arg_str(&args[0]);
    match with_zset(db, &key, |zset| {
        match normalize_rank_bounds(start, stop, zset.len() as i64) {
            None => Vec::new(),
            Some((from, to)) => zset.range_by_rank(from, to, desc),
        }
    }) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(elements)) => elements_reply(elements, with_scores),
    }
}

fn exec_zrange(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    range_by_rank(db, args, false, "zrange")
}

fn exec_zrevrange(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    range_by_rank(db, args, true, "zrevrange")
}

/// Parses the trailing [WITHSCORES] [LIMIT offset count] options of the
/// score-range queries.
fn parse_score_range_options(args: &[Bytes]) -> Result<(bool, i64, i64), RespValue> {
    let mut with_scores = false;
    let mut offset = 0i64;
    let mut limit = -1i64;

    let mut i = 3;
    while i < args.len() {
        let opt = arg_str(&args[i]).to_ascii_uppercase();
        match opt.as_str() {
            "WITHSCORES" => {
                with_scores = true;
                i += 1;
            }
            "LIMIT" => {
                if args.len() < i + 3 {
                    return Err(RespValue::syntax_error());
                }
                offset = parse_i64(&args[i + 1])?;
                limit = parse_i64(&args[i + 2])?;
                i += 3;
            }
            _ => return Err(RespValue::syntax_error()),
        }
    }
    Ok((with_scores, offset, limit))
}

fn range_by_score(db: &Arc<Database>, args: &[Bytes], desc: bool) -> RespValue {
    // ZREVRANGEBYSCORE takes max before min
    let (min_arg, max_arg) = if desc { (&args[2], &args[1]) } else { (&args[1], &args[2]) };
    let min = match parse_score_border(&arg_str(min_arg)) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let max = match parse_score_border(&arg_str(max_arg)) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let (with_scores, offset, limit) = match parse_score_range_options(args) {
        Ok(options) => options,
        Err(reply) => return reply,
    };

    let key = arg_str(&args[0]);
    match with_zset(db, &key, |zset| zset.range(&min, &max, offset, limit, desc)) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(elements)) => elements_reply(elements, with_scores),
    }
}

fn exec_zrangebyscore(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    range_by_score(db, args, false)
}

fn exec_zrevrangebyscore(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    range_by_score(db, args, true)
}

fn exec_zcount(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let min = match parse_score_border(&arg_str(&args[1])) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let max = match parse_score_border(&arg_str(&args[2])) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let key = arg_str(&args[0]);
    match with_zset(db, &key, |zset| zset.range_count(&min, &max)) {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some(count)) => RespValue::integer(count as i64),
    }
}

fn exec_zremrangebyscore(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let min = match parse_score_border(&arg_str(&args[1])) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let max = match parse_score_border(&arg_str(&args[2])) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let key = arg_str(&args[0]);
    let result = with_zset_mut(db, &key, |zset| {
        let removed = zset.remove_range(&min, &max);
        (removed, zset.is_empty())
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(cmd_line_with_name("ZREMRANGEBYSCORE", args));
            }
            RespValue::integer(removed as i64)
        }
    }
}

fn exec_zremrangebyrank(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let (start, stop) = match (parse_i64(&args[1]), parse_i64(&args[2])) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };
    let key = arg_str(&args[0]);
    let result = with_zset_mut(db, &key, |zset| {
        match normalize_rank_bounds(start, stop, zset.len() as i64) {
            None => (0, zset.is_empty()),
            Some((from, to)) => {
                let removed = zset.remove_by_rank(from, to);
                (removed, zset.is_empty())
            }
        }
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(cmd_line_with_name("ZREMRANGEBYRANK", args));
            }
            RespValue::integer(removed as i64)
        }
    }
}

fn exec_zrem(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let members: Vec<String> = args[1..].iter().map(arg_str).collect();
    let result = with_zset_mut(db, &key, |zset| {
        let mut removed = 0;
        for member in &members {
            if zset.remove(member) {
                removed += 1;
            }
        }
        (removed, zset.is_empty())
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(cmd_line_with_name("ZREM", args));
            }
            RespValue::integer(removed)
        }
    }
}

fn undo_zrem(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    let members: Vec<String> = args[1..].iter().map(arg_str).collect();
    rollback_zset_fields(db, &key, members.iter().map(String::as_str))
}

fn exec_zpopmin(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let key = arg_str(&args[0]);
    let count = match args.get(1) {
        None => 1usize,
        Some(raw) => match parse_i64(raw) {
            Ok(n) if n >= 0 => n as usize,
            Ok(_) => return RespValue::not_integer(),
            Err(reply) => return reply,
        },
    };
    if count == 0 {
        return RespValue::empty_array();
    }
    let result = with_zset_mut(db, &key, |zset| {
        let popped = zset.pop_min(count);
        (popped, zset.is_empty())
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some((popped, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            if !popped.is_empty() {
                db.add_aof(cmd_line_with_name("ZPOPMIN", args));
            }
            elements_reply(popped, true)
        }
    }
}

fn exec_zlexcount(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let min = match parse_lex_border(&arg_str(&args[1])) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let max = match parse_lex_border(&arg_str(&args[2])) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let key = arg_str(&args[0]);
    match with_zset(db, &key, |zset| zset.range_count(&min, &max)) {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some(count)) => RespValue::integer(count as i64),
    }
}

/// Parses key min max [LIMIT offset count] for the lex ranges. For the
/// reversed form the endpoint arguments arrive max-first.
fn parse_lex_range(args: &[Bytes], desc: bool, name: &str) -> Result<(Border, Border, i64, i64), RespValue> {
    let n = args.len();
    if n > 3 && !arg_str(&args[3]).eq_ignore_ascii_case("limit") {
        return Err(RespValue::syntax_error());
    }
    if n != 3 && n != 6 {
        return Err(RespValue::arg_num_error(name));
    }

    let (min_arg, max_arg) = if desc { (&args[2], &args[1]) } else { (&args[1], &args[2]) };
    let min = parse_lex_border(&arg_str(min_arg)).map_err(RespValue::error)?;
    let max = parse_lex_border(&arg_str(max_arg)).map_err(RespValue::error)?;

    let mut offset = 0i64;
    let mut limit = -1i64;
    if n > 3 {
        offset = parse_i64(&args[4])?;
        let count = parse_i64(&args[5])?;
        if count >= 0 {
            limit = count;
        }
    }
    Ok((min, max, offset, limit))
}

fn range_by_lex(db: &Arc<Database>, args: &[Bytes], desc: bool, name: &str) -> RespValue {
    let (min, max, offset, limit) = match parse_lex_range(args, desc, name) {
        Ok(parsed) => parsed,
        Err(reply) => return reply,
    };
    if offset < 0 {
        return RespValue::empty_array();
    }
    let key = arg_str(&args[0]);
    match with_zset(db, &key, |zset| zset.range(&min, &max, offset, limit, desc)) {
        Err(reply) => reply,
        Ok(None) => RespValue::empty_array(),
        Ok(Some(elements)) => elements_reply(elements, false),
    }
}

fn exec_zrangebylex(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    range_by_lex(db, args, false, "zrangebylex")
}

fn exec_zrevrangebylex(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    range_by_lex(db, args, true, "zrevrangebylex")
}

fn exec_zremrangebylex(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let min = match parse_lex_border(&arg_str(&args[1])) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let max = match parse_lex_border(&arg_str(&args[2])) {
        Ok(border) => border,
        Err(message) => return RespValue::error(message),
    };
    let key = arg_str(&args[0]);
    let result = with_zset_mut(db, &key, |zset| {
        let removed = zset.remove_range(&min, &max);
        (removed, zset.is_empty())
    });
    match result {
        Err(reply) => reply,
        Ok(None) => RespValue::integer(0),
        Ok(Some((removed, now_empty))) => {
            if now_empty {
                db.remove(&key);
            }
            if removed > 0 {
                db.add_aof(cmd_line_with_name("ZREMRANGEBYLEX", args));
            }
            RespValue::integer(removed as i64)
        }
    }
}

/// ZSCAN key cursor [MATCH pattern] [COUNT n]; one page, cursor 0.
fn exec_zscan(db: &Arc<Database>, args: &[Bytes]) -> RespValue {
    let Ok(cursor) = arg_str(&args[1]).parse::<usize>() else {
        return RespValue::not_integer();
    };

    let mut count = 10usize;
    let mut pattern = "*".to_string();
    let mut i = 2;
    while i < args.len() {
        let opt = arg_str(&args[i]).to_ascii_lowercase();
        if i + 1 >= args.len() {
            return RespValue::syntax_error();
        }
        match opt.as_str() {
            "count" => match arg_str(&args[i + 1]).parse::<usize>() {
                Ok(n) => count = n,
                Err(_) => return RespValue::not_integer(),
            },
            "match" => pattern = arg_str(&args[i + 1]),
            _ => return RespValue::syntax_error(),
        }
        i += 2;
    }

    let key = arg_str(&args[0]);
    let glob = GlobPattern::new(&pattern);
    match with_zset(db, &key, |zset| zset.scan(cursor, count, &glob)) {
        Err(reply) => reply,
        Ok(None) => RespValue::Array(vec![
            RespValue::bulk_string("0"),
            RespValue::empty_array(),
        ]),
        Ok(Some((pairs, next_cursor))) => RespValue::Array(vec![
            RespValue::bulk_string(next_cursor.to_string()),
            RespValue::bulk_array(pairs),
        ]),
    }
}

pub(crate) fn register_commands(table: &mut CommandTable) {
    register(table, "zadd", exec_zadd, write_first_key, Some(undo_zadd), -4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "zscore", exec_zscore, read_first_key, None, 3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zincrby", exec_zincrby, write_first_key, Some(undo_zincr), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "zrank", exec_zrank, read_first_key, None, 3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zrevrank", exec_zrevrank, read_first_key, None, 3, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zcard", exec_zcard, read_first_key, None, 2, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zcount", exec_zcount, read_first_key, None, 4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zrange", exec_zrange, read_first_key, None, -4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zrevrange", exec_zrevrange, read_first_key, None, -4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zrangebyscore", exec_zrangebyscore, read_first_key, None, -4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zrevrangebyscore", exec_zrevrangebyscore, read_first_key, None, -4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zremrangebyscore", exec_zremrangebyscore, write_first_key, Some(rollback_first_key), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "zremrangebyrank", exec_zremrangebyrank, write_first_key, Some(rollback_first_key), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "zrem", exec_zrem, write_first_key, Some(undo_zrem), -3, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "zpopmin", exec_zpopmin, write_first_key, Some(rollback_first_key), -2, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "zlexcount", exec_zlexcount, read_first_key, None, 4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zrangebylex", exec_zrangebylex, read_first_key, None, -4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zrevrangebylex", exec_zrevrangebylex, read_first_key, None, -4, FLAG_READ_ONLY, KeyExtra::SINGLE);
    register(table, "zremrangebylex", exec_zremrangebylex, write_first_key, Some(rollback_first_key), 4, FLAG_WRITE, KeyExtra::SINGLE);
    register(table, "zscan", exec_zscan, read_first_key, None, -3, FLAG_READ_ONLY, KeyExtra::SINGLE);
}
