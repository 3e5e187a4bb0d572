//! Prepare Helpers and Rollback Synthesis
//!
//! The `prepare` functions classify a command's key arguments into write
//! and read sets before locking. The `rollback_*` functions capture
//! pre-image state as compensating command sequences: executed in
//! reverse, they restore the touched keys exactly.

use bytes::Bytes;

use crate::aof::marshal::entity_to_cmd;
use crate::database::{arg_str, Database};
use crate::protocol::{cmd_line, CmdLine};
use crate::storage::{format_score, DataValue};

/* ---- prepare variants ---- */

pub(crate) fn read_first_key(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), vec![arg_str(&args[0])])
}

pub(crate) fn write_first_key(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![arg_str(&args[0])], Vec::new())
}

pub(crate) fn write_all_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.iter().map(arg_str).collect(), Vec::new())
}

pub(crate) fn read_all_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.iter().map(arg_str).collect())
}

pub(crate) fn no_prepare(_args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), Vec::new())
}

/// RENAME src dest: dest is written, src is read.
pub(crate) fn prepare_rename(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![arg_str(&args[1])], vec![arg_str(&args[0])])
}

/// SINTER/SUNION/SDIFF: every argument is a read key.
pub(crate) fn prepare_set_calculate(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.iter().map(arg_str).collect())
}

/// SINTERSTORE-style: first argument is the destination, the rest are
/// read sources.
pub(crate) fn prepare_set_calculate_store(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![arg_str(&args[0])], args[1..].iter().map(arg_str).collect())
}

/// Keys written by every other argument pair (MSET k v k v ...).
pub(crate) fn prepare_mset(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    let keys = args.iter().step_by(2).map(arg_str).collect();
    (keys, Vec::new())
}

/* ---- rollback synthesis ---- */

/// TTL reconstruction for a key: PEXPIREAT when a TTL is present, PERSIST
/// otherwise.
pub(crate) fn to_ttl_cmd(db: &Database, key: &str) -> CmdLine {
    match db.expire_time(key) {
        Some(at_ms) => cmd_line(&["PEXPIREAT", key, &at_ms.to_string()]),
        None => cmd_line(&["PERSIST", key]),
    }
}

/// Whole-key pre-image: DEL when absent, otherwise DEL + reconstruction
/// command + TTL command.
pub(crate) fn rollback_given_keys<'a>(
    db: &Database,
    keys: impl IntoIterator<Item = &'a str>,
) -> Vec<CmdLine> {
    let mut undo = Vec::new();
    for key in keys {
        match db.entity_ref(key) {
            None => undo.push(cmd_line(&["DEL", key])),
            Some(entity) => {
                let reconstruct = entity_to_cmd(key, &entity);
                let ttl = to_ttl_cmd(db, key);
                undo.push(cmd_line(&["DEL", key]));
                if let Some(line) = reconstruct {
                    undo.push(line);
                }
                undo.push(ttl);
            }
        }
    }
    undo
}

pub(crate) fn rollback_first_key(db: &Database, args: &[Bytes]) -> Vec<CmdLine> {
    let key = arg_str(&args[0]);
    rollback_given_keys(db, [key.as_str()])
}

/// Per-field hash pre-image: HDEL for fields that were absent, HSET with
/// the prior value otherwise.
pub(crate) fn rollback_hash_fields<'a>(
    db: &Database,
    key: &str,
    fields: impl IntoIterator<Item = &'a str>,
) -> Vec<CmdLine> {
    let Some(entity) = db.entity_ref(key) else {
        return vec![cmd_line(&["DEL", key])];
    };
    let DataValue::Hash(map) = &entity.data else {
        return Vec::new();
    };
    let mut undo = Vec::new();
    for field in fields {
        match map.get(field) {
            None => undo.push(cmd_line(&["HDEL", key, field])),
            Some(value) => undo.push(vec![
                Bytes::from_static(b"HSET"),
                Bytes::copy_from_slice(key.as_bytes()),
                Bytes::copy_from_slice(field.as_bytes()),
                value.clone(),
            ]),
        }
    }
    undo
}

/// Per-member set pre-image: SREM for members that were absent, SADD
/// otherwise.
pub(crate) fn rollback_set_members<'a>(
    db: &Database,
    key: &str,
    members: impl IntoIterator<Item = &'a str>,
) -> Vec<CmdLine> {
    let Some(entity) = db.entity_ref(key) else {
        return vec![cmd_line(&["DEL", key])];
    };
    let DataValue::Set(set) = &entity.data else {
        return Vec::new();
    };
    let mut undo = Vec::new();
    for member in members {
        if set.contains(member) {
            undo.push(cmd_line(&["SADD", key, member]));
        } else {
            undo.push(cmd_line(&["SREM", key, member]));
        }
    }
    undo
}

/// Per-member sorted-set pre-image: ZREM for members that were absent,
/// ZADD with the prior score otherwise.
pub(crate) fn rollback_zset_fields<'a>(
    db: &Database,
    key: &str,
    members: impl IntoIterator<Item = &'a str>,
) -> Vec<CmdLine> {
    let Some(entity) = db.entity_ref(key) else {
        return vec![cmd_line(&["DEL", key])];
    };
    let DataValue::SortedSet(zset) = &entity.data else {
        return Vec::new();
    };
    let mut undo = Vec::new();
    for member in members {
        match zset.score(member) {
            None => undo.push(cmd_line(&["ZREM", key, member])),
            Some(score) => undo.push(cmd_line(&["ZADD", key, &format_score(score), member])),
        }
    }
    undo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::database::Database;
    use crate::protocol::cmd_line as line;
    use crate::timewheel::TimeWheel;
    use std::sync::Arc;

    fn db_with(cmds: &[&[&str]]) -> Arc<Database> {
        let db = Database::new(0, TimeWheel::start());
        let mut conn = ConnectionState::fake();
        for parts in cmds {
            let reply = db.exec(&mut conn, &line(parts));
            assert!(!reply.is_error(), "setup command failed: {parts:?}");
        }
        db
    }

    #[tokio::test]
    async fn test_prepare_variants() {
        let args = line(&["k1", "k2"]);
        assert_eq!(read_first_key(&args), (vec![], vec!["k1".to_string()]));
        assert_eq!(write_first_key(&args), (vec!["k1".to_string()], vec![]));
        assert_eq!(
            write_all_keys(&args),
            (vec!["k1".to_string(), "k2".to_string()], vec![])
        );
        assert_eq!(
            prepare_rename(&args),
            (vec!["k2".to_string()], vec!["k1".to_string()])
        );
        assert_eq!(no_prepare(&args), (vec![], vec![]));

        let store = line(&["dest", "s1", "s2"]);
        assert_eq!(
            prepare_set_calculate_store(&store),
            (vec!["dest".to_string()], vec!["s1".to_string(), "s2".to_string()])
        );

        let mset = line(&["a", "1", "b", "2"]);
        assert_eq!(prepare_mset(&mset), (vec!["a".to_string(), "b".to_string()], vec![]));
    }

    #[tokio::test]
    async fn test_rollback_absent_key_is_del() {
        let db = db_with(&[]);
        let undo = rollback_given_keys(&db, ["nope"]);
        assert_eq!(undo, vec![line(&["DEL", "nope"])]);
    }

    #[tokio::test]
    async fn test_rollback_existing_string_reconstructs() {
        let db = db_with(&[&["SET", "k", "v"]]);
        let undo = rollback_given_keys(&db, ["k"]);
        assert_eq!(undo[0], line(&["DEL", "k"]));
        assert_eq!(undo[1], line(&["SET", "k", "v"]));
        assert_eq!(undo[2], line(&["PERSIST", "k"]));
    }

    #[tokio::test]
    async fn test_rollback_hash_fields() {
        let db = db_with(&[&["HSET", "h", "f1", "v1"]]);
        let undo = rollback_hash_fields(&db, "h", ["f1", "f2"]);
        assert_eq!(undo[0], line(&["HSET", "h", "f1", "v1"]));
        assert_eq!(undo[1], line(&["HDEL", "h", "f2"]));
    }

    #[tokio::test]
    async fn test_rollback_zset_fields() {
        let db = db_with(&[&["ZADD", "z", "1.5", "a"]]);
        let undo = rollback_zset_fields(&db, "z", ["a", "b"]);
        assert_eq!(undo[0], line(&["ZADD", "z", "1.5", "a"]));
        assert_eq!(undo[1], line(&["ZREM", "z", "b"]));
    }

    #[tokio::test]
    async fn test_rollback_set_members() {
        let db = db_with(&[&["SADD", "s", "a"]]);
        let undo = rollback_set_members(&db, "s", ["a", "b"]);
        assert_eq!(undo[0], line(&["SADD", "s", "a"]));
        assert_eq!(undo[1], line(&["SREM", "s", "b"]));
    }
}
