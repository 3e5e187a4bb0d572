//! Entity → Command Reconstruction
//!
//! Serializes a live entity as the single command that recreates it:
//! SET for strings, RPUSH for lists, SADD for sets, HMSET for hashes,
//! ZADD for sorted sets. TTLs become absolute PEXPIREAT commands so the
//! reconstruction is immune to replay timing. Used by the log rewriter
//! and by transaction rollback.

use bytes::Bytes;

use crate::protocol::CmdLine;
use crate::storage::{format_score, DataEntity, DataValue};

fn key_bytes(key: &str) -> Bytes {
    Bytes::copy_from_slice(key.as_bytes())
}

/// The command that recreates `entity` under `key`. Returns `None` for
/// an empty collection, which no single command can express.
pub fn entity_to_cmd(key: &str, entity: &DataEntity) -> Option<CmdLine> {
    match &entity.data {
        DataValue::String(value) => Some(vec![
            Bytes::from_static(b"SET"),
            key_bytes(key),
            value.clone(),
        ]),
        DataValue::List(items) => {
            if items.is_empty() {
                return None;
            }
            let mut line = Vec::with_capacity(2 + items.len());
            line.push(Bytes::from_static(b"RPUSH"));
            line.push(key_bytes(key));
            line.extend(items.iter().cloned());
            Some(line)
        }
        DataValue::Set(members) => {
            if members.is_empty() {
                return None;
            }
            let mut line = Vec::with_capacity(2 + members.len());
            line.push(Bytes::from_static(b"SADD"));
            line.push(key_bytes(key));
            line.extend(members.iter().map(|m| Bytes::copy_from_slice(m.as_bytes())));
            Some(line)
        }
        DataValue::Hash(map) => {
            if map.is_empty() {
                return None;
            }
            let mut line = Vec::with_capacity(2 + map.len() * 2);
            line.push(Bytes::from_static(b"HMSET"));
            line.push(key_bytes(key));
            for (field, value) in map {
                line.push(Bytes::copy_from_slice(field.as_bytes()));
                line.push(value.clone());
            }
            Some(line)
        }
        DataValue::SortedSet(zset) => {
            if zset.is_empty() {
                return None;
            }
            let mut line = Vec::with_capacity(2 + zset.len() * 2);
            line.push(Bytes::from_static(b"ZADD"));
            line.push(key_bytes(key));
            zset.for_each_by_rank(0, zset.len() as u64, false, |element| {
                line.push(Bytes::from(format_score(element.score).into_bytes()));
                line.push(Bytes::copy_from_slice(element.member.as_bytes()));
                true
            });
            Some(line)
        }
    }
}

/// PEXPIREAT with a millisecond timestamp.
pub fn make_expire_cmd(key: &str, at_ms: u64) -> CmdLine {
    vec![
        Bytes::from_static(b"PEXPIREAT"),
        key_bytes(key),
        Bytes::from(at_ms.to_string().into_bytes()),
    ]
}
