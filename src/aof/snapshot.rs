//! Binary Snapshot Format
//!
//! A compact point-in-time image of every database, written either as a
//! standalone dump file (SAVE/BGSAVE) or as the preamble of a rewritten
//! command log. Layout:
//!
//! ```text
//! +----------+---------+-------------+------------------+----------+
//! | magic  8 | ver u32 | len u64 LE  | bincode payload  | end    8 |
//! +----------+---------+-------------+------------------+----------+
//! ```
//!
//! The payload carries aux fields (server version, arch bits, whether
//! this snapshot prefixes a command log, creation time) and one record
//! per database with key/TTL counts and type-tagged objects, each with
//! an optional millisecond expiry. The loader probes offset 0 for the
//! magic; anything else means "no preamble, parse commands from the
//! start".

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::database::server::Server;
use crate::storage::{DataEntity, DataValue, SortedSet};
use crate::timewheel::now_ms;

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"EMBERKV\x01";
pub const SNAPSHOT_END: &[u8; 8] = b"EMBEREND";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Metadata stored alongside the data, after the fashion of dump-file
/// aux fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxFields {
    pub server_version: String,
    pub arch_bits: u32,
    /// True when this snapshot is the preamble of a command log.
    pub aof_preamble: bool,
    /// Creation time, seconds since the epoch.
    pub ctime: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotValue {
    String(Vec<u8>),
    List(Vec<Vec<u8>>),
    Set(Vec<String>),
    Hash(Vec<(String, Vec<u8>)>),
    ZSet(Vec<(String, f64)>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: SnapshotValue,
    pub expire_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSnapshot {
    pub index: usize,
    pub key_count: u64,
    pub ttl_count: u64,
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub aux: AuxFields,
    pub dbs: Vec<DbSnapshot>,
}

fn value_to_snapshot(data: &DataValue) -> SnapshotValue {
    match data {
        DataValue::String(b) => SnapshotValue::String(b.to_vec()),
        DataValue::List(items) => SnapshotValue::List(items.iter().map(|b| b.to_vec()).collect()),
        DataValue::Set(members) => SnapshotValue::Set(members.iter().cloned().collect()),
        DataValue::Hash(map) => {
            SnapshotValue::Hash(map.iter().map(|(f, v)| (f.clone(), v.to_vec())).collect())
        }
        DataValue::SortedSet(zset) => {
            let mut pairs = Vec::with_capacity(zset.len());
            zset.for_each_by_rank(0, zset.len() as u64, false, |element| {
                pairs.push((element.member.clone(), element.score));
                true
            });
            SnapshotValue::ZSet(pairs)
        }
    }
}

pub(crate) fn snapshot_to_entity(value: &SnapshotValue) -> DataEntity {
    let data = match value {
        SnapshotValue::String(b) => DataValue::String(Bytes::from(b.clone())),
        SnapshotValue::List(items) => {
            DataValue::List(items.iter().cloned().map(Bytes::from).collect::<VecDeque<_>>())
        }
        SnapshotValue::Set(members) => {
            DataValue::Set(members.iter().cloned().collect::<HashSet<_>>())
        }
        SnapshotValue::Hash(pairs) => DataValue::Hash(
            pairs
                .iter()
                .map(|(f, v)| (f.clone(), Bytes::from(v.clone())))
                .collect::<HashMap<_, _>>(),
        ),
        SnapshotValue::ZSet(pairs) => {
            let mut zset = SortedSet::new();
            for (member, score) in pairs {
                zset.add(member, *score);
            }
            DataValue::SortedSet(zset)
        }
    };
    DataEntity::new(data)
}

/// Captures a snapshot of every non-empty database.
pub fn build_snapshot(server: &Server, aof_preamble: bool) -> Snapshot {
    let mut dbs = Vec::new();
    for index in 0..server.database_count() {
        let db = server.database(index).expect("index within database count");
        let (key_count, ttl_count) = db.sizes();
        if key_count == 0 {
            continue;
        }
        let mut entries = Vec::with_capacity(key_count);
        db.for_each(|key, entity, expire_at_ms| {
            entries.push(SnapshotEntry {
                key: key.to_string(),
                value: value_to_snapshot(&entity.data),
                expire_at_ms,
            });
            true
        });
        dbs.push(DbSnapshot {
            index,
            key_count: key_count as u64,
            ttl_count: ttl_count as u64,
            entries,
        });
    }

    Snapshot {
        aux: AuxFields {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            arch_bits: usize::BITS,
            aof_preamble,
            ctime: now_ms() / 1000,
        },
        dbs,
    }
}

/// Serializes a snapshot with framing: magic, version, payload length,
/// payload, end marker.
pub fn write_snapshot(writer: &mut impl Write, snapshot: &Snapshot) -> std::io::Result<()> {
    let payload = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(SNAPSHOT_MAGIC)?;
    writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(SNAPSHOT_END)?;
    Ok(())
}

/// Probes the reader for a snapshot frame at the current position.
/// Returns the snapshot and total frame length, or `None` when the magic
/// does not match (the caller rewinds and parses commands instead).
pub fn read_preamble(reader: &mut impl Read) -> std::io::Result<Option<(Snapshot, u64)>> {
    let mut magic = [0u8; 8];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if &magic != SNAPSHOT_MAGIC {
        return Ok(None);
    }

    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    if u32::from_le_bytes(version) != SNAPSHOT_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported snapshot version",
        ));
    }

    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    let payload_len = u64::from_le_bytes(len);

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;

    let mut end = [0u8; 8];
    reader.read_exact(&mut end)?;
    if &end != SNAPSHOT_END {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "snapshot end marker missing",
        ));
    }

    let (snapshot, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let frame_len = 8 + 4 + 8 + payload_len + 8;
    Ok(Some((snapshot, frame_len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::ConnectionState;
    use crate::protocol::cmd_line;

    fn populated_server() -> std::sync::Arc<Server> {
        let server = Server::new(Config { databases: 4, ..Config::default() });
        let mut conn = ConnectionState::fake();
        server.exec(&mut conn, &cmd_line(&["SET", "s", "hello"]));
        server.exec(&mut conn, &cmd_line(&["RPUSH", "l", "a", "b"]));
        server.exec(&mut conn, &cmd_line(&["SADD", "set", "m1", "m2"]));
        server.exec(&mut conn, &cmd_line(&["HSET", "h", "f", "v"]));
        server.exec(&mut conn, &cmd_line(&["ZADD", "z", "1.5", "a", "2.5", "b"]));
        server.exec(&mut conn, &cmd_line(&["SELECT", "2"]));
        server.exec(&mut conn, &cmd_line(&["SET", "other-db", "x"]));
        server
    }

    #[tokio::test]
    async fn test_round_trip_restores_all_types() {
        let server = populated_server();
        let snapshot = build_snapshot(&server, false);
        assert_eq!(snapshot.dbs.len(), 2);

        let mut frame = Vec::new();
        write_snapshot(&mut frame, &snapshot).unwrap();

        let mut cursor = std::io::Cursor::new(&frame);
        let (decoded, frame_len) = read_preamble(&mut cursor).unwrap().unwrap();
        assert_eq!(frame_len as usize, frame.len());

        let restored = Server::new(Config { databases: 4, ..Config::default() });
        restored.load_snapshot(&decoded);

        let mut conn = ConnectionState::fake();
        assert_eq!(
            restored.exec(&mut conn, &cmd_line(&["GET", "s"])).unwrap(),
            crate::protocol::RespValue::bulk_string("hello")
        );
        assert_eq!(
            restored.exec(&mut conn, &cmd_line(&["LRANGE", "l", "0", "-1"])).unwrap(),
            crate::protocol::RespValue::Array(vec![
                crate::protocol::RespValue::bulk_string("a"),
                crate::protocol::RespValue::bulk_string("b"),
            ])
        );
        assert_eq!(
            restored.exec(&mut conn, &cmd_line(&["SCARD", "set"])).unwrap(),
            crate::protocol::RespValue::integer(2)
        );
        assert_eq!(
            restored.exec(&mut conn, &cmd_line(&["HGET", "h", "f"])).unwrap(),
            crate::protocol::RespValue::bulk_string("v")
        );
        assert_eq!(
            restored.exec(&mut conn, &cmd_line(&["ZSCORE", "z", "b"])).unwrap(),
            crate::protocol::RespValue::bulk_string("2.5")
        );

        restored.exec(&mut conn, &cmd_line(&["SELECT", "2"]));
        assert_eq!(
            restored.exec(&mut conn, &cmd_line(&["GET", "other-db"])).unwrap(),
            crate::protocol::RespValue::bulk_string("x")
        );
    }

    #[tokio::test]
    async fn test_ttls_survive_with_millisecond_granularity() {
        let server = Server::new(Config::default());
        let mut conn = ConnectionState::fake();
        server.exec(&mut conn, &cmd_line(&["SET", "k", "v"]));
        let at_ms = now_ms() + 60_000;
        server.exec(&mut conn, &cmd_line(&["PEXPIREAT", "k", &at_ms.to_string()]));

        let snapshot = build_snapshot(&server, false);
        assert_eq!(snapshot.dbs[0].ttl_count, 1);
        assert_eq!(snapshot.dbs[0].entries[0].expire_at_ms, Some(at_ms));

        let restored = Server::new(Config::default());
        restored.load_snapshot(&snapshot);
        assert_eq!(restored.database(0).unwrap().expire_time("k"), Some(at_ms));
    }

    #[tokio::test]
    async fn test_probe_rejects_plain_command_log() {
        let log = b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n";
        let mut cursor = std::io::Cursor::new(&log[..]);
        assert!(read_preamble(&mut cursor).unwrap().is_none());

        let mut empty = std::io::Cursor::new(&b""[..]);
        assert!(read_preamble(&mut empty).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_aux_fields() {
        let server = Server::new(Config::default());
        let snapshot = build_snapshot(&server, true);
        assert!(snapshot.aux.aof_preamble);
        assert_eq!(snapshot.aux.arch_bits, usize::BITS);
        assert!(snapshot.aux.ctime > 0);
        assert!(!snapshot.aux.server_version.is_empty());
    }
}
