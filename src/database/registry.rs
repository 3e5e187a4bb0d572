//! Command Registry
//!
//! The metadata table driving dispatch: command name → executor, key
//! classifier (`prepare`), rollback synthesizer (`undo`), arity, flags,
//! and key-position info for COMMAND introspection. The table is built
//! once at first use from the per-family `register` functions.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::database::{hash, keys, list, set, strings, zset, Database};
use crate::protocol::{CmdLine, RespValue};

/// Executes a command against a database. Arguments exclude the name.
pub type ExecFn = fn(&Arc<Database>, &[Bytes]) -> RespValue;

/// Classifies key arguments into (write keys, read keys) before locking.
pub type PrepareFn = fn(&[Bytes]) -> (Vec<String>, Vec<String>);

/// Synthesizes compensating commands from pre-image state.
pub type UndoFn = fn(&Database, &[Bytes]) -> Vec<CmdLine>;

pub const FLAG_WRITE: u8 = 0;
pub const FLAG_READ_ONLY: u8 = 1;

/// Key positions within the command line, as reported by COMMAND:
/// 1-based index of the first and last key (-1 meaning "through the last
/// argument") and the step between keys. All zero for keyless commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyExtra {
    pub first_key: i32,
    pub last_key: i32,
    pub key_step: i32,
}

impl KeyExtra {
    pub(crate) const fn keys(first_key: i32, last_key: i32, key_step: i32) -> Self {
        Self { first_key, last_key, key_step }
    }

    /// One key, right after the command name.
    pub(crate) const SINGLE: KeyExtra = KeyExtra::keys(1, 1, 1);
    /// Every argument is a key (DEL, MGET, SINTER, ...).
    pub(crate) const ALL: KeyExtra = KeyExtra::keys(1, -1, 1);
    /// Keys at every other position (MSET key value key value ...).
    pub(crate) const PAIRS: KeyExtra = KeyExtra::keys(1, -1, 2);
    /// Two keys: source and destination (RENAME).
    pub(crate) const SRC_DEST: KeyExtra = KeyExtra::keys(1, 2, 1);
    /// No key arguments (KEYS, SCAN).
    pub(crate) const NONE: KeyExtra = KeyExtra::keys(0, 0, 0);
}

pub struct Command {
    pub name: &'static str,
    pub executor: ExecFn,
    pub prepare: PrepareFn,
    pub undo: Option<UndoFn>,
    pub arity: i32,
    pub flags: u8,
    pub extra: KeyExtra,
}

impl Command {
    /// One COMMAND reply row: name, arity, flags, first/last key, step.
    pub fn desc_reply(&self) -> RespValue {
        let flag = if self.flags == FLAG_READ_ONLY { "readonly" } else { "write" };
        RespValue::Array(vec![
            RespValue::bulk_string(self.name.as_bytes().to_vec()),
            RespValue::integer(i64::from(self.arity)),
            RespValue::Array(vec![RespValue::bulk_string(flag)]),
            RespValue::integer(i64::from(self.extra.first_key)),
            RespValue::integer(i64::from(self.extra.last_key)),
            RespValue::integer(i64::from(self.extra.key_step)),
        ])
    }
}

pub type CommandTable = HashMap<&'static str, Command>;

/// Registers one command into the table. Names are stored lowercase.
#[allow(clippy::too_many_arguments)]
pub(crate) fn register(
    table: &mut CommandTable,
    name: &'static str,
    executor: ExecFn,
    prepare: PrepareFn,
    undo: Option<UndoFn>,
    arity: i32,
    flags: u8,
    extra: KeyExtra,
) {
    debug_assert!(name.chars().all(|c| !c.is_ascii_uppercase()));
    table.insert(
        name,
        Command {
            name,
            executor,
            prepare,
            undo,
            arity,
            flags,
            extra,
        },
    );
}

fn build_table() -> CommandTable {
    let mut table = CommandTable::new();
    strings::register_commands(&mut table);
    keys::register_commands(&mut table);
    list::register_commands(&mut table);
    hash::register_commands(&mut table);
    set::register_commands(&mut table);
    zset::register_commands(&mut table);
    table
}

static TABLE: OnceLock<CommandTable> = OnceLock::new();

/// The full command table.
pub fn all_commands() -> &'static CommandTable {
    TABLE.get_or_init(build_table)
}

/// Looks up a command by its lowercased name.
pub fn lookup(name: &str) -> Option<&'static Command> {
    all_commands().get(name)
}
