//! Stored Value Shapes
//!
//! Every key maps to a [`DataEntity`] wrapping one of the five supported
//! value shapes. Command executors pattern-match on the tag and answer a
//! wrong-type error on mismatch.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::storage::sorted_set::SortedSet;

/// Tagged union over the supported value shapes.
#[derive(Debug)]
pub enum DataValue {
    /// Binary-safe string.
    String(Bytes),
    /// Ordered sequence with O(1) push/pop at both ends.
    List(VecDeque<Bytes>),
    /// Deduplicated string bag.
    Set(HashSet<String>),
    /// Field → value mapping.
    Hash(HashMap<String, Bytes>),
    /// Score-ordered member set.
    SortedSet(SortedSet),
}

impl DataValue {
    /// Type name as reported by TYPE.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::String(_) => "string",
            DataValue::List(_) => "list",
            DataValue::Set(_) => "set",
            DataValue::Hash(_) => "hash",
            DataValue::SortedSet(_) => "zset",
        }
    }
}

/// A stored entity: the value bound to a key.
#[derive(Debug)]
pub struct DataEntity {
    pub data: DataValue,
}

impl DataEntity {
    pub fn new(data: DataValue) -> Self {
        Self { data }
    }

    pub fn string(value: impl Into<Bytes>) -> Self {
        Self::new(DataValue::String(value.into()))
    }
}
