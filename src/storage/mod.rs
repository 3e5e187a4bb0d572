//! Storage Primitives
//!
//! The data-structure layer under the database: the sharded concurrent
//! dictionary, the striped key-lock manager, the skiplist-backed sorted
//! set with its range borders, the value union, and glob matching.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ConcurrentDict                          │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐            │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ ...N    │            │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │            │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘            │
//! └──────────────────────────────────────────────────────────────┘
//! ┌──────────────────────────────────────────────────────────────┐
//! │  KeyLocks: striped RwLock<()> table for multi-key batches    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dictionary's shard locks cover single operations; the separate
//! [`KeyLocks`] table gives multi-key commands and transactions their
//! atomicity, acquired in canonical ascending stripe order.

pub mod border;
pub mod dict;
pub mod glob;
pub mod lock;
pub mod skiplist;
pub mod sorted_set;
pub mod value;

// Re-export commonly used types
pub use border::{parse_lex_border, parse_score_border, Border};
pub use dict::ConcurrentDict;
pub use glob::GlobPattern;
pub use lock::KeyLocks;
pub use skiplist::Element;
pub use sorted_set::{format_score, SortedSet};
pub use value::{DataEntity, DataValue};
