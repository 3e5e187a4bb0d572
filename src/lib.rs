//! # emberkv: A Redis-Compatible In-Memory Key-Value Server
//!
//! emberkv speaks the RESP wire protocol and serves string, list, hash,
//! set, and sorted-set values with per-key expiration, publish/subscribe,
//! optimistic transactions, and durable persistence through an
//! append-only command log with background compaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  TCP accept loop ──> ConnectionHandler ──> Server dispatch       │
//! │                                               │                  │
//! │              meta commands ┌──────────────────┴───────┐          │
//! │            (SELECT, AUTH,  │                          ▼          │
//! │             pub/sub, AOF)  │              Database[0..16]        │
//! │                            │      prepare → lock → execute       │
//! │                            │                          │          │
//! │                            ▼                          ▼          │
//! │                        Pub/Sub Hub          append-only log      │
//! │                                          (writer task + fsync)   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP types and the incremental parser
//! - [`storage`]: sharded dictionary, striped key locks, skiplist
//!   sorted set, value union
//! - [`database`]: per-database execution pipeline, command registry,
//!   transactions, the server
//! - [`timewheel`]: named deferred tasks driving scheduled expiration
//! - [`aof`]: append-only command log, rewrite, binary snapshots
//! - [`pubsub`]: channel subscription hub
//! - [`connection`]: per-client task, state, and socket loop
//! - [`config`]: config-file and command-line settings
//!
//! ## Design Highlights
//!
//! The key space is sharded: each shard carries its own reader/writer
//! lock, and a separate striped lock table orders multi-key acquisitions
//! canonically so concurrent batches can never deadlock. Expiration is
//! scheduled best-effort on a time wheel and enforced authoritatively by
//! lazy eviction on access. Transactions are optimistic: WATCH snapshots
//! per-key version counters, EXEC revalidates them under the full lock
//! set, and failures roll back through pre-image undo commands.

pub mod aof;
pub mod config;
pub mod connection;
pub mod database;
pub mod protocol;
pub mod pubsub;
pub mod storage;
pub mod timewheel;

// Re-export commonly used types for convenience
pub use config::Config;
pub use connection::{handle_connection, ConnectionState, ConnectionStats};
pub use database::server::Server;
pub use protocol::{RespParser, RespValue};

/// The default port emberkv listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// Version of emberkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
