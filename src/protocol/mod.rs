//! RESP Protocol Implementation
//!
//! Wire types and the incremental parser for the Redis Serialization
//! Protocol. Commands are RESP arrays of bulk strings; the same encoding
//! doubles as the append-only command-log format.

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::{cmd_line, cmd_line_to_bytes, cmd_line_with_name, CmdLine, RespValue};
