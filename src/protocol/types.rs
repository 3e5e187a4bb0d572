//! RESP (Redis Serialization Protocol) Data Types
//!
//! Reply values exchanged with clients and written to the command log.
//! Each type starts with a prefix byte and ends with CRLF:
//!
//! - `+OK\r\n` simple string
//! - `-ERR message\r\n` error
//! - `:1000\r\n` integer
//! - `$5\r\nhello\r\n` bulk string, `$-1\r\n` null bulk
//! - `*2\r\n...` array, `*0\r\n` empty array

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A command line: the bulk-string arguments of one command, name first.
pub type CmdLine = Vec<Bytes>;

/// Builds a command line from string parts.
pub fn cmd_line(parts: &[&str]) -> CmdLine {
    parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
}

/// Builds a command line from a name plus raw argument bytes.
pub fn cmd_line_with_name(name: &str, args: &[Bytes]) -> CmdLine {
    let mut line = Vec::with_capacity(args.len() + 1);
    line.push(Bytes::copy_from_slice(name.as_bytes()));
    line.extend(args.iter().cloned());
    line
}

/// Serializes a command line as a RESP multi-bulk array, the on-wire and
/// on-log form.
pub fn cmd_line_to_bytes(line: &[Bytes]) -> Vec<u8> {
    let values = line.iter().map(|arg| RespValue::BulkString(arg.clone())).collect();
    RespValue::Array(values).serialize()
}

/// Represents a value in the RESP protocol, used for both parsing
/// incoming data and serializing outgoing replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Non-binary-safe status line: `+<string>\r\n`
    SimpleString(String),

    /// Error condition: `-<message>\r\n`
    Error(String),

    /// 64-bit signed integer: `:<n>\r\n`
    Integer(i64),

    /// Binary-safe string: `$<len>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null bulk string: `$-1\r\n`
    Null,

    /// Array of any RESP values: `*<count>\r\n<elements>`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// An array of bulk strings, the shape most multi-value replies take.
    pub fn bulk_array(items: Vec<Vec<u8>>) -> Self {
        RespValue::Array(items.into_iter().map(|i| RespValue::BulkString(Bytes::from(i))).collect())
    }

    pub fn empty_array() -> Self {
        RespValue::Array(Vec::new())
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    pub fn queued() -> Self {
        RespValue::SimpleString("QUEUED".to_string())
    }

    // ------------------------------------------------------------------
    // Canonical error replies
    // ------------------------------------------------------------------

    pub fn unknown_command(name: &str) -> Self {
        RespValue::Error(format!("ERR unknown command '{name}'"))
    }

    pub fn arg_num_error(name: &str) -> Self {
        RespValue::Error(format!("ERR wrong number of arguments for '{name}' command"))
    }

    pub fn wrong_type() -> Self {
        RespValue::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
    }

    pub fn not_integer() -> Self {
        RespValue::Error("ERR value is not an integer or out of range".to_string())
    }

    pub fn not_float() -> Self {
        RespValue::Error("ERR value is not a valid float".to_string())
    }

    pub fn no_such_key() -> Self {
        RespValue::Error("ERR no such key".to_string())
    }

    pub fn syntax_error() -> Self {
        RespValue::Error("ERR syntax error".to_string())
    }

    pub fn db_index_out_of_range() -> Self {
        RespValue::Error("ERR DB index is out of range".to_string())
    }

    pub fn exec_abort() -> Self {
        RespValue::Error("EXECABORT Transaction discarded because of previous errors.".to_string())
    }

    pub fn unknown_error() -> Self {
        RespValue::Error("ERR unknown".to_string())
    }

    /// Serializes the value into its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes into an existing buffer, reusing its capacity.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Interprets a parsed value as a command line. Commands arrive as
    /// arrays of bulk strings (inline commands are normalized to the same
    /// shape by the parser).
    pub fn into_cmd_line(self) -> Option<CmdLine> {
        let RespValue::Array(values) = self else {
            return None;
        };
        let mut line = Vec::with_capacity(values.len());
        for value in values {
            match value {
                RespValue::BulkString(b) => line.push(b),
                RespValue::SimpleString(s) => line.push(Bytes::from(s)),
                _ => return None,
            }
        }
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{s}\""),
            RespValue::Error(s) => write!(f, "(error) {s}"),
            RespValue::Integer(n) => write!(f, "(integer) {n}"),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{s}\"")
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    writeln!(f)?;
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string_serialize() {
        assert_eq!(RespValue::ok().serialize(), b"+OK\r\n");
    }

    #[test]
    fn test_error_serialize() {
        let value = RespValue::unknown_command("nope");
        assert_eq!(value.serialize(), b"-ERR unknown command 'nope'\r\n");
    }

    #[test]
    fn test_integer_serialize() {
        assert_eq!(RespValue::integer(1000).serialize(), b":1000\r\n");
        assert_eq!(RespValue::integer(-42).serialize(), b":-42\r\n");
    }

    #[test]
    fn test_bulk_string_serialize() {
        let value = RespValue::bulk_string(Bytes::from("hello"));
        assert_eq!(value.serialize(), b"$5\r\nhello\r\n");
    }

    #[test]
    fn test_null_serialize() {
        assert_eq!(RespValue::Null.serialize(), b"$-1\r\n");
    }

    #[test]
    fn test_array_serialize() {
        let value = RespValue::array(vec![
            RespValue::bulk_string(Bytes::from("GET")),
            RespValue::bulk_string(Bytes::from("name")),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
        assert_eq!(RespValue::empty_array().serialize(), b"*0\r\n");
    }

    #[test]
    fn test_cmd_line_to_bytes() {
        let line = cmd_line(&["SET", "k", "v"]);
        assert_eq!(
            cmd_line_to_bytes(&line),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"
        );
    }

    #[test]
    fn test_into_cmd_line() {
        let value = RespValue::array(vec![
            RespValue::bulk_string(Bytes::from("GET")),
            RespValue::bulk_string(Bytes::from("name")),
        ]);
        let line = value.into_cmd_line().unwrap();
        assert_eq!(line, cmd_line(&["GET", "name"]));

        assert!(RespValue::integer(3).into_cmd_line().is_none());
        assert!(RespValue::empty_array().into_cmd_line().is_none());
    }

    #[test]
    fn test_arg_num_error_text() {
        assert_eq!(
            RespValue::arg_num_error("get").serialize(),
            b"-ERR wrong number of arguments for 'get' command\r\n".to_vec()
        );
    }
}
