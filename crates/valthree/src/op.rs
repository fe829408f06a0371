//! Canonical names for the supported Valkey operations.

use std::fmt;

/// A supported Valkey operation. Only the most commonly-used operations are
/// supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Set,
    Del,
    FlushAll,
    Ping,
    Quit,
}

impl Op {
    /// Parse an operation from wire data, case-insensitively. Returns `None`
    /// for unsupported commands.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "get" => Some(Op::Get),
            "set" => Some(Op::Set),
            "del" => Some(Op::Del),
            "flushall" => Some(Op::FlushAll),
            "ping" => Some(Op::Ping),
            "quit" => Some(Op::Quit),
            _ => None,
        }
    }

    /// The canonical lowercase name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Get => "get",
            Op::Set => "set",
            Op::Del => "del",
            Op::FlushAll => "flushall",
            Op::Ping => "ping",
            Op::Quit => "quit",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
