//! Memcached ASCII protocol implementation (client side)

pub mod command;
pub mod parser;
pub mod writer;

pub use command::{Command, MAX_KEY_LENGTH, ReplyKind, StatsGroup, StoreOp, is_valid_key};
pub use parser::{CacheDumpEntry, ParseResult, Reply, ValueEntry, parse_reply};
pub use writer::RequestWriter;
