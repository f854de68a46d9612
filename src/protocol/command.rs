//! Memcached ASCII protocol command types (client side)

use crate::protocol::writer::RequestWriter;
use bytes::Bytes;

/// Maximum key length accepted by memcached itself
pub const MAX_KEY_LENGTH: usize = 250;

/// Storage command verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Cas => "cas",
        }
    }
}

/// Argument to the `stats` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsGroup {
    General,
    Settings,
    Slabs,
    Items,
}

impl StatsGroup {
    pub fn argument(self) -> Option<&'static str> {
        match self {
            Self::General => None,
            Self::Settings => Some("settings"),
            Self::Slabs => Some("slabs"),
            Self::Items => Some("items"),
        }
    }
}

/// Shape of the reply a command expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// One status line (STORED, DELETED, OK, ...)
    Line,
    /// VALUE blocks terminated by END
    Retrieval,
    /// A number or NOT_FOUND
    Numeric,
    /// STAT lines terminated by END
    Stats,
    /// ITEM lines terminated by END
    Dump,
    /// VERSION line
    Version,
}

/// Command sent to a memcached server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// get <key>*
    Get { keys: Vec<String> },

    /// gets <key>*
    Gets { keys: Vec<String> },

    /// <op> <key> <flags> <exptime> <bytes> [<cas unique>]
    Store {
        op: StoreOp,
        key: String,
        flags: u32,
        exptime: u32,
        data: Bytes,
        cas: Option<u64>,
    },

    /// incr <key> <value>
    Incr { key: String, amount: u64 },

    /// decr <key> <value>
    Decr { key: String, amount: u64 },

    /// delete <key>
    Delete { key: String },

    /// touch <key> <exptime>
    Touch { key: String, exptime: u32 },

    /// version
    Version,

    /// stats [group]
    Stats { group: StatsGroup },

    /// stats cachedump <slab> <limit>
    CacheDump { slab: u32, limit: u32 },

    /// flush_all
    FlushAll,
}

impl Command {
    /// Command name used in logs, metrics and issue tokens
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Gets { .. } => "gets",
            Self::Store { op, .. } => op.as_str(),
            Self::Incr { .. } => "incr",
            Self::Decr { .. } => "decr",
            Self::Delete { .. } => "delete",
            Self::Touch { .. } => "touch",
            Self::Version => "version",
            Self::Stats { group } => match group {
                StatsGroup::General => "stats",
                StatsGroup::Settings => "settings",
                StatsGroup::Slabs => "slabs",
                StatsGroup::Items => "items",
            },
            Self::CacheDump { .. } => "cachedump",
            Self::FlushAll => "flush",
        }
    }

    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Self::Get { .. } | Self::Gets { .. } => ReplyKind::Retrieval,
            Self::Incr { .. } | Self::Decr { .. } => ReplyKind::Numeric,
            Self::Version => ReplyKind::Version,
            Self::Stats { .. } => ReplyKind::Stats,
            Self::CacheDump { .. } => ReplyKind::Dump,
            Self::Store { .. } | Self::Delete { .. } | Self::Touch { .. } | Self::FlushAll => {
                ReplyKind::Line
            }
        }
    }

    /// Encode the command onto the wire
    pub fn encode(&self, writer: &mut RequestWriter) {
        match self {
            Self::Get { keys } => writer.retrieval("get", keys),
            Self::Gets { keys } => writer.retrieval("gets", keys),
            Self::Store {
                op,
                key,
                flags,
                exptime,
                data,
                cas,
            } => writer.storage(op.as_str(), key, *flags, *exptime, data, *cas),
            Self::Incr { key, amount } => writer.arithmetic("incr", key, *amount),
            Self::Decr { key, amount } => writer.arithmetic("decr", key, *amount),
            Self::Delete { key } => writer.delete(key),
            Self::Touch { key, exptime } => writer.touch(key, *exptime),
            Self::Version => writer.line("version"),
            Self::Stats { group } => writer.stats(group.argument()),
            Self::CacheDump { slab, limit } => writer.cachedump(*slab, *limit),
            Self::FlushAll => writer.line("flush_all"),
        }
    }
}

/// Check if a key is syntactically valid (length limits are configured separately)
pub fn is_valid_key(key: &[u8]) -> bool {
    if key.is_empty() {
        return false;
    }
    // Keys cannot contain control characters or whitespace
    key.iter().all(|&b| b > 32 && b < 127)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key(b"valid_key"));
        assert!(is_valid_key(b"key-with-dashes"));
        assert!(is_valid_key(b"key:with:colons"));
        assert!(!is_valid_key(b""));
        assert!(!is_valid_key(b"key with space"));
        assert!(!is_valid_key(b"key\twith\ttab"));
        assert!(!is_valid_key("ключ".as_bytes()));
    }

    #[test]
    fn test_reply_kinds() {
        assert_eq!(
            Command::Get {
                keys: vec!["a".to_string()]
            }
            .reply_kind(),
            ReplyKind::Retrieval
        );
        assert_eq!(
            Command::Incr {
                key: "a".to_string(),
                amount: 1
            }
            .reply_kind(),
            ReplyKind::Numeric
        );
        assert_eq!(Command::FlushAll.reply_kind(), ReplyKind::Line);
        assert_eq!(
            Command::Stats {
                group: StatsGroup::Slabs
            }
            .name(),
            "slabs"
        );
    }

    #[test]
    fn test_encode_cas() {
        let cmd = Command::Store {
            op: StoreOp::Cas,
            key: "k".to_string(),
            flags: 2,
            exptime: 60,
            data: Bytes::from_static(b"{}"),
            cas: Some(99),
        };
        let mut writer = RequestWriter::new(64);
        cmd.encode(&mut writer);
        assert_eq!(writer.buffer(), b"cas k 2 60 2 99\r\n{}\r\n");
    }
}
