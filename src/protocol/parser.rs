//! Hand-written memcached ASCII reply parser
//!
//! Replies are parsed from the start of the read buffer every time new data
//! arrives. Multi-line replies (VALUE/STAT/ITEM blocks) are only returned once
//! the terminating END line is buffered, so a partial reply never escapes.

use crate::ProtocolError;
use crate::protocol::command::ReplyKind;
use bytes::Bytes;

/// Largest data block accepted in a VALUE reply (memcached caps items at 1 GiB)
pub const MAX_DATA_LENGTH: usize = 1 << 30;

/// One VALUE block from a get/gets reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    pub key: String,
    pub flags: u32,
    pub cas: Option<u64>,
    pub data: Bytes,
}

/// One ITEM line from `stats cachedump`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDumpEntry {
    pub key: String,
    /// Item size in bytes
    pub bytes: u64,
    /// Expiration as a unix timestamp (server start time for items without TTL)
    pub expires: u64,
}

/// Parsed server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Touched,
    Ok,
    Values(Vec<ValueEntry>),
    Number(u64),
    Version(String),
    Stats(Vec<(String, String)>),
    Dump(Vec<CacheDumpEntry>),
    Error,
    ClientError(String),
    ServerError(String),
}

impl Reply {
    /// Convert error lines into a protocol error, pass everything else through
    pub fn into_result(self) -> Result<Self, ProtocolError> {
        match self {
            Self::Error => Err(ProtocolError::Error),
            Self::ClientError(msg) => Err(ProtocolError::ClientError(msg)),
            Self::ServerError(msg) => Err(ProtocolError::ServerError(msg)),
            other => Ok(other),
        }
    }
}

/// Result of parsing
#[derive(Debug)]
pub enum ParseResult {
    /// Reply fully parsed, with the number of bytes consumed
    Complete(Reply, usize),
    /// Need more data to complete parsing
    NeedMoreData,
    /// Parse error; the connection is no longer in a known state
    Error(ProtocolError),
}

/// Parse one reply of the expected kind from the start of `buf`
pub fn parse_reply(buf: &[u8], kind: ReplyKind) -> ParseResult {
    let line_end = match find_crlf(buf) {
        Some(pos) => pos,
        None => return ParseResult::NeedMoreData,
    };
    let line = &buf[..line_end];
    let consumed = line_end + 2;

    // Error lines can answer any command
    if let Some(reply) = parse_error_line(line) {
        return ParseResult::Complete(reply, consumed);
    }

    match kind {
        ReplyKind::Line => match parse_status(line) {
            Some(reply) => ParseResult::Complete(reply, consumed),
            None => ParseResult::Error(unexpected(line)),
        },
        ReplyKind::Numeric => {
            if line == b"NOT_FOUND" {
                return ParseResult::Complete(Reply::NotFound, consumed);
            }
            match parse_u64(trim_end(line)) {
                Some(n) => ParseResult::Complete(Reply::Number(n), consumed),
                None => ParseResult::Error(unexpected(line)),
            }
        }
        ReplyKind::Version => match line.strip_prefix(b"VERSION ") {
            Some(version) => ParseResult::Complete(
                Reply::Version(String::from_utf8_lossy(version).trim().to_string()),
                consumed,
            ),
            None => ParseResult::Error(unexpected(line)),
        },
        ReplyKind::Retrieval => parse_values(buf),
        ReplyKind::Stats => parse_stats(buf),
        ReplyKind::Dump => parse_dump(buf),
    }
}

/// Find \r\n in buffer
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n")
}

fn parse_error_line(line: &[u8]) -> Option<Reply> {
    if line == b"ERROR" {
        return Some(Reply::Error);
    }
    if let Some(msg) = line.strip_prefix(b"CLIENT_ERROR") {
        return Some(Reply::ClientError(lossy_trimmed(msg)));
    }
    if let Some(msg) = line.strip_prefix(b"SERVER_ERROR") {
        return Some(Reply::ServerError(lossy_trimmed(msg)));
    }
    None
}

fn parse_status(line: &[u8]) -> Option<Reply> {
    let reply = match line {
        b"STORED" => Reply::Stored,
        b"NOT_STORED" => Reply::NotStored,
        b"EXISTS" => Reply::Exists,
        b"NOT_FOUND" => Reply::NotFound,
        b"DELETED" => Reply::Deleted,
        b"TOUCHED" => Reply::Touched,
        b"OK" => Reply::Ok,
        _ => return None,
    };
    Some(reply)
}

/// VALUE <key> <flags> <bytes> [<cas unique>]\r\n<data>\r\n ... END\r\n
fn parse_values(buf: &[u8]) -> ParseResult {
    let mut entries = Vec::new();
    let mut pos = 0;

    loop {
        let rest = &buf[pos..];
        let line_end = match find_crlf(rest) {
            Some(p) => p,
            None => return ParseResult::NeedMoreData,
        };
        let line = &rest[..line_end];

        if line == b"END" {
            return ParseResult::Complete(Reply::Values(entries), pos + line_end + 2);
        }

        let Some(header) = line.strip_prefix(b"VALUE ") else {
            return ParseResult::Error(unexpected(line));
        };

        let mut parts = header.split(|&b| b == b' ').filter(|p| !p.is_empty());
        let key = match parts.next() {
            Some(k) => String::from_utf8_lossy(k).to_string(),
            None => return ParseResult::Error(malformed("VALUE line missing key")),
        };
        let flags = match parts.next().and_then(parse_u32) {
            Some(f) => f,
            None => return ParseResult::Error(malformed("VALUE line has invalid flags")),
        };
        let bytes = match parts.next().and_then(parse_usize) {
            Some(b) if b <= MAX_DATA_LENGTH => b,
            _ => return ParseResult::Error(malformed("VALUE line has invalid length")),
        };
        let cas = match parts.next() {
            Some(raw) => match parse_u64(raw) {
                Some(c) => Some(c),
                None => return ParseResult::Error(malformed("VALUE line has invalid cas")),
            },
            None => None,
        };

        // Data block follows the header line
        let data_start = pos + line_end + 2;
        let Some(data_end) = data_start.checked_add(bytes) else {
            return ParseResult::Error(malformed("VALUE length overflows"));
        };
        if buf.len() < data_end.saturating_add(2) {
            return ParseResult::NeedMoreData;
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return ParseResult::Error(malformed("data block not terminated by CRLF"));
        }

        entries.push(ValueEntry {
            key,
            flags,
            cas,
            data: Bytes::copy_from_slice(&buf[data_start..data_end]),
        });
        pos = data_end + 2;
    }
}

/// STAT <name> <value>\r\n ... END\r\n
fn parse_stats(buf: &[u8]) -> ParseResult {
    let mut stats = Vec::new();
    let mut pos = 0;

    loop {
        let rest = &buf[pos..];
        let line_end = match find_crlf(rest) {
            Some(p) => p,
            None => return ParseResult::NeedMoreData,
        };
        let line = &rest[..line_end];
        pos += line_end + 2;

        if line == b"END" {
            return ParseResult::Complete(Reply::Stats(stats), pos);
        }

        let Some(body) = line.strip_prefix(b"STAT ") else {
            return ParseResult::Error(unexpected(line));
        };
        let body = String::from_utf8_lossy(body);
        match body.split_once(' ') {
            Some((name, value)) => stats.push((name.to_string(), value.to_string())),
            None => stats.push((body.to_string(), String::new())),
        }
    }
}

/// ITEM <key> [<bytes> b; <expires> s]\r\n ... END\r\n
fn parse_dump(buf: &[u8]) -> ParseResult {
    let mut items = Vec::new();
    let mut pos = 0;

    loop {
        let rest = &buf[pos..];
        let line_end = match find_crlf(rest) {
            Some(p) => p,
            None => return ParseResult::NeedMoreData,
        };
        let line = &rest[..line_end];
        pos += line_end + 2;

        if line == b"END" {
            return ParseResult::Complete(Reply::Dump(items), pos);
        }

        let Some(body) = line.strip_prefix(b"ITEM ") else {
            return ParseResult::Error(unexpected(line));
        };
        match parse_dump_item(&String::from_utf8_lossy(body)) {
            Some(item) => items.push(item),
            None => return ParseResult::Error(malformed("invalid ITEM line")),
        }
    }
}

fn parse_dump_item(body: &str) -> Option<CacheDumpEntry> {
    let (key, meta) = body.split_once(' ')?;
    let meta = meta.trim().strip_prefix('[')?.strip_suffix(']')?;
    let (bytes, expires) = meta.split_once(';')?;
    let bytes = bytes.trim().strip_suffix('b')?.trim().parse().ok()?;
    let expires = expires.trim().strip_suffix('s')?.trim().parse().ok()?;

    Some(CacheDumpEntry {
        key: key.to_string(),
        bytes,
        expires,
    })
}

fn unexpected(line: &[u8]) -> ProtocolError {
    ProtocolError::UnexpectedReply(String::from_utf8_lossy(line).to_string())
}

fn malformed(msg: &str) -> ProtocolError {
    ProtocolError::Malformed(msg.to_string())
}

fn lossy_trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    &bytes[..end]
}

/// Parse bytes as u32
fn parse_u32(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parse bytes as u64
fn parse_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parse bytes as usize
fn parse_usize(bytes: &[u8]) -> Option<usize> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
