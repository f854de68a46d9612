//! Memcached ASCII protocol request builder

use bytes::BytesMut;
use itoa::Buffer;

/// Request writer for memcached ASCII protocol
pub struct RequestWriter {
    buf: BytesMut,
}

impl RequestWriter {
    /// Create a new request writer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Get the internal buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Write a retrieval command
    /// Format: get <key>*\r\n
    pub fn retrieval(&mut self, command: &str, keys: &[String]) {
        self.buf.extend_from_slice(command.as_bytes());
        for key in keys {
            self.buf.extend_from_slice(b" ");
            self.buf.extend_from_slice(key.as_bytes());
        }
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write a storage command with its data block
    /// Format: <command> <key> <flags> <exptime> <bytes> [<cas unique>]\r\n<data>\r\n
    pub fn storage(
        &mut self,
        command: &str,
        key: &str,
        flags: u32,
        exptime: u32,
        data: &[u8],
        cas: Option<u64>,
    ) {
        let mut itoa_buf = Buffer::new();
        self.buf.reserve(command.len() + key.len() + data.len() + 48);
        self.buf.extend_from_slice(command.as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(flags).as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(exptime).as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf
            .extend_from_slice(itoa_buf.format(data.len()).as_bytes());
        if let Some(cas) = cas {
            self.buf.extend_from_slice(b" ");
            self.buf.extend_from_slice(itoa_buf.format(cas).as_bytes());
        }
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write incr/decr
    pub fn arithmetic(&mut self, command: &str, key: &str, amount: u64) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(command.as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(amount).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write delete
    pub fn delete(&mut self, key: &str) {
        self.buf.extend_from_slice(b"delete ");
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write touch
    pub fn touch(&mut self, key: &str, exptime: u32) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(b"touch ");
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(exptime).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write stats with an optional group argument
    pub fn stats(&mut self, group: Option<&str>) {
        self.buf.extend_from_slice(b"stats");
        if let Some(group) = group {
            self.buf.extend_from_slice(b" ");
            self.buf.extend_from_slice(group.as_bytes());
        }
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write stats cachedump
    pub fn cachedump(&mut self, slab: u32, limit: u32) {
        let mut itoa_buf = Buffer::new();
        self.buf.extend_from_slice(b"stats cachedump ");
        self.buf.extend_from_slice(itoa_buf.format(slab).as_bytes());
        self.buf.extend_from_slice(b" ");
        self.buf.extend_from_slice(itoa_buf.format(limit).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Write a bare command line (version, flush_all)
    pub fn line(&mut self, command: &str) {
        self.buf.extend_from_slice(command.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }
}

impl Default for RequestWriter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage() {
        let mut writer = RequestWriter::new(256);
        writer.storage("set", "mykey", 42, 3600, b"hello", None);
        assert_eq!(writer.buffer(), b"set mykey 42 3600 5\r\nhello\r\n");
    }

    #[test]
    fn test_retrieval() {
        let mut writer = RequestWriter::new(256);
        writer.retrieval("gets", &["a".to_string(), "b".to_string()]);
        assert_eq!(writer.buffer(), b"gets a b\r\n");
        writer.clear();
        assert!(writer.buffer().is_empty());
    }

    #[test]
    fn test_simple_commands() {
        let mut writer = RequestWriter::new(256);

        writer.arithmetic("incr", "counter", 5);
        assert_eq!(writer.buffer(), b"incr counter 5\r\n");
        writer.clear();

        writer.delete("gone");
        assert_eq!(writer.buffer(), b"delete gone\r\n");
        writer.clear();

        writer.touch("k", 10);
        assert_eq!(writer.buffer(), b"touch k 10\r\n");
        writer.clear();

        writer.line("flush_all");
        assert_eq!(writer.buffer(), b"flush_all\r\n");
    }

    #[test]
    fn test_stats() {
        let mut writer = RequestWriter::new(256);

        writer.stats(None);
        assert_eq!(writer.buffer(), b"stats\r\n");
        writer.clear();

        writer.stats(Some("slabs"));
        assert_eq!(writer.buffer(), b"stats slabs\r\n");
        writer.clear();

        writer.cachedump(3, 100);
        assert_eq!(writer.buffer(), b"stats cachedump 3 100\r\n");
    }
}
