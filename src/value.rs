//! Value encoding/decoding for memcached items
//!
//! The item flags record how the payload was produced:
//! - 0 = UTF-8 text
//! - 2 = JSON document
//! - 4 = raw binary
//! - 8 = number, written as decimal text so incr/decr keep working

use crate::ProtocolError;
use crate::ValidationError;
use bytes::Bytes;

/// Flag for JSON documents
pub const FLAG_JSON: u32 = 1 << 1;
/// Flag for raw binary payloads
pub const FLAG_BINARY: u32 = 1 << 2;
/// Flag for numbers
pub const FLAG_NUMERIC: u32 = 1 << 3;

/// Value stored in or fetched from memcached
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Json(serde_json::Value),
    Binary(Bytes),
    Integer(i64),
    Float(f64),
}

impl Value {
    /// Encode to `(flags, payload)`
    pub fn encode(&self) -> Result<(u32, Bytes), ValidationError> {
        let encoded = match self {
            Self::Text(s) => (0, Bytes::copy_from_slice(s.as_bytes())),
            Self::Json(v) => {
                let data = serde_json::to_vec(v)
                    .map_err(|e| ValidationError::InvalidValue(e.to_string()))?;
                (FLAG_JSON, Bytes::from(data))
            }
            Self::Binary(b) => (FLAG_BINARY, b.clone()),
            Self::Integer(n) => {
                let mut buf = itoa::Buffer::new();
                (FLAG_NUMERIC, Bytes::copy_from_slice(buf.format(*n).as_bytes()))
            }
            // Debug formatting keeps the fractional part ("2.0"), so it decodes as a float again
            Self::Float(f) => (FLAG_NUMERIC, Bytes::from(format!("{f:?}"))),
        };
        Ok(encoded)
    }

    /// Decode a payload according to its flags
    pub fn decode(flags: u32, data: Bytes) -> Result<Self, ProtocolError> {
        if flags & FLAG_JSON != 0 {
            return serde_json::from_slice(&data)
                .map(Self::Json)
                .map_err(|e| ProtocolError::Decoding(format!("invalid JSON value: {e}")));
        }

        if flags & FLAG_BINARY != 0 {
            return Ok(Self::Binary(data));
        }

        if flags & FLAG_NUMERIC != 0 {
            let s = std::str::from_utf8(&data)
                .map_err(|_| ProtocolError::Decoding("numeric value is not UTF-8".to_string()))?
                .trim();
            if let Ok(n) = s.parse::<i64>() {
                return Ok(Self::Integer(n));
            }
            return s
                .parse::<f64>()
                .map(Self::Float)
                .map_err(|_| ProtocolError::Decoding(format!("invalid numeric value: {s}")));
        }

        // Plain text; anything that is not UTF-8 is handed back as bytes
        match String::from_utf8(data.to_vec()) {
            Ok(s) => Ok(Self::Text(s)),
            Err(_) => Ok(Self::Binary(data)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(s) => Some(s.as_bytes()),
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text() {
        let (flags, data) = Value::from("hello").encode().unwrap();
        assert_eq!(flags, 0);
        assert_eq!(data.as_ref(), b"hello");
        assert_eq!(
            Value::decode(flags, data).unwrap().as_str(),
            Some("hello")
        );
    }

    #[test]
    fn test_json() {
        let doc = json!({"name": "ada", "tags": [1, 2]});
        let (flags, data) = Value::from(doc.clone()).encode().unwrap();
        assert_eq!(flags, FLAG_JSON);
        assert_eq!(Value::decode(flags, data).unwrap(), Value::Json(doc));
    }

    #[test]
    fn test_numbers_keep_their_kind() {
        let (flags, data) = Value::from(41_i64).encode().unwrap();
        assert_eq!(flags, FLAG_NUMERIC);
        assert_eq!(data.as_ref(), b"41");
        assert_eq!(Value::decode(flags, data).unwrap(), Value::Integer(41));

        let (flags, data) = Value::from(2.0).encode().unwrap();
        assert_eq!(data.as_ref(), b"2.0");
        assert_eq!(Value::decode(flags, data).unwrap(), Value::Float(2.0));
    }

    #[test]
    fn test_invalid_numeric() {
        let result = Value::decode(FLAG_NUMERIC, Bytes::from_static(b"hello"));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_utf8_text_falls_back_to_binary() {
        let value = Value::decode(0, Bytes::from_static(&[0xff, 0xfe])).unwrap();
        assert_eq!(value, Value::Binary(Bytes::from_static(&[0xff, 0xfe])));
    }

    #[test]
    fn test_invalid_json() {
        assert!(Value::decode(FLAG_JSON, Bytes::from_static(b"{nope")).is_err());
    }
}
