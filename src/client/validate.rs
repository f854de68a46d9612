//! Argument checks run before any network activity

use crate::config::ClientConfig;
use crate::error::ValidationError;
use crate::protocol::{MAX_KEY_LENGTH, is_valid_key};
use crate::value::Value;
use bytes::Bytes;
use md5::{Digest, Md5};

/// Check a key and return the form sent on the wire. Oversized keys are
/// replaced by their hex MD5 digest when compression is enabled.
pub(crate) fn normalize_key(key: &str, config: &ClientConfig) -> Result<String, ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if !is_valid_key(key.as_bytes()) {
        return Err(ValidationError::InvalidKey(key.to_string()));
    }

    let max = config.max_key_size.min(MAX_KEY_LENGTH);
    if key.len() <= max {
        return Ok(key.to_string());
    }
    if config.key_compression {
        return Ok(format!("{:x}", Md5::digest(key.as_bytes())));
    }
    Err(ValidationError::KeyTooLong {
        len: key.len(),
        max,
    })
}

/// Normalize a key list, dropping duplicates. Returns `(original, wire)` pairs.
pub(crate) fn normalize_keys<K: AsRef<str>>(
    keys: &[K],
    config: &ClientConfig,
) -> Result<Vec<(String, String)>, ValidationError> {
    if keys.is_empty() {
        return Err(ValidationError::NoKeys);
    }

    let mut out: Vec<(String, String)> = Vec::with_capacity(keys.len());
    for key in keys {
        let key = key.as_ref();
        if out.iter().any(|(original, _)| original == key) {
            continue;
        }
        out.push((key.to_string(), normalize_key(key, config)?));
    }
    Ok(out)
}

/// Lifetime in seconds; 0 means never expire
pub(crate) fn check_lifetime(lifetime: u32, config: &ClientConfig) -> Result<u32, ValidationError> {
    if lifetime > config.max_expiration {
        return Err(ValidationError::LifetimeTooLong {
            lifetime,
            max: config.max_expiration,
        });
    }
    Ok(lifetime)
}

/// Encode a value and check its size against `max_value`
pub(crate) fn encode_value(
    value: &Value,
    config: &ClientConfig,
) -> Result<(u32, Bytes), ValidationError> {
    let (flags, data) = value.encode()?;
    if data.len() > config.max_value {
        return Err(ValidationError::ValueTooLarge {
            size: data.len(),
            max: config.max_value,
        });
    }
    Ok((flags, data))
}
