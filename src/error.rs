//! Error types for memring

use thiserror::Error;

/// Main error type for memring
#[derive(Error, Debug)]
pub enum MemringError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error on {server}: {source}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No server available for key")]
    NoServers,

    #[error("Client has been closed")]
    Closed,
}

impl MemringError {
    pub(crate) fn transport(server: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            server: server.into(),
            source,
        }
    }

    /// Returns true for failures that are retried and counted against a server
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns true if the call was rejected locally before any network activity
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Argument shape errors, reported before dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Key is empty")]
    EmptyKey,

    #[error("Key contains whitespace or control characters: {0}")]
    InvalidKey(String),

    #[error("Key too long ({len} bytes, max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Value too large ({size} bytes, max {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("Value cannot be encoded: {0}")]
    InvalidValue(String),

    #[error("Lifetime too long ({lifetime}s, max {max}s)")]
    LifetimeTooLong { lifetime: u32, max: u32 },

    #[error("No keys given")]
    NoKeys,

    #[error("Unknown server: {0}")]
    UnknownServer(String),
}

/// Connection-level failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Timed out waiting for a pooled connection")]
    AcquireTimeout,

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Server is marked dead")]
    ServerDead,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Short machine-readable name, used as the second issue token
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectTimeout => "connect_timeout",
            Self::RequestTimeout => "request_timeout",
            Self::AcquireTimeout => "acquire_timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::ServerDead => "server_dead",
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => "connection_refused",
                std::io::ErrorKind::ConnectionReset => "connection_reset",
                std::io::ErrorKind::BrokenPipe => "broken_pipe",
                _ => "io",
            },
        }
    }
}

/// Reply parsing errors and error lines sent by the server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Malformed reply: {0}")]
    Malformed(String),

    #[error("Server replied ERROR")]
    Error,

    #[error("CLIENT_ERROR {0}")]
    ClientError(String),

    #[error("SERVER_ERROR {0}")]
    ServerError(String),

    #[error("Value decoding error: {0}")]
    Decoding(String),
}

pub type Result<T> = std::result::Result<T, MemringError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = MemringError::transport("127.0.0.1:11211", TransportError::RequestTimeout);
        assert!(err.is_transport());
        assert!(!err.is_validation());
        assert_eq!(
            err.to_string(),
            "Transport error on 127.0.0.1:11211: Request timed out"
        );

        let err = MemringError::from(ValidationError::EmptyKey);
        assert!(err.is_validation());
        assert!(!err.is_transport());

        let err = MemringError::from(ProtocolError::ServerError("out of memory".to_string()));
        assert!(!err.is_transport());
    }

    #[test]
    fn test_transport_codes() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(TransportError::Io(refused).code(), "connection_refused");
        assert_eq!(TransportError::ConnectTimeout.code(), "connect_timeout");
    }
}
