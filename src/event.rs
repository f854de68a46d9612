//! Server health events broadcast to subscribers

use std::fmt;
use std::time::Duration;

/// What happened to a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An operation against the server failed
    Issue,
    /// The server crossed the failure threshold and is dead
    Failure,
    /// A reconnection probe is starting
    Reconnecting,
    /// A reconnection probe succeeded
    Reconnect,
    /// The server was permanently taken out of the ring
    Remove,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Failure => "failure",
            Self::Reconnecting => "reconnecting",
            Self::Reconnect => "reconnect",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server identity plus the health counters at the time of the event
#[derive(Debug, Clone, PartialEq)]
pub struct IssueEvent {
    pub server: String,
    /// Operation class and error kind, e.g. `["get", "connection_refused"]`
    pub tokens: [String; 2],
    pub messages: Vec<String>,
    /// Consecutive failures
    pub failures: u32,
    pub total_failures: u64,
    pub total_reconnects_attempted: u64,
    pub total_reconnects_success: u64,
    pub total_reconnects_failed: u64,
    /// Time spent dead, including the current outage
    pub total_down_time: Duration,
}

/// Event delivered on `Client::subscribe`
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub kind: EventKind,
    pub issue: IssueEvent,
}
