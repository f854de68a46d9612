//! Prelude module for common imports.
//!
//! # Usage
//!
//! ```ignore
//! use memring::prelude::*;
//! ```

// Error types
pub use crate::error::{MemringError, ProtocolError, Result, TransportError, ValidationError};

// Configuration
pub use crate::config::{ClientConfig, Config, Servers};
pub use crate::hashring::HashAlgorithm;

// Client
pub use crate::client::{CasValue, Client, CommandContext, ServerStats, VersionInfo};
pub use crate::value::Value;

// Events
pub use crate::event::{ClientEvent, EventKind, IssueEvent};
pub use crate::health::{ServerState, ServerStatus};

// Metrics
pub use crate::metrics::Metrics;

// Common external crates
pub use std::sync::Arc;
pub use tracing::{debug, error, info, trace, warn};
