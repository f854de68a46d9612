//! # memring
//!
//! Distributed memcached client with consistent hashing, per-server
//! connection pools and automatic failover.
//!
//! ## Features
//!
//! - Memcached ASCII protocol (get/gets/set/add/replace/cas/append/prepend,
//!   incr/decr, delete, touch, stats groups, cachedump, flush_all)
//! - Consistent hash ring (MD5 or CRC32) with per-server weights
//! - Bounded connection pool per server with idle eviction
//! - Failure tracking, dead-server exclusion, fail-over servers and
//!   scheduled reconnection probes
//! - Health events and per-command diagnostics over broadcast channels
//! - Prometheus metrics
//!
//! ## Example
//!
//! ```ignore
//! use memring::{Client, ClientConfig};
//!
//! let client = Client::new(
//!     vec!["10.0.0.1:11211", "10.0.0.2:11211"],
//!     ClientConfig::default(),
//! )?;
//! client.set("user:42", "ada", 3600).await?;
//! let user = client.get("user:42").await?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Client       │────▶│ Topology     │     │ memcached #1 │
//! │  validate    │     │  hash ring   │     ├──────────────┤
//! │  dispatch    │     └──────▲───────┘     │ memcached #2 │
//! │  retry       │────────────┼────────────▶├──────────────┤
//! └──────┬───────┘            │  Pool per   │ fail-over    │
//!        ▼                    │  server     └──────────────┘
//! ┌──────────────┐  exclude / include
//! │ Health       │────────────┘
//! │  tracker     │──▶ issue / failure / reconnecting / reconnect / remove
//! └──────────────┘
//! ```

// Modules
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod event;
pub mod hashring;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod prelude;
pub mod protocol;
pub mod value;

// Re-exports for convenience
pub use client::{CasValue, Client, CommandContext, ServerStats, VersionInfo};
pub use config::{ClientConfig, Config, Servers};
pub use error::{MemringError, ProtocolError, Result, TransportError, ValidationError};
pub use event::{ClientEvent, EventKind, IssueEvent};
pub use hashring::HashAlgorithm;
pub use health::{ServerState, ServerStatus};
pub use protocol::CacheDumpEntry;
pub use value::Value;
