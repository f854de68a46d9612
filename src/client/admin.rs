//! Server-wide commands: version, stats groups, cachedump and flush
//!
//! Everything except `cachedump` fans out to every server on the ring and
//! returns one record per server that answered, ordered by server. A server
//! that fails is left out; its failure already went through the event stream.
//! The call only fails when no server answered.

use super::{Client, CommandContext, reject};
use crate::error::ValidationError;
use crate::protocol::{CacheDumpEntry, Command, Reply, StatsGroup};
use crate::{MemringError, Result};
use std::time::Instant;
use tracing::warn;

/// `version` reply of one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub server: String,
    /// Full version string as reported
    pub version: String,
    pub major: u32,
    pub minor: u32,
    pub bugfix: u32,
}

impl VersionInfo {
    fn parse(server: String, version: String) -> Self {
        let mut parts = version.split('.').map(leading_number);
        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        let bugfix = parts.next().unwrap_or(0);
        Self {
            server,
            version,
            major,
            minor,
            bugfix,
        }
    }
}

fn leading_number(part: &str) -> u32 {
    let digits = part.bytes().take_while(u8::is_ascii_digit).count();
    part[..digits].parse().unwrap_or(0)
}

/// `stats`, `stats settings`, `stats slabs` or `stats items` of one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub server: String,
    /// Name/value pairs in the order the server sent them
    pub values: Vec<(String, String)>,
}

impl ServerStats {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name)?.parse().ok()
    }
}

impl Client {
    pub async fn version(&self) -> Result<Vec<VersionInfo>> {
        self.fanout(Command::Version, |server, reply| match reply {
            Reply::Version(version) => Ok(VersionInfo::parse(server, version)),
            other => Err(reject(other)),
        })
        .await
    }

    /// `stats settings` from every server
    pub async fn settings(&self) -> Result<Vec<ServerStats>> {
        self.stats_group(StatsGroup::Settings).await
    }

    pub async fn stats(&self) -> Result<Vec<ServerStats>> {
        self.stats_group(StatsGroup::General).await
    }

    /// `stats slabs` from every server
    pub async fn slabs(&self) -> Result<Vec<ServerStats>> {
        self.stats_group(StatsGroup::Slabs).await
    }

    /// `stats items` from every server
    pub async fn items(&self) -> Result<Vec<ServerStats>> {
        self.stats_group(StatsGroup::Items).await
    }

    /// Dump up to `limit` keys of one slab class from one server
    /// (0 means no limit)
    pub async fn cachedump(
        &self,
        server: &str,
        slab: u32,
        limit: u32,
    ) -> Result<Vec<CacheDumpEntry>> {
        let inner = &self.inner;
        let ctx = CommandContext::new("cachedump");
        let started = Instant::now();

        let (id, result) = match inner.topology.find(server) {
            None => (
                None,
                Err(MemringError::from(ValidationError::UnknownServer(
                    server.to_string(),
                ))),
            ),
            Some(id) => {
                let command = Command::CacheDump { slab, limit };
                let result = match inner.dispatch(&command, || Some(id)).await {
                    Ok((_, Reply::Dump(entries))) => Ok(entries),
                    Ok((_, other)) => Err(reject(other)),
                    Err(e) => Err(e),
                };
                (Some(id), result)
            }
        };

        inner.finish(ctx, started, id, &result);
        result
    }

    /// `flush_all` on every server. A server that fails reports `false`.
    pub async fn flush(&self) -> Result<Vec<bool>> {
        let inner = &self.inner;
        let ctx = CommandContext::new("flush");
        let started = Instant::now();

        let result = inner.fanout(Command::FlushAll).await.map(|results| {
            results
                .into_iter()
                .map(|(id, result)| match result {
                    Ok(Reply::Ok) => true,
                    Ok(other) => {
                        warn!(server = inner.address(id), error = %reject(other), "Flush refused");
                        false
                    }
                    Err(e) => {
                        warn!(server = inner.address(id), error = %e, "Flush failed");
                        false
                    }
                })
                .collect()
        });

        inner.finish(ctx, started, None, &result);
        result
    }

    async fn stats_group(&self, group: StatsGroup) -> Result<Vec<ServerStats>> {
        self.fanout(Command::Stats { group }, |server, reply| match reply {
            Reply::Stats(values) => Ok(ServerStats { server, values }),
            other => Err(reject(other)),
        })
        .await
    }

    /// Fan out and map every reply, skipping servers that failed
    async fn fanout<T>(
        &self,
        command: Command,
        map: impl Fn(String, Reply) -> Result<T>,
    ) -> Result<Vec<T>> {
        let inner = &self.inner;
        let name = command.name();
        let ctx = CommandContext::new(name);
        let started = Instant::now();

        let result = match inner.fanout(command).await {
            Ok(results) => {
                let mut records = Vec::with_capacity(results.len());
                let mut first_error = None;
                for (id, result) in results {
                    let server = inner.address(id);
                    match result.and_then(|reply| map(server.to_string(), reply)) {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            warn!(server, command = name, error = %e, "Server left out of reply");
                            first_error.get_or_insert(e);
                        }
                    }
                }
                match first_error {
                    Some(e) if records.is_empty() => Err(e),
                    _ => Ok(records),
                }
            }
            Err(e) => Err(e),
        };

        inner.finish(ctx, started, None, &result);
        result
    }
}
