//! Memcached client and command dispatcher
//!
//! A `Client` is cheap to clone; clones share pools, health state and the
//! ring. Every single-key command takes the same path: validate the arguments,
//! resolve the key on the current ring, check out a connection from that
//! server's pool, send, and map the reply. Transport failures are reported to
//! the health tracker and retried with a fresh resolution, up to `retries`
//! extra attempts. Negative replies (`NOT_STORED`, `EXISTS`, `NOT_FOUND`) are
//! ordinary results and never retried.

mod admin;
mod reconnect;
mod validate;

pub use admin::{ServerStats, VersionInfo};

use crate::cluster::{ServerId, Topology};
use crate::config::{ClientConfig, Config, Servers};
use crate::error::{ProtocolError, TransportError, ValidationError};
use crate::event::ClientEvent;
use crate::health::{FailureOutcome, HealthTracker, ServerState, ServerStatus};
use crate::metrics::Metrics;
use crate::pool::Pool;
use crate::protocol::{Command, Reply, StoreOp};
use crate::value::Value;
use crate::{MemringError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Value fetched with `gets`, along with its CAS token
#[derive(Debug, Clone, PartialEq)]
pub struct CasValue {
    pub value: Value,
    pub cas: u64,
}

/// Diagnostic record of one public call, published when the call completes
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub command: &'static str,
    pub key: Option<String>,
    /// Requested keys for `get_multi`
    pub keys: Vec<String>,
    /// Value given to a storage command
    pub value: Option<Value>,
    /// Encoded size of `value`
    pub value_len: Option<usize>,
    pub cas: Option<u64>,
    pub lifetime: Option<u32>,
    /// Server that answered, or the last one that failed
    pub server: Option<String>,
    pub start: SystemTime,
    pub execution: Duration,
    pub success: bool,
}

impl CommandContext {
    fn new(command: &'static str) -> Self {
        Self {
            command,
            key: None,
            keys: Vec::new(),
            value: None,
            value_len: None,
            cas: None,
            lifetime: None,
            server: None,
            start: SystemTime::now(),
            execution: Duration::ZERO,
            success: false,
        }
    }

    fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }
}

/// Distributed memcached client
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    topology: Topology,
    health: HealthTracker,
    /// Indexed by `ServerId`
    pools: Vec<Arc<Pool>>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    commands: broadcast::Sender<CommandContext>,
    closed: AtomicBool,
}

impl Client {
    /// Create a client. Must be called from within a Tokio runtime.
    ///
    /// `servers` takes a single address, a list of addresses, or a map of
    /// address to weight. No connection is opened until the first command.
    pub fn new(servers: impl Into<Servers>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(MemringError::Config(
                "Client must be created inside a Tokio runtime".to_string(),
            ));
        }

        let servers = servers.into();
        let topology = Topology::new(
            &servers.entries(),
            &config.failover_servers,
            config.algorithm,
        )?;

        let metrics = Arc::new(Metrics::new());
        let pools = topology
            .endpoints()
            .iter()
            .map(|endpoint| {
                Arc::new(Pool::new(
                    &endpoint.address,
                    config.pool_size,
                    config.timeout(),
                    config.idle(),
                    Arc::clone(&metrics),
                ))
            })
            .collect();
        let health = HealthTracker::new(
            topology
                .endpoints()
                .iter()
                .map(|endpoint| endpoint.address.clone())
                .collect(),
            config.failures,
            config.remove,
            config.reconnect_attempts,
            config.event_capacity,
            Arc::clone(&metrics),
        );
        let (commands, _) = broadcast::channel(config.event_capacity);

        info!(
            servers = topology.routable().len(),
            failover = config.failover_servers.len(),
            algorithm = ?config.algorithm,
            "Client created"
        );

        let inner = Arc::new(Inner {
            config,
            topology,
            health,
            pools,
            metrics,
            cancel: CancellationToken::new(),
            commands,
            closed: AtomicBool::new(false),
        });
        reconnect::spawn_evictor(&inner);

        Ok(Self { inner })
    }

    /// Create a client from a loaded configuration
    pub fn from_config(config: Config) -> Result<Self> {
        Self::new(config.servers, config.client)
    }

    /// Server health events: issue, failure, reconnecting, reconnect, remove
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.health.subscribe()
    }

    /// One `CommandContext` per completed public call
    pub fn subscribe_commands(&self) -> broadcast::Receiver<CommandContext> {
        self.inner.commands.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Addresses of the servers currently on the ring
    pub fn servers(&self) -> Vec<String> {
        self.inner
            .topology
            .routable()
            .into_iter()
            .map(|id| self.inner.address(id).to_string())
            .collect()
    }

    /// Health status of a configured or fail-over server
    pub fn server_status(&self, address: &str) -> Option<ServerStatus> {
        let id = self.inner.topology.find(address)?;
        Some(self.inner.health.status(id))
    }

    /// Health counters of a configured or fail-over server, including when
    /// its next reconnection attempt is due
    pub fn server_state(&self, address: &str) -> Option<ServerState> {
        let id = self.inner.topology.find(address)?;
        Some(self.inner.health.state(id))
    }

    /// Server the key currently routes to
    pub fn server_for(&self, key: &str) -> Result<String> {
        let key = validate::normalize_key(key, &self.inner.config)?;
        let id = self
            .inner
            .topology
            .resolve(&key)
            .ok_or(MemringError::NoServers)?;
        Ok(self.inner.address(id).to_string())
    }

    /// Update the expiration of an existing item
    pub async fn touch(&self, key: &str, lifetime: u32) -> Result<bool> {
        let ctx = CommandContext::new("touch").with_key(key);
        self.inner
            .call(
                ctx,
                |config, ctx| {
                    let key = validate::normalize_key(key, config)?;
                    let exptime = validate::check_lifetime(lifetime, config)?;
                    ctx.lifetime = Some(exptime);
                    Ok((key.clone(), Command::Touch { key, exptime }))
                },
                |reply| match reply {
                    Reply::Touched => Ok(true),
                    Reply::NotFound => Ok(false),
                    other => Err(reject(other)),
                },
            )
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let ctx = CommandContext::new("get").with_key(key);
        let metrics = &self.inner.metrics;
        self.inner
            .call(
                ctx,
                |config, _| {
                    let key = validate::normalize_key(key, config)?;
                    Ok((key.clone(), Command::Get { keys: vec![key] }))
                },
                |reply| match reply {
                    Reply::Values(entries) => match entries.into_iter().next() {
                        Some(entry) => {
                            metrics.get_hits.inc();
                            Ok(Some(Value::decode(entry.flags, entry.data)?))
                        }
                        None => {
                            metrics.get_misses.inc();
                            Ok(None)
                        }
                    },
                    other => Err(reject(other)),
                },
            )
            .await
    }

    /// Fetch a value together with its CAS token
    pub async fn gets(&self, key: &str) -> Result<Option<CasValue>> {
        let ctx = CommandContext::new("gets").with_key(key);
        let metrics = &self.inner.metrics;
        self.inner
            .call(
                ctx,
                |config, _| {
                    let key = validate::normalize_key(key, config)?;
                    Ok((key.clone(), Command::Gets { keys: vec![key] }))
                },
                |reply| match reply {
                    Reply::Values(entries) => match entries.into_iter().next() {
                        Some(entry) => {
                            metrics.get_hits.inc();
                            let cas = entry.cas.ok_or_else(|| {
                                ProtocolError::Malformed("gets reply without CAS token".to_string())
                            })?;
                            Ok(Some(CasValue {
                                value: Value::decode(entry.flags, entry.data)?,
                                cas,
                            }))
                        }
                        None => {
                            metrics.get_misses.inc();
                            Ok(None)
                        }
                    },
                    other => Err(reject(other)),
                },
            )
            .await
    }

    /// Fetch many keys in one logical call, one `get` per server involved.
    ///
    /// Missing keys are absent from the result, which is keyed by the keys
    /// as given (before any compression).
    pub async fn get_multi<K: AsRef<str>>(&self, keys: &[K]) -> Result<HashMap<String, Value>> {
        let mut ctx = CommandContext::new("get_multi");
        ctx.keys = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let started = Instant::now();

        let result = match validate::normalize_keys(keys, &self.inner.config) {
            Ok(pairs) => self.inner.get_multi(pairs).await,
            Err(e) => Err(e.into()),
        };

        self.inner.finish(ctx, started, None, &result);
        result
    }

    /// Store unconditionally
    pub async fn set(&self, key: &str, value: impl Into<Value>, lifetime: u32) -> Result<bool> {
        self.store(StoreOp::Set, key, value.into(), lifetime, None)
            .await
    }

    /// Store only if the key exists
    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Value>,
        lifetime: u32,
    ) -> Result<bool> {
        self.store(StoreOp::Replace, key, value.into(), lifetime, None)
            .await
    }

    /// Store only if the key does not exist
    pub async fn add(&self, key: &str, value: impl Into<Value>, lifetime: u32) -> Result<bool> {
        self.store(StoreOp::Add, key, value.into(), lifetime, None)
            .await
    }

    /// Store only if the item is unchanged since `cas` was read
    pub async fn cas(
        &self,
        key: &str,
        value: impl Into<Value>,
        cas: u64,
        lifetime: u32,
    ) -> Result<bool> {
        self.store(StoreOp::Cas, key, value.into(), lifetime, Some(cas))
            .await
    }

    pub async fn append(&self, key: &str, value: impl Into<Value>) -> Result<bool> {
        self.store(StoreOp::Append, key, value.into(), 0, None).await
    }

    pub async fn prepend(&self, key: &str, value: impl Into<Value>) -> Result<bool> {
        self.store(StoreOp::Prepend, key, value.into(), 0, None).await
    }

    /// Increment a numeric item. `None` if the key is missing or not numeric.
    pub async fn incr(&self, key: &str, amount: u64) -> Result<Option<u64>> {
        self.arithmetic(true, key, amount).await
    }

    /// Decrement a numeric item, stopping at zero. `None` if the key is
    /// missing or not numeric.
    pub async fn decr(&self, key: &str, amount: u64) -> Result<Option<u64>> {
        self.arithmetic(false, key, amount).await
    }

    /// Delete an item; false if it did not exist
    pub async fn del(&self, key: &str) -> Result<bool> {
        let ctx = CommandContext::new("delete").with_key(key);
        self.inner
            .call(
                ctx,
                |config, _| {
                    let key = validate::normalize_key(key, config)?;
                    Ok((key.clone(), Command::Delete { key }))
                },
                |reply| match reply {
                    Reply::Deleted => Ok(true),
                    Reply::NotFound => Ok(false),
                    other => Err(reject(other)),
                },
            )
            .await
    }

    /// Close every pooled connection and stop background tasks.
    ///
    /// Further commands fail with `MemringError::Closed`. Calling this more
    /// than once is harmless.
    pub fn end(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        for pool in &self.inner.pools {
            pool.close();
        }
        info!("Client closed");
    }

    async fn store(
        &self,
        op: StoreOp,
        key: &str,
        value: Value,
        lifetime: u32,
        cas: Option<u64>,
    ) -> Result<bool> {
        let ctx = CommandContext::new(op.as_str()).with_key(key);
        self.inner
            .call(
                ctx,
                |config, ctx| {
                    let key = validate::normalize_key(key, config)?;
                    let exptime = validate::check_lifetime(lifetime, config)?;
                    let (flags, data) = validate::encode_value(&value, config)?;
                    ctx.value_len = Some(data.len());
                    ctx.value = Some(value);
                    ctx.lifetime = Some(exptime);
                    ctx.cas = cas;
                    let command = Command::Store {
                        op,
                        key: key.clone(),
                        flags,
                        exptime,
                        data,
                        cas,
                    };
                    Ok((key, command))
                },
                |reply| match reply {
                    Reply::Stored => Ok(true),
                    // Refused by add/replace/append/prepend, or a CAS mismatch
                    Reply::NotStored | Reply::Exists | Reply::NotFound => Ok(false),
                    other => Err(reject(other)),
                },
            )
            .await
    }

    async fn arithmetic(&self, incr: bool, key: &str, amount: u64) -> Result<Option<u64>> {
        let name = if incr { "incr" } else { "decr" };
        let ctx = CommandContext::new(name).with_key(key);
        self.inner
            .call(
                ctx,
                |config, _| {
                    let key = validate::normalize_key(key, config)?;
                    let command = if incr {
                        Command::Incr {
                            key: key.clone(),
                            amount,
                        }
                    } else {
                        Command::Decr {
                            key: key.clone(),
                            amount,
                        }
                    };
                    Ok((key, command))
                },
                |reply| match reply {
                    Reply::Number(n) => Ok(Some(n)),
                    Reply::NotFound => Ok(None),
                    Reply::ClientError(msg) if msg.contains("non-numeric") => Ok(None),
                    other => Err(reject(other)),
                },
            )
            .await
    }
}

impl Inner {
    fn address(&self, id: ServerId) -> &str {
        &self.topology.endpoint(id).address
    }

    /// Validate, dispatch and record a single-key command
    async fn call<T>(
        self: &Arc<Self>,
        mut ctx: CommandContext,
        prepare: impl FnOnce(
            &ClientConfig,
            &mut CommandContext,
        ) -> std::result::Result<(String, Command), ValidationError>,
        map: impl FnOnce(Reply) -> Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let mut server = None;

        let result = match prepare(&self.config, &mut ctx) {
            Err(e) => Err(e.into()),
            Ok((key, command)) => {
                match self
                    .dispatch(&command, || self.topology.resolve(&key))
                    .await
                {
                    Ok((id, reply)) => {
                        server = Some(id);
                        map(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        self.finish(ctx, started, server, &result);
        result
    }

    /// Send with retries. `target` is asked for a server before every
    /// attempt, so a retry follows ring changes made by the failed attempt.
    async fn dispatch(
        self: &Arc<Self>,
        command: &Command,
        target: impl Fn() -> Option<ServerId>,
    ) -> Result<(ServerId, Reply)> {
        let mut last_error = None;

        for attempt in 0..=self.config.retries {
            // The ring can run empty after a failed attempt removed the last server
            let Some(id) = target() else {
                return Err(last_error.unwrap_or(MemringError::NoServers));
            };
            match self.send(id, command).await {
                Ok(reply) => return Ok((id, reply)),
                Err(e) if e.is_transport() => {
                    debug!(
                        command = command.name(),
                        server = self.address(id),
                        attempt,
                        error = %e,
                        "Attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(MemringError::NoServers))
    }

    /// One attempt against one server. Transport failures are reported to
    /// the health tracker here, once per attempt.
    async fn send(self: &Arc<Self>, id: ServerId, command: &Command) -> Result<Reply> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MemringError::Closed);
        }

        let pool = &self.pools[id.0];
        let result = if self.health.is_dead(id) {
            Err(MemringError::transport(
                pool.addr(),
                TransportError::ServerDead,
            ))
        } else {
            match pool.acquire().await {
                Ok(mut conn) => conn.request(command).await,
                Err(e) => Err(e),
            }
        };

        match &result {
            Ok(_) => self.health.record_success(id),
            Err(MemringError::Transport { source, .. }) => {
                self.report_failure(id, command.name(), source)
            }
            Err(_) => {}
        }
        result
    }

    fn report_failure(self: &Arc<Self>, id: ServerId, operation: &str, err: &TransportError) {
        if self.health.record_failure(id, operation, err) != FailureOutcome::Dead {
            return;
        }
        // The server dropped its end of every idle socket
        self.pools[id.0].drain_idle();
        if self.config.remove {
            self.topology.exclude(id);
        }
        reconnect::spawn_probe(self, id);
    }

    async fn get_multi(
        self: &Arc<Self>,
        pairs: Vec<(String, String)>,
    ) -> Result<HashMap<String, Value>> {
        let requested = pairs.len();
        let mut originals: HashMap<String, Vec<String>> = HashMap::new();
        for (original, wire) in pairs {
            originals.entry(wire).or_default().push(original);
        }

        let mut pending: Vec<String> = originals.keys().cloned().collect();
        let mut found = HashMap::with_capacity(requested);
        let mut last_error = None;

        for attempt in 0..=self.config.retries {
            let mut batches: BTreeMap<ServerId, Vec<String>> = BTreeMap::new();
            for key in pending.drain(..) {
                let Some(id) = self.topology.resolve(&key) else {
                    return Err(last_error.unwrap_or(MemringError::NoServers));
                };
                batches.entry(id).or_default().push(key);
            }

            let mut tasks = JoinSet::new();
            for (id, keys) in batches {
                let inner = Arc::clone(self);
                tasks.spawn(async move {
                    let command = Command::Get { keys: keys.clone() };
                    let result = inner.send(id, &command).await;
                    (keys, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (keys, result) = joined.map_err(task_error)?;
                match result {
                    Ok(Reply::Values(entries)) => {
                        for entry in entries {
                            let Some(owners) = originals.get(&entry.key) else {
                                continue;
                            };
                            let value = Value::decode(entry.flags, entry.data)?;
                            for owner in owners {
                                found.insert(owner.clone(), value.clone());
                            }
                        }
                    }
                    Ok(other) => return Err(reject(other)),
                    Err(e) if e.is_transport() => {
                        pending.extend(keys);
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if pending.is_empty() {
                self.metrics.get_hits.inc_by(found.len() as u64);
                self.metrics
                    .get_misses
                    .inc_by(requested.saturating_sub(found.len()) as u64);
                return Ok(found);
            }
            debug!(attempt, remaining = pending.len(), "Retrying get_multi batches");
        }

        Err(last_error.unwrap_or(MemringError::NoServers))
    }

    /// Run `command` on every server currently on the ring, concurrently.
    /// Results come back ordered by server.
    async fn fanout(self: &Arc<Self>, command: Command) -> Result<Vec<(ServerId, Result<Reply>)>> {
        let command = Arc::new(command);
        let mut tasks = JoinSet::new();
        for id in self.topology.routable() {
            let inner = Arc::clone(self);
            let command = Arc::clone(&command);
            tasks.spawn(async move {
                let result = inner
                    .dispatch(&command, || Some(id))
                    .await
                    .map(|(_, reply)| reply);
                (id, result)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.map_err(task_error)?);
        }
        results.sort_by_key(|(id, _)| *id);
        Ok(results)
    }

    /// Publish the context of a finished call
    fn finish<T>(
        &self,
        mut ctx: CommandContext,
        started: Instant,
        server: Option<ServerId>,
        result: &Result<T>,
    ) {
        ctx.execution = started.elapsed();
        ctx.success = result.is_ok();
        ctx.server = match (server, result) {
            (Some(id), _) => Some(self.address(id).to_string()),
            (None, Err(MemringError::Transport { server, .. })) => Some(server.clone()),
            _ => None,
        };

        self.metrics.commands.with_label_values(&[ctx.command]).inc();
        self.metrics
            .cmd_latency
            .with_label_values(&[ctx.command])
            .observe(ctx.execution.as_secs_f64());

        match result {
            Ok(_) => debug!(
                command = ctx.command,
                key = ?ctx.key,
                server = ?ctx.server,
                elapsed = ?ctx.execution,
                "Command completed"
            ),
            Err(e) => {
                self.metrics
                    .command_errors
                    .with_label_values(&[ctx.command])
                    .inc();
                debug!(
                    command = ctx.command,
                    key = ?ctx.key,
                    server = ?ctx.server,
                    elapsed = ?ctx.execution,
                    error = %e,
                    "Command failed"
                );
            }
        }

        // No subscribers is fine
        let _ = self.commands.send(ctx);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turn a reply the caller did not expect into an error. Error lines keep
/// their protocol meaning.
fn reject(reply: Reply) -> MemringError {
    match reply.into_result() {
        Err(e) => e.into(),
        Ok(other) => ProtocolError::UnexpectedReply(format!("{other:?}")).into(),
    }
}

fn task_error(e: JoinError) -> MemringError {
    if e.is_panic() {
        std::panic::resume_unwind(e.into_panic());
    }
    MemringError::Closed
}
