//! Per-server bounded connection pool
//!
//! A semaphore caps the number of connections checked out at once; idle
//! connections wait in a stack and are reused most-recent first. Connections
//! are opened lazily. Anything that comes back in a state other than `Idle`
//! (an error, a timeout, or a request future dropped mid-flight) is closed
//! instead of pooled.

mod connection;

pub use connection::{ConnState, Connection};

use crate::error::TransportError;
use crate::metrics::Metrics;
use crate::protocol::{Command, Reply};
use crate::{MemringError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Connection pool for one server
pub struct Pool {
    addr: Arc<str>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    timeout: Duration,
    idle_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Pool {
    /// Create a pool of at most `size` connections to `addr`
    pub fn new(
        addr: &str,
        size: usize,
        timeout: Duration,
        idle_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            addr: Arc::from(addr),
            permits: Arc::new(Semaphore::new(size.max(1))),
            idle: Mutex::new(Vec::with_capacity(size)),
            timeout,
            idle_timeout,
            metrics,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Check out a connection, waiting at most `timeout` for a free slot and
    /// `timeout` again to open a new connection
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let start = Instant::now();
        let permit =
            match tokio::time::timeout(self.timeout, Arc::clone(&self.permits).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(MemringError::Closed),
                Err(_) => {
                    return Err(MemringError::transport(
                        &*self.addr,
                        TransportError::AcquireTimeout,
                    ));
                }
            };
        self.metrics
            .acquire_latency
            .observe(start.elapsed().as_secs_f64());

        let conn = match self.take_idle() {
            Some(conn) => conn,
            None => {
                let conn =
                    Connection::connect(Arc::clone(&self.addr), self.timeout, Arc::clone(&self.metrics))
                        .await
                        .map_err(|e| MemringError::transport(&*self.addr, e))?;
                self.metrics.connections_opened.inc();
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Open a one-off connection and check the server answers. Used by the
    /// reconnection probe; the connection is not pooled.
    pub async fn probe(&self) -> std::result::Result<(), TransportError> {
        let mut conn =
            Connection::connect(Arc::clone(&self.addr), self.timeout, Arc::clone(&self.metrics))
                .await?;
        match conn.request(&Command::Version, self.timeout).await {
            Ok(_) => Ok(()),
            Err(MemringError::Transport { source, .. }) => Err(source),
            // The server answered, even if oddly; it is reachable
            Err(_) => Ok(()),
        }
    }

    /// Close idle connections older than the idle timeout
    pub fn evict_idle(&self) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|conn| conn.idle_for() < self.idle_timeout);
        let evicted = before - idle.len();

        if evicted > 0 {
            self.metrics.connections_evicted.inc_by(evicted as u64);
            self.metrics.idle_connections.sub(evicted as i64);
            debug!(server = %self.addr, evicted, "Evicted idle connections");
        }
        evicted
    }

    /// Drop every idle connection. Used when the server dies, since its
    /// end of those sockets is gone.
    pub fn drain_idle(&self) -> usize {
        let drained = std::mem::take(&mut *self.idle.lock());
        if !drained.is_empty() {
            self.metrics.idle_connections.sub(drained.len() as i64);
            self.metrics
                .connections_discarded
                .inc_by(drained.len() as u64);
            debug!(server = %self.addr, drained = drained.len(), "Dropped idle connections");
        }
        drained.len()
    }

    /// Drop idle connections and fail every further acquire with `Closed`
    pub fn close(&self) {
        self.permits.close();
        self.drain_idle();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn take_idle(&self) -> Option<Connection> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop() {
            self.metrics.idle_connections.dec();
            if conn.idle_for() < self.idle_timeout {
                return Some(conn);
            }
            self.metrics.connections_evicted.inc();
        }
        None
    }

    fn release(&self, conn: Connection) {
        if conn.state() != ConnState::Idle || self.is_closed() {
            self.metrics.connections_discarded.inc();
            debug!(server = %self.addr, state = ?conn.state(), "Discarding connection");
            return;
        }
        self.idle.lock().push(conn);
        self.metrics.idle_connections.inc();
    }
}

/// A checked-out connection; goes back to its pool on drop
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Send a command using the pool's request timeout
    pub async fn request(&mut self, command: &Command) -> Result<Reply> {
        let timeout = self.pool.timeout;
        match self.conn.as_mut() {
            Some(conn) => conn.request(command, timeout).await,
            None => Err(MemringError::Closed),
        }
    }

    pub fn state(&self) -> Option<ConnState> {
        self.conn.as_ref().map(Connection::state)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Runs before the permit is released, so a waiter finds the connection
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
