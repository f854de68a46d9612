//! A single connection to a memcached server

use crate::error::TransportError;
use crate::metrics::Metrics;
use crate::protocol::{Command, ParseResult, Reply, ReplyKind, RequestWriter, parse_reply};
use crate::{MemringError, Result};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Lifecycle of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    /// A request is in flight; dropping the connection now loses the reply
    InUse,
    /// Protocol state unknown; never reused
    Closing,
}

/// One TCP connection speaking the text protocol
pub struct Connection {
    addr: Arc<str>,
    stream: TcpStream,
    read_buf: BytesMut,
    writer: RequestWriter,
    state: ConnState,
    last_used: Instant,
    metrics: Arc<Metrics>,
}

impl Connection {
    /// Open a connection, bounded by `timeout`
    pub async fn connect(
        addr: Arc<str>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> std::result::Result<Self, TransportError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&*addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => return Err(TransportError::ConnectTimeout),
        };

        // Disable Nagle's algorithm for lower latency
        if let Err(e) = stream.set_nodelay(true) {
            warn!(server = %addr, "Failed to set TCP_NODELAY: {}", e);
        }

        trace!(server = %addr, "Connected");
        Ok(Self {
            addr,
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            writer: RequestWriter::default(),
            state: ConnState::Idle,
            last_used: Instant::now(),
            metrics,
        })
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Time since the connection last completed a request
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Send one command and wait for its complete reply, bounded by `timeout`.
    ///
    /// On any failure the connection is left in `Closing`.
    pub async fn request(&mut self, command: &Command, timeout: Duration) -> Result<Reply> {
        self.state = ConnState::InUse;
        self.writer.clear();
        command.encode(&mut self.writer);

        match tokio::time::timeout(timeout, self.round_trip(command.reply_kind())).await {
            Ok(Ok(reply)) => {
                self.last_used = Instant::now();
                // Bytes past the reply mean we lost track of the stream
                self.state = if self.read_buf.is_empty() {
                    ConnState::Idle
                } else {
                    ConnState::Closing
                };
                Ok(reply)
            }
            Ok(Err(e)) => {
                self.state = ConnState::Closing;
                Err(e)
            }
            Err(_) => {
                self.state = ConnState::Closing;
                Err(MemringError::transport(
                    &*self.addr,
                    TransportError::RequestTimeout,
                ))
            }
        }
    }

    async fn round_trip(&mut self, kind: ReplyKind) -> Result<Reply> {
        self.stream
            .write_all(self.writer.buffer())
            .await
            .map_err(|e| MemringError::transport(&*self.addr, e.into()))?;
        self.metrics
            .bytes_written
            .inc_by(self.writer.buffer().len() as u64);

        self.read_buf.clear();
        loop {
            match parse_reply(&self.read_buf, kind) {
                ParseResult::Complete(reply, consumed) => {
                    let _ = self.read_buf.split_to(consumed);
                    return Ok(reply);
                }
                ParseResult::NeedMoreData => {}
                ParseResult::Error(e) => return Err(e.into()),
            }

            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| MemringError::transport(&*self.addr, e.into()))?;
            if n == 0 {
                return Err(MemringError::transport(
                    &*self.addr,
                    TransportError::ConnectionClosed,
                ));
            }
            self.metrics.bytes_read.inc_by(n as u64);
        }
    }
}
