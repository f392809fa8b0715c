use crate::monitor::LeakMonitor;
use crate::pool::Destination;
use crate::transport::connector::Connection;
use bytes::{Buf, BytesMut};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::time::Instant;

const READ_CHUNK: usize = 8192;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who currently owns a connection.
///
/// ```text
///   open ──► Borrowed ──release──► Idle ──borrow──► Borrowed
///               │                   │
///               └──────► Closed ◄───┘  (error, cap, timeout, drop)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Parked in the pool, not reading.
    Idle,
    /// Reserved by an in-flight request or an unreleased response.
    Borrowed,
    Closed,
}

/// One transport connection plus the bytes read off it but not yet consumed.
///
/// Has exactly one owner at a time; moving it between the pool, the executor
/// and a response handle is the ownership transfer. Dropping it closes the
/// socket.
pub struct ByteConnection {
    id: ConnId,
    destination: Destination,
    io: Box<dyn Connection>,
    buf: BytesMut,
    state: ConnectionState,
    created_at: Instant,
    last_used: Instant,
    requests: u32,
    monitor: Arc<LeakMonitor>,
}

impl ByteConnection {
    /// Wrap a freshly dialed stream. The new connection is borrowed by its
    /// opener.
    pub fn new(
        id: ConnId,
        destination: Destination,
        io: Box<dyn Connection>,
        monitor: Arc<LeakMonitor>,
    ) -> Self {
        monitor.connection_opened();
        let now = Instant::now();
        Self {
            id,
            destination,
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
            state: ConnectionState::Borrowed,
            created_at: now,
            last_used: now,
            requests: 0,
            monitor,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Number of requests written on this connection.
    pub fn requests_served(&self) -> u32 {
        self.requests
    }

    /// Whether a request has already been exchanged on this connection.
    pub fn is_reused(&self) -> bool {
        self.requests > 0
    }

    /// Bytes read past the end of the current message.
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    pub(crate) fn mark_idle(&mut self) {
        if self.state == ConnectionState::Borrowed {
            self.state = ConnectionState::Idle;
            self.last_used = Instant::now();
            self.monitor.worker_stopped();
        }
    }

    pub(crate) fn mark_borrowed(&mut self) {
        if self.state == ConnectionState::Idle {
            self.state = ConnectionState::Borrowed;
            self.monitor.worker_started();
        }
    }

    /// Non-blocking liveness check.
    ///
    /// An idle HTTP/1.x connection has nothing to say: EOF, an error or
    /// unsolicited bytes all mean it cannot carry another request.
    pub fn probe(&mut self) -> bool {
        if self.state == ConnectionState::Closed || !self.buf.is_empty() {
            return false;
        }

        let mut scratch = [0u8; 1];
        let mut read_buf = ReadBuf::new(&mut scratch);
        let mut cx = Context::from_waker(Waker::noop());
        match Pin::new(&mut *self.io).poll_read(&mut cx, &mut read_buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(())) => false,
            Poll::Ready(Err(_)) => false,
        }
    }

    /// Write a complete request and flush it.
    pub async fn send(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.requests += 1;
        self.last_used = Instant::now();
        self.io.write_all(payload).await?;
        self.io.flush().await
    }

    /// Read more bytes into the internal buffer; `Ok(0)` means EOF.
    pub async fn fill_buf(&mut self) -> std::io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.io.read_buf(&mut self.buf).await
    }

    pub(crate) fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Read body bytes, serving buffered bytes first.
    pub async fn read_into(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        if !self.buf.is_empty() {
            let n = self.buf.len().min(dst.len());
            dst[..n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Ok(n);
        }
        self.io.read(dst).await
    }

    /// Shut the write side down and close the connection.
    pub async fn close(mut self) -> std::io::Result<()> {
        let result = self.io.shutdown().await;
        self.mark_closed();
        result
    }

    fn mark_closed(&mut self) {
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Borrowed => self.monitor.worker_stopped(),
            ConnectionState::Idle => {}
        }
        self.state = ConnectionState::Closed;
        self.monitor.connection_closed();
        tracing::trace!(conn_id = %self.id, destination = %self.destination, "Connection closed");
    }
}

impl Drop for ByteConnection {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

impl fmt::Debug for ByteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteConnection")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("state", &self.state)
            .field("requests", &self.requests)
            .field("buffered", &self.buf.len())
            .finish()
    }
}
