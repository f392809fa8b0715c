//! In-flight responses and the release protocol.
//!
//! A [`ResponseHandle`] owns the connection its response arrived on. The
//! connection goes back to the pool only through [`ResponseHandle::release`]
//! (or the consuming [`bytes`](ResponseHandle::bytes) /
//! [`text`](ResponseHandle::text), which release when done). Every handle must
//! be released exactly once: until then its connection stays reserved and
//! cannot serve any other request.
//!
//! Dropping an unreleased handle is the fallback for cancellation and early
//! returns. The connection is closed rather than pooled because its read
//! position is unknown, and the handle is counted as abandoned.

use crate::error::{ClientError, ProtocolViolation, Result};
use crate::http::codec::BodyKind;
use crate::http::response::{ResponseHead, StatusCode};
use crate::monitor::LeakMonitor;
use crate::pool::{ConnectionPool, Destination, ReturnOutcome};
use crate::transport::{ByteConnection, ConnId};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

const DRAIN_CHUNK: usize = 8192;

/// What `release` did with the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Body fully consumed or drained; the pool decided what to keep.
    Returned(ReturnOutcome),
    /// Closed without draining. `unread` is `None` for bodies of unknown
    /// length.
    Discarded { unread: Option<u64> },
    /// Closed because the connection cannot carry another request.
    Closed,
    /// The handle had already been released; nothing happened.
    AlreadyReleased,
}

/// Limits applied by a handle's body reads and release.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BodyLimits {
    pub max_drain_bytes: u64,
    pub read_timeout: Duration,
}

#[must_use = "a response keeps its connection reserved until it is released"]
pub struct ResponseHandle {
    head: ResponseHead,
    destination: Destination,
    conn: Option<ByteConnection>,
    body: BodyKind,
    eof: bool,
    keep_alive: bool,
    poisoned: bool,
    released: bool,
    limits: BodyLimits,
    pool: Arc<ConnectionPool>,
    monitor: Arc<LeakMonitor>,
}

impl ResponseHandle {
    pub(crate) fn new(
        head: ResponseHead,
        body: BodyKind,
        keep_alive: bool,
        conn: ByteConnection,
        limits: BodyLimits,
        pool: Arc<ConnectionPool>,
        monitor: Arc<LeakMonitor>,
    ) -> Self {
        monitor.handle_created();
        Self {
            head,
            destination: conn.destination().clone(),
            conn: Some(conn),
            body,
            eof: false,
            keep_alive,
            poisoned: false,
            released: false,
            limits,
            pool,
            monitor,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn version(&self) -> &str {
        &self.head.version
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.head.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.head.header(key)
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Body bytes still expected, if the length is known.
    pub fn remaining(&self) -> Option<u64> {
        match self.body {
            BodyKind::Empty => Some(0),
            BodyKind::Length(n) => Some(n),
            BodyKind::CloseDelimited | BodyKind::Encoded => None,
        }
    }

    /// Id of the reserved connection; `None` once released.
    pub fn connection_id(&self) -> Option<ConnId> {
        self.conn.as_ref().map(ByteConnection::id)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Read the next body bytes into `buf`; `Ok(0)` marks the end of the body.
    ///
    /// Reaching the end does not release the handle.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.released {
            return Err(self.violation(ProtocolViolation::ReadAfterRelease));
        }

        let want = match self.body {
            BodyKind::Empty | BodyKind::Length(0) => return Ok(0),
            BodyKind::Length(rem) => buf.len().min(usize::try_from(rem).unwrap_or(usize::MAX)),
            BodyKind::CloseDelimited if self.eof => return Ok(0),
            BodyKind::CloseDelimited => buf.len(),
            BodyKind::Encoded => {
                return Err(ClientError::MalformedResponse(format!(
                    "unsupported transfer encoding: {}",
                    self.head.header("Transfer-Encoding").unwrap_or_default()
                )));
            }
        };
        let Some(conn) = self.conn.as_mut() else {
            return Ok(0);
        };

        let n = match timeout(self.limits.read_timeout, conn.read_into(&mut buf[..want])).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.poisoned = true;
                return Err(e.into());
            }
            Err(_) => {
                self.poisoned = true;
                return Err(ClientError::Timeout(self.limits.read_timeout));
            }
        };

        match &mut self.body {
            BodyKind::Length(rem) => {
                if n == 0 && want > 0 {
                    self.poisoned = true;
                    return Err(ClientError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("connection closed with {} body bytes outstanding", rem),
                    )));
                }
                *rem -= n as u64;
            }
            BodyKind::CloseDelimited => self.eof = n == 0,
            BodyKind::Empty | BodyKind::Encoded => {}
        }
        Ok(n)
    }

    /// Read the whole body, then release.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let body = self.read_to_end().await;
        let released = self.release().await;
        let body = body?;
        released?;
        Ok(body)
    }

    /// Read the whole body as UTF-8, then release.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ClientError::MalformedResponse(format!("body is not UTF-8: {}", e)))
    }

    async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        let mut chunk = [0u8; DRAIN_CHUNK];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Give the connection back.
    ///
    /// Unread bodies up to `max_drain_bytes` are drained so the connection can
    /// be pooled; larger or unbounded ones close it. Calling this twice is a
    /// caller bug: the second call only logs and returns
    /// [`ReleaseOutcome::AlreadyReleased`].
    pub async fn release(&mut self) -> Result<ReleaseOutcome> {
        if self.released {
            self.violation(ProtocolViolation::DoubleRelease);
            return Ok(ReleaseOutcome::AlreadyReleased);
        }
        self.released = true;
        self.monitor.handle_released();

        let Some(mut conn) = self.conn.take() else {
            return Ok(ReleaseOutcome::Closed);
        };

        if self.poisoned {
            debug!(conn_id = %conn.id(), "Dropping connection after failed body read");
            return Ok(ReleaseOutcome::Closed);
        }

        let unread = match self.body {
            BodyKind::Empty | BodyKind::Length(0) => 0,
            BodyKind::CloseDelimited if self.eof => 0,
            BodyKind::CloseDelimited | BodyKind::Encoded => {
                debug!(conn_id = %conn.id(), "Discarding body of unknown length");
                conn.close().await.map_err(ClientError::Close)?;
                return Ok(ReleaseOutcome::Discarded { unread: None });
            }
            BodyKind::Length(rem) if rem > self.limits.max_drain_bytes => {
                debug!(conn_id = %conn.id(), unread = rem, "Body too large to drain, closing");
                conn.close().await.map_err(ClientError::Close)?;
                return Ok(ReleaseOutcome::Discarded { unread: Some(rem) });
            }
            BodyKind::Length(rem) => rem,
        };

        if !self.keep_alive {
            conn.close().await.map_err(ClientError::Close)?;
            return Ok(ReleaseOutcome::Closed);
        }

        if unread > 0 {
            self.drain(&mut conn, unread).await?;
            debug!(conn_id = %conn.id(), drained = unread, "Drained unread body");
        }

        let outcome = self.pool.put(&self.destination, conn).await?;
        Ok(ReleaseOutcome::Returned(outcome))
    }

    async fn drain(&mut self, conn: &mut ByteConnection, mut remaining: u64) -> Result<()> {
        let mut scratch = [0u8; DRAIN_CHUNK];
        while remaining > 0 {
            let want = scratch.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let n = timeout(self.limits.read_timeout, conn.read_into(&mut scratch[..want]))
                .await
                .map_err(|_| ClientError::Timeout(self.limits.read_timeout))??;
            if n == 0 {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed while draining body",
                )));
            }
            remaining -= n as u64;
        }
        self.body = BodyKind::Length(0);
        Ok(())
    }

    fn violation(&self, violation: ProtocolViolation) -> ClientError {
        self.monitor.protocol_violation();
        warn!(
            destination = %self.destination,
            status = self.head.status.as_u16(),
            violation = %violation,
            "Response handle misused"
        );
        ClientError::CallerProtocol(violation)
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.monitor.handle_abandoned();
        warn!(
            destination = %self.destination,
            status = self.head.status.as_u16(),
            "Response dropped without release, closing its connection"
        );
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("status", &self.head.status)
            .field("destination", &self.destination)
            .field("connection", &self.connection_id())
            .field("body", &self.body)
            .field("released", &self.released)
            .finish()
    }
}
