//! Request execution
//!
//! Borrows or dials a connection, writes the request, reads the response head
//! and binds the connection to a [`ResponseHandle`].

use crate::client::handle::{BodyLimits, ResponseHandle};
use crate::config::{ClientConfig, Config};
use crate::error::{ClientError, Result};
use crate::http::codec::{self, BodyKind};
use crate::http::request::Request;
use crate::http::response::ResponseHead;
use crate::monitor::LeakMonitor;
use crate::pool::{ConnectionPool, Destination};
use crate::transport::{ByteConnection, ConnId, Connector, TcpConnector};
use bytes::Buf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Interim (1xx) heads tolerated before the final response.
const MAX_INTERIM_RESPONSES: usize = 5;

/// Failure of one exchange on one connection.
enum Attempt {
    /// A reused connection failed before any response byte arrived; the peer
    /// most likely closed it while it sat idle.
    Stale(std::io::Error),
    Failed(ClientError),
}

/// Executes requests over pooled connections.
///
/// Owns the pool; clones of the `Arc`s it hands to response handles keep the
/// pool alive until the last handle is released.
pub struct RequestExecutor {
    connector: Arc<dyn Connector>,
    pool: Arc<ConnectionPool>,
    monitor: Arc<LeakMonitor>,
    config: ClientConfig,
    next_conn_id: AtomicU64,
    sweeper: Option<JoinHandle<()>>,
}

impl RequestExecutor {
    /// Build an executor over an arbitrary transport.
    ///
    /// Must be called inside a Tokio runtime when a sweep interval is
    /// configured.
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let sweeper = config
            .pool
            .sweep_interval
            .map(|every| pool.spawn_sweeper(every));

        info!(
            per_destination_idle_cap = config.pool.per_destination_idle_cap,
            global_idle_cap = config.pool.global_idle_cap,
            idle_timeout = ?config.pool.idle_timeout,
            max_drain_bytes = config.client.max_drain_bytes,
            "Request executor ready"
        );

        Self {
            connector,
            pool,
            monitor: Arc::new(LeakMonitor::new()),
            config: config.client.clone(),
            next_conn_id: AtomicU64::new(1),
            sweeper,
        }
    }

    /// Build an executor that dials plain TCP.
    pub fn with_tcp(config: &Config) -> Self {
        let connector = Arc::new(TcpConnector::new(config.client.connect_timeout));
        Self::new(config, connector)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<LeakMonitor> {
        &self.monitor
    }

    /// Send `request` and return once the response head has been read.
    ///
    /// The returned handle reserves its connection until it is released.
    /// If the request times out or this future is dropped, the connection in
    /// use is closed, never pooled.
    pub async fn execute(&self, request: Request) -> Result<ResponseHandle> {
        let payload = codec::encode_request(&request)?;

        timeout(self.config.request_timeout, self.execute_inner(&request, &payload))
            .await
            .map_err(|_| {
                warn!(
                    destination = %request.destination,
                    path = %request.path,
                    timeout = ?self.config.request_timeout,
                    "Request timed out"
                );
                ClientError::Timeout(self.config.request_timeout)
            })?
    }

    /// Execute `request`, run `f` on the response, and release it on every
    /// path out of `f`.
    pub async fn with_response<T, F>(&self, request: Request, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut ResponseHandle) -> Result<T>,
    {
        let mut response = self.execute(request).await?;
        let result = f(&mut response).await;
        let released = response.release().await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// Close all idle connections. Responses still outstanding close their
    /// connections when released.
    pub async fn shutdown(&self) -> Result<usize> {
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
        let closed = self.pool.shutdown().await?;
        info!(closed, outstanding = self.monitor.outstanding_count(), "Request executor shut down");
        Ok(closed)
    }

    async fn execute_inner(&self, request: &Request, payload: &[u8]) -> Result<ResponseHandle> {
        let destination = &request.destination;

        if let Some(conn) = self.pool.borrow(destination).await {
            let conn_id = conn.id();
            match self.exchange(conn, request, payload).await {
                Ok(handle) => return Ok(handle),
                Err(Attempt::Failed(e)) => return Err(e),
                Err(Attempt::Stale(e)) if self.config.retry_stale_connections => {
                    self.monitor.stale_retry();
                    warn!(
                        conn_id = %conn_id,
                        destination = %destination,
                        error = %e,
                        "Pooled connection was stale, retrying on a fresh connection"
                    );
                }
                Err(Attempt::Stale(e)) => return Err(ClientError::StaleConnection(e)),
            }
        }

        let conn = self.open(destination).await?;
        match self.exchange(conn, request, payload).await {
            Ok(handle) => Ok(handle),
            Err(Attempt::Failed(e)) => Err(e),
            Err(Attempt::Stale(e)) => Err(ClientError::Io(e)),
        }
    }

    async fn open(&self, destination: &Destination) -> Result<ByteConnection> {
        let io = self
            .connector
            .connect(destination)
            .await
            .map_err(|source| ClientError::ConnectOpen {
                destination: destination.to_string(),
                source,
            })?;

        let id = ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        debug!(conn_id = %id, destination = %destination, "Opened new connection");
        Ok(ByteConnection::new(id, destination.clone(), io, self.monitor.clone()))
    }

    /// Write the request and read the response head on `conn`.
    ///
    /// On failure `conn` is dropped here, which closes it.
    async fn exchange(
        &self,
        mut conn: ByteConnection,
        request: &Request,
        payload: &[u8],
    ) -> std::result::Result<ResponseHandle, Attempt> {
        let reused = conn.is_reused();

        if let Err(e) = conn.send(payload).await {
            return Err(if reused {
                Attempt::Stale(e)
            } else {
                Attempt::Failed(e.into())
            });
        }
        trace!(conn_id = %conn.id(), method = request.method.as_str(), path = %request.path, "Request sent");

        let head = self.read_head(&mut conn, reused).await?;
        let body = BodyKind::for_response(&head, request.method)
            .map_err(|e| Attempt::Failed(e.into()))?;
        // 101 hands the connection over to another protocol.
        let switched = head.status.as_u16() == 101;
        let keep_alive = head.keep_alive() && request.keep_alive() && body.is_delimited() && !switched;

        debug!(
            conn_id = %conn.id(),
            destination = %request.destination,
            status = head.status.as_u16(),
            reused,
            keep_alive,
            "Response head received"
        );

        let limits = BodyLimits {
            max_drain_bytes: self.config.max_drain_bytes,
            read_timeout: self.config.read_timeout,
        };
        Ok(ResponseHandle::new(
            head,
            body,
            keep_alive,
            conn,
            limits,
            self.pool.clone(),
            self.monitor.clone(),
        ))
    }

    /// Read the final response head, skipping interim 1xx heads other than
    /// 101.
    async fn read_head(&self, conn: &mut ByteConnection, reused: bool) -> std::result::Result<ResponseHead, Attempt> {
        let mut interim = 0;
        loop {
            if let Some(end) = codec::find_headers_end(conn.buffer()) {
                if end > self.config.max_header_bytes {
                    return Err(Attempt::Failed(ClientError::MalformedResponse(
                        "response head too large".to_string(),
                    )));
                }
                let head = codec::parse_response_head(&conn.buffer()[..end])
                    .map_err(|e| Attempt::Failed(e.into()))?;
                conn.buffer().advance(end + 4);

                if head.status.is_informational() && head.status.as_u16() != 101 {
                    interim += 1;
                    if interim > MAX_INTERIM_RESPONSES {
                        return Err(Attempt::Failed(ClientError::MalformedResponse(
                            "too many interim responses".to_string(),
                        )));
                    }
                    trace!(conn_id = %conn.id(), status = head.status.as_u16(), "Skipping interim response");
                    continue;
                }
                return Ok(head);
            }

            if conn.buffer().len() > self.config.max_header_bytes {
                return Err(Attempt::Failed(ClientError::MalformedResponse(
                    "response head too large".to_string(),
                )));
            }

            let nothing_received = interim == 0 && conn.buffer().is_empty();
            match conn.fill_buf().await {
                Ok(0) if nothing_received && reused => {
                    return Err(Attempt::Stale(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "idle connection closed by peer",
                    )));
                }
                Ok(0) => {
                    return Err(Attempt::Failed(ClientError::MalformedResponse(
                        "connection closed before complete response head".to_string(),
                    )));
                }
                Ok(_) => {}
                Err(e) if nothing_received && reused => return Err(Attempt::Stale(e)),
                Err(e) => return Err(Attempt::Failed(e.into())),
            }
        }
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
