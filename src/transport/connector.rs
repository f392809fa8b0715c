//! Dialing new byte streams.

use crate::pool::{Destination, Scheme};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A bidirectional byte stream to a remote peer.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens connections to destinations.
///
/// TLS, proxies and name resolution live behind this trait; the pool only
/// sees the resulting stream.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, destination: &Destination) -> io::Result<Box<dyn Connection>>;
}

/// Plain TCP connector for `http` destinations.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, destination: &Destination) -> io::Result<Box<dyn Connection>> {
        if destination.scheme() == Scheme::Https {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TcpConnector does not speak TLS",
            ));
        }

        let addr = destination.socket_addr();
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
        stream.set_nodelay(true)?;

        tracing::trace!(destination = %destination, "TCP connection established");
        Ok(Box::new(stream))
    }
}
