//! In-memory transport for integration tests.
//!
//! Every `connect` creates a `tokio::io::duplex` pair and spawns a tiny
//! HTTP/1.1 server on the far end that answers each request with whatever
//! the responder returns.

#![allow(dead_code)]

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tether::client::RequestExecutor;
use tether::config::Config;
use tether::http::request::Request;
use tether::pool::Destination;
use tether::transport::{Connection, Connector};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

pub const URL: &str = "http://mock.test/";

type Responder = Arc<dyn Fn(usize) -> Option<Vec<u8>> + Send + Sync>;

pub struct MockConnector {
    responder: Responder,
    hang_up_after: Option<usize>,
    interim: Option<Vec<u8>>,
    refuse: AtomicBool,
    fail_new_writes: AtomicBool,
    connects: AtomicUsize,
    faults: Mutex<Vec<Arc<AtomicBool>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    /// Answer every request with `response`.
    pub fn replying(response: Vec<u8>) -> Arc<Self> {
        Self::with(move |_| Some(response.clone()), None)
    }

    /// `responder(n)` answers the n-th request on a connection; `None`
    /// leaves the request unanswered. The server hangs up after
    /// `hang_up_after` responses.
    pub fn with(
        responder: impl Fn(usize) -> Option<Vec<u8>> + Send + Sync + 'static,
        hang_up_after: Option<usize>,
    ) -> Arc<Self> {
        Self::build(Arc::new(responder), hang_up_after, None)
    }

    /// Like [`with`](Self::with), but every response is preceded by
    /// `interim` and a short pause.
    pub fn with_interim(
        interim: Vec<u8>,
        responder: impl Fn(usize) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(Arc::new(responder), None, Some(interim))
    }

    fn build(responder: Responder, hang_up_after: Option<usize>, interim: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            responder,
            hang_up_after,
            interim,
            refuse: AtomicBool::new(false),
            fail_new_writes: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            faults: Mutex::new(Vec::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Make writes fail on every connection opened from now on.
    pub fn fail_new_writes(&self) {
        self.fail_new_writes.store(true, Ordering::SeqCst);
    }

    /// Make writes fail on the `n`-th connection ever opened (0-based).
    pub fn break_connection(&self, n: usize) {
        self.faults.lock().unwrap()[n].store(true, Ordering::SeqCst);
    }

    /// Request heads received by the server side, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _destination: &Destination) -> io::Result<Box<dyn Connection>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve(
            server,
            self.responder.clone(),
            self.hang_up_after,
            self.interim.clone(),
            self.requests.clone(),
        ));

        let fail_writes = Arc::new(AtomicBool::new(self.fail_new_writes.load(Ordering::SeqCst)));
        self.faults.lock().unwrap().push(fail_writes.clone());
        Ok(Box::new(FaultyStream {
            inner: client,
            fail_writes,
        }))
    }
}

async fn serve(
    mut io: DuplexStream,
    responder: Responder,
    hang_up_after: Option<usize>,
    interim: Option<Vec<u8>>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut served = 0;

    loop {
        let end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buf[..end]).to_string();
        let content_length = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < end + content_length {
            match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        buf.drain(..end + content_length);
        requests.lock().unwrap().push(head);

        if let Some(interim) = &interim {
            if io.write_all(interim).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        match responder(served) {
            Some(response) => {
                if io.write_all(&response).await.is_err() {
                    return;
                }
            }
            None => {
                // Leave the request unanswered until the client goes away.
                let _ = io.read(&mut chunk).await;
                return;
            }
        }

        served += 1;
        if hang_up_after == Some(served) {
            return;
        }
    }
}

/// Duplex stream whose writes can be made to fail on demand.
struct FaultyStream {
    inner: DuplexStream,
    fail_writes: Arc<AtomicBool>,
}

impl AsyncRead for FaultyStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FaultyStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// `HTTP/1.1 200 OK` with a sized body.
pub fn ok(body: &str) -> Vec<u8> {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
}

pub fn response(head: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!("{}\r\n\r\n", head).into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn config() -> Config {
    Config::default()
}

pub fn executor(config: &Config, connector: &Arc<MockConnector>) -> RequestExecutor {
    RequestExecutor::new(config, connector.clone())
}

pub fn get() -> Request {
    Request::get(URL).unwrap()
}

pub fn get_to(url: &str) -> Request {
    Request::get(url).unwrap()
}
