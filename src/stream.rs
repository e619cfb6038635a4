//! Byte streams beneath the protocol layer: a TCP implementation for
//! production and a scriptable in-memory one for tests, plus the
//! [`Connector`] abstraction the cluster engine uses to open connections
//! to addresses it discovers at runtime.

use crate::error::{ClientError, Result};
use crate::protocol::RespValue;
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::debug;

/// Outbound connection attempts give up after this long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sequential byte source/sink beneath one protocol connection.
///
/// `fill` suspends until at least one byte arrives and returns 0 on clean
/// EOF. `try_fill` never waits: `Ok(None)` means nothing is readable right
/// now, `Ok(Some(0))` means EOF.
#[allow(async_fn_in_trait)]
pub trait ByteStream {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    fn try_fill(&mut self, buf: &mut BytesMut) -> io::Result<Option<usize>>;

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Opens byte streams to addresses, so routing code can reach nodes it
/// only learns about from topology responses.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Stream: ByteStream;

    async fn connect(&mut self, addr: &str) -> Result<Self::Stream>;
}

/// TCP-backed [`ByteStream`].
pub struct TcpByteStream {
    stream: TcpStream,
}

impl TcpByteStream {
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::connect_with(addr, CONNECT_TIMEOUT).await
    }

    pub async fn connect_with(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Connect {
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|e| ClientError::Connect {
                addr: addr.to_string(),
                source: e,
            })?;
        // Request/response traffic; latency beats throughput.
        let _ = stream.set_nodelay(true);
        debug!(addr, "connected");
        Ok(Self { stream })
    }
}

impl ByteStream for TcpByteStream {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stream.read_buf(buf).await
    }

    fn try_fill(&mut self, buf: &mut BytesMut) -> io::Result<Option<usize>> {
        match self.stream.try_read_buf(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }
}

/// Production connector: TCP with a connect timeout.
#[derive(Clone, Copy)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpByteStream;

    async fn connect(&mut self, addr: &str) -> Result<TcpByteStream> {
        TcpByteStream::connect_with(addr, self.connect_timeout).await
    }
}

#[derive(Default)]
struct MemoryInner {
    input: Vec<u8>,
    output: Vec<u8>,
    closed: bool,
}

/// In-memory [`ByteStream`] for tests. The paired [`MemoryHandle`] plays
/// the server side: it queues reply bytes and inspects what the client
/// wrote.
pub struct MemoryStream {
    inner: Arc<Mutex<MemoryInner>>,
    notify: Arc<Notify>,
}

impl MemoryStream {
    pub fn new() -> (Self, MemoryHandle) {
        let inner = Arc::new(Mutex::new(MemoryInner::default()));
        let notify = Arc::new(Notify::new());
        let handle = MemoryHandle {
            inner: inner.clone(),
            notify: notify.clone(),
        };
        (Self { inner, notify }, handle)
    }
}

impl ByteStream for MemoryStream {
    async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking state, so a push that
            // lands between the check and the await is not lost.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.input.is_empty() {
                    let n = inner.input.len();
                    buf.extend_from_slice(&inner.input);
                    inner.input.clear();
                    return Ok(n);
                }
                if inner.closed {
                    return Ok(0);
                }
            }

            notified.await;
        }
    }

    fn try_fill(&mut self, buf: &mut BytesMut) -> io::Result<Option<usize>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.input.is_empty() {
            let n = inner.input.len();
            buf.extend_from_slice(&inner.input);
            inner.input.clear();
            return Ok(Some(n));
        }
        if inner.closed {
            return Ok(Some(0));
        }
        Ok(None)
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        inner.output.extend_from_slice(data);
        Ok(())
    }
}

/// Server side of a [`MemoryStream`].
#[derive(Clone)]
pub struct MemoryHandle {
    inner: Arc<Mutex<MemoryInner>>,
    notify: Arc<Notify>,
}

impl MemoryHandle {
    /// Queue raw bytes the client will read next.
    pub fn push_reply(&self, data: &[u8]) {
        self.inner.lock().unwrap().input.extend_from_slice(data);
        self.notify.notify_one();
    }

    /// Queue one serialized value the client will read next.
    pub fn push_value(&self, value: &RespValue) {
        self.push_reply(&value.serialize());
    }

    /// Close the read side; the client sees EOF once queued bytes drain.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    /// Everything the client has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().output.clone()
    }

    /// Drain and return the client's written bytes.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().output)
    }
}

/// Test [`Connector`] handing out pre-registered [`MemoryStream`]s.
///
/// Each expected connect is registered up front with
/// [`expect`](Self::expect); connecting to an address with no stream left
/// fails like a refused connection, which is how tests model down nodes.
#[derive(Default)]
pub struct MemoryConnector {
    scripted: HashMap<String, VecDeque<MemoryStream>>,
    log: Vec<String>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the stream returned by the next connect to `addr`.
    pub fn expect(&mut self, addr: &str) -> MemoryHandle {
        let (stream, handle) = MemoryStream::new();
        self.scripted
            .entry(addr.to_string())
            .or_default()
            .push_back(stream);
        handle
    }

    /// Addresses connected to so far, in order.
    pub fn connects(&self) -> &[String] {
        &self.log
    }
}

impl Connector for MemoryConnector {
    type Stream = MemoryStream;

    async fn connect(&mut self, addr: &str) -> Result<MemoryStream> {
        self.log.push(addr.to_string());
        self.scripted
            .get_mut(addr)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| ClientError::Connect {
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "no scripted stream"),
            })
    }
}
