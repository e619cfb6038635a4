//! Single-connection client.
//!
//! A [`NodeClient`] owns one byte stream, serializes outbound requests,
//! and keeps an ordered queue of pending continuations. The wire carries
//! replies strictly in request order, so the oldest continuation always
//! matches the next parsed value; push messages bypass the queue entirely.

use crate::error::{ClientError, ParseError, Result};
use crate::protocol::{command, RespParser, RespValue};
use crate::stream::{ByteStream, TcpByteStream};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Continuation invoked exactly once with the reply (or failure) of one
/// request. It consumes the value; whoever installed it owns the tree
/// afterwards.
pub type ReplyHandler = Box<dyn FnOnce(Result<RespValue>) + Send>;

/// Callback for server-initiated push messages.
pub type PushHandler = Box<dyn FnMut(RespValue) + Send>;

pub struct NodeClient<S> {
    stream: Option<S>,
    parser: RespParser,
    pending: VecDeque<ReplyHandler>,
    push_handler: Option<PushHandler>,
}

impl<S: ByteStream> NodeClient<S> {
    pub fn new() -> Self {
        Self {
            stream: None,
            parser: RespParser::new(8192),
            pending: VecDeque::new(),
            push_handler: None,
        }
    }

    /// Install a connected stream, tearing down any previous one first.
    pub fn attach(&mut self, stream: S) {
        self.teardown();
        self.stream = Some(stream);
    }

    /// Drop the connection. Pending continuations fail with
    /// [`ClientError::NotConnected`]; buffered partial input is discarded.
    pub fn disconnect(&mut self) {
        if self.stream.is_some() {
            debug!(pending = self.pending.len(), "disconnecting");
        }
        self.teardown();
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn set_push_handler(&mut self, handler: impl FnMut(RespValue) + Send + 'static) {
        self.push_handler = Some(Box::new(handler));
    }

    /// Write one request and queue its continuation.
    ///
    /// On error the request was not issued and the continuation is dropped
    /// uninvoked; a write failure additionally tears the connection down,
    /// failing previously queued continuations.
    pub async fn send(&mut self, request: &RespValue, handler: ReplyHandler) -> Result<()> {
        let data = request.serialize();
        self.write(&data).await?;
        self.pending.push_back(handler);
        Ok(())
    }

    /// Write MULTI, each command, and EXEC as one pipelined chunk.
    ///
    /// Only the EXEC reply reaches `on_exec`; the MULTI acknowledgment and
    /// the per-command QUEUED replies are discarded. A command rejected at
    /// queue time surfaces through EXEC as the server's abort error, so
    /// nothing is lost by dropping the intermediate replies.
    pub async fn send_transaction(
        &mut self,
        commands: &[RespValue],
        on_exec: ReplyHandler,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(64 * (commands.len() + 2));
        command::multi().encode(&mut buf);
        for cmd in commands {
            cmd.encode(&mut buf);
        }
        command::exec().encode(&mut buf);

        self.write(&buf).await?;

        for _ in 0..commands.len() + 1 {
            self.pending.push_back(Box::new(|_| {}));
        }
        self.pending.push_back(on_exec);
        Ok(())
    }

    /// Make at most one step of read progress without waiting.
    ///
    /// Returns `Ok(true)` when a complete value came off the wire, whether
    /// it resolved a pending continuation or went to the push handler.
    /// Errors are fatal for the connection and have already torn it down.
    pub async fn update(&mut self) -> Result<bool> {
        if self.stream.is_none() {
            return Ok(false);
        }

        // Serve from already buffered bytes before touching the socket.
        match self.parser.parse() {
            Ok(Some(value)) => return self.dispatch(value).map(|_| true),
            Ok(None) => {}
            Err(e) => {
                self.teardown();
                return Err(e);
            }
        }

        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        match stream.try_fill(self.parser.buffer_mut()) {
            Ok(None) => return Ok(false),
            Ok(Some(0)) => return Err(self.closed_by_peer()),
            Ok(Some(_)) => {}
            Err(e) => {
                self.teardown();
                return Err(e.into());
            }
        }

        match self.parser.parse() {
            Ok(Some(value)) => self.dispatch(value).map(|_| true),
            Ok(None) => Ok(false),
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// Drive the connection until every pending continuation has fired.
    ///
    /// This is the blocking path: between parse attempts it suspends until
    /// the peer sends more bytes.
    pub async fn flush(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            if self.update().await? {
                continue;
            }

            let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
            let n = stream.fill(self.parser.buffer_mut()).await.map_err(|e| {
                self.teardown();
                ClientError::from(e)
            })?;
            if n == 0 {
                return Err(self.closed_by_peer());
            }
        }
        Ok(())
    }

    /// Send one request and wait for its reply.
    pub async fn call(&mut self, request: &RespValue) -> Result<RespValue> {
        let slot: Arc<Mutex<Option<Result<RespValue>>>> = Arc::new(Mutex::new(None));
        let tx = slot.clone();
        self.send(
            request,
            Box::new(move |reply| {
                *tx.lock().unwrap() = Some(reply);
            }),
        )
        .await?;
        self.flush().await?;

        let reply = slot
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(ClientError::NotConnected));
        reply
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        if let Err(e) = stream.write_all(data).await {
            warn!(error = %e, "write failed, dropping connection");
            self.teardown();
            return Err(e.into());
        }
        Ok(())
    }

    fn dispatch(&mut self, value: RespValue) -> Result<()> {
        if value.is_push() {
            match self.push_handler.as_mut() {
                Some(handler) => handler(value),
                None => debug!("push message with no handler installed, dropped"),
            }
            return Ok(());
        }

        match self.pending.pop_front() {
            Some(handler) => {
                handler(Ok(value));
                Ok(())
            }
            None => {
                warn!("reply with no request pending, dropping connection");
                self.teardown();
                Err(ClientError::StrayResponse)
            }
        }
    }

    /// EOF from the peer. A partial value left in the buffer means the
    /// stream died mid-value, which is a parse-level fault.
    fn closed_by_peer(&mut self) -> ClientError {
        let mid_value = !self.parser.is_empty();
        self.teardown();
        if mid_value {
            ParseError::Truncated.into()
        } else {
            ClientError::ConnectionClosed
        }
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.parser.reset();
        while let Some(handler) = self.pending.pop_front() {
            handler(Err(ClientError::NotConnected));
        }
    }
}

impl<S: ByteStream> Default for NodeClient<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeClient<TcpByteStream> {
    /// Connect over TCP, replacing any existing connection.
    pub async fn connect(&mut self, addr: &str) -> Result<()> {
        let stream = TcpByteStream::connect(addr).await?;
        self.attach(stream);
        Ok(())
    }
}
