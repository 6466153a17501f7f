//! TCP connection management with line-delimited I/O.
//!
//! Stratum v1 uses newline-delimited JSON over TCP. [`Connection`] frames the
//! stream with a [`LinesCodec`] so reads stay cancellation-safe inside the
//! client's `select!` loop. The [`Transport`] trait abstracts message I/O and
//! the [`Connector`] trait abstracts dialing, so tests can run the whole
//! client over channels.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use super::CONNECT_TIMEOUT;
use crate::tracing::prelude::*;
use crate::tracing::LogConfig;

/// Longest line we accept from a pool. Large coinbases and merkle branches
/// fit comfortably.
const MAX_LINE_LENGTH: usize = 1 << 16;

/// Pool endpoint, `scheme://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PoolUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

fn url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(stratum\+tcp|tcp)://([A-Za-z0-9.\-_]+|\[[0-9A-Fa-f:.]+\]):([0-9]{1,5})/?$").ok()
    })
    .as_ref()
}

impl PoolUrl {
    /// `host:port` suitable for [`TcpStream::connect`].
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for PoolUrl {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = url_regex()
            .and_then(|re| re.captures(s.trim()))
            .ok_or_else(|| StratumError::InvalidUrl(format!("expected scheme://host:port, got {s:?}")))?;

        let port: u16 = caps[3]
            .parse()
            .map_err(|_| StratumError::InvalidUrl(format!("port out of range in {s:?}")))?;
        if port == 0 {
            return Err(StratumError::InvalidUrl(format!("port 0 in {s:?}")));
        }

        Ok(Self {
            scheme: caps[1].to_string(),
            host: caps[2].to_string(),
            port,
        })
    }
}

impl TryFrom<String> for PoolUrl {
    type Error = StratumError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PoolUrl> for String {
    fn from(url: PoolUrl) -> Self {
        url.to_string()
    }
}

impl fmt::Display for PoolUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Message-level I/O for Stratum protocol.
///
/// Abstracts reading and writing JSON-RPC messages so the client can run
/// over TCP (production) or channels (tests). `read_message` must be
/// cancellation-safe.
#[async_trait]
pub trait Transport: Send {
    /// Read one complete JSON-RPC message.
    ///
    /// Returns `None` on clean connection close (EOF).
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>>;

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()>;
}

/// Opens transports to a pool. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &PoolUrl) -> StratumResult<Box<dyn Transport>>;
}

/// Line-framed TCP connection for Stratum protocol.
pub struct Connection {
    framed: Framed<TcpStream, LinesCodec>,
    log: LogConfig,
}

impl Connection {
    pub fn new(stream: TcpStream, log: LogConfig) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            log,
        }
    }

    /// Connect to a Stratum pool, bounded by [`CONNECT_TIMEOUT`].
    pub async fn connect(url: &PoolUrl, log: LogConfig) -> StratumResult<Self> {
        debug!(url = %url, "Connecting to pool");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(url.authority()))
            .await
            .map_err(|_| StratumError::ConnectionFailed(format!("{url}: connect timed out")))?
            .map_err(|e| StratumError::ConnectionFailed(format!("{url}: {e}")))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not set TCP_NODELAY");
        }

        Ok(Self::new(stream, log))
    }
}

fn codec_error(err: LinesCodecError) -> StratumError {
    match err {
        LinesCodecError::Io(e) => StratumError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            StratumError::InvalidMessage(format!("line longer than {MAX_LINE_LENGTH} bytes"))
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        loop {
            let line = match self.framed.next().await {
                None => return Ok(None),
                Some(line) => line.map_err(codec_error)?,
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if self.log.raw_traffic() {
                trace!(rx = %line, "Received message");
            }

            return serde_json::from_str(line).map(Some).map_err(|e| {
                StratumError::InvalidMessage(format!("{e}, line: {line}"))
            });
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let json = serde_json::to_string(msg)?;
        if self.log.raw_traffic() {
            trace!(tx = %json, "Sending message");
        }

        self.framed.send(json).await.map_err(codec_error)
    }
}

/// Dials pools over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector {
    log: LogConfig,
}

impl TcpConnector {
    pub fn new(log: LogConfig) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &PoolUrl) -> StratumResult<Box<dyn Transport>> {
        Ok(Box::new(Connection::connect(url, self.log).await?))
    }
}

/// Channel-based transport for deterministic testing.
///
/// Backed by tokio mpsc channels rather than TCP, so it works with
/// `tokio::time::pause()` without triggering auto-advance on real I/O.
/// Create a pair with [`MockTransport::pair()`]; the transport is the
/// client's side, the handle is the test's side.
#[cfg(test)]
pub(crate) struct MockTransport {
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Test-side handle for a [`MockTransport`].
///
/// Dropping the handle closes the client's read side, which the client sees
/// as the pool hanging up.
#[cfg(test)]
pub(crate) struct MockTransportHandle {
    tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    rx: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl MockTransport {
    pub fn pair() -> (Self, MockTransportHandle) {
        let (client_tx, handle_rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle_tx, client_rx) = tokio::sync::mpsc::unbounded_channel();

        (
            MockTransport {
                rx: client_rx,
                tx: client_tx,
            },
            MockTransportHandle {
                tx: handle_tx,
                rx: handle_rx,
            },
        )
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

#[cfg(test)]
impl MockTransportHandle {
    /// Send a message to the client.
    pub fn send(&self, msg: JsonRpcMessage) {
        self.tx.send(msg).expect("transport dropped");
    }

    /// Receive a message the client wrote.
    pub async fn recv(&mut self) -> JsonRpcMessage {
        self.rx.recv().await.expect("transport dropped")
    }

    /// Receive the next request the client wrote and check its method.
    pub async fn expect_request(&mut self, method: &str) -> (u64, serde_json::Value) {
        match self.recv().await {
            JsonRpcMessage::Request {
                id: Some(id),
                method: got,
                params,
            } if got == method => (id, params),
            other => panic!("expected {method} request, got {other:?}"),
        }
    }

    /// Reply to request `id` with a result.
    pub fn respond(&self, id: u64, result: serde_json::Value) {
        self.send(JsonRpcMessage::Response {
            id,
            result: Some(result),
            error: None,
        });
    }

    /// Reply to request `id` with a Stratum error array.
    pub fn respond_error(&self, id: u64, error: serde_json::Value) {
        self.send(JsonRpcMessage::Response {
            id,
            result: None,
            error: Some(error),
        });
    }

    pub fn notify(&self, method: &str, params: serde_json::Value) {
        self.send(JsonRpcMessage::notification(method, params));
    }

    /// Whether the client has written nothing further.
    pub fn rx_is_empty(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}

/// Connector handing out pre-made mock transports, one per attempt.
///
/// Attempts beyond the queued transports fail with `ConnectionFailed`.
#[cfg(test)]
pub(crate) struct MockConnector {
    transports: parking_lot::Mutex<std::collections::VecDeque<MockTransport>>,
    attempts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MockConnector {
    pub fn new(transports: Vec<MockTransport>) -> Self {
        Self {
            transports: parking_lot::Mutex::new(transports.into()),
            attempts: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &PoolUrl) -> StratumResult<Box<dyn Transport>> {
        self.attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match self.transports.lock().pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(StratumError::ConnectionFailed(format!("{url}: refused"))),
        }
    }
}
