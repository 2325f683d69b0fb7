//! Connection Handle
//!
//! Enforces the half-duplex exchange on top of the frame codec. Either side of
//! a connection uses the same type: clients call `write_request` /
//! `read_response`, the daemon calls `read_request` / `write_response`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::frame::{read_frame, write_frame};
use super::{Message, Request, Response};
use crate::error::{Error, Result};

/// Any byte stream a connection can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Type-erased stream used when the transport is chosen at runtime
pub type BoxedStream = Box<dyn ByteStream>;

// =============================================================================
// Endpoint
// =============================================================================

/// Where a daemon listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP socket, usually loopback
    Tcp(SocketAddr),
    /// Unix domain socket path
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Accepts `tcp://host:port`, `unix:///path/to/socket` or a bare `host:port`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::Config("unix endpoint without a path".into()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        addr.parse::<SocketAddr>()
            .map(Endpoint::Tcp)
            .map_err(|e| Error::Config(format!("invalid endpoint '{}': {}", s, e)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Open a connection to an endpoint, giving up after `timeout`
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Connection<BoxedStream>> {
    let stream: BoxedStream = match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| timed_out(endpoint))??;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path))
                .await
                .map_err(|_| timed_out(endpoint))??;
            Box::new(stream)
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => {
            return Err(Error::Config(
                "unix domain sockets are not supported on this platform".into(),
            ));
        }
    };
    debug!(%endpoint, "connected");
    Ok(Connection::new(stream))
}

fn timed_out(endpoint: &Endpoint) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("connecting to {} timed out", endpoint),
    ))
}

// =============================================================================
// Connection
// =============================================================================

/// Exchange state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing in flight
    Idle,
    /// Client wrote a request and owes a `read_response`
    AwaitingResponse,
    /// Server read a request and owes a `write_response`
    Serving,
    /// A transport failure tore the connection down
    Failed,
}

/// One end of a half-duplex request/response connection
pub struct Connection<S> {
    stream: S,
    phase: Phase,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase)
            .finish()
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established byte stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            phase: Phase::Idle,
        }
    }

    /// Whether a transport failure has torn this connection down
    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    /// Send a request; the previous response must have been read
    pub async fn write_request(&mut self, request: &Request) -> Result<()> {
        self.expect(Phase::Idle, "write_request")?;
        let message = Message::Request(request.clone());
        self.begin();
        write_frame(&mut self.stream, &message).await?;
        self.phase = Phase::AwaitingResponse;
        Ok(())
    }

    /// Wait for the response to the outstanding request
    pub async fn read_response(&mut self) -> Result<Response> {
        self.expect(Phase::AwaitingResponse, "read_response")?;
        self.begin();
        match read_frame(&mut self.stream).await? {
            Message::Response(response) => {
                self.phase = Phase::Idle;
                Ok(response)
            }
            Message::Request(request) => Err(Error::Protocol(format!(
                "expected a response, got request '{}'",
                request.command()
            ))),
        }
    }

    /// Send a request and wait for its response
    pub async fn exchange(&mut self, request: &Request) -> Result<Response> {
        self.write_request(request).await?;
        self.read_response().await
    }

    /// Wait for the next request from the peer
    pub async fn read_request(&mut self) -> Result<Request> {
        self.expect(Phase::Idle, "read_request")?;
        self.begin();
        match read_frame(&mut self.stream).await? {
            Message::Request(request) => {
                self.phase = Phase::Serving;
                Ok(request)
            }
            Message::Response(response) => Err(Error::Protocol(format!(
                "expected a request, got {} response",
                response.status()
            ))),
        }
    }

    /// Answer the request most recently read
    pub async fn write_response(&mut self, response: &Response) -> Result<()> {
        self.expect(Phase::Serving, "write_response")?;
        let message = Message::Response(response.clone());
        self.begin();
        write_frame(&mut self.stream, &message).await?;
        self.phase = Phase::Idle;
        Ok(())
    }

    /// Shut the write half down
    pub async fn shutdown(&mut self) -> Result<()> {
        self.phase = Phase::Failed;
        self.stream.shutdown().await?;
        Ok(())
    }

    fn expect(&self, phase: Phase, operation: &str) -> Result<()> {
        if self.phase == Phase::Failed {
            return Err(Error::ConnectionClosed);
        }
        if self.phase != phase {
            return Err(Error::ExchangeOrder(format!(
                "{} called while connection is {:?}",
                operation, self.phase
            )));
        }
        Ok(())
    }

    /// Mark the connection failed until the frame in flight completes
    ///
    /// An error or a dropped future leaves it failed, since the stream may
    /// hold part of a frame.
    fn begin(&mut self) {
        self.phase = Phase::Failed;
    }
}

// =============================================================================
// Tests
// =============================================================================
