//! Shared Local Daemon
//!
//! Serves an [`ArtifactCache`] to build processes on the same machine over
//! the wire protocol. Each accepted connection runs in its own task and is
//! served strictly one request at a time. Lookups and stores go through the
//! cache's checksum enforcement, so nothing unverified lands in the daemon's
//! own tiers.
//!
//! # Commands
//!
//! | Command | Data | Reply |
//! |---------|------|-------|
//! | `HELLO` | `client`, `version` | `OK` with `server`, `version` |
//! | `LOOKUP` | `origin`, `path` | `OK` with `location`, `size`, `node`, `checksum.<ALG>`; or `NOT_FOUND` |
//! | `STORE` | `origin`, `path`, `location`, `size`, `checksum.<ALG>` | `OK` with `node`; or `NOT_FOUND` when no tier accepts writes |
//! | `BYE` | - | `OK`, then the connection ends |
//!
//! Any other command is answered with `ERROR` and a `message`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::ArtifactCache;
use crate::error::{Error, Result};
use crate::node::{
    entry_from_data, entry_to_data, key_from_data, NodeChain, CLIENT, SERVER, VERSION,
};
use crate::protocol::{
    Connection, Request, Response, Status, BYE, HELLO, LOOKUP, PROTOCOL_VERSION, STORE,
};

const NODE: &str = "node";

/// Daemon serving lookups and stores from its own cache
pub struct DaemonServer {
    id: String,
    cache: Arc<ArtifactCache>,
    shutdown: CancellationToken,
    connections: AtomicU64,
    requests: AtomicU64,
}

impl DaemonServer {
    /// Create a new daemon over `cache`
    pub fn new(id: impl Into<String>, cache: Arc<ArtifactCache>) -> Self {
        Self {
            id: id.into(),
            cache,
            shutdown: CancellationToken::new(),
            connections: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn chain(&self) -> &Arc<NodeChain> {
        self.cache.chain()
    }

    /// Token that stops every accept loop and connection of this daemon
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting and end open sessions at their next request
    pub fn shutdown(&self) {
        info!(server = %self.id, "daemon shutting down");
        self.shutdown.cancel();
    }

    /// Connections accepted so far
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Requests served so far
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Accept TCP connections until shut down
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(server = %self.id, addr = %listener.local_addr()?, "daemon listening on TCP");
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
            self.spawn_connection(stream, peer.to_string());
        }
        Ok(())
    }

    /// Accept Unix domain socket connections until shut down
    #[cfg(unix)]
    pub async fn serve_unix(self: Arc<Self>, listener: tokio::net::UnixListener) -> Result<()> {
        info!(server = %self.id, "daemon listening on Unix socket");
        loop {
            let (stream, _) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            self.spawn_connection(stream, "unix".to_string());
        }
        Ok(())
    }

    fn spawn_connection<S>(self: &Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.connections.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("connection", id = %Uuid::new_v4(), %peer);
        let server = self.clone();
        tokio::spawn(async move { server.handle_connection(stream).await }.instrument(span));
    }

    /// Serve one connection until the peer leaves or the daemon stops
    pub async fn handle_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("session started");
        let mut connection = Connection::new(stream);
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = connection.read_request() => request,
            };
            let request = match request {
                Ok(request) => request,
                Err(Error::ConnectionClosed) => {
                    debug!("peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "dropping connection");
                    break;
                }
            };

            let response = self.dispatch(&request).await;
            if let Err(e) = connection.write_response(&response).await {
                warn!(command = request.command(), error = %e, "failed to send response");
                break;
            }
            if request.command() == BYE {
                break;
            }
        }
        let _ = connection.shutdown().await;
        debug!("session ended");
    }

    /// Answer one request
    pub async fn dispatch(&self, request: &Request) -> Response {
        self.requests.fetch_add(1, Ordering::Relaxed);
        debug!(command = request.command(), "request");

        let result = match request.command() {
            HELLO => self.hello(request),
            LOOKUP => self.lookup(request).await,
            STORE => self.store(request).await,
            BYE => Ok(Response::ok()),
            other => Ok(Response::error(format!("unknown command '{}'", other))),
        };
        result.unwrap_or_else(|e| {
            warn!(command = request.command(), error = %e, "request failed");
            Response::error(e.to_string())
        })
    }

    fn hello(&self, request: &Request) -> Result<Response> {
        if let Some(version) = request.data().get(VERSION) {
            if version != PROTOCOL_VERSION {
                return Ok(Response::error(format!(
                    "unsupported protocol version {}",
                    version
                )));
            }
        }
        debug!(client = request.data().get(CLIENT).unwrap_or("anonymous"), "handshake");
        Ok(Response::ok()
            .with(SERVER, self.id.as_str())
            .with(VERSION, PROTOCOL_VERSION))
    }

    async fn lookup(&self, request: &Request) -> Result<Response> {
        let key = key_from_data(request.data())?;
        let Some(mut entry) = self.cache.fetch(&key).await? else {
            return Ok(Response::not_found());
        };
        if entry.content().location().is_none() {
            // Promotion may have left a copy on disk that the client can read
            if let Some(hit) = self.chain().locate(&key).await? {
                entry = hit.entry;
            }
        }
        match entry_to_data(&entry) {
            Some(data) => Ok(Response::with_data(Status::Ok, data)),
            None => Ok(Response::not_found().with_message(format!(
                "{} is held in memory by {} and cannot be shared",
                key,
                entry.node_id()
            ))),
        }
    }

    async fn store(&self, request: &Request) -> Result<Response> {
        let key = key_from_data(request.data())?;
        let client = request.data().get(CLIENT).unwrap_or("client");
        let entry = entry_from_data(key, request.data(), client)?;

        match self.cache.store_entry(&entry).await? {
            Some(node) => {
                debug!(key = %entry.key(), %node, "stored on behalf of client");
                Ok(Response::ok().with(NODE, node))
            }
            None => Ok(Response::not_found().with_message("no writable tier")),
        }
    }
}

impl std::fmt::Debug for DaemonServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonServer")
            .field("id", &self.id)
            .field("cache", &self.cache)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
