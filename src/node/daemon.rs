//! Daemon Tier
//!
//! Client side of the shared local daemon. One connection is kept per node
//! and guarded by an async mutex, which serializes lookups from concurrent
//! tasks into the strict request/response order the protocol requires.
//!
//! A transport failure fails the request in flight and drops the connection;
//! the next request reconnects. Nothing is retried here.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::entry::{CacheEntry, CacheKey, Content};
use super::{Node, NodeFactory};
use crate::checksum::Checksums;
use crate::error::{Error, Result};
use crate::protocol::{
    connect, BoxedStream, Connection, Data, Endpoint, Request, Response, Status, BYE, HELLO,
    LOOKUP, PROTOCOL_VERSION, STORE,
};

// =============================================================================
// Payload Keys
// =============================================================================

pub(crate) const ORIGIN: &str = "origin";
pub(crate) const PATH: &str = "path";
pub(crate) const LOCATION: &str = "location";
pub(crate) const SIZE: &str = "size";
pub(crate) const NODE: &str = "node";
pub(crate) const CHECKSUM_PREFIX: &str = "checksum.";
pub(crate) const CLIENT: &str = "client";
pub(crate) const SERVER: &str = "server";
pub(crate) const VERSION: &str = "version";

pub(crate) fn key_to_data(key: &CacheKey) -> Data {
    [(ORIGIN, key.origin()), (PATH, key.path())]
        .into_iter()
        .collect()
}

pub(crate) fn key_from_data(data: &Data) -> Result<CacheKey> {
    Ok(CacheKey::new(data.require(ORIGIN)?, data.require(PATH)?))
}

/// Payload describing a file-backed entry; in-memory entries have none
pub(crate) fn entry_to_data(entry: &CacheEntry) -> Option<Data> {
    let location = entry.content().location()?;
    let mut data = key_to_data(entry.key());
    data.insert(LOCATION, location.to_string_lossy());
    data.insert(SIZE, entry.size().to_string());
    data.insert(NODE, entry.node_id());
    for (algorithm, digest) in entry.checksums() {
        data.insert(format!("{}{}", CHECKSUM_PREFIX, algorithm), digest.as_str());
    }
    Some(data)
}

pub(crate) fn entry_from_data(key: CacheKey, data: &Data, node_id: &str) -> Result<CacheEntry> {
    let location = data.require(LOCATION)?;
    let size = data
        .require(SIZE)?
        .parse::<u64>()
        .map_err(|e| Error::Protocol(format!("invalid size: {}", e)))?;
    let checksums: Checksums = data
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(CHECKSUM_PREFIX)
                .map(|algorithm| (algorithm.to_string(), v.to_string()))
        })
        .collect();

    Ok(
        CacheEntry::new(key, Content::File(location.into()), size, node_id)
            .with_checksums(checksums),
    )
}

/// HELLO exchange; returns the server id
async fn handshake(connection: &mut Connection<BoxedStream>, client: &str) -> Result<String> {
    let hello = Request::new(HELLO)
        .with(CLIENT, client)
        .with(VERSION, PROTOCOL_VERSION);
    let response = connection.exchange(&hello).await?;

    if response.status() != Status::Ok {
        return Err(Error::Protocol(format!(
            "handshake rejected: {}",
            response.message().unwrap_or("no reason given")
        )));
    }
    let version = response.require_data(VERSION)?;
    if version != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "daemon speaks protocol {}, expected {}",
            version, PROTOCOL_VERSION
        )));
    }
    Ok(response.data().get(SERVER).unwrap_or("unknown").to_string())
}

// =============================================================================
// Daemon Node
// =============================================================================

/// Tier served by a daemon process
pub struct DaemonNode {
    id: String,
    distance: u32,
    endpoint: Endpoint,
    timeout: Duration,
    connection: Mutex<Option<Connection<BoxedStream>>>,
}

impl DaemonNode {
    /// Create a node that connects on first use
    pub fn new(id: impl Into<String>, endpoint: Endpoint, distance: u32, timeout: Duration) -> Self {
        Self::with_connection(id, endpoint, distance, timeout, None)
    }

    fn with_connection(
        id: impl Into<String>,
        endpoint: Endpoint,
        distance: u32,
        timeout: Duration,
        connection: Option<Connection<BoxedStream>>,
    ) -> Self {
        Self {
            id: id.into(),
            distance,
            endpoint,
            timeout,
            connection: Mutex::new(connection),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open(&self) -> Result<Connection<BoxedStream>> {
        let mut connection = connect(&self.endpoint, self.timeout).await?;
        let server = handshake(&mut connection, &self.id).await?;
        debug!(node = %self.id, endpoint = %self.endpoint, %server, "daemon session opened");
        Ok(connection)
    }

    /// Run one exchange, reconnecting first if the last one failed
    async fn request(&self, request: &Request) -> Result<Response> {
        let mut slot = self.connection.lock().await;
        if !matches!(slot.as_ref(), Some(c) if !c.is_failed()) {
            *slot = Some(self.open().await?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(Error::ConnectionClosed);
        };

        let result = connection.exchange(request).await;
        if result.is_err() {
            *slot = None;
        }
        result
    }

    fn failure(&self, response: &Response) -> Error {
        Error::Tier {
            node: self.id.clone(),
            reason: response
                .message()
                .unwrap_or("daemon reported an error")
                .to_string(),
        }
    }
}

#[async_trait]
impl Node for DaemonNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn distance(&self) -> u32 {
        self.distance
    }

    async fn locate(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let request = Request::with_data(LOOKUP, key_to_data(key));
        let response = self.request(&request).await?;

        match response.status() {
            Status::Ok => entry_from_data(key.clone(), response.data(), &self.id).map(Some),
            Status::NotFound => Ok(None),
            Status::Error => Err(self.failure(&response)),
        }
    }

    async fn store(&self, entry: &CacheEntry) -> Result<bool> {
        let Some(data) = entry_to_data(entry) else {
            return Ok(false);
        };
        let response = self.request(&Request::with_data(STORE, data)).await?;

        match response.status() {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            Status::Error => Err(self.failure(&response)),
        }
    }

    async fn close(&self) -> Result<()> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        if !connection.is_failed() {
            if let Err(e) = connection.exchange(&Request::new(BYE)).await {
                debug!(node = %self.id, error = %e, "daemon did not acknowledge BYE");
            }
        }
        let _ = connection.shutdown().await;
        Ok(())
    }
}

impl std::fmt::Debug for DaemonNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonNode")
            .field("id", &self.id)
            .field("distance", &self.distance)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Builds a daemon tier from the first reachable endpoint
///
/// Endpoints are probed in the order given, so mirrors can list their
/// preferred address first.
#[derive(Debug, Clone)]
pub struct DaemonNodeFactory {
    id: String,
    endpoints: Vec<Endpoint>,
    distance: u32,
    timeout: Duration,
}

impl DaemonNodeFactory {
    /// Create a new factory
    pub fn new(id: impl Into<String>, endpoints: Vec<Endpoint>, distance: u32) -> Self {
        Self {
            id: id.into(),
            endpoints,
            distance,
            timeout: Duration::from_secs(1),
        }
    }

    /// Limit each connection attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn distance(&self) -> u32 {
        self.distance
    }
}

#[async_trait]
impl NodeFactory for DaemonNodeFactory {
    fn name(&self) -> &str {
        &self.id
    }

    async fn create(&self) -> Option<Box<dyn Node>> {
        for endpoint in &self.endpoints {
            let mut connection = match connect(endpoint, self.timeout).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(node = %self.id, %endpoint, error = %e, "daemon endpoint unreachable");
                    continue;
                }
            };
            match handshake(&mut connection, &self.id).await {
                Ok(server) => {
                    info!(node = %self.id, %endpoint, %server, "connected to daemon");
                    return Some(Box::new(DaemonNode::with_connection(
                        self.id.clone(),
                        endpoint.clone(),
                        self.distance,
                        self.timeout,
                        Some(connection),
                    )));
                }
                Err(e) => {
                    debug!(node = %self.id, %endpoint, error = %e, "daemon handshake failed");
                }
            }
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
