//! Daemon Wire Protocol
//!
//! Minimal request/response exchange between a build process and the shared
//! local daemon tier, carried over any ordered byte stream (TCP loopback or a
//! Unix domain socket).
//!
//! # Frame Layout
//!
//! ```text
//! ┌──────────────┬──────┬─────────────────────────────┬───────┬────────────────────┐
//! │ length (u32) │ kind │ command (str) | status (u8) │ count │ count × (key, val) │
//! └──────────────┴──────┴─────────────────────────────┴───────┴────────────────────┘
//!   str := u32 length + UTF-8 bytes, all integers big-endian
//! ```
//!
//! # Exchange Discipline
//!
//! Strictly half-duplex: one request is outstanding per connection, and the
//! next request may only be written once the previous response has been read.
//! The connection itself links a response to the request it answers.

mod connection;
mod frame;

pub use connection::{connect, BoxedStream, Connection, Endpoint};
pub use frame::{decode, encode, read_frame, write_frame, MAX_FRAME_LEN};

use std::fmt;

use crate::error::{Error, Result};

// =============================================================================
// Reserved Commands and Keys
// =============================================================================

/// Handshake, exchanging an arbitrary data map
pub const HELLO: &str = "HELLO";

/// Resolve a cache key through the daemon's tiers
pub const LOOKUP: &str = "LOOKUP";

/// Hand an artifact to the daemon so it can back-fill its own tiers
pub const STORE: &str = "STORE";

/// Orderly end of a session
pub const BYE: &str = "BYE";

/// Reserved data key carrying a human-readable message
pub const MESSAGE: &str = "message";

/// Protocol revision exchanged during the handshake
pub const PROTOCOL_VERSION: &str = "1";

// =============================================================================
// Status
// =============================================================================

/// Response status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Request served
    Ok,
    /// Request understood but nothing to return
    NotFound,
    /// Request failed; see the message key
    Error,
}

impl Status {
    /// Wire code of this status
    pub fn code(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::NotFound => 1,
            Status::Error => 2,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Status::Ok),
            1 => Ok(Status::NotFound),
            2 => Ok(Status::Error),
            other => Err(Error::Protocol(format!("unknown status code {}", other))),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::NotFound => write!(f, "NOT_FOUND"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Ordered string-to-string payload of a message
///
/// Keys keep the order in which they were first inserted; inserting an
/// existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Data {
    entries: Vec<(String, String)>,
}

impl Data {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a value that the caller requires to be present
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| Error::missing_key(key))
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Data {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut data = Data::new();
        for (k, v) in iter {
            data.insert(k, v);
        }
        data
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A command sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    command: String,
    data: Data,
}

impl Request {
    /// Create a request with an empty payload
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            data: Data::new(),
        }
    }

    /// Create a request with a payload
    pub fn with_data(command: impl Into<String>, data: Data) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }

    /// Add a payload entry while building
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key, value);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    /// Get a payload value the caller cannot proceed without
    pub fn require_data(&self, key: &str) -> Result<&str> {
        self.data.require(key)
    }
}

/// The answer to the request outstanding on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: Status,
    data: Data,
}

impl Response {
    /// Create a response with an empty payload
    pub fn new(status: Status) -> Self {
        Self {
            status,
            data: Data::new(),
        }
    }

    /// Create a response with a payload
    pub fn with_data(status: Status, data: Data) -> Self {
        Self { status, data }
    }

    /// Successful response
    pub fn ok() -> Self {
        Self::new(Status::Ok)
    }

    /// Nothing found for the request
    pub fn not_found() -> Self {
        Self::new(Status::NotFound)
    }

    /// Failed response carrying a message
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Status::Error).with(MESSAGE, message)
    }

    /// Add a payload entry while building
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key, value);
        self
    }

    /// Attach the human-readable message
    pub fn with_message(self, message: impl Into<String>) -> Self {
        self.with(MESSAGE, message)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    /// Get a payload value the caller cannot proceed without
    pub fn require_data(&self, key: &str) -> Result<&str> {
        self.data.require(key)
    }

    /// Human-readable message, if any
    pub fn message(&self) -> Option<&str> {
        self.data.get(MESSAGE)
    }
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Frame kind as shown in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

// =============================================================================
// Tests
// =============================================================================
