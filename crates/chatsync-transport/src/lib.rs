//! Transport abstraction layer for Chatsync.
//!
//! Provides the [`Connector`] and [`Connection`] traits that abstract over
//! the physical link to the chat server. The session layer owns exactly one
//! connection at a time and only talks to it through these traits, which is
//! what lets tests swap in an in-memory fake.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket client via `tokio-tungstenite`
//!
//! The in-process [`memory_pair`] transport is always available.
//!
//! # Why `impl Future + Send` instead of `async fn`?
//!
//! The session spawns a reader task per connection. `tokio::spawn`
//! requires the future to be `Send`, and a plain `async fn` in a trait
//! makes no promise about that. Spelling the return type out lets
//! implementors still write `async fn` while callers get the `Send` bound.

mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{
    MemoryConnection, MemoryConnector, MemoryPeer, MemoryServer, memory_pair,
};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketConnector};

use std::fmt;
use std::future::Future;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opens new outbound connections to the chat server.
///
/// A connector is a recipe, not a connection: the session calls
/// [`connect`](Connector::connect) once on startup and again after every
/// transport failure.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Connection: Connection;
    /// The error type for connect attempts.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establishes a fresh connection.
    fn connect(
        &self,
    ) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;
}

/// A single connection that can send and receive bytes.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends data to the server.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Receives the next frame from the server.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
