//! Error types for the session layer.

use std::time::Duration;

use chatsync_protocol::ProtocolError;

/// Errors surfaced by [`TransportSession`](crate::TransportSession).
///
/// Only the send pipeline sees these. The reconciliation side of the
/// client never depends on the connection succeeding.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// `ensure_connected` gave up waiting for the open state.
    #[error("connection not established within {0:?}")]
    ConnectionTimeout(Duration),

    /// Every connect attempt failed; the session stopped retrying.
    #[error("connection unavailable after {attempts} attempts: {reason}")]
    ConnectionUnavailable {
        /// How many attempts were made.
        attempts: u32,
        /// The last failure reason.
        reason: String,
    },

    /// An emit was attempted while no connection is open.
    #[error("not connected")]
    NotConnected,

    /// The open connection failed while sending. Reconnection has
    /// already been scheduled.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Encoding an outbound event failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// `true` for the failures the send pipeline treats as "connection
    /// unavailable" (the message is marked failed).
    pub fn is_connection_failure(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}
