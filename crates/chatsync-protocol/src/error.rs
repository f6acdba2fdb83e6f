//! Error types for the protocol layer.
//!
//! Each crate in Chatsync defines its own error enum. When you see a
//! `ProtocolError`, the problem is in serialization or in a malformed
//! identifier, not in networking or conversation state.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, an unknown event `type`, or a
    /// missing required field.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A room key string did not have the `channel:<id>` or `dm:<a>:<b>`
    /// shape.
    #[error("invalid room key: {0:?}")]
    InvalidRoomKey(String),

    /// The message is invalid at the protocol level.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
