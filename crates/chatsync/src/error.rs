//! Error types for the Chatsync client.

use chatsync_conversation::ConversationError;
use chatsync_protocol::{MessageId, ProtocolError};
use chatsync_session::SessionError;
use chatsync_transport::TransportError;

/// Why a send (or a retry) did not reach the server.
///
/// Except for [`EmptyMessage`](Self::EmptyMessage), the optimistic message
/// is still in the conversation when one of these is returned; a
/// connection failure leaves it in the failed substate so it can be
/// retried.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The text was empty after trimming. Nothing was inserted or sent.
    #[error("message is empty")]
    EmptyMessage,

    /// The connection could not be established (or broke while
    /// emitting). The message has been marked failed.
    #[error("connection unavailable, message {local_id} marked failed: {source}")]
    ConnectionUnavailable {
        /// Local id of the failed message; pass it to `retry`.
        local_id: MessageId,
        /// What the session reported.
        #[source]
        source: SessionError,
    },

    /// `retry` named a message the room doesn't hold.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    /// `retry` named a message that isn't a failed optimistic message.
    #[error("message {0} is not in the failed state")]
    NotRetryable(MessageId),

    /// The client's engine task is gone.
    #[error("chat engine stopped")]
    EngineStopped,
}

/// Errors reported by a [`MessageStore`](crate::MessageStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store answered, but refused or failed the request.
    #[error("store request failed: {0}")]
    Request(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `chatsync` meta-crate, you deal with this single
/// error type instead of importing errors from each sub-crate.
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum ChatsyncError {
    /// A transport-level error (connect, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid room key).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (timeout, retries exhausted, not connected).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A conversation-level error (stale receipt, unknown message).
    #[error(transparent)]
    Conversation(#[from] ConversationError),

    /// A send or retry failed.
    #[error(transparent)]
    Send(#[from] SendError),

    /// The history/deletion store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The builder was asked to build without an identity.
    #[error("no identity configured")]
    MissingIdentity,

    /// The client's engine task is gone.
    #[error("chat engine stopped")]
    EngineStopped,
}

#[cfg(test)]
mod tests {
    use chatsync_protocol::RoomKey;

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let chatsync_err: ChatsyncError = err.into();
        assert!(matches!(chatsync_err, ChatsyncError::Transport(_)));
        assert!(chatsync_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidRoomKey("nope".into());
        let chatsync_err: ChatsyncError = err.into();
        assert!(matches!(chatsync_err, ChatsyncError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let chatsync_err: ChatsyncError = SessionError::NotConnected.into();
        assert!(matches!(chatsync_err, ChatsyncError::Session(_)));
    }

    #[test]
    fn test_from_conversation_error() {
        let err = ConversationError::StaleReceipt {
            room: RoomKey::channel("c"),
            message_id: MessageId::from("m"),
        };
        let chatsync_err: ChatsyncError = err.into();
        assert!(matches!(chatsync_err, ChatsyncError::Conversation(_)));
    }

    #[test]
    fn test_send_error_keeps_local_id_and_source() {
        let err = SendError::ConnectionUnavailable {
            local_id: MessageId::from("local-1"),
            source: SessionError::NotConnected,
        };
        let msg = err.to_string();
        assert!(msg.contains("local-1"));
        assert!(std::error::Error::source(&err).is_some());

        let chatsync_err: ChatsyncError = err.into();
        assert!(matches!(chatsync_err, ChatsyncError::Send(_)));
    }

    #[test]
    fn test_from_store_error() {
        let chatsync_err: ChatsyncError = StoreError::Request("500".into()).into();
        assert!(matches!(chatsync_err, ChatsyncError::Store(_)));
    }
}
