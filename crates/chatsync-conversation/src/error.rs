//! Error types for the conversation layer.

use chatsync_protocol::{MessageId, RoomKey};

/// Errors that can occur while mutating a conversation.
///
/// None of these are fatal to the client: the engine logs them and moves
/// on, relying on the next history fetch to fill any gap.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    /// A delivery/read receipt named a message this conversation doesn't
    /// hold (or only holds as an unconfirmed optimistic copy).
    #[error("stale receipt for message {message_id} in {room}")]
    StaleReceipt {
        /// The conversation the receipt was routed to.
        room: RoomKey,
        /// The message the receipt referenced.
        message_id: MessageId,
    },

    /// An operation named a message that isn't in the conversation.
    #[error("message {message_id} not found in {room}")]
    UnknownMessage {
        /// The conversation that was searched.
        room: RoomKey,
        /// The missing message.
        message_id: MessageId,
    },

    /// An event for one room was routed to another room's conversation.
    #[error("event for {event_room} routed to {room}")]
    RoomMismatch {
        /// The conversation that received the event.
        room: RoomKey,
        /// The room named by the event.
        event_room: RoomKey,
    },
}
