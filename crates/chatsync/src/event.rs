//! What the client tells its subscribers.

use chatsync_conversation::{LastMessagePreview, Message};
use chatsync_presence::TypingSummary;
use chatsync_protocol::{MessageId, PeerId, RoomKey};
use chatsync_session::SessionSignal;

/// A change the UI may want to render.
///
/// Delivered over a broadcast channel from
/// [`ChatClient::subscribe`](crate::ChatClient::subscribe). Every message
/// event carries a full snapshot of the message, so a subscriber never has
/// to query back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A message appeared: a local send, or a confirmed message that
    /// matched nothing already shown.
    MessageAdded {
        /// The message's room.
        room: RoomKey,
        /// Snapshot after insertion.
        message: Message,
    },

    /// A shown message changed: confirmed, failed, retried, or its
    /// receipts moved.
    MessageUpdated {
        /// The message's room.
        room: RoomKey,
        /// Snapshot after the change.
        message: Message,
        /// The local id it was shown under, if confirmation just replaced
        /// it with the server id.
        previous_id: Option<MessageId>,
    },

    /// Messages were deleted.
    MessagesRemoved {
        /// The room they were removed from.
        room: RoomKey,
        /// The removed ids.
        ids: Vec<MessageId>,
    },

    /// The room's last-message summary changed.
    PreviewChanged {
        /// The room.
        room: RoomKey,
        /// The new summary, possibly the empty sentinel.
        preview: LastMessagePreview,
    },

    /// A peer went online or offline.
    PresenceChanged {
        /// Who.
        peer: PeerId,
        /// The new status.
        online: bool,
    },

    /// The set of peers typing in a room changed.
    TypingChanged {
        /// The room.
        room: RoomKey,
        /// Who is typing now.
        summary: TypingSummary,
    },

    /// The server refused a `sendMessage`. Not an error: the message may
    /// still have been persisted, so nothing is removed or failed.
    SendRejected {
        /// The room the message was sent to.
        room: RoomKey,
        /// The local id of the rejected message, when the server echoed
        /// its nonce.
        local_id: Option<MessageId>,
        /// The server's reason.
        reason: String,
    },

    /// A room finished opening; its history is loaded.
    RoomOpened {
        /// The room.
        room: RoomKey,
        /// Number of messages now held for it.
        messages: usize,
    },

    /// Connection lifecycle, forwarded from the session.
    Connection(SessionSignal),
}

impl ChatEvent {
    /// The room this event concerns, or `None` for global events.
    pub fn room(&self) -> Option<&RoomKey> {
        match self {
            Self::MessageAdded { room, .. }
            | Self::MessageUpdated { room, .. }
            | Self::MessagesRemoved { room, .. }
            | Self::PreviewChanged { room, .. }
            | Self::TypingChanged { room, .. }
            | Self::SendRejected { room, .. }
            | Self::RoomOpened { room, .. } => Some(room),
            Self::PresenceChanged { .. } | Self::Connection(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_of_global_events_is_none() {
        let online = ChatEvent::PresenceChanged {
            peer: PeerId::from("bob"),
            online: true,
        };
        assert!(online.room().is_none());
        assert!(ChatEvent::Connection(SessionSignal::Connected).room().is_none());
    }

    #[test]
    fn test_room_of_room_events() {
        let room = RoomKey::channel("general");
        let event = ChatEvent::MessagesRemoved {
            room: room.clone(),
            ids: vec![MessageId::from("m1")],
        };
        assert_eq!(event.room(), Some(&room));
    }
}
