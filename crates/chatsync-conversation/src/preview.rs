//! The UI-facing "last message" summary for a room.

use chatsync_protocol::{MessageId, PeerId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::Message;
use crate::message::snippet;

/// Summary of the newest message in a room, for room lists.
///
/// Recomputed from the conversation tail whenever messages are removed;
/// an emptied room falls back to [`LastMessagePreview::Empty`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LastMessagePreview {
    /// The room has no messages.
    #[default]
    Empty,
    /// The newest message.
    Message {
        /// Id of the newest message.
        id: MessageId,
        /// Its author.
        sender: PeerId,
        /// Start of its text.
        snippet: String,
        /// Its timestamp.
        created_at: Timestamp,
    },
}

impl LastMessagePreview {
    pub(crate) fn of(tail: Option<&Message>, snippet_len: usize) -> Self {
        match tail {
            None => Self::Empty,
            Some(m) => Self::Message {
                id: m.id.clone(),
                sender: m.sender.clone(),
                snippet: snippet(&m.text, snippet_len),
                created_at: m.created_at,
            },
        }
    }

    /// `true` for the empty-room sentinel.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_default_is_empty() {
        assert!(LastMessagePreview::default().is_empty());
    }

    #[test]
    fn test_preview_serializes_with_kind_tag() {
        let preview = LastMessagePreview::Message {
            id: MessageId::from("m1"),
            sender: PeerId::from("bob"),
            snippet: "hi".into(),
            created_at: 7,
        };
        let json = serde_json::to_value(&preview).unwrap();
        assert_eq!(json["kind"], "message");
        assert_eq!(json["createdAt"], 7);

        let json = serde_json::to_value(LastMessagePreview::Empty).unwrap();
        assert_eq!(json["kind"], "empty");
    }
}
