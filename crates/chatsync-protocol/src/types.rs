//! Core protocol types for Chatsync's wire format.
//!
//! Everything in this module travels "on the wire": it is serialized by
//! the client, sent over the transport, and deserialized by the chat
//! server (or the other way round). The event names and field names are
//! the contract with the server, so the serde attributes here matter more
//! than the Rust names.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch.
///
/// Both client-observed and server-assigned `createdAt` values use this
/// unit, which keeps the reconciliation window arithmetic trivial.
pub type Timestamp = u64;

/// Returns the current wall-clock time as a [`Timestamp`].
///
/// A clock set before 1970 yields `0` rather than an error; ordering of
/// such messages is then by insertion order alone.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// A user identifier as handed out by the (external) auth service.
///
/// A "newtype wrapper" around `String`: you can't accidentally pass a
/// `MessageId` where a `PeerId` is expected. `#[serde(transparent)]`
/// makes it serialize as the bare string.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Borrows the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A message identifier.
///
/// Either a *server id* (authoritative, assigned by the message store) or
/// a *local id* (client-generated, only valid until reconciliation). The
/// type doesn't distinguish them; the message's `is_optimistic` flag does.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Borrows the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// RoomKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum RoomKind {
    Channel(String),
    /// Always stored with the smaller peer first.
    Direct(PeerId, PeerId),
}

/// Canonical identifier of a conversation.
///
/// Two topologies share one key type:
///
/// - **Channel**: a group/college channel, `channel:<id>` on the wire.
/// - **Direct**: a 1:1 conversation, `dm:<a>:<b>` on the wire, where
///   `a <= b`. The key is order-independent:
///   `RoomKey::direct(a, b) == RoomKey::direct(b, a)`.
///
/// The variants are private so a non-canonical direct key can't be built.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey(RoomKind);

impl RoomKey {
    /// A group channel key.
    pub fn channel(id: impl Into<String>) -> Self {
        Self(RoomKind::Channel(id.into()))
    }

    /// A direct-conversation key for the two participants, in either order.
    pub fn direct(a: PeerId, b: PeerId) -> Self {
        if a <= b {
            Self(RoomKind::Direct(a, b))
        } else {
            Self(RoomKind::Direct(b, a))
        }
    }

    /// `true` for 1:1 conversations.
    pub fn is_direct(&self) -> bool {
        matches!(self.0, RoomKind::Direct(..))
    }

    /// The channel id, for channel keys.
    pub fn channel_id(&self) -> Option<&str> {
        match &self.0 {
            RoomKind::Channel(id) => Some(id),
            RoomKind::Direct(..) => None,
        }
    }

    /// Both participants (canonical order), for direct keys.
    pub fn participants(&self) -> Option<(&PeerId, &PeerId)> {
        match &self.0 {
            RoomKind::Direct(a, b) => Some((a, b)),
            RoomKind::Channel(_) => None,
        }
    }

    /// The participant that isn't `me`, for direct keys that include `me`.
    pub fn counterpart(&self, me: &PeerId) -> Option<&PeerId> {
        let (a, b) = self.participants()?;
        if a == me {
            Some(b)
        } else if b == me {
            Some(a)
        } else {
            None
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            RoomKind::Channel(id) => write!(f, "channel:{id}"),
            RoomKind::Direct(a, b) => write!(f, "dm:{a}:{b}"),
        }
    }
}

impl FromStr for RoomKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidRoomKey(s.to_owned());
        let (prefix, rest) = s.split_once(':').ok_or_else(invalid)?;
        match prefix {
            "channel" if !rest.is_empty() => Ok(Self::channel(rest)),
            "dm" => {
                let (a, b) = rest.split_once(':').ok_or_else(invalid)?;
                if a.is_empty() || b.is_empty() || b.contains(':') {
                    return Err(invalid());
                }
                Ok(Self::direct(PeerId::from(a), PeerId::from(b)))
            }
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for RoomKey {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RoomKey> for String {
    fn from(key: RoomKey) -> Self {
        key.to_string()
    }
}

// ---------------------------------------------------------------------------
// Message payloads
// ---------------------------------------------------------------------------

/// One delivery or read record as carried inside a message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    /// Who received/read the message.
    pub peer_id: PeerId,
    /// When, per the server.
    pub at: Timestamp,
}

/// A persisted, server-confirmed message.
///
/// This is both the payload of the `receiveMessage` push event and the
/// element type of a history fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// The server id.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub room_key: RoomKey,
    /// Author.
    pub sender_id: PeerId,
    /// Message body.
    pub text: String,
    /// Server timestamp.
    pub created_at: Timestamp,
    /// Message this one replies to, if any. Resolved by id lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// The sender's `clientNonce`, when the server echoes it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<String>,
    /// Peers the message has been delivered to.
    #[serde(default)]
    pub delivered_to: Vec<ReceiptRecord>,
    /// Peers that have read the message.
    #[serde(default)]
    pub read_by: Vec<ReceiptRecord>,
}

// ---------------------------------------------------------------------------
// ClientEvent: what this client emits
// ---------------------------------------------------------------------------

/// Events the client sends to the server.
///
/// `#[serde(tag = "type")]` produces internally tagged JSON, e.g.
/// `{ "type": "typing", "roomKey": "channel:cs101", "isTyping": true }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Subscribe to a room's events.
    JoinRoom { room_key: RoomKey },

    /// Unsubscribe from a room's events.
    LeaveRoom { room_key: RoomKey },

    /// Submit a new message. `client_nonce` is the local id of the
    /// optimistic message so the confirmation can be matched back to it.
    SendMessage {
        text: String,
        room_key: RoomKey,
        reply_to_id: Option<MessageId>,
        client_nonce: String,
    },

    /// Local typing indicator on/off.
    Typing { room_key: RoomKey, is_typing: bool },

    /// This client received the message.
    MarkDelivered {
        room_key: RoomKey,
        message_id: MessageId,
    },

    /// This client displayed the message.
    MarkRead {
        room_key: RoomKey,
        message_id: MessageId,
    },
}

// ---------------------------------------------------------------------------
// ServerEvent: what this client listens for
// ---------------------------------------------------------------------------

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// A confirmed message, from this user or a peer.
    ReceiveMessage(MessagePayload),

    /// A peer started or stopped typing in a room.
    UserTyping {
        room_key: RoomKey,
        peer_id: PeerId,
        is_typing: bool,
    },

    /// A peer came online.
    UserOnline { peer_id: PeerId },

    /// A peer went offline.
    UserOffline { peer_id: PeerId },

    /// A peer received a message.
    MessageDelivered {
        room_key: RoomKey,
        message_id: MessageId,
        peer_id: PeerId,
        at: Timestamp,
    },

    /// A peer read a message.
    MessageRead {
        room_key: RoomKey,
        message_id: MessageId,
        peer_id: PeerId,
        at: Timestamp,
    },

    /// The server refused (or claims to have failed) a `sendMessage`.
    ///
    /// This is a signal, not an error: the message may still have been
    /// persisted.
    SendRejected {
        room_key: RoomKey,
        #[serde(default)]
        client_nonce: Option<String>,
        reason: String,
    },

    /// Acknowledges a `joinRoom`.
    RoomJoined { room_key: RoomKey },

    /// A generic server-side error. `code` follows HTTP conventions.
    Error { code: u16, message: String },
}

impl ServerEvent {
    /// The room this event is scoped to, or `None` for global events
    /// (presence, errors).
    pub fn room_key(&self) -> Option<&RoomKey> {
        match self {
            Self::ReceiveMessage(payload) => Some(&payload.room_key),
            Self::UserTyping { room_key, .. }
            | Self::MessageDelivered { room_key, .. }
            | Self::MessageRead { room_key, .. }
            | Self::SendRejected { room_key, .. }
            | Self::RoomJoined { room_key } => Some(room_key),
            Self::UserOnline { .. }
            | Self::UserOffline { .. }
            | Self::Error { .. } => None,
        }
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! The server defines the exact JSON shapes. These tests pin the serde
    //! attributes so a rename here can't silently break the contract.

    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::from(s)
    }

    // =====================================================================
    // RoomKey
    // =====================================================================

    #[test]
    fn test_room_key_direct_is_order_independent() {
        let ab = RoomKey::direct(peer("alice"), peer("bob"));
        let ba = RoomKey::direct(peer("bob"), peer("alice"));
        assert_eq!(ab, ba);
        assert_eq!(ab.to_string(), "dm:alice:bob");
    }

    #[test]
    fn test_room_key_parse_canonicalizes_direct() {
        let key: RoomKey = "dm:zed:amy".parse().unwrap();
        assert_eq!(key.to_string(), "dm:amy:zed");
        assert!(key.is_direct());
    }

    #[test]
    fn test_room_key_channel_display_and_accessors() {
        let key = RoomKey::channel("cs101");
        assert_eq!(key.to_string(), "channel:cs101");
        assert_eq!(key.channel_id(), Some("cs101"));
        assert!(key.participants().is_none());
    }

    #[test]
    fn test_room_key_counterpart() {
        let key = RoomKey::direct(peer("alice"), peer("bob"));
        assert_eq!(key.counterpart(&peer("alice")), Some(&peer("bob")));
        assert_eq!(key.counterpart(&peer("bob")), Some(&peer("alice")));
        assert_eq!(key.counterpart(&peer("carol")), None);
        assert_eq!(RoomKey::channel("x").counterpart(&peer("alice")), None);
    }

    #[test]
    fn test_room_key_parse_rejects_malformed() {
        for bad in ["", "channel:", "dm:alice", "dm::bob", "dm:a:b:c", "room:1"] {
            assert!(
                bad.parse::<RoomKey>().is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_room_key_deserialize_rejects_malformed() {
        let result: Result<RoomKey, _> = serde_json::from_str(r#""nope""#);
        assert!(result.is_err());
    }

    // =====================================================================
    // ClientEvent
    // =====================================================================

    #[test]
    fn test_client_event_send_message_json_format() {
        let event = ClientEvent::SendMessage {
            text: "hi".into(),
            room_key: RoomKey::channel("cs101"),
            reply_to_id: None,
            client_nonce: "local-1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "sendMessage");
        assert_eq!(json["text"], "hi");
        assert_eq!(json["roomKey"], "channel:cs101");
        assert!(json["replyToId"].is_null());
        assert_eq!(json["clientNonce"], "local-1");
    }

    #[test]
    fn test_client_event_typing_json_format() {
        let event = ClientEvent::Typing {
            room_key: RoomKey::direct(peer("a"), peer("b")),
            is_typing: true,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "typing");
        assert_eq!(json["roomKey"], "dm:a:b");
        assert_eq!(json["isTyping"], true);
    }

    #[test]
    fn test_client_event_mark_read_json_format() {
        let event = ClientEvent::MarkRead {
            room_key: RoomKey::channel("c"),
            message_id: MessageId::from("m1"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "markRead");
        assert_eq!(json["messageId"], "m1");
    }

    // =====================================================================
    // ServerEvent
    // =====================================================================

    #[test]
    fn test_server_event_receive_message_minimal_fields() {
        // Receipts, nonce and reply are optional on the wire.
        let json = r#"{
            "type": "receiveMessage",
            "id": "srv-1",
            "roomKey": "channel:cs101",
            "senderId": "alice",
            "text": "hello",
            "createdAt": 1700000000000
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        let ServerEvent::ReceiveMessage(payload) = event else {
            panic!("expected receiveMessage");
        };
        assert_eq!(payload.id, MessageId::from("srv-1"));
        assert_eq!(payload.sender_id, peer("alice"));
        assert_eq!(payload.created_at, 1_700_000_000_000);
        assert!(payload.client_nonce.is_none());
        assert!(payload.delivered_to.is_empty());
        assert!(payload.read_by.is_empty());
    }

    #[test]
    fn test_server_event_receive_message_with_receipts() {
        let json = r#"{
            "type": "receiveMessage",
            "id": "srv-2",
            "roomKey": "dm:alice:bob",
            "senderId": "alice",
            "text": "yo",
            "createdAt": 5,
            "replyToId": "srv-1",
            "clientNonce": "local-abc",
            "deliveredTo": [{"peerId": "bob", "at": 6}],
            "readBy": [{"peerId": "bob", "at": 7}]
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        let ServerEvent::ReceiveMessage(payload) = event else {
            panic!("expected receiveMessage");
        };
        assert_eq!(payload.reply_to_id, Some(MessageId::from("srv-1")));
        assert_eq!(payload.client_nonce.as_deref(), Some("local-abc"));
        assert_eq!(payload.read_by[0].peer_id, peer("bob"));
        assert_eq!(payload.read_by[0].at, 7);
    }

    #[test]
    fn test_server_event_user_typing_json_format() {
        let json = r#"{"type":"userTyping","roomKey":"channel:x","peerId":"bob","isTyping":false}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            ServerEvent::UserTyping {
                room_key: RoomKey::channel("x"),
                peer_id: peer("bob"),
                is_typing: false,
            }
        );
    }

    #[test]
    fn test_server_event_send_rejected_without_nonce() {
        let json = r#"{"type":"sendRejected","roomKey":"channel:x","reason":"blocked"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(
            event,
            ServerEvent::SendRejected { client_nonce: None, .. }
        ));
    }

    #[test]
    fn test_server_event_room_key_routing() {
        let scoped = ServerEvent::MessageRead {
            room_key: RoomKey::channel("x"),
            message_id: MessageId::from("m"),
            peer_id: peer("bob"),
            at: 1,
        };
        assert_eq!(scoped.room_key(), Some(&RoomKey::channel("x")));

        let global = ServerEvent::UserOffline { peer_id: peer("bob") };
        assert_eq!(global.room_key(), None);
    }

    #[test]
    fn test_decode_unknown_event_type_returns_error() {
        let unknown = r#"{"type": "flyToMoon", "speed": 9000}"#;
        let result: Result<ServerEvent, _> = serde_json::from_str(unknown);
        assert!(result.is_err());
    }

    #[test]
    fn test_now_millis_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
