//! The message entity and its delivery lifecycle.

use std::fmt;

use chatsync_protocol::{MessageId, MessagePayload, PeerId, RoomKey, Timestamp};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DeliveryState
// ---------------------------------------------------------------------------

/// Where a message is in its lifecycle.
///
/// The variants are declared in lifecycle order, so the derived `Ord`
/// gives `Sending < Sent < Delivered < Read`. Every update goes through
/// `max`, which is what makes the state monotonic:
///
/// ```text
/// Sending ──confirm──→ Sent ──delivered──→ Delivered ──read──→ Read
///                        └───────────────read──────────────────↗
/// ```
///
/// "Failed" is deliberately not a variant. A failed send is a terminal
/// substate of an optimistic message ([`Message::failed`]), not a step on
/// this ladder.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryState {
    /// Optimistic, not yet confirmed by the server.
    Sending,
    /// Persisted by the server.
    Sent,
    /// Received by at least one other participant.
    Delivered,
    /// Read by at least one other participant.
    Read,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Receipts and reply previews
// ---------------------------------------------------------------------------

/// One peer's delivery or read record. Never removed once added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Who.
    pub peer: PeerId,
    /// When.
    pub at: Timestamp,
}

/// Denormalized view of the message being replied to.
///
/// Copied at resolution time so the reply still renders if the original
/// is later deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    /// Author of the original message.
    pub sender: PeerId,
    /// Start of the original text.
    pub snippet: String,
}

/// Result of applying one receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptOutcome {
    /// `true` if the receipt sets or the state changed.
    pub changed: bool,
    /// The state after applying the receipt.
    pub state: DeliveryState,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message as held in a [`Conversation`](crate::Conversation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Local id while optimistic, server id afterwards.
    pub id: MessageId,
    /// The conversation this message belongs to.
    pub room: RoomKey,
    /// Author.
    pub sender: PeerId,
    /// Body.
    pub text: String,
    /// Client-observed time while optimistic, server time afterwards.
    pub created_at: Timestamp,
    /// Id of the message this replies to. Never a pointer: resolved by
    /// lookup, and allowed to dangle.
    pub reply_to: Option<MessageId>,
    /// Resolved preview of `reply_to`, if it could be resolved.
    pub reply_preview: Option<ReplyPreview>,
    /// Monotonic lifecycle state.
    pub delivery_state: DeliveryState,
    /// Append-only delivery records.
    pub delivered_by: Vec<Receipt>,
    /// Append-only read records.
    pub read_by: Vec<Receipt>,
    /// `true` from creation until a server confirmation replaces it.
    pub is_optimistic: bool,
    /// The send failed before reaching the server. Only ever set on
    /// optimistic messages.
    pub failed: bool,
    /// The nonce sent with this message, for messages sent by this client.
    pub client_nonce: Option<String>,
    /// Insertion order, the tie-breaker for equal `created_at`.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Message {
    /// Builds an optimistic message. `local_id` doubles as the nonce.
    pub(crate) fn optimistic(
        room: RoomKey,
        local_id: MessageId,
        sender: PeerId,
        text: String,
        created_at: Timestamp,
        reply_to: Option<MessageId>,
        seq: u64,
    ) -> Self {
        Self {
            client_nonce: Some(local_id.0.clone()),
            id: local_id,
            room,
            sender,
            text,
            created_at,
            reply_to,
            reply_preview: None,
            delivery_state: DeliveryState::Sending,
            delivered_by: Vec::new(),
            read_by: Vec::new(),
            is_optimistic: true,
            failed: false,
            seq,
        }
    }

    /// Builds a confirmed message from a server payload. Receipts in the
    /// payload are merged by the caller.
    pub(crate) fn confirmed(payload: &MessagePayload, seq: u64) -> Self {
        Self {
            id: payload.id.clone(),
            room: payload.room_key.clone(),
            sender: payload.sender_id.clone(),
            text: payload.text.clone(),
            created_at: payload.created_at,
            reply_to: payload.reply_to_id.clone(),
            reply_preview: None,
            delivery_state: DeliveryState::Sent,
            delivered_by: Vec::new(),
            read_by: Vec::new(),
            is_optimistic: false,
            failed: false,
            client_nonce: payload.client_nonce.clone(),
            seq,
        }
    }

    /// Insertion sequence number within the conversation.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// `true` if the reply reference resolved and should render as a
    /// reply. Dangling references render as plain messages.
    pub fn renders_as_reply(&self) -> bool {
        self.reply_preview.is_some()
    }

    /// `true` if `peer` has a delivery record.
    pub fn is_delivered_to(&self, peer: &PeerId) -> bool {
        self.delivered_by.iter().any(|r| &r.peer == peer)
    }

    /// `true` if `peer` has a read record.
    pub fn is_read_by(&self, peer: &PeerId) -> bool {
        self.read_by.iter().any(|r| &r.peer == peer)
    }

    /// Whether a receipt from `peer` may advance `delivery_state`.
    ///
    /// The sender's own receipts never count. In a direct room only the
    /// counterpart counts; in a channel any other participant does.
    fn counts_toward_state(&self, peer: &PeerId) -> bool {
        if peer == &self.sender {
            return false;
        }
        match self.room.participants() {
            Some((a, b)) => peer == a || peer == b,
            None => true,
        }
    }

    /// Records a delivery by `peer`. Idempotent.
    pub(crate) fn record_delivered(
        &mut self,
        peer: &PeerId,
        at: Timestamp,
    ) -> ReceiptOutcome {
        let before = self.delivery_state;
        let mut changed = false;

        if !self.is_delivered_to(peer) {
            self.delivered_by.push(Receipt {
                peer: peer.clone(),
                at,
            });
            changed = true;
        }
        if self.counts_toward_state(peer) {
            self.delivery_state = self.delivery_state.max(DeliveryState::Delivered);
        }

        ReceiptOutcome {
            changed: changed || self.delivery_state != before,
            state: self.delivery_state,
        }
    }

    /// Records a read by `peer`. Idempotent.
    ///
    /// A read implies a delivery, so a missing delivery record is added
    /// too. This is what makes read-before-delivered arrivals converge to
    /// the same state as the in-order sequence.
    pub(crate) fn record_read(&mut self, peer: &PeerId, at: Timestamp) -> ReceiptOutcome {
        let before = self.delivery_state;
        let mut changed = false;

        if !self.is_read_by(peer) {
            self.read_by.push(Receipt {
                peer: peer.clone(),
                at,
            });
            changed = true;
        }
        if !self.is_delivered_to(peer) {
            self.delivered_by.push(Receipt {
                peer: peer.clone(),
                at,
            });
            changed = true;
        }
        if self.counts_toward_state(peer) {
            self.delivery_state = self.delivery_state.max(DeliveryState::Read);
        }

        ReceiptOutcome {
            changed: changed || self.delivery_state != before,
            state: self.delivery_state,
        }
    }

    /// Merges the receipt arrays carried by a server payload.
    pub(crate) fn merge_payload_receipts(&mut self, payload: &MessagePayload) -> bool {
        let mut changed = false;
        for r in &payload.delivered_to {
            changed |= self.record_delivered(&r.peer_id, r.at).changed;
        }
        for r in &payload.read_by {
            changed |= self.record_read(&r.peer_id, r.at).changed;
        }
        changed
    }
}

/// Cuts `text` to at most `max_chars` characters (not bytes), appending
/// `…` when something was cut.
pub(crate) fn snippet(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}…", &text[..byte_idx]),
        None => text.to_owned(),
    }
}
