//! Matching server-confirmed messages against the local store.
//!
//! Every confirmed message must end up as exactly one [`Message`] in the
//! room, whether it was sent from here (and is still sitting there as an
//! optimistic copy) or arrives from a peer. The checks run in a fixed
//! priority order:
//!
//! ```text
//!   1. exact id      already known          → merge receipts, stop
//!   2. nonce         echo of our local id   → replace optimistic copy
//!   3. heuristic     sender + text + Δt     → replace optimistic copy
//!   4. new           nothing matched        → insert (never drop)
//!   5. normalize     re-sort, resolve reply previews
//! ```
//!
//! Step 3 only runs when the incoming message carries no nonce at all.
//! A nonce that matches nothing belongs to another device or to a copy
//! that is already gone, and guessing on top of it would only add
//! misattributions.

use chatsync_protocol::MessageId;

use crate::message::Message;
use crate::{Conversation, ConversationError, DeliveryState, IncomingMessage};

/// Which step of the matching order claimed the incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Already present under its server id; receipts merged.
    Duplicate,
    /// Replaced the optimistic copy named by the echoed nonce.
    Nonce,
    /// Replaced the only optimistic copy with the same sender and text.
    Heuristic,
    /// Several optimistic copies qualified; the earliest one was replaced.
    HeuristicAmbiguous,
    /// Inserted as a new message authored by the local user.
    NewOwn,
    /// Inserted as a new message from a peer.
    NewPeer,
}

impl MatchKind {
    /// `true` if an optimistic message was replaced.
    pub fn replaced_optimistic(self) -> bool {
        matches!(self, Self::Nonce | Self::Heuristic | Self::HeuristicAmbiguous)
    }

    /// `true` if the conversation grew by one message.
    pub fn inserted(self) -> bool {
        matches!(self, Self::NewOwn | Self::NewPeer)
    }
}

/// What [`Conversation::reconcile`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Server id of the reconciled message.
    pub id: MessageId,
    /// Which step matched.
    pub kind: MatchKind,
    /// Local id of the optimistic copy that was replaced, if any.
    pub replaced: Option<MessageId>,
    /// `false` only for a duplicate that brought nothing new.
    pub changed: bool,
}

impl Conversation {
    /// Folds one confirmed message into the conversation.
    ///
    /// Fails only when the message belongs to a different room.
    pub fn reconcile(
        &mut self,
        incoming: IncomingMessage,
    ) -> Result<ReconcileOutcome, ConversationError> {
        if incoming.room_key != self.room {
            return Err(ConversationError::RoomMismatch {
                room: self.room.clone(),
                event_room: incoming.room_key,
            });
        }

        // 1. exact id
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == incoming.id) {
            let changed = existing.merge_payload_receipts(&incoming);
            tracing::debug!(room = %self.room, id = %incoming.id, changed, "duplicate message");
            return Ok(ReconcileOutcome {
                id: incoming.id,
                kind: MatchKind::Duplicate,
                replaced: None,
                changed,
            });
        }

        // 2. nonce / 3. heuristic
        let matched = match incoming.client_nonce.as_deref() {
            Some(nonce) => self
                .messages
                .iter()
                .position(|m| m.is_optimistic && m.id.as_str() == nonce)
                .map(|idx| (idx, MatchKind::Nonce)),
            None if self.config.heuristic_matching => self.heuristic_candidate(&incoming),
            None => None,
        };

        let outcome = match matched {
            Some((idx, kind)) => {
                let replaced = self.replace_optimistic(idx, &incoming);
                tracing::debug!(
                    room = %self.room,
                    local_id = %replaced,
                    id = %incoming.id,
                    ?kind,
                    "optimistic message confirmed"
                );
                ReconcileOutcome {
                    id: incoming.id,
                    kind,
                    replaced: Some(replaced),
                    changed: true,
                }
            }
            // 4. new
            None => {
                let kind = if incoming.sender_id == self.local_user {
                    MatchKind::NewOwn
                } else {
                    MatchKind::NewPeer
                };
                let seq = self.take_seq();
                let mut message = Message::confirmed(&incoming, seq);
                message.merge_payload_receipts(&incoming);
                self.messages.push(message);
                tracing::debug!(room = %self.room, id = %incoming.id, ?kind, "message inserted");
                ReconcileOutcome {
                    id: incoming.id,
                    kind,
                    replaced: None,
                    changed: true,
                }
            }
        };

        // 5. normalize
        self.normalize();
        Ok(outcome)
    }

    /// Finds the optimistic copy a nonce-less confirmation most likely
    /// belongs to.
    fn heuristic_candidate(&self, incoming: &IncomingMessage) -> Option<(usize, MatchKind)> {
        let window = self.config.window_millis();
        let text = incoming.text.trim();

        let mut candidates: Vec<(usize, u64)> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.is_optimistic
                    && m.sender == incoming.sender_id
                    && m.text.trim() == text
                    && m.created_at.abs_diff(incoming.created_at) < window
            })
            .map(|(idx, m)| (idx, m.seq))
            .collect();

        candidates.sort_by_key(|&(_, seq)| seq);
        let &(idx, _) = candidates.first()?;
        if candidates.len() > 1 {
            tracing::debug!(
                room = %self.room,
                id = %incoming.id,
                candidates = candidates.len(),
                "ambiguous heuristic match, taking the earliest"
            );
            Some((idx, MatchKind::HeuristicAmbiguous))
        } else {
            Some((idx, MatchKind::Heuristic))
        }
    }

    /// Turns the optimistic message at `idx` into the confirmed one.
    /// Keeps its position, insertion sequence, and reply preview.
    /// Returns the replaced local id.
    fn replace_optimistic(&mut self, idx: usize, incoming: &IncomingMessage) -> MessageId {
        let message = &mut self.messages[idx];
        let local_id = std::mem::replace(&mut message.id, incoming.id.clone());

        message.text = incoming.text.clone();
        message.created_at = incoming.created_at;
        if incoming.reply_to_id.is_some() && incoming.reply_to_id != message.reply_to {
            message.reply_to = incoming.reply_to_id.clone();
            message.reply_preview = None;
        }
        message.is_optimistic = false;
        message.failed = false;
        message.delivery_state = message.delivery_state.max(DeliveryState::Sent);
        message.merge_payload_receipts(incoming);

        local_id
    }
}
