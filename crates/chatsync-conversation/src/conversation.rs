//! The per-room conversation store.
//!
//! A [`Conversation`] owns the ordered messages of one room together with
//! the bookkeeping the client needs around them: the insertion counter
//! used for tie-breaking, and the sets of messages for which delivery and
//! read receipts were already emitted.
//!
//! It is plain data. There is no locking and no I/O here: the client's
//! engine task is the only mutator, so every method runs to completion
//! before the next event is looked at. Reconciliation and receipts live
//! in their own modules as further `impl Conversation` blocks.

use std::collections::HashSet;

use chatsync_protocol::{MessageId, MessagePayload, PeerId, RoomKey, Timestamp};

use crate::message::snippet;
use crate::{ConversationError, LastMessagePreview, Message, ReplyPreview, SyncConfig};

/// A confirmed message as delivered by the server or the history store.
///
/// Same shape as the wire payload, including the receipt arrays.
pub type IncomingMessage = MessagePayload;

/// Result of [`Conversation::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOutcome {
    /// Ids that were present and got removed, in conversation order.
    pub removed: Vec<MessageId>,
    /// Whether the last-message preview changed as a result.
    pub preview_changed: bool,
}

/// One room's messages, kept sorted by `(created_at, insertion order)`.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub(crate) room: RoomKey,
    pub(crate) local_user: PeerId,
    pub(crate) config: SyncConfig,
    pub(crate) messages: Vec<Message>,
    next_seq: u64,
    /// Peer messages already read-receipted during this viewing session.
    read_emitted: HashSet<MessageId>,
    /// Peer messages already delivery-receipted, ever.
    delivered_emitted: HashSet<MessageId>,
}

impl Conversation {
    /// Creates an empty conversation for `room` as seen by `local_user`.
    pub fn new(room: RoomKey, local_user: PeerId, config: SyncConfig) -> Self {
        Self {
            room,
            local_user,
            config: config.validated(),
            messages: Vec::new(),
            next_seq: 0,
            read_emitted: HashSet::new(),
            delivered_emitted: HashSet::new(),
        }
    }

    /// The room this conversation belongs to.
    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    /// The identity messages are sent as.
    pub fn local_user(&self) -> &PeerId {
        &self.local_user
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages held, optimistic ones included.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// `true` if the room holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Looks up a message by its current id (local or server).
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Index of a message in display order.
    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Summary of the newest message, or the empty sentinel.
    pub fn last_preview(&self) -> LastMessagePreview {
        LastMessagePreview::of(self.messages.last(), self.config.snippet_len)
    }

    // -----------------------------------------------------------------
    // Local sends
    // -----------------------------------------------------------------

    /// Inserts an optimistic message authored by the local user.
    ///
    /// `local_id` is also recorded as the client nonce so the server's
    /// echo can find this message again.
    pub fn insert_optimistic(
        &mut self,
        local_id: MessageId,
        text: impl Into<String>,
        created_at: Timestamp,
        reply_to: Option<MessageId>,
    ) -> &Message {
        let seq = self.take_seq();
        let message = Message::optimistic(
            self.room.clone(),
            local_id.clone(),
            self.local_user.clone(),
            text.into(),
            created_at,
            reply_to,
            seq,
        );
        self.messages.push(message);
        self.normalize();

        tracing::debug!(room = %self.room, id = %local_id, "optimistic message inserted");
        let pos = self
            .position(&local_id)
            .unwrap_or(self.messages.len() - 1);
        &self.messages[pos]
    }

    /// Moves an optimistic message into the failed substate.
    ///
    /// Returns `Ok(false)` when the message was already confirmed by the
    /// time the failure was noticed; a confirmed message never fails.
    pub fn mark_failed(&mut self, id: &MessageId) -> Result<bool, ConversationError> {
        let message = self.get_mut(id)?;
        if !message.is_optimistic || message.failed {
            return Ok(false);
        }
        message.failed = true;
        tracing::info!(room = %self.room, %id, "message marked failed");
        Ok(true)
    }

    /// Clears the failed flag before a retry. Returns `Ok(false)` if the
    /// message is not a failed optimistic message.
    pub fn mark_retrying(&mut self, id: &MessageId) -> Result<bool, ConversationError> {
        let message = self.get_mut(id)?;
        if !(message.is_optimistic && message.failed) {
            return Ok(false);
        }
        message.failed = false;
        Ok(true)
    }

    // -----------------------------------------------------------------
    // History and removal
    // -----------------------------------------------------------------

    /// Seeds the conversation from fetched history.
    ///
    /// Every record is reconciled like a live push, so history that
    /// overlaps messages already received (or still optimistic) never
    /// produces duplicates.
    pub fn seed_history(
        &mut self,
        history: Vec<IncomingMessage>,
    ) -> Vec<crate::ReconcileOutcome> {
        let mut outcomes = Vec::with_capacity(history.len());
        for record in history {
            match self.reconcile(record) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::warn!(room = %self.room, error = %e, "skipping history record"),
            }
        }
        tracing::debug!(room = %self.room, count = outcomes.len(), "history seeded");
        outcomes
    }

    /// Removes the given messages. Ids that aren't present are ignored,
    /// which keeps deletion idempotent.
    pub fn remove(&mut self, ids: &[MessageId]) -> RemovalOutcome {
        let before = self.last_preview();
        let wanted: HashSet<&MessageId> = ids.iter().collect();

        let mut removed = Vec::new();
        self.messages.retain(|m| {
            if wanted.contains(&m.id) {
                removed.push(m.id.clone());
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.read_emitted.remove(id);
            self.delivered_emitted.remove(id);
        }

        let preview_changed = self.last_preview() != before;
        RemovalOutcome {
            removed,
            preview_changed,
        }
    }

    // -----------------------------------------------------------------
    // Receipt emission tracking
    // -----------------------------------------------------------------

    /// Returns the visible peer messages that still need a read receipt
    /// from the local user, and records them as receipted for the current
    /// viewing session.
    ///
    /// Calling this again with the same ids returns nothing until
    /// [`reset_viewing_session`](Self::reset_viewing_session).
    pub fn take_unread_for_receipt(&mut self, visible: &[MessageId]) -> Vec<MessageId> {
        let mut out = Vec::new();
        for id in visible {
            let Some(message) = self.messages.iter().find(|m| &m.id == id) else {
                continue;
            };
            if message.is_optimistic
                || message.sender == self.local_user
                || message.is_read_by(&self.local_user)
            {
                continue;
            }
            if self.read_emitted.insert(id.clone()) {
                out.push(id.clone());
            }
        }
        out
    }

    /// Returns confirmed peer messages that haven't been acknowledged as
    /// delivered to the local user yet, and records them.
    pub fn take_undelivered_for_receipt(&mut self) -> Vec<MessageId> {
        let mut out = Vec::new();
        for message in &self.messages {
            if message.is_optimistic
                || message.sender == self.local_user
                || message.is_delivered_to(&self.local_user)
            {
                continue;
            }
            if self.delivered_emitted.insert(message.id.clone()) {
                out.push(message.id.clone());
            }
        }
        out
    }

    /// Un-records a delivery ack that never reached the server, so the
    /// next [`take_undelivered_for_receipt`](Self::take_undelivered_for_receipt)
    /// returns it again.
    pub fn forget_delivered_ack(&mut self, id: &MessageId) -> bool {
        self.delivered_emitted.remove(id)
    }

    /// Un-records a read receipt that never reached the server.
    pub fn forget_read_receipt(&mut self, id: &MessageId) -> bool {
        self.read_emitted.remove(id)
    }

    /// Starts a new viewing session: read receipts may be emitted again.
    pub fn reset_viewing_session(&mut self) {
        self.read_emitted.clear();
    }

    // -----------------------------------------------------------------
    // Internals shared with reconcile / receipts
    // -----------------------------------------------------------------

    pub(crate) fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn get_mut(&mut self, id: &MessageId) -> Result<&mut Message, ConversationError> {
        let room = &self.room;
        self.messages
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| ConversationError::UnknownMessage {
                room: room.clone(),
                message_id: id.clone(),
            })
    }

    /// Restores display order and fills in reply previews that can now
    /// be resolved. Runs after every insertion or replacement.
    pub(crate) fn normalize(&mut self) {
        self.messages.sort_by_key(|m| (m.created_at, m.seq));
        self.resolve_reply_previews();
    }

    fn resolve_reply_previews(&mut self) {
        let snippet_len = self.config.snippet_len;
        let pending: Vec<(usize, MessageId)> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.reply_preview.is_none())
            .filter_map(|(i, m)| m.reply_to.clone().map(|target| (i, target)))
            .collect();

        for (idx, target) in pending {
            let preview = self
                .messages
                .iter()
                .find(|m| m.id == target)
                .map(|m| ReplyPreview {
                    sender: m.sender.clone(),
                    snippet: snippet(&m.text, snippet_len),
                });
            if let Some(preview) = preview {
                self.messages[idx].reply_preview = Some(preview);
            }
        }
    }
}
