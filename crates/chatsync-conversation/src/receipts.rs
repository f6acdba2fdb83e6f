//! Delivery and read receipts.
//!
//! Receipts only ever add information: records are appended, never
//! removed, and the state moves through `max`. Applying the same receipt
//! twice, or a read before the matching delivery, converges to the same
//! result as the in-order sequence.

use chatsync_protocol::{MessageId, PeerId, Timestamp};

use crate::{Conversation, ConversationError, Message, ReceiptOutcome};

impl Conversation {
    /// Records that `peer` received message `id`.
    pub fn apply_delivered(
        &mut self,
        id: &MessageId,
        peer: &PeerId,
        at: Timestamp,
    ) -> Result<ReceiptOutcome, ConversationError> {
        let outcome = self.confirmed_mut(id)?.record_delivered(peer, at);
        tracing::debug!(room = %self.room, %id, %peer, state = %outcome.state, "delivery applied");
        Ok(outcome)
    }

    /// Records that `peer` read message `id`. Implies delivery.
    pub fn apply_read(
        &mut self,
        id: &MessageId,
        peer: &PeerId,
        at: Timestamp,
    ) -> Result<ReceiptOutcome, ConversationError> {
        let outcome = self.confirmed_mut(id)?.record_read(peer, at);
        tracing::debug!(room = %self.room, %id, %peer, state = %outcome.state, "read applied");
        Ok(outcome)
    }

    /// Receipts reference server ids, so an optimistic copy can't be the
    /// target; the confirmation will carry the receipt arrays instead.
    fn confirmed_mut(&mut self, id: &MessageId) -> Result<&mut Message, ConversationError> {
        let room = &self.room;
        self.messages
            .iter_mut()
            .find(|m| &m.id == id && !m.is_optimistic)
            .ok_or_else(|| ConversationError::StaleReceipt {
                room: room.clone(),
                message_id: id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use chatsync_protocol::{MessagePayload, RoomKey};

    use super::*;
    use crate::{DeliveryState, SyncConfig};

    fn conversation_with_sent(room: RoomKey) -> Conversation {
        let mut conv = Conversation::new(room.clone(), PeerId::from("me"), SyncConfig::default());
        conv.reconcile(MessagePayload {
            id: MessageId::from("s1"),
            room_key: room,
            sender_id: PeerId::from("me"),
            text: "hello".into(),
            created_at: 1,
            reply_to_id: None,
            client_nonce: None,
            delivered_to: Vec::new(),
            read_by: Vec::new(),
        })
        .unwrap();
        conv
    }

    fn s1() -> MessageId {
        MessageId::from("s1")
    }

    #[test]
    fn test_apply_read_twice_is_idempotent() {
        let mut conv = conversation_with_sent(RoomKey::channel("c"));
        let bob = PeerId::from("bob");

        let first = conv.apply_read(&s1(), &bob, 5).unwrap();
        let snapshot = conv.get(&s1()).unwrap().clone();
        let second = conv.apply_read(&s1(), &bob, 6).unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(conv.get(&s1()).unwrap(), &snapshot);
        assert_eq!(snapshot.read_by.len(), 1);
        assert_eq!(snapshot.read_by[0].at, 5, "first record wins");
    }

    #[test]
    fn test_apply_receipt_for_unknown_message_is_stale() {
        let mut conv = conversation_with_sent(RoomKey::channel("c"));
        let err = conv
            .apply_delivered(&MessageId::from("ghost"), &PeerId::from("bob"), 1)
            .unwrap_err();
        assert!(matches!(err, ConversationError::StaleReceipt { .. }));
    }

    #[test]
    fn test_apply_receipt_for_optimistic_message_is_stale() {
        let mut conv = conversation_with_sent(RoomKey::channel("c"));
        conv.insert_optimistic(MessageId::from("local-1"), "hey", 2, None);
        let err = conv
            .apply_read(&MessageId::from("local-1"), &PeerId::from("bob"), 3)
            .unwrap_err();
        assert!(matches!(err, ConversationError::StaleReceipt { .. }));
    }

    #[test]
    fn test_group_room_delivered_by_any_other_participant() {
        let mut conv = conversation_with_sent(RoomKey::channel("c"));
        let outcome = conv.apply_delivered(&s1(), &PeerId::from("carol"), 2).unwrap();
        assert_eq!(outcome.state, DeliveryState::Delivered);
    }

    #[test]
    fn test_direct_room_reflects_counterpart() {
        let room = RoomKey::direct(PeerId::from("me"), PeerId::from("bob"));
        let mut conv = conversation_with_sent(room);

        let own = conv.apply_read(&s1(), &PeerId::from("me"), 2).unwrap();
        assert_eq!(own.state, DeliveryState::Sent);

        let bob = conv.apply_delivered(&s1(), &PeerId::from("bob"), 3).unwrap();
        assert_eq!(bob.state, DeliveryState::Delivered);
    }
}
