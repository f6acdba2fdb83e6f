//! The client's engine: one Tokio task that owns all chat state.
//!
//! Every conversation and the presence coordinator live inside this task,
//! and only this task mutates them. Everything else talks to it by
//! message passing:
//!
//! ```text
//!   ChatClient ──Command──→ ┐
//!   session    ──ServerEvent→ ├─→ Engine ──ChatEvent──→ subscribers
//!   session    ──Signal────→ │        └──Outbound──→ emitter task → session
//!   timers     ──deadline──→ ┘
//! ```
//!
//! Anything that waits on the network or the store (connecting, history
//! fetches, deletions) runs in a spawned task that reports back with
//! another [`Command`], so the loop never blocks and events keep being
//! applied in arrival order. Sends go through the emitter queue with the
//! typing and receipt intents, so the server sees them in the order the
//! engine produced them.

use std::collections::HashMap;
use std::sync::Arc;

use chatsync_conversation::{
    Conversation, IncomingMessage, LastMessagePreview, Message, ReconcileOutcome, RemovalOutcome,
};
use chatsync_presence::{
    PresenceChange, PresenceCoordinator, TypingSignal, TypingSummary, sleep_until_deadline,
};
use chatsync_protocol::{
    ClientEvent, JsonCodec, MessageId, PeerId, RoomKey, ServerEvent, now_millis,
};
use chatsync_session::{SessionError, SessionSignal, TransportSession};
use chatsync_transport::Connector;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::{ChatEvent, ChatsyncError, ClientConfig, MessageStore, SendError, StoreError};

/// Requests handled by the engine task.
///
/// Public-facing variants come from [`ChatClient`](crate::ChatClient);
/// the `*Loaded` / `*Done` / `SendFailed` / `ReceiptDropped` variants are
/// sent back by the engine's own helper tasks.
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    OpenRoom {
        room: RoomKey,
        reply: oneshot::Sender<Result<Vec<Message>, ChatsyncError>>,
    },
    HistoryLoaded {
        room: RoomKey,
        history: Result<Vec<IncomingMessage>, StoreError>,
        reply: oneshot::Sender<Result<Vec<Message>, ChatsyncError>>,
    },
    CloseRoom {
        room: RoomKey,
    },
    Send {
        room: RoomKey,
        text: String,
        reply_to: Option<MessageId>,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    },
    Retry {
        room: RoomKey,
        local_id: MessageId,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    },
    SendFailed {
        room: RoomKey,
        local_id: MessageId,
        source: SessionError,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    },
    ReceiptDropped {
        room: RoomKey,
        message_id: MessageId,
        read: bool,
    },
    InputChanged {
        room: RoomKey,
        text: String,
    },
    MarkVisible {
        room: RoomKey,
        ids: Vec<MessageId>,
    },
    Delete {
        room: RoomKey,
        ids: Vec<MessageId>,
        reply: oneshot::Sender<Result<Vec<MessageId>, ChatsyncError>>,
    },
    ClearHistory {
        room: RoomKey,
        reply: oneshot::Sender<Result<Vec<MessageId>, ChatsyncError>>,
    },
    DeleteDone {
        room: RoomKey,
        ids: Vec<MessageId>,
        result: Result<(), StoreError>,
        reply: oneshot::Sender<Result<Vec<MessageId>, ChatsyncError>>,
    },
    Messages {
        room: RoomKey,
        reply: oneshot::Sender<Vec<Message>>,
    },
    LastPreview {
        room: RoomKey,
        reply: oneshot::Sender<LastMessagePreview>,
    },
    TypingSummary {
        room: RoomKey,
        reply: oneshot::Sender<TypingSummary>,
    },
    IsOnline {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Fire-and-forget work for the emitter task, kept in one queue so the
/// server sees it in the order the engine produced it.
enum Outbound {
    Emit(ClientEvent),
    Leave(RoomKey),
    /// Connects and joins if needed, then emits the message.
    Deliver {
        room: RoomKey,
        local_id: MessageId,
        event: ClientEvent,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    },
}

/// The engine actor state. Runs inside a Tokio task.
pub(crate) struct Engine<T: Connector, S: MessageStore> {
    identity: PeerId,
    config: ClientConfig,
    session: TransportSession<T, JsonCodec>,
    store: Arc<S>,
    conversations: HashMap<RoomKey, Conversation>,
    presence: PresenceCoordinator,
    commands: mpsc::Receiver<Command>,
    /// Weak so that dropping every `ChatClient` still ends the loop.
    command_tx: mpsc::WeakSender<Command>,
    inbound: mpsc::Receiver<ServerEvent>,
    signals: broadcast::Receiver<SessionSignal>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<ChatEvent>,
}

impl<T: Connector, S: MessageStore> Engine<T, S> {
    /// Spawns the engine and its emitter task.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        identity: PeerId,
        config: ClientConfig,
        session: TransportSession<T, JsonCodec>,
        inbound: mpsc::Receiver<ServerEvent>,
        store: S,
        commands: mpsc::Receiver<Command>,
        command_tx: mpsc::WeakSender<Command>,
        events: broadcast::Sender<ChatEvent>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_emitter(
            session.clone(),
            outbound_rx,
            command_tx.clone(),
        ));

        let engine = Self {
            presence: PresenceCoordinator::new(config.presence.clone()),
            signals: session.subscribe(),
            identity,
            config,
            session,
            store: Arc::new(store),
            conversations: HashMap::new(),
            commands,
            command_tx,
            inbound,
            outbound,
            events,
        };
        tokio::spawn(engine.run());
    }

    /// Runs the actor loop until shutdown or until every client handle is
    /// dropped.
    async fn run(mut self) {
        tracing::info!(identity = %self.identity, "chat engine started");
        let mut signals_open = true;

        loop {
            let deadline = self.presence.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.session.disconnect().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.session.disconnect().await;
                        break;
                    }
                },
                Some(event) = self.inbound.recv() => self.handle_server_event(event),
                signal = self.signals.recv(), if signals_open => match signal {
                    Ok(signal) => self.handle_signal(signal),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "missed connection signals");
                    }
                    Err(broadcast::error::RecvError::Closed) => signals_open = false,
                },
                _ = sleep_until_deadline(deadline) => self.handle_timers(Instant::now()),
            }
        }

        tracing::info!(identity = %self.identity, "chat engine stopped");
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                let session = self.session.clone();
                tokio::spawn(async move {
                    let _ = reply.send(session.connect().await);
                });
            }
            Command::OpenRoom { room, reply } => self.open_room(room, reply),
            Command::HistoryLoaded {
                room,
                history,
                reply,
            } => self.history_loaded(room, history, reply),
            Command::CloseRoom { room } => self.close_room(room),
            Command::Send {
                room,
                text,
                reply_to,
                reply,
            } => self.send(room, text, reply_to, reply),
            Command::Retry {
                room,
                local_id,
                reply,
            } => self.retry(room, local_id, reply),
            Command::SendFailed {
                room,
                local_id,
                source,
                reply,
            } => self.send_failed(room, local_id, source, reply),
            Command::ReceiptDropped {
                room,
                message_id,
                read,
            } => self.receipt_dropped(room, message_id, read),
            Command::InputChanged { room, text } => {
                let signal = self
                    .presence
                    .on_input(&room, Instant::now(), text.trim().is_empty());
                self.emit_typing(signal);
            }
            Command::MarkVisible { room, ids } => self.mark_visible(&room, &ids),
            Command::Delete { room, ids, reply } => self.delete(room, ids, reply),
            Command::ClearHistory { room, reply } => {
                let ids = self
                    .conversations
                    .get(&room)
                    .map(|c| c.messages().iter().map(|m| m.id.clone()).collect())
                    .unwrap_or_default();
                self.delete(room, ids, reply);
            }
            Command::DeleteDone {
                room,
                ids,
                result,
                reply,
            } => self.delete_done(room, ids, result, reply),
            Command::Messages { room, reply } => {
                let messages = self
                    .conversations
                    .get(&room)
                    .map(|c| c.messages().to_vec())
                    .unwrap_or_default();
                let _ = reply.send(messages);
            }
            Command::LastPreview { room, reply } => {
                let preview = self
                    .conversations
                    .get(&room)
                    .map(Conversation::last_preview)
                    .unwrap_or_default();
                let _ = reply.send(preview);
            }
            Command::TypingSummary { room, reply } => {
                let _ = reply.send(self.presence.typing_summary(&room));
            }
            Command::IsOnline { peer, reply } => {
                let _ = reply.send(self.presence.is_online(&peer));
            }
            // Handled in `run`.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn open_room(
        &mut self,
        room: RoomKey,
        reply: oneshot::Sender<Result<Vec<Message>, ChatsyncError>>,
    ) {
        self.conversation(&room).reset_viewing_session();

        let Some(commands) = self.command_tx.upgrade() else {
            return;
        };
        let session = self.session.clone();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = session.join_room(&room).await {
                tracing::debug!(%room, error = %e, "join deferred until connected");
            }
            let history = store.fetch_history(&room).await;
            let _ = commands
                .send(Command::HistoryLoaded {
                    room,
                    history,
                    reply,
                })
                .await;
        });
    }

    fn history_loaded(
        &mut self,
        room: RoomKey,
        history: Result<Vec<IncomingMessage>, StoreError>,
        reply: oneshot::Sender<Result<Vec<Message>, ChatsyncError>>,
    ) {
        let history = match history {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(%room, error = %e, "history fetch failed");
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        let conversation = self.conversation(&room);
        let before = conversation.last_preview();
        let outcomes = conversation.seed_history(history);
        let snapshot = conversation.messages().to_vec();
        let after = conversation.last_preview();

        for outcome in outcomes {
            self.publish_reconciled(&room, outcome);
        }
        if before != after {
            self.publish(ChatEvent::PreviewChanged {
                room: room.clone(),
                preview: after,
            });
        }
        self.emit_delivered(&room);

        tracing::info!(%room, messages = snapshot.len(), "room opened");
        self.publish(ChatEvent::RoomOpened {
            room,
            messages: snapshot.len(),
        });
        let _ = reply.send(Ok(snapshot));
    }

    fn handle_signal(&mut self, signal: SessionSignal) {
        if matches!(signal, SessionSignal::Connected) {
            let rooms: Vec<RoomKey> = self.conversations.keys().cloned().collect();
            for room in &rooms {
                self.emit_delivered(room);
            }
        }
        self.publish(ChatEvent::Connection(signal));
    }

    /// A receipt the emitter couldn't hand to the server. Delivery acks are
    /// retried now if the connection is open, otherwise on the next
    /// `Connected`; read receipts on the next matching `mark_visible`.
    fn receipt_dropped(&mut self, room: RoomKey, message_id: MessageId, read: bool) {
        let Some(conversation) = self.conversations.get_mut(&room) else {
            return;
        };
        let forgotten = if read {
            conversation.forget_read_receipt(&message_id)
        } else {
            conversation.forget_delivered_ack(&message_id)
        };
        tracing::debug!(%room, %message_id, read, forgotten, "receipt not delivered to server");
        if forgotten && !read && self.session.is_open() {
            self.emit_delivered(&room);
        }
    }

    fn close_room(&mut self, room: RoomKey) {
        if let Some(conversation) = self.conversations.get_mut(&room) {
            conversation.reset_viewing_session();
        }
        let signal = self.presence.clear_room(&room);
        self.emit_typing(signal);
        let _ = self.outbound.send(Outbound::Leave(room.clone()));
        tracing::info!(%room, "room closed");
    }

    fn mark_visible(&mut self, room: &RoomKey, ids: &[MessageId]) {
        let Some(conversation) = self.conversations.get_mut(room) else {
            return;
        };
        for message_id in conversation.take_unread_for_receipt(ids) {
            tracing::debug!(%room, %message_id, "emitting read receipt");
            self.emit(ClientEvent::MarkRead {
                room_key: room.clone(),
                message_id,
            });
        }
    }

    // -----------------------------------------------------------------
    // Send pipeline
    // -----------------------------------------------------------------

    fn send(
        &mut self,
        room: RoomKey,
        text: String,
        reply_to: Option<MessageId>,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    ) {
        let local_id = new_local_id();
        let conversation = self.conversation(&room);
        let before = conversation.last_preview();
        let message = conversation
            .insert_optimistic(local_id.clone(), text.clone(), now_millis(), reply_to.clone())
            .clone();
        let after = conversation.last_preview();

        tracing::debug!(%room, %local_id, "message queued");
        self.publish(ChatEvent::MessageAdded {
            room: room.clone(),
            message,
        });
        if before != after {
            self.publish(ChatEvent::PreviewChanged {
                room: room.clone(),
                preview: after,
            });
        }
        let signal = self.presence.on_send(&room);
        self.emit_typing(signal);

        let event = ClientEvent::SendMessage {
            text,
            room_key: room.clone(),
            reply_to_id: reply_to,
            client_nonce: local_id.as_str().to_owned(),
        };
        self.deliver(room, local_id, event, reply);
    }

    fn retry(
        &mut self,
        room: RoomKey,
        local_id: MessageId,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    ) {
        let Some(conversation) = self.conversations.get_mut(&room) else {
            let _ = reply.send(Err(SendError::UnknownMessage(local_id)));
            return;
        };
        match conversation.mark_retrying(&local_id) {
            Ok(true) => {}
            Ok(false) => {
                let _ = reply.send(Err(SendError::NotRetryable(local_id)));
                return;
            }
            Err(_) => {
                let _ = reply.send(Err(SendError::UnknownMessage(local_id)));
                return;
            }
        }
        let Some(message) = conversation.get(&local_id).cloned() else {
            let _ = reply.send(Err(SendError::UnknownMessage(local_id)));
            return;
        };

        tracing::info!(%room, %local_id, "retrying message");
        let event = ClientEvent::SendMessage {
            text: message.text.clone(),
            room_key: room.clone(),
            reply_to_id: message.reply_to.clone(),
            client_nonce: message
                .client_nonce
                .clone()
                .unwrap_or_else(|| local_id.as_str().to_owned()),
        };
        self.publish(ChatEvent::MessageUpdated {
            room: room.clone(),
            message,
            previous_id: None,
        });
        self.deliver(room, local_id, event, reply);
    }

    /// Queues the send behind any intent already queued. A failure comes
    /// back as [`Command::SendFailed`] so the message is marked failed
    /// before the caller hears about it.
    fn deliver(
        &self,
        room: RoomKey,
        local_id: MessageId,
        event: ClientEvent,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    ) {
        let item = Outbound::Deliver {
            room,
            local_id,
            event,
            reply,
        };
        if let Err(mpsc::error::SendError(Outbound::Deliver { reply, .. })) =
            self.outbound.send(item)
        {
            let _ = reply.send(Err(SendError::EngineStopped));
        }
    }

    fn send_failed(
        &mut self,
        room: RoomKey,
        local_id: MessageId,
        source: SessionError,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    ) {
        tracing::warn!(%room, %local_id, error = %source, "send failed");
        if let Some(conversation) = self.conversations.get_mut(&room) {
            if let Ok(true) = conversation.mark_failed(&local_id) {
                if let Some(message) = conversation.get(&local_id).cloned() {
                    self.publish(ChatEvent::MessageUpdated {
                        room,
                        message,
                        previous_id: None,
                    });
                }
            }
        }
        let _ = reply.send(Err(SendError::ConnectionUnavailable { local_id, source }));
    }

    // -----------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------

    fn delete(
        &mut self,
        room: RoomKey,
        ids: Vec<MessageId>,
        reply: oneshot::Sender<Result<Vec<MessageId>, ChatsyncError>>,
    ) {
        // Optimistic copies were never persisted; only confirmed ids go to
        // the store.
        let persisted: Vec<MessageId> = match self.conversations.get(&room) {
            Some(conversation) => ids
                .iter()
                .filter(|id| conversation.get(id).is_none_or(|m| !m.is_optimistic))
                .cloned()
                .collect(),
            None => ids.clone(),
        };

        let Some(commands) = self.command_tx.upgrade() else {
            let _ = reply.send(Err(ChatsyncError::EngineStopped));
            return;
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let result = if persisted.is_empty() {
                Ok(())
            } else {
                store.delete_messages(&room, &persisted).await
            };
            let _ = commands
                .send(Command::DeleteDone {
                    room,
                    ids,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn delete_done(
        &mut self,
        room: RoomKey,
        ids: Vec<MessageId>,
        result: Result<(), StoreError>,
        reply: oneshot::Sender<Result<Vec<MessageId>, ChatsyncError>>,
    ) {
        if let Err(e) = result {
            tracing::warn!(%room, error = %e, "delete failed");
            let _ = reply.send(Err(e.into()));
            return;
        }

        let RemovalOutcome {
            removed,
            preview_changed,
        } = match self.conversations.get_mut(&room) {
            Some(conversation) => conversation.remove(&ids),
            None => RemovalOutcome {
                removed: Vec::new(),
                preview_changed: false,
            },
        };

        tracing::info!(%room, removed = removed.len(), "messages deleted");
        if !removed.is_empty() {
            self.publish(ChatEvent::MessagesRemoved {
                room: room.clone(),
                ids: removed.clone(),
            });
        }
        if preview_changed {
            let preview = self
                .conversations
                .get(&room)
                .map(Conversation::last_preview)
                .unwrap_or_default();
            self.publish(ChatEvent::PreviewChanged { room, preview });
        }
        let _ = reply.send(Ok(removed));
    }

    // -----------------------------------------------------------------
    // Inbound events
    // -----------------------------------------------------------------

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ReceiveMessage(payload) => self.receive_message(payload),
            ServerEvent::UserTyping {
                room_key,
                peer_id,
                is_typing,
            } => {
                if peer_id == self.identity {
                    return;
                }
                let change =
                    self.presence
                        .apply_typing(&room_key, &peer_id, is_typing, Instant::now());
                if let Some(change) = change {
                    self.publish_presence(change);
                }
            }
            ServerEvent::UserOnline { peer_id } => {
                if let Some(change) = self.presence.apply_online(&peer_id, Instant::now()) {
                    self.publish_presence(change);
                }
            }
            ServerEvent::UserOffline { peer_id } => {
                for change in self.presence.apply_offline(&peer_id, Instant::now()) {
                    self.publish_presence(change);
                }
            }
            ServerEvent::MessageDelivered {
                room_key,
                message_id,
                peer_id,
                at,
            } => self.apply_receipt(room_key, message_id, peer_id, at, false),
            ServerEvent::MessageRead {
                room_key,
                message_id,
                peer_id,
                at,
            } => self.apply_receipt(room_key, message_id, peer_id, at, true),
            ServerEvent::SendRejected {
                room_key,
                client_nonce,
                reason,
            } => {
                tracing::warn!(room = %room_key, ?client_nonce, %reason, "send rejected by server");
                self.publish(ChatEvent::SendRejected {
                    room: room_key,
                    local_id: client_nonce.map(MessageId::from),
                    reason,
                });
            }
            ServerEvent::RoomJoined { room_key } => {
                tracing::debug!(room = %room_key, "room join acknowledged");
            }
            ServerEvent::Error { code, message } => {
                tracing::warn!(code, %message, "server error");
            }
        }
    }

    fn receive_message(&mut self, payload: IncomingMessage) {
        let room = payload.room_key.clone();
        let conversation = self.conversation(&room);
        let before = conversation.last_preview();
        let outcome = match conversation.reconcile(payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(%room, error = %e, "dropping misrouted message");
                return;
            }
        };
        let after = conversation.last_preview();

        self.publish_reconciled(&room, outcome);
        if before != after {
            self.publish(ChatEvent::PreviewChanged {
                room: room.clone(),
                preview: after,
            });
        }
        self.emit_delivered(&room);
    }

    fn apply_receipt(
        &mut self,
        room: RoomKey,
        message_id: MessageId,
        peer: PeerId,
        at: u64,
        read: bool,
    ) {
        let Some(conversation) = self.conversations.get_mut(&room) else {
            tracing::warn!(%room, %message_id, "receipt for a room with no conversation");
            return;
        };
        let result = if read {
            conversation.apply_read(&message_id, &peer, at)
        } else {
            conversation.apply_delivered(&message_id, &peer, at)
        };
        match result {
            Ok(outcome) if outcome.changed => {
                if let Some(message) = conversation.get(&message_id).cloned() {
                    self.publish(ChatEvent::MessageUpdated {
                        room,
                        message,
                        previous_id: None,
                    });
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring receipt"),
        }
    }

    // -----------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------

    fn handle_timers(&mut self, now: Instant) {
        let expired = self.presence.poll(now);
        tracing::trace!(
            signals = expired.signals.len(),
            changes = expired.changes.len(),
            "presence timers fired"
        );
        for signal in expired.signals {
            self.emit_typing(Some(signal));
        }
        for change in expired.changes {
            self.publish_presence(change);
        }
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    fn conversation(&mut self, room: &RoomKey) -> &mut Conversation {
        let identity = &self.identity;
        let sync = &self.config.sync;
        self.conversations
            .entry(room.clone())
            .or_insert_with(|| Conversation::new(room.clone(), identity.clone(), sync.clone()))
    }

    fn publish(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_reconciled(&self, room: &RoomKey, outcome: ReconcileOutcome) {
        if !outcome.changed {
            return;
        }
        let Some(message) = self
            .conversations
            .get(room)
            .and_then(|c| c.get(&outcome.id))
            .cloned()
        else {
            return;
        };
        let event = if outcome.kind.inserted() {
            ChatEvent::MessageAdded {
                room: room.clone(),
                message,
            }
        } else {
            ChatEvent::MessageUpdated {
                room: room.clone(),
                message,
                previous_id: outcome.replaced,
            }
        };
        self.publish(event);
    }

    fn publish_presence(&self, change: PresenceChange) {
        let event = match change {
            PresenceChange::Online(peer) => ChatEvent::PresenceChanged { peer, online: true },
            PresenceChange::Offline(peer) => ChatEvent::PresenceChanged {
                peer,
                online: false,
            },
            PresenceChange::Typing { room, .. } => ChatEvent::TypingChanged {
                summary: self.presence.typing_summary(&room),
                room,
            },
        };
        self.publish(event);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.outbound.send(Outbound::Emit(event));
    }

    fn emit_typing(&self, signal: Option<TypingSignal>) {
        if let Some(signal) = signal {
            tracing::debug!(room = %signal.room, is_typing = signal.is_typing, "typing signal");
            self.emit(signal.to_event());
        }
    }

    /// Acknowledges delivery of every peer message not yet acknowledged.
    fn emit_delivered(&mut self, room: &RoomKey) {
        let Some(conversation) = self.conversations.get_mut(room) else {
            return;
        };
        for message_id in conversation.take_undelivered_for_receipt() {
            self.emit(ClientEvent::MarkDelivered {
                room_key: room.clone(),
                message_id,
            });
        }
    }
}

/// Drains the outbound queue into the session, in order.
async fn run_emitter<T: Connector>(
    session: TransportSession<T, JsonCodec>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    commands: mpsc::WeakSender<Command>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Emit(event) => {
                if let Err(e) = session.emit(&event).await {
                    tracing::debug!(error = %e, "dropped outbound intent");
                    report_dropped_receipt(&commands, event).await;
                }
            }
            Outbound::Leave(room) => {
                if let Err(e) = session.leave_room(&room).await {
                    tracing::debug!(%room, error = %e, "dropped leave");
                }
            }
            Outbound::Deliver {
                room,
                local_id,
                event,
                reply,
            } => match deliver_now(&session, &room, &event).await {
                Ok(()) => {
                    tracing::info!(%room, %local_id, "message sent");
                    let _ = reply.send(Ok(local_id));
                }
                Err(source) => match commands.upgrade() {
                    Some(commands) => {
                        let _ = commands
                            .send(Command::SendFailed {
                                room,
                                local_id,
                                source,
                                reply,
                            })
                            .await;
                    }
                    None => {
                        let _ = reply.send(Err(SendError::EngineStopped));
                    }
                },
            },
        }
    }
}

async fn deliver_now<T: Connector>(
    session: &TransportSession<T, JsonCodec>,
    room: &RoomKey,
    event: &ClientEvent,
) -> Result<(), SessionError> {
    session
        .ensure_connected(session.config().connect_timeout)
        .await?;
    if !session.is_joined(room).await {
        session.join_room(room).await?;
    }
    session.emit(event).await
}

/// Tells the engine a receipt never left, so it can be emitted again.
async fn report_dropped_receipt(commands: &mpsc::WeakSender<Command>, event: ClientEvent) {
    let (room, message_id, read) = match event {
        ClientEvent::MarkDelivered {
            room_key,
            message_id,
        } => (room_key, message_id, false),
        ClientEvent::MarkRead {
            room_key,
            message_id,
        } => (room_key, message_id, true),
        _ => return,
    };
    if let Some(commands) = commands.upgrade() {
        let _ = commands
            .send(Command::ReceiptDropped {
                room,
                message_id,
                read,
            })
            .await;
    }
}

/// A fresh local id, also used as the client nonce.
fn new_local_id() -> MessageId {
    let bits: u128 = rand::random();
    MessageId::from(format!("local-{bits:032x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_local_id_format() {
        let id = new_local_id();
        let hex = id.as_str().strip_prefix("local-").unwrap();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_local_id_is_unique() {
        assert_ne!(new_local_id(), new_local_id());
    }
}
