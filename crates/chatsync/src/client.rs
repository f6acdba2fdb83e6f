//! The public client handle and its builder.

use chatsync_conversation::{LastMessagePreview, Message};
use chatsync_presence::TypingSummary;
use chatsync_protocol::{JsonCodec, MessageId, PeerId, RoomKey};
use chatsync_session::{ConnectionState, TransportSession};
use chatsync_transport::Connector;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::engine::{Command, Engine};
use crate::{ChatEvent, ChatsyncError, ClientConfig, MessageStore, SendError};

/// Capacity of the command channel between handles and the engine.
const COMMAND_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`ChatClient`].
///
/// # Example
///
/// ```rust,no_run
/// use chatsync::{ChatClient, NoopStore};
/// use chatsync::protocol::{PeerId, RoomKey};
///
/// # async fn run() -> Result<(), chatsync::ChatsyncError> {
/// let client = ChatClient::builder()
///     .identity(PeerId::from("alice"))
///     .connect_websocket("ws://127.0.0.1:8080", NoopStore)
///     .await?;
///
/// client.open_room(RoomKey::channel("general")).await?;
/// client.send(RoomKey::channel("general"), "hello", None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ChatClientBuilder {
    identity: Option<PeerId>,
    config: ClientConfig,
}

impl ChatClientBuilder {
    /// Creates a builder with default configuration and no identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// The local user. Required.
    pub fn identity(mut self, identity: PeerId) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the connection settings.
    pub fn session_config(mut self, session: chatsync_session::SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    /// Sets the reconciliation settings.
    pub fn sync_config(mut self, sync: chatsync_conversation::SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    /// Sets the typing/presence timers.
    pub fn presence_config(mut self, presence: chatsync_presence::PresenceConfig) -> Self {
        self.config.presence = presence;
        self
    }

    /// Builds the client over any [`Connector`] without dialling.
    ///
    /// Spawns the engine, so this must be called from within a Tokio
    /// runtime. The connection opens lazily on the first send, or
    /// explicitly via [`ChatClient::connect`].
    ///
    /// # Errors
    /// [`ChatsyncError::MissingIdentity`] if no identity was set.
    pub fn build<T, S>(self, connector: T, store: S) -> Result<ChatClient, ChatsyncError>
    where
        T: Connector,
        S: MessageStore,
    {
        let identity = self.identity.ok_or(ChatsyncError::MissingIdentity)?;
        let config = self.config.validated();

        let (session, inbound) =
            TransportSession::new(connector, JsonCodec, config.session.clone());
        let state = session.watch_state();
        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(config.event_buffer);

        Engine::spawn(
            identity.clone(),
            config,
            session,
            inbound,
            store,
            commands_rx,
            commands.downgrade(),
            events.clone(),
        );

        tracing::debug!(%identity, "chat client built");
        Ok(ChatClient {
            identity,
            commands,
            events,
            state,
        })
    }

    /// Builds a client over WebSocket and opens the connection.
    ///
    /// # Errors
    /// - [`ChatsyncError::MissingIdentity`] if no identity was set
    /// - [`ChatsyncError::Session`] if the connection can't be opened
    #[cfg(feature = "websocket")]
    pub async fn connect_websocket<S: MessageStore>(
        self,
        url: impl Into<String>,
        store: S,
    ) -> Result<ChatClient, ChatsyncError> {
        let connector = chatsync_transport::WebSocketConnector::new(url);
        let client = self.build(connector, store)?;
        client.connect().await?;
        Ok(client)
    }
}

// ---------------------------------------------------------------------------
// ChatClient
// ---------------------------------------------------------------------------

/// A handle to a running chat engine.
///
/// Cheap to clone; every clone talks to the same engine. The engine stops
/// after [`shutdown`](Self::shutdown) or once the last handle is dropped.
#[derive(Debug, Clone)]
pub struct ChatClient {
    identity: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ChatEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl ChatClient {
    /// Starts building a client.
    pub fn builder() -> ChatClientBuilder {
        ChatClientBuilder::new()
    }

    /// The local user.
    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that sees every connection state change.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribes to [`ChatEvent`]s. Only events published after this call
    /// are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Opens the connection now instead of waiting for the first send.
    pub async fn connect(&self) -> Result<(), ChatsyncError> {
        let result = self.request(|reply| Command::Connect { reply }).await?;
        Ok(result?)
    }

    /// Opens a room: joins it and seeds it from the store's history.
    ///
    /// Returns the room's messages in display order. Peers' messages in
    /// the history are acknowledged as delivered.
    ///
    /// # Errors
    /// [`ChatsyncError::Store`] if history can't be fetched. The room is
    /// still joined, and live messages keep arriving.
    pub async fn open_room(&self, room: RoomKey) -> Result<Vec<Message>, ChatsyncError> {
        self.request(|reply| Command::OpenRoom { room, reply }).await?
    }

    /// Leaves a room. Stops local typing there and ends the viewing
    /// session, so reopening it acknowledges reads again.
    pub async fn close_room(&self, room: RoomKey) -> Result<(), ChatsyncError> {
        self.tell(Command::CloseRoom { room }).await
    }

    /// Sends a message.
    ///
    /// The message shows up immediately (a [`ChatEvent::MessageAdded`]
    /// with `is_optimistic` set) and is confirmed when the server echoes
    /// it. Returns the local id once the server accepted the emit.
    ///
    /// # Errors
    /// - [`SendError::EmptyMessage`] for blank text; nothing is inserted
    /// - [`SendError::ConnectionUnavailable`] if the connection couldn't
    ///   be opened; the message stays, marked failed
    pub async fn send(
        &self,
        room: RoomKey,
        text: impl Into<String>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, SendError> {
        let text = text.into().trim().to_owned();
        if text.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                room,
                text,
                reply_to,
                reply,
            })
            .await
            .map_err(|_| SendError::EngineStopped)?;
        rx.await.map_err(|_| SendError::EngineStopped)?
    }

    /// Re-sends a failed message with its original local id.
    ///
    /// # Errors
    /// - [`SendError::UnknownMessage`] if the room doesn't hold `local_id`
    /// - [`SendError::NotRetryable`] if the message hasn't failed
    /// - [`SendError::ConnectionUnavailable`] if it fails again
    pub async fn retry(&self, room: RoomKey, local_id: MessageId) -> Result<MessageId, SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Retry {
                room,
                local_id,
                reply,
            })
            .await
            .map_err(|_| SendError::EngineStopped)?;
        rx.await.map_err(|_| SendError::EngineStopped)?
    }

    /// Reports the composer's contents; drives the local typing signal.
    pub async fn input_changed(
        &self,
        room: RoomKey,
        text: impl Into<String>,
    ) -> Result<(), ChatsyncError> {
        self.tell(Command::InputChanged {
            room,
            text: text.into(),
        })
        .await
    }

    /// Reports which messages are on screen. Each peer message is
    /// acknowledged as read at most once per viewing session.
    pub async fn mark_visible(
        &self,
        room: RoomKey,
        ids: Vec<MessageId>,
    ) -> Result<(), ChatsyncError> {
        self.tell(Command::MarkVisible { room, ids }).await
    }

    /// Deletes messages through the store, then removes them locally.
    ///
    /// Returns the ids that were actually removed.
    pub async fn delete_messages(
        &self,
        room: RoomKey,
        ids: Vec<MessageId>,
    ) -> Result<Vec<MessageId>, ChatsyncError> {
        self.request(|reply| Command::Delete { room, ids, reply })
            .await?
    }

    /// Deletes every message in the room.
    pub async fn clear_room_history(&self, room: RoomKey) -> Result<Vec<MessageId>, ChatsyncError> {
        self.request(|reply| Command::ClearHistory { room, reply })
            .await?
    }

    /// Snapshot of a room's messages in display order.
    pub async fn messages(&self, room: RoomKey) -> Result<Vec<Message>, ChatsyncError> {
        self.request(|reply| Command::Messages { room, reply }).await
    }

    /// The room's sidebar preview.
    pub async fn last_preview(&self, room: RoomKey) -> Result<LastMessagePreview, ChatsyncError> {
        self.request(|reply| Command::LastPreview { room, reply })
            .await
    }

    /// Who is typing in the room right now.
    pub async fn typing_summary(&self, room: RoomKey) -> Result<TypingSummary, ChatsyncError> {
        self.request(|reply| Command::TypingSummary { room, reply })
            .await
    }

    /// Whether a peer is online as far as this client has heard.
    pub async fn is_online(&self, peer: PeerId) -> Result<bool, ChatsyncError> {
        self.request(|reply| Command::IsOnline { peer, reply }).await
    }

    /// Stops the engine and closes the connection.
    pub async fn shutdown(&self) -> Result<(), ChatsyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    // -- helpers ------------------------------------------------------------

    async fn tell(&self, cmd: Command) -> Result<(), ChatsyncError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| ChatsyncError::EngineStopped)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, ChatsyncError> {
        let (reply, rx) = oneshot::channel();
        self.tell(make(reply)).await?;
        rx.await.map_err(|_| ChatsyncError::EngineStopped)
    }
}

