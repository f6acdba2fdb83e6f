//! The transport session: one logical connection, rebuilt transparently.
//!
//! [`TransportSession`] is the only owner of the physical connection.
//! Everything else talks to it through three surfaces:
//!
//! - **emit**: [`TransportSession::emit`] sends one [`ClientEvent`].
//! - **receive**: decoded [`ServerEvent`]s arrive, in order, on the
//!   `mpsc::Receiver` returned by [`TransportSession::new`].
//! - **signals**: [`TransportSession::subscribe`] yields lifecycle
//!   [`SessionSignal`]s.
//!
//! # Tasks
//!
//! ```text
//!             ┌──────────────┐   frames   ┌──────────────┐   ServerEvent
//!  server ───→│  connection  │──────────→ │ reader task  │──────────────→ inbound
//!             └──────────────┘            └──────┬───────┘
//!                                                │ lost(epoch)
//!                                                ▼
//!                                         ┌──────────────┐
//!                                         │  supervisor  │──→ connect()
//!                                         └──────────────┘
//! ```
//!
//! A reader task is spawned per connection. When it sees the connection
//! end, it only reports the loss; the supervisor task (one per session)
//! runs the reconnect round. Each connection carries an epoch so a late
//! report from an old reader can't tear down a newer connection.
//!
//! # Lock order
//!
//! `rooms` before `link`. Neither is held while dialling the connector.
//! `rooms` is held across the rejoin sends of a new connection, so a
//! concurrent `join_room` waits until the rejoin is complete.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chatsync_protocol::{ClientEvent, Codec, JsonCodec, RoomKey, ServerEvent};
use chatsync_transport::{Connection, Connector};
use tokio::sync::{Mutex, broadcast, mpsc, watch};

use crate::{ConnectionState, SessionConfig, SessionError, SessionSignal};

/// Capacity of the lifecycle signal broadcast.
const SIGNAL_CHANNEL_SIZE: usize = 64;

/// The current physical connection, if any, and its epoch.
struct Link<K> {
    conn: Option<Arc<K>>,
    epoch: u64,
}

struct Inner<T: Connector, C: Codec> {
    connector: T,
    codec: C,
    config: SessionConfig,
    /// Serializes connect rounds so concurrent callers share one.
    connect_lock: Mutex<()>,
    link: Mutex<Link<T::Connection>>,
    /// Rooms to (re)join on every new connection.
    rooms: Mutex<BTreeSet<RoomKey>>,
    state: watch::Sender<ConnectionState>,
    signals: broadcast::Sender<SessionSignal>,
    inbound: mpsc::Sender<ServerEvent>,
    lost: mpsc::UnboundedSender<u64>,
}

impl<T: Connector, C: Codec> Inner<T, C> {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    fn signal(&self, signal: SessionSignal) {
        // No subscribers is fine.
        let _ = self.signals.send(signal);
    }

    /// Tears down the connection of `epoch` if it is still current and
    /// schedules a reconnect round. Later reports for the same epoch are
    /// no-ops.
    async fn connection_lost(&self, epoch: u64, reason: String) {
        {
            let mut link = self.link.lock().await;
            if link.epoch != epoch || link.conn.take().is_none() {
                return;
            }
        }

        if *self.state.borrow() == ConnectionState::Closed {
            return;
        }

        tracing::info!(epoch, %reason, "connection lost, reconnecting");
        self.set_state(ConnectionState::Reconnecting);
        self.signal(SessionSignal::Disconnected { reason });
        let _ = self.lost.send(epoch);
    }
}

/// Handle to the single logical connection.
///
/// Cheap to clone: every clone refers to the same connection, room set,
/// and signal channel. Construct it once and inject it where needed.
pub struct TransportSession<T: Connector, C: Codec = JsonCodec> {
    inner: Arc<Inner<T, C>>,
}

impl<T: Connector, C: Codec> Clone for TransportSession<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Connector, C: Codec> TransportSession<T, C> {
    /// Creates a session and the receiver for its inbound events.
    ///
    /// Nothing is dialled until [`connect`](Self::connect) or
    /// [`ensure_connected`](Self::ensure_connected) is called. Must be
    /// called from within a Tokio runtime (a supervisor task is spawned).
    pub fn new(
        connector: T,
        codec: C,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let config = config.validated();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (signal_tx, _) = broadcast::channel(SIGNAL_CHANNEL_SIZE);

        let inner = Arc::new(Inner {
            connector,
            codec,
            config,
            connect_lock: Mutex::new(()),
            link: Mutex::new(Link {
                conn: None,
                epoch: 0,
            }),
            rooms: Mutex::new(BTreeSet::new()),
            state: state_tx,
            signals: signal_tx,
            inbound: inbound_tx,
            lost: lost_tx,
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), lost_rx));

        (Self { inner }, inbound_rx)
    }

    /// The configuration this session runs with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to lifecycle signals.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.inner.signals.subscribe()
    }

    /// `true` if a connection is open and all rooms have been rejoined.
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Opens the connection if it isn't open already.
    ///
    /// Idempotent: returns immediately when open, and concurrent callers
    /// wait for the same round instead of dialling twice. A round makes
    /// up to `1 + max_retries` attempts spaced by `retry_backoff`.
    ///
    /// # Errors
    /// [`SessionError::ConnectionUnavailable`] once the round is exhausted.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _round = self.inner.connect_lock.lock().await;
        if self.inner.link.lock().await.conn.is_some() {
            return Ok(());
        }

        let reconnecting = matches!(
            self.state(),
            ConnectionState::Reconnecting | ConnectionState::Open
        );
        self.inner.set_state(if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let attempts = self.inner.config.attempts();
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            match self.attempt().await {
                Ok(()) => return Ok(()),
                Err(reason) => {
                    tracing::warn!(attempt, attempts, %reason, "connect attempt failed");
                    self.inner.signal(SessionSignal::ConnectError {
                        attempt,
                        reason: reason.clone(),
                    });
                    last_reason = reason;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.inner.config.retry_backoff).await;
            }
        }

        tracing::warn!(attempts, "connection unavailable, giving up");
        self.inner.set_state(ConnectionState::Unavailable);
        self.inner.signal(SessionSignal::Unavailable);
        Err(SessionError::ConnectionUnavailable {
            attempts,
            reason: last_reason,
        })
    }

    /// One attempt: dial, rejoin every room, then publish `Open`.
    async fn attempt(&self) -> Result<(), String> {
        let conn = self
            .inner
            .connector
            .connect()
            .await
            .map_err(|e| e.to_string())?;
        let conn = Arc::new(conn);

        // Holding `rooms` makes the rejoin snapshot and the link install
        // atomic with respect to `join_room`.
        let rooms = self.inner.rooms.lock().await;
        for room_key in rooms.iter() {
            let bytes = self
                .inner
                .codec
                .encode(&ClientEvent::JoinRoom {
                    room_key: room_key.clone(),
                })
                .map_err(|e| e.to_string())?;
            conn.send(&bytes).await.map_err(|e| e.to_string())?;
        }

        let epoch = {
            let mut link = self.inner.link.lock().await;
            link.epoch += 1;
            link.conn = Some(Arc::clone(&conn));
            link.epoch
        };
        let rejoined = rooms.len();
        drop(rooms);

        tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&conn),
            epoch,
        ));

        tracing::info!(conn = %conn.id(), epoch, rejoined, "connected");
        self.inner.set_state(ConnectionState::Open);
        self.inner.signal(SessionSignal::Connected);
        Ok(())
    }

    /// Waits until the connection is open, dialling if necessary.
    ///
    /// # Errors
    /// - [`SessionError::ConnectionTimeout`] if `timeout` elapses first
    /// - [`SessionError::ConnectionUnavailable`] if the round is exhausted
    ///   before the deadline
    pub async fn ensure_connected(
        &self,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        if self.is_open() {
            return Ok(());
        }
        match tokio::time::timeout(timeout, self.connect()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(?timeout, "timed out waiting for connection");
                self.abandon_round().await;
                Err(SessionError::ConnectionTimeout(timeout))
            }
        }
    }

    /// Settles the state after a timed-out round was dropped mid-flight.
    ///
    /// Leaves everything alone if another caller is still dialling or a
    /// connection made it in.
    async fn abandon_round(&self) {
        let Ok(_round) = self.inner.connect_lock.try_lock() else {
            return;
        };
        if self.inner.link.lock().await.conn.is_some() {
            return;
        }
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            self.inner.set_state(ConnectionState::Unavailable);
            self.inner.signal(SessionSignal::Unavailable);
        }
    }

    /// [`ensure_connected`](Self::ensure_connected) with the configured
    /// `connect_timeout`.
    pub async fn ensure_connected_default(&self) -> Result<(), SessionError> {
        self.ensure_connected(self.inner.config.connect_timeout).await
    }

    /// Records membership of `room_key` and, if connected, sends the join.
    ///
    /// Membership survives reconnects: every new connection rejoins all
    /// recorded rooms before the session reports `Open`.
    pub async fn join_room(&self, room_key: &RoomKey) -> Result<(), SessionError> {
        let mut rooms = self.inner.rooms.lock().await;
        let newly_joined = rooms.insert(room_key.clone());

        let current = {
            let link = self.inner.link.lock().await;
            link.conn.clone().map(|conn| (conn, link.epoch))
        };
        let Some((conn, epoch)) = current else {
            tracing::debug!(room = %room_key, "room recorded, will join on connect");
            return Ok(());
        };

        let bytes = self.inner.codec.encode(&ClientEvent::JoinRoom {
            room_key: room_key.clone(),
        })?;
        if let Err(e) = conn.send(&bytes).await {
            drop(rooms);
            self.inner.connection_lost(epoch, e.to_string()).await;
            return Err(SessionError::Transport(Box::new(e)));
        }

        tracing::info!(room = %room_key, newly_joined, "room joined");
        Ok(())
    }

    /// Forgets `room_key` and, if connected, sends the leave.
    ///
    /// In-flight operations for the room are not cancelled.
    pub async fn leave_room(&self, room_key: &RoomKey) -> Result<(), SessionError> {
        let was_joined = self.inner.rooms.lock().await.remove(room_key);
        if !was_joined {
            return Ok(());
        }
        tracing::info!(room = %room_key, "room left");
        match self
            .emit(&ClientEvent::LeaveRoom {
                room_key: room_key.clone(),
            })
            .await
        {
            Err(SessionError::NotConnected) => Ok(()),
            other => other,
        }
    }

    /// `true` if `room_key` is in the membership set.
    pub async fn is_joined(&self, room_key: &RoomKey) -> bool {
        self.inner.rooms.lock().await.contains(room_key)
    }

    /// Every room in the membership set.
    pub async fn joined_rooms(&self) -> Vec<RoomKey> {
        self.inner.rooms.lock().await.iter().cloned().collect()
    }

    /// Encodes and sends one event on the open connection.
    ///
    /// # Errors
    /// - [`SessionError::NotConnected`] if no connection is open
    /// - [`SessionError::Transport`] if the send failed; the connection is
    ///   then treated as lost and a reconnect round starts
    pub async fn emit(&self, event: &ClientEvent) -> Result<(), SessionError> {
        let bytes = self.inner.codec.encode(event)?;

        let (conn, epoch) = {
            let link = self.inner.link.lock().await;
            let conn = link.conn.clone().ok_or(SessionError::NotConnected)?;
            (conn, link.epoch)
        };

        if let Err(e) = conn.send(&bytes).await {
            self.inner.connection_lost(epoch, e.to_string()).await;
            return Err(SessionError::Transport(Box::new(e)));
        }
        tracing::trace!(?event, "emitted");
        Ok(())
    }

    /// Closes the connection on purpose. No reconnect is attempted until
    /// [`connect`](Self::connect) is called again. Room membership is kept.
    pub async fn disconnect(&self) {
        self.inner.set_state(ConnectionState::Closed);
        let conn = self.inner.link.lock().await.conn.take();
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "error while closing connection");
            }
            tracing::info!(conn = %conn.id(), "disconnected by client");
            self.inner.signal(SessionSignal::Disconnected {
                reason: "closed by client".to_owned(),
            });
        }
    }
}

/// Per-connection reader: decode frames and forward them in order.
async fn read_loop<T: Connector, C: Codec>(
    inner: Weak<Inner<T, C>>,
    conn: Arc<T::Connection>,
    epoch: u64,
) {
    let reason = loop {
        let frame = match conn.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "closed by server".to_owned(),
            Err(e) => break e.to_string(),
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.codec.decode::<ServerEvent>(&frame) {
            Ok(event) => {
                if inner.inbound.send(event).await.is_err() {
                    tracing::debug!(epoch, "inbound receiver dropped, reader exiting");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(epoch, error = %e, "dropping undecodable frame");
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(epoch, reason).await;
    }
}

/// Runs a reconnect round for every reported loss until the session is
/// dropped.
async fn supervise<T: Connector, C: Codec>(
    inner: Weak<Inner<T, C>>,
    mut lost: mpsc::UnboundedReceiver<u64>,
) {
    while let Some(epoch) = lost.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if *inner.state.borrow() == ConnectionState::Closed {
            continue;
        }
        let session = TransportSession { inner };
        if let Err(e) = session.connect().await {
            tracing::warn!(epoch, error = %e, "reconnect failed");
        }
    }
}
