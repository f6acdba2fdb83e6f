//! Typing indicators and online presence for Chatsync.
//!
//! [`PresenceCoordinator`] tracks three things:
//!
//! - **Local typing** per room, so the client emits exactly one
//!   `typing(true)` when a burst of keystrokes starts and exactly one
//!   `typing(false)` when it ends (send, empty input, leave, or
//!   `typing_idle` without a keystroke).
//! - **Remote typing** per room, with a `remote_typing_ttl` safety net so
//!   a lost `typing(false)` doesn't leave a peer typing forever.
//! - **Online status** per peer, global across rooms.
//!
//! The coordinator does no I/O and reads no clock: every method that
//! depends on time takes `now` explicitly. The owner asks for
//! [`next_deadline`](PresenceCoordinator::next_deadline), sleeps until
//! then, and calls [`poll`](PresenceCoordinator::poll).
//!
//! # Integration
//!
//! The coordinator is designed to sit inside an actor's `tokio::select!`
//! loop:
//!
//! ```ignore
//! loop {
//!     let deadline = presence.next_deadline();
//!     tokio::select! {
//!         Some(cmd) = cmd_rx.recv() => { /* handle commands */ }
//!         _ = sleep_until_deadline(deadline) => {
//!             let expired = presence.poll(Instant::now());
//!             /* emit expired.signals, publish expired.changes */
//!         }
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use chatsync_protocol::{ClientEvent, PeerId, RoomKey};
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timer settings for typing and presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// How long after the last keystroke local typing ends on its own.
    pub typing_idle: Duration,
    /// How long a remote `typing(true)` stays valid without a refresh.
    pub remote_typing_ttl: Duration,
    /// Maximum number of typers named in a [`TypingSummary`]; the rest
    /// are only counted.
    pub typing_display_cap: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_idle: Duration::from_secs(2),
            remote_typing_ttl: Duration::from_secs(5),
            typing_display_cap: 5,
        }
    }
}

impl PresenceConfig {
    /// Clamp and fix any out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`PresenceCoordinator::new`]. Zero
    /// durations fall back to the defaults; a zero display cap becomes 1.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.typing_idle.is_zero() {
            warn!("typing_idle of 0 is not allowed, using default");
            self.typing_idle = defaults.typing_idle;
        }
        if self.remote_typing_ttl.is_zero() {
            warn!("remote_typing_ttl of 0 is not allowed, using default");
            self.remote_typing_ttl = defaults.remote_typing_ttl;
        }
        if self.typing_display_cap == 0 {
            self.typing_display_cap = 1;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// A local typing transition the client must announce to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    /// The room being typed in.
    pub room: RoomKey,
    /// `true` when a burst starts, `false` when it ends.
    pub is_typing: bool,
}

impl TypingSignal {
    /// The wire event announcing this transition.
    pub fn to_event(&self) -> ClientEvent {
        ClientEvent::Typing {
            room_key: self.room.clone(),
            is_typing: self.is_typing,
        }
    }
}

/// A change in what the UI should show about peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// A peer came online.
    Online(PeerId),
    /// A peer went offline.
    Offline(PeerId),
    /// A peer started or stopped typing in a room.
    Typing {
        /// Where.
        room: RoomKey,
        /// Who.
        peer: PeerId,
        /// Started (`true`) or stopped (`false`).
        is_typing: bool,
    },
}

/// Everything a [`PresenceCoordinator::poll`] expired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expired {
    /// Local typing bursts that ended by idling out.
    pub signals: Vec<TypingSignal>,
    /// Remote typing entries that ran past their TTL.
    pub changes: Vec<PresenceChange>,
}

impl Expired {
    /// `true` if nothing expired.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.changes.is_empty()
    }
}

/// A peer's known online status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEntry {
    /// Last reported status.
    pub online: bool,
    /// When that status was reported.
    pub since: Instant,
}

/// Who is typing in a room, ready for rendering.
///
/// `shown` lists the most recent typers first, capped at
/// `typing_display_cap`; `others` counts the rest ("and 3 others").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingSummary {
    /// Typers to name, most recently started first.
    pub shown: Vec<PeerId>,
    /// Typers beyond the cap.
    pub others: usize,
}

impl TypingSummary {
    /// `true` if nobody is typing.
    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }

    /// Total number of typers.
    pub fn total(&self) -> usize {
        self.shown.len() + self.others
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RemoteTyping {
    peer: PeerId,
    started: Instant,
    expires: Instant,
}

/// Typing and presence state for one client.
#[derive(Debug)]
pub struct PresenceCoordinator {
    config: PresenceConfig,
    /// Rooms the local user is typing in, with their idle deadline.
    local: HashMap<RoomKey, Instant>,
    remote: HashMap<RoomKey, Vec<RemoteTyping>>,
    peers: HashMap<PeerId, PresenceEntry>,
}

impl PresenceCoordinator {
    /// Creates a coordinator with no typing or presence state. `config`
    /// goes through [`PresenceConfig::validated`] first.
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config: config.validated(),
            local: HashMap::new(),
            remote: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    /// The validated configuration in use.
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    // -- local typing -----------------------------------------------------

    /// Reacts to the local input field changing.
    ///
    /// Returns `typing(true)` on the first keystroke of a burst and
    /// `typing(false)` when the input is cleared mid-burst. Further
    /// keystrokes only push the idle deadline back.
    pub fn on_input(
        &mut self,
        room: &RoomKey,
        now: Instant,
        input_empty: bool,
    ) -> Option<TypingSignal> {
        if input_empty {
            return self.stop_local(room);
        }
        let deadline = now + self.config.typing_idle;
        match self.local.insert(room.clone(), deadline) {
            Some(_) => {
                trace!(%room, "typing deadline extended");
                None
            }
            None => {
                debug!(%room, "local typing started");
                Some(TypingSignal {
                    room: room.clone(),
                    is_typing: true,
                })
            }
        }
    }

    /// A message was sent: any burst in `room` is over.
    pub fn on_send(&mut self, room: &RoomKey) -> Option<TypingSignal> {
        self.stop_local(room)
    }

    /// The user left `room`: any burst there is over.
    pub fn on_leave(&mut self, room: &RoomKey) -> Option<TypingSignal> {
        self.stop_local(room)
    }

    /// Whether a local burst is in progress in `room`.
    pub fn is_typing_locally(&self, room: &RoomKey) -> bool {
        self.local.contains_key(room)
    }

    fn stop_local(&mut self, room: &RoomKey) -> Option<TypingSignal> {
        self.local.remove(room).map(|_| {
            debug!(%room, "local typing stopped");
            TypingSignal {
                room: room.clone(),
                is_typing: false,
            }
        })
    }

    // -- remote typing ----------------------------------------------------

    /// Applies a peer's typing event. Returns a change only when the
    /// peer's visible state flips; a repeated `typing(true)` just refreshes
    /// its expiry.
    pub fn apply_typing(
        &mut self,
        room: &RoomKey,
        peer: &PeerId,
        is_typing: bool,
        now: Instant,
    ) -> Option<PresenceChange> {
        let typers = self.remote.entry(room.clone()).or_default();
        let existing = typers.iter().position(|t| &t.peer == peer);

        let change = match (existing, is_typing) {
            (Some(idx), true) => {
                typers[idx].expires = now + self.config.remote_typing_ttl;
                None
            }
            (None, true) => {
                typers.push(RemoteTyping {
                    peer: peer.clone(),
                    started: now,
                    expires: now + self.config.remote_typing_ttl,
                });
                Some(PresenceChange::Typing {
                    room: room.clone(),
                    peer: peer.clone(),
                    is_typing: true,
                })
            }
            (Some(idx), false) => {
                typers.remove(idx);
                Some(PresenceChange::Typing {
                    room: room.clone(),
                    peer: peer.clone(),
                    is_typing: false,
                })
            }
            (None, false) => None,
        };

        if typers.is_empty() {
            self.remote.remove(room);
        }
        change
    }

    /// Whether `peer` is shown as typing in `room`.
    pub fn is_typing(&self, room: &RoomKey, peer: &PeerId) -> bool {
        self.remote
            .get(room)
            .is_some_and(|typers| typers.iter().any(|t| &t.peer == peer))
    }

    /// Who is typing in `room`, most recently started first.
    pub fn typing_summary(&self, room: &RoomKey) -> TypingSummary {
        let Some(typers) = self.remote.get(room) else {
            return TypingSummary::default();
        };
        let mut ordered: Vec<&RemoteTyping> = typers.iter().collect();
        ordered.sort_by(|a, b| b.started.cmp(&a.started));

        let cap = self.config.typing_display_cap;
        TypingSummary {
            shown: ordered.iter().take(cap).map(|t| t.peer.clone()).collect(),
            others: ordered.len().saturating_sub(cap),
        }
    }

    // -- online presence --------------------------------------------------

    /// Marks `peer` online. Returns a change if it wasn't already.
    pub fn apply_online(&mut self, peer: &PeerId, now: Instant) -> Option<PresenceChange> {
        let since = match self.peers.get(peer) {
            Some(e) if e.online => return None,
            _ => now,
        };
        self.peers.insert(peer.clone(), PresenceEntry { online: true, since });
        debug!(%peer, "peer online");
        Some(PresenceChange::Online(peer.clone()))
    }

    /// Marks `peer` offline and clears its typing in every room.
    pub fn apply_offline(&mut self, peer: &PeerId, now: Instant) -> Vec<PresenceChange> {
        let mut changes = Vec::new();

        let mut rooms: Vec<RoomKey> = self
            .remote
            .iter()
            .filter(|(_, typers)| typers.iter().any(|t| &t.peer == peer))
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort_by_key(ToString::to_string);
        for room in rooms {
            if let Some(change) = self.apply_typing(&room, peer, false, now) {
                changes.push(change);
            }
        }

        let was_online = self.is_online(peer);
        let since = match self.peers.get(peer) {
            Some(e) if !e.online => e.since,
            _ => now,
        };
        self.peers.insert(peer.clone(), PresenceEntry { online: false, since });
        if was_online {
            debug!(%peer, "peer offline");
            changes.push(PresenceChange::Offline(peer.clone()));
        }
        changes
    }

    /// Whether `peer` was last reported online. Unknown peers are offline.
    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|e| e.online)
    }

    /// The last known status of `peer`, if any was ever reported.
    pub fn entry(&self, peer: &PeerId) -> Option<PresenceEntry> {
        self.peers.get(peer).copied()
    }

    // -- timers -----------------------------------------------------------

    /// The earliest pending deadline, or `None` when nothing is waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        let local = self.local.values().copied();
        let remote = self
            .remote
            .values()
            .flat_map(|typers| typers.iter().map(|t| t.expires));
        local.chain(remote).min()
    }

    /// Expires everything whose deadline is at or before `now`.
    pub fn poll(&mut self, now: Instant) -> Expired {
        let mut expired = Expired::default();

        let mut idle: Vec<RoomKey> = self
            .local
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(room, _)| room.clone())
            .collect();
        idle.sort_by_key(ToString::to_string);
        for room in idle {
            if let Some(signal) = self.stop_local(&room) {
                expired.signals.push(signal);
            }
        }

        let mut rooms: Vec<RoomKey> = self.remote.keys().cloned().collect();
        rooms.sort_by_key(ToString::to_string);
        for room in rooms {
            let Some(typers) = self.remote.get_mut(&room) else {
                continue;
            };
            typers.retain(|t| {
                if t.expires <= now {
                    debug!(%room, peer = %t.peer, "remote typing expired");
                    expired.changes.push(PresenceChange::Typing {
                        room: room.clone(),
                        peer: t.peer.clone(),
                        is_typing: false,
                    });
                    false
                } else {
                    true
                }
            });
            if typers.is_empty() {
                self.remote.remove(&room);
            }
        }

        expired
    }

    /// Forgets a room on close. Returns the `typing(false)` to emit if a
    /// local burst was in progress.
    pub fn clear_room(&mut self, room: &RoomKey) -> Option<TypingSignal> {
        self.remote.remove(room);
        self.on_leave(room)
    }
}

/// Sleeps until `deadline`, or forever when there is none.
///
/// Meant for a `tokio::select!` branch: with no deadline the branch never
/// fires, and the other branches keep running.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
