//! Session configuration, connection state, and lifecycle signals.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for connection behavior.
///
/// Create one with `SessionConfig::default()` and override just the
/// fields you care about:
///
/// ```rust
/// use std::time::Duration;
/// use chatsync_session::SessionConfig;
///
/// let config = SessionConfig {
///     max_retries: 2,
///     ..SessionConfig::default()
/// };
/// assert_eq!(config.connect_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long `ensure_connected` waits for the open state when the
    /// caller doesn't pass an explicit deadline.
    pub connect_timeout: Duration,

    /// Retries after the first failed connect attempt. After
    /// `1 + max_retries` failures the session reports
    /// `ConnectionUnavailable` and stops trying until asked again.
    pub max_retries: u32,

    /// Fixed pause between connect attempts.
    pub retry_backoff: Duration,

    /// Capacity of the inbound event channel. When the consumer falls
    /// behind, the reader task waits rather than dropping events.
    pub inbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_retries: 5,
            retry_backoff: Duration::from_millis(1000),
            inbound_buffer: 256,
        }
    }
}

impl SessionConfig {
    /// Clamps values that would make the session unusable.
    pub fn validated(mut self) -> Self {
        if self.inbound_buffer == 0 {
            tracing::warn!("inbound_buffer of 0 is not allowed, using 1");
            self.inbound_buffer = 1;
        }
        if self.connect_timeout.is_zero() {
            tracing::warn!("connect_timeout of 0 is not allowed, using default");
            self.connect_timeout = Self::default().connect_timeout;
        }
        self
    }

    /// Total connect attempts per round (first try plus retries).
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// The state of the session's single logical connection.
///
/// ```text
///   Idle ──connect()──→ Connecting ──ok──→ Open ──lost──→ Reconnecting
///                           │                ↑                 │
///                           │                └──────ok─────────┘
///                           └──────retries exhausted──────→ Unavailable
///
///   any ──disconnect()──→ Closed
/// ```
///
/// `Open` is only published after every joined room has been rejoined on
/// the new connection, so "open" also means "safe to send".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// First connection round in progress.
    Connecting,
    /// Connected and all rooms rejoined.
    Open,
    /// Lost the connection; a new round is in progress or scheduled.
    Reconnecting,
    /// The last round exhausted its retries.
    Unavailable,
    /// Closed on purpose by [`disconnect`](crate::TransportSession::disconnect).
    Closed,
}

impl ConnectionState {
    /// `true` when events can be emitted.
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Unavailable => "unavailable",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// SessionSignal
// ---------------------------------------------------------------------------

/// Lifecycle signals broadcast to subscribers.
///
/// The session doesn't interpret message content; these are the only
/// things it has to say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// A connection is open and all rooms have been rejoined.
    Connected,
    /// The open connection went away.
    Disconnected {
        /// Why, as far as the transport knows.
        reason: String,
    },
    /// One connect attempt failed.
    ConnectError {
        /// 1-based attempt number within the current round.
        attempt: u32,
        /// The transport's error message.
        reason: String,
    },
    /// A round of attempts was exhausted.
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_values() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_backoff, Duration::from_millis(1000));
        assert_eq!(config.attempts(), 6);
    }

    #[test]
    fn test_validated_clamps_zero_values() {
        let config = SessionConfig {
            connect_timeout: Duration::ZERO,
            inbound_buffer: 0,
            ..SessionConfig::default()
        }
        .validated();
        assert_eq!(config.inbound_buffer, 1);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Connecting.is_open());
    }
}
