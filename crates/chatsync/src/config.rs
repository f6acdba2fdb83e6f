//! Client-wide configuration.

use chatsync_conversation::SyncConfig;
use chatsync_presence::PresenceConfig;
use chatsync_session::SessionConfig;
use serde::{Deserialize, Serialize};

/// Everything a [`ChatClient`](crate::ChatClient) can be tuned with.
///
/// Each layer keeps its own config type; this just bundles them so an
/// application can load one struct from its settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection timeout, retries, backoff.
    pub session: SessionConfig,
    /// Reconciliation window and snippet length.
    pub sync: SyncConfig,
    /// Typing and presence timers.
    pub presence: PresenceConfig,
    /// Capacity of the [`ChatEvent`](crate::ChatEvent) broadcast channel.
    /// Subscribers that fall further behind than this miss events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            sync: SyncConfig::default(),
            presence: PresenceConfig::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ClientConfig {
    /// Validates every section.
    pub fn validated(mut self) -> Self {
        self.session = self.session.validated();
        self.sync = self.sync.validated();
        self.presence = self.presence.validated();
        if self.event_buffer == 0 {
            tracing::warn!("event_buffer of 0 is not allowed, using default");
            self.event_buffer = default_event_buffer();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_event_buffer() {
        assert_eq!(ClientConfig::default().event_buffer, 1024);
    }

    #[test]
    fn test_validated_replaces_zero_event_buffer() {
        let config = ClientConfig {
            event_buffer: 0,
            ..ClientConfig::default()
        }
        .validated();
        assert_eq!(config.event_buffer, 1024);
    }
}
