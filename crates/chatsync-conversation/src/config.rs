//! Reconciliation settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How confirmed messages are matched back to optimistic ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum `|local createdAt − server createdAt|` for a heuristic
    /// match. Wide on purpose: a missed match duplicates a message, a
    /// false match only mislabels which of two identical texts was
    /// confirmed first.
    pub heuristic_window: Duration,

    /// Whether to fall back to sender+text+time matching when the server
    /// doesn't echo the client nonce. Turn off once the transport echoes
    /// nonces reliably.
    pub heuristic_matching: bool,

    /// Maximum characters kept in reply and last-message snippets.
    pub snippet_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heuristic_window: Duration::from_secs(60),
            heuristic_matching: true,
            snippet_len: 80,
        }
    }
}

impl SyncConfig {
    /// Clamps values that would make matching or previews meaningless.
    pub fn validated(mut self) -> Self {
        if self.snippet_len == 0 {
            tracing::warn!("snippet_len of 0 is not allowed, using 1");
            self.snippet_len = 1;
        }
        self
    }

    pub(crate) fn window_millis(&self) -> u64 {
        u64::try_from(self.heuristic_window.as_millis()).unwrap_or(u64::MAX)
    }
}
