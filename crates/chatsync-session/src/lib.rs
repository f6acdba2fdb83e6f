//! Connection lifecycle for Chatsync.
//!
//! This crate owns the client's single logical connection to the chat
//! server:
//!
//! 1. **Connecting**: idempotent [`TransportSession::connect`] and
//!    deadline-bounded [`TransportSession::ensure_connected`]
//! 2. **Reconnection**: automatic, with a capped retry count and fixed
//!    backoff ([`SessionConfig`])
//! 3. **Room membership**: joined rooms are rejoined on every new
//!    connection before the session reports [`ConnectionState::Open`]
//!
//! # How it fits in the stack
//!
//! ```text
//! Client engine (above)  ← sends through the session, consumes its events
//!     ↕
//! Session Layer (this crate)  ← connection state, reconnects, rooms
//!     ↕
//! Transport + Protocol (below)  ← bytes, codecs, event types
//! ```

mod config;
mod error;
mod session;

pub use config::{ConnectionState, SessionConfig, SessionSignal};
pub use error::SessionError;
pub use session::TransportSession;
