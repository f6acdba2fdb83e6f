//! # Chatsync
//!
//! Real-time message synchronization for chat clients.
//!
//! Chatsync keeps a client's view of its conversations consistent with the
//! server while messages, receipts, and typing signals race each other over
//! an unreliable connection. A message the user sends shows up at once,
//! and the server's confirmation later replaces it in place instead of
//! duplicating it.
//!
//! ## Layers
//!
//! | Crate | Role |
//! |-------|------|
//! | `chatsync-transport` | byte-level connections (WebSocket, in-memory) |
//! | `chatsync-protocol` | wire events and the JSON codec |
//! | `chatsync-session` | one connection: retries, room membership, emit |
//! | `chatsync-conversation` | per-room message list and reconciliation |
//! | `chatsync-presence` | typing debounce, remote typing TTL, online status |
//! | `chatsync` | the [`ChatClient`] tying them together |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatsync::prelude::*;
//!
//! # async fn run() -> Result<(), ChatsyncError> {
//! let client = ChatClient::builder()
//!     .identity(PeerId::from("alice"))
//!     .connect_websocket("ws://127.0.0.1:8080", NoopStore)
//!     .await?;
//!
//! let mut events = client.subscribe();
//! let room = RoomKey::channel("general");
//! client.open_room(room.clone()).await?;
//! client.send(room, "hello", None).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let ChatEvent::MessageUpdated { message, .. } = event {
//!         println!("{} is now {}", message.id, message.delivery_state);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod engine;
mod error;
mod event;
mod store;

pub use client::{ChatClient, ChatClientBuilder};
pub use config::ClientConfig;
pub use error::{ChatsyncError, SendError, StoreError};
pub use event::ChatEvent;
pub use store::{MessageStore, NoopStore};

pub use chatsync_conversation::{
    DeliveryState, IncomingMessage, LastMessagePreview, Message, Receipt, ReplyPreview,
    SyncConfig,
};
pub use chatsync_presence::{PresenceConfig, TypingSummary};
pub use chatsync_session::{ConnectionState, SessionConfig, SessionSignal};

pub use chatsync_conversation as conversation;
pub use chatsync_presence as presence;
pub use chatsync_protocol as protocol;
pub use chatsync_session as session;
pub use chatsync_transport as transport;

/// Everything most applications need.
pub mod prelude {
    pub use crate::{
        ChatClient, ChatEvent, ChatsyncError, ClientConfig, ConnectionState, DeliveryState,
        LastMessagePreview, Message, MessageStore, NoopStore, SendError, StoreError,
        TypingSummary,
    };
    pub use chatsync_protocol::{MessageId, PeerId, RoomKey};
}
