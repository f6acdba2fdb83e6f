//! Conversation state for Chatsync.
//!
//! A [`Conversation`] holds one room's messages and guarantees that every
//! server-confirmed message is represented exactly once, whether it was
//! sent from this client or arrived from a peer.
//!
//! # Key types
//!
//! - [`Conversation`]: ordered message store for one room
//! - [`Message`] / [`DeliveryState`]: the entity and its lifecycle
//! - [`ReconcileOutcome`] / [`MatchKind`]: what reconciliation did
//! - [`ReceiptOutcome`]: what a delivery/read receipt did
//! - [`LastMessagePreview`]: the room-list summary
//! - [`SyncConfig`]: matching window and snippet length

mod config;
mod conversation;
mod error;
mod message;
mod preview;
mod receipts;
mod reconcile;

pub use config::SyncConfig;
pub use conversation::{Conversation, IncomingMessage, RemovalOutcome};
pub use error::ConversationError;
pub use message::{DeliveryState, Message, Receipt, ReceiptOutcome, ReplyPreview};
pub use preview::LastMessagePreview;
pub use reconcile::{MatchKind, ReconcileOutcome};
