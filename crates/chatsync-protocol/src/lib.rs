//! Wire protocol for Chatsync.
//!
//! This crate defines the "language" the chat client and server speak:
//!
//! - **Identifiers** ([`PeerId`], [`MessageId`], [`RoomKey`]): who, what,
//!   and where.
//! - **Events** ([`ClientEvent`], [`ServerEvent`], [`MessagePayload`]):
//!   the structures that travel on the wire.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those events are
//!   converted to/from bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (events) → Session (connection + rooms)
//! ```
//!
//! The protocol layer doesn't know about connections or conversations;
//! it only knows how to name things and serialize them.

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    ClientEvent, MessageId, MessagePayload, PeerId, ReceiptRecord, RoomKey,
    ServerEvent, Timestamp, now_millis,
};
