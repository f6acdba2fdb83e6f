//! Hook for the server-side message store.
//!
//! Chatsync doesn't talk to your REST API itself. History on room open and
//! message deletion go through the [`MessageStore`] trait: you implement
//! it with whatever HTTP client your application already uses, and the
//! client calls it at the right moments.
//!
//! # Why a trait?
//!
//! The same client code then runs against:
//! - your real backend in production
//! - [`NoopStore`] when there is no history to load
//! - an in-memory fake in tests

use std::future::Future;

use chatsync_conversation::IncomingMessage;
use chatsync_protocol::{MessageId, RoomKey};

use crate::StoreError;

/// Fetches and deletes persisted messages.
///
/// # Trait bounds
///
/// - `Send + Sync` → the store is shared with the tasks the client spawns
///   for history loads and deletions.
/// - `'static` → it lives as long as the client.
///
/// # Example
///
/// ```rust
/// use chatsync::{IncomingMessage, MessageStore, StoreError};
/// use chatsync::protocol::{MessageId, RoomKey};
///
/// /// Pretends every room is empty and every delete succeeds.
/// struct EmptyBackend;
///
/// impl MessageStore for EmptyBackend {
///     async fn fetch_history(
///         &self,
///         _room: &RoomKey,
///     ) -> Result<Vec<IncomingMessage>, StoreError> {
///         Ok(Vec::new())
///     }
///
///     async fn delete_messages(
///         &self,
///         _room: &RoomKey,
///         _ids: &[MessageId],
///     ) -> Result<(), StoreError> {
///         Ok(())
///     }
/// }
/// ```
pub trait MessageStore: Send + Sync + 'static {
    /// Returns the persisted messages of `room`, oldest first, with their
    /// receipt arrays.
    fn fetch_history(
        &self,
        room: &RoomKey,
    ) -> impl Future<Output = Result<Vec<IncomingMessage>, StoreError>> + Send;

    /// Deletes the given messages. Must be idempotent: deleting an id that
    /// is already gone succeeds.
    fn delete_messages(
        &self,
        room: &RoomKey,
        ids: &[MessageId],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// A store with no history that accepts every deletion.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl MessageStore for NoopStore {
    async fn fetch_history(&self, _room: &RoomKey) -> Result<Vec<IncomingMessage>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete_messages(&self, _room: &RoomKey, _ids: &[MessageId]) -> Result<(), StoreError> {
        Ok(())
    }
}
