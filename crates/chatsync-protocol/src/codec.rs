//! Codec trait and implementations for serializing/deserializing events.
//!
//! The session layer never cares HOW events become bytes. It holds
//! something that implements [`Codec`] and calls `encode`/`decode`.
//! [`JsonCodec`] is the default because the chat server speaks JSON and
//! JSON frames are easy to inspect in browser DevTools.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because the codec is shared between the
/// session handle and its reader task, which Tokio may run on any thread.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or
    /// don't match the expected type.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// ## Example
///
/// ```rust
/// use chatsync_protocol::{Codec, ClientEvent, JsonCodec, RoomKey};
///
/// let codec = JsonCodec;
/// let event = ClientEvent::JoinRoom { room_key: RoomKey::channel("cs101") };
///
/// let bytes = codec.encode(&event).unwrap();
/// let decoded: ClientEvent = codec.decode(&bytes).unwrap();
/// assert_eq!(event, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{PeerId, RoomKey, ServerEvent};

    #[test]
    fn test_json_codec_decodes_server_event() {
        let bytes = br#"{"type":"userOnline","peerId":"alice"}"#;
        let event: ServerEvent = JsonCodec.decode(bytes).unwrap();
        assert_eq!(
            event,
            ServerEvent::UserOnline {
                peer_id: PeerId::from("alice")
            }
        );
    }

    #[test]
    fn test_json_codec_decode_garbage_is_decode_error() {
        let result: Result<ServerEvent, _> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_json_codec_encode_room_key_as_string() {
        let bytes = JsonCodec.encode(&RoomKey::channel("cs101")).unwrap();
        assert_eq!(bytes, br#""channel:cs101""#);
    }
}
