//! Message types and their wire encoding.
//!
//! A message body is the [`postcard`] encoding of [`Message`]; the enum
//! discriminant doubles as the type tag. Collaborators that need their own
//! message types carry them in [`Message::Custom`] under a numeric id.
//! [`Message::Compressed`] wraps another message in LZ4 and is unwrapped by
//! [`decode_message`] before anyone sees it.

use std::sync::Arc;

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::peer::{Leg, Peer};

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Every message the session layer can carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    // --- Handshake ---
    /// Client announces itself on each of its legs.
    Registration(ClientRegistration),
    /// Server confirms that both legs were joined.
    RegistrationAck(RegistrationAck),
    /// Either side is closing the session.
    Disconnect(Disconnect),

    // --- System ---
    /// Reserved host-discovery probe; servers echo it back over datagrams.
    DiscoverHost,
    /// Heartbeat ping.
    Ping(Ping),
    /// Heartbeat pong. Response to a Ping.
    Pong(Pong),
    /// An LZ4-compressed message.
    Compressed(Compressed),

    // --- Application ---
    /// Collaborator-defined message.
    Custom(CustomMessage),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Correlation message sent by a client over each leg.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRegistration {
    /// Correlation id shared by both legs; becomes the player id.
    pub id: i64,
    /// Name of the application the client was built for.
    pub game_name: String,
    /// Application protocol version.
    pub version: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationAck {
    pub player_id: i64,
    pub client_id: u64,
}

/// Why a session is ending.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DisconnectKind {
    /// The local user asked to leave.
    UserRequested,
    /// The server removed the client.
    Kick,
    /// An unrecoverable error occurred.
    Error,
    /// The server is shutting down.
    Shutdown,
}

/// Disconnect notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disconnect {
    pub kind: DisconnectKind,
    pub reason: Option<String>,
}

impl Disconnect {
    pub fn new(kind: DisconnectKind, reason: Option<String>) -> Self {
        Self { kind, reason }
    }

    pub fn user_requested() -> Self {
        Self::new(DisconnectKind::UserRequested, None)
    }

    pub fn kick(reason: impl Into<String>) -> Self {
        Self::new(DisconnectKind::Kick, Some(reason.into()))
    }

    pub fn shutdown() -> Self {
        Self::new(DisconnectKind::Shutdown, Some("Server shutdown".to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    pub seq: u32,
    /// Sender's clock in milliseconds.
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pong {
    /// Sequence number of the Ping being answered.
    pub seq: u32,
    /// Echoed timestamp from the Ping.
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compressed {
    /// Size-prepended LZ4 block holding an encoded [`Message`].
    pub payload: Vec<u8>,
}

/// Opaque application message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomMessage {
    /// Application-assigned type id, used for per-kind listener routing.
    pub type_id: u16,
    /// Postcard-encoded application value.
    pub payload: Vec<u8>,
}

impl CustomMessage {
    /// Encode `value` under `type_id`.
    pub fn encode<T: Serialize>(type_id: u16, value: &T) -> Result<Self, MessageError> {
        Ok(Self {
            type_id,
            payload: postcard::to_allocvec(value)?,
        })
    }

    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Routing key for per-kind listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Registration,
    RegistrationAck,
    Disconnect,
    DiscoverHost,
    Ping,
    Pong,
    Compressed,
    Custom(u16),
}

impl Message {
    /// Extract the routing kind without consuming the message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Registration(_) => MessageKind::Registration,
            Message::RegistrationAck(_) => MessageKind::RegistrationAck,
            Message::Disconnect(_) => MessageKind::Disconnect,
            Message::DiscoverHost => MessageKind::DiscoverHost,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Compressed(_) => MessageKind::Compressed,
            Message::Custom(custom) => MessageKind::Custom(custom.type_id),
        }
    }

    /// Wrap this message in an LZ4-compressed envelope.
    pub fn compress(&self) -> Result<Message, MessageError> {
        if matches!(self, Message::Compressed(_)) {
            return Err(MessageError::NestedCompression);
        }
        let encoded = postcard::to_allocvec(self)?;
        Ok(Message::Compressed(Compressed {
            payload: compress_prepend_size(&encoded),
        }))
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding message bodies.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Postcard could not encode or decode the body.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),

    /// The body was empty.
    #[error("empty message body")]
    Empty,

    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),

    /// A compressed message contained another compressed message.
    #[error("nested compressed message")]
    NestedCompression,
}

/// Encode a message body.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, MessageError> {
    Ok(postcard::to_allocvec(message)?)
}

/// Decode a message body, unwrapping compression.
pub fn decode_message(bytes: &[u8]) -> Result<Message, MessageError> {
    if bytes.is_empty() {
        return Err(MessageError::Empty);
    }
    match postcard::from_bytes(bytes)? {
        Message::Compressed(compressed) => {
            let inner = decompress_size_prepended(&compressed.payload)
                .map_err(|e| MessageError::DecompressFailed(e.to_string()))?;
            match postcard::from_bytes(&inner)? {
                Message::Compressed(_) => Err(MessageError::NestedCompression),
                message => Ok(message),
            }
        }
        message => Ok(message),
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A message together with its delivery metadata.
///
/// Outgoing envelopes only set `reliable`; received envelopes also carry the
/// peer and the leg they arrived on.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    /// `true` for the stream leg, `false` for the datagram leg.
    pub reliable: bool,
    pub source: Option<Arc<Peer>>,
    pub leg: Option<Leg>,
}

impl Envelope {
    pub fn reliable(message: Message) -> Self {
        Self {
            message,
            reliable: true,
            source: None,
            leg: None,
        }
    }

    pub fn unreliable(message: Message) -> Self {
        Self {
            message,
            reliable: false,
            source: None,
            leg: None,
        }
    }

    pub(crate) fn received(message: Message, source: Arc<Peer>, leg: Leg) -> Self {
        Self {
            message,
            reliable: leg == Leg::Stream,
            source: Some(source),
            leg: Some(leg),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Pos {
        x: f32,
    }

    #[test]
    fn test_message_roundtrip() {
        let message = Message::Registration(ClientRegistration {
            id: 1_700_000_000_123,
            game_name: "nebula".to_string(),
            version: 3,
        });
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_discriminant_is_type_tag() {
        // Registration is the first variant; DiscoverHost carries no payload.
        let bytes = encode_message(&Message::DiscoverHost).unwrap();
        assert_eq!(bytes, vec![3]);
    }

    #[test]
    fn test_custom_payload_roundtrip() {
        let custom = CustomMessage::encode(7, &Pos { x: 1.0 }).unwrap();
        let message = Message::Custom(custom);
        assert_eq!(message.kind(), MessageKind::Custom(7));

        let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
        let Message::Custom(custom) = decoded else {
            panic!("expected a custom message");
        };
        assert_eq!(custom.decode::<Pos>().unwrap(), Pos { x: 1.0 });
    }

    #[test]
    fn test_compressed_message_is_unwrapped() {
        let original = Message::Custom(CustomMessage {
            type_id: 1,
            payload: vec![42u8; 4096],
        });
        let compressed = original.compress().unwrap();
        let bytes = encode_message(&compressed).unwrap();
        assert!(bytes.len() < 4096);

        assert_eq!(decode_message(&bytes).unwrap(), original);
    }

    #[test]
    fn test_nested_compression_is_rejected() {
        let once = Message::Ping(Ping {
            seq: 1,
            timestamp_ms: 0,
        })
        .compress()
        .unwrap();
        assert!(matches!(
            once.compress(),
            Err(MessageError::NestedCompression)
        ));
    }

    #[test]
    fn test_empty_body_is_rejected() {
        assert!(matches!(decode_message(&[]), Err(MessageError::Empty)));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(matches!(
            decode_message(&[0xFF, 0x01]),
            Err(MessageError::Postcard(_))
        ));
    }

    #[test]
    fn test_shutdown_notice_defaults() {
        let notice = Disconnect::shutdown();
        assert_eq!(notice.kind, DisconnectKind::Shutdown);
        assert_eq!(notice.reason.as_deref(), Some("Server shutdown"));
    }

    #[test]
    fn test_outgoing_envelopes() {
        let ping = Message::Ping(Ping {
            seq: 1,
            timestamp_ms: 5,
        });
        assert!(Envelope::reliable(ping.clone()).reliable);
        let envelope = Envelope::unreliable(ping);
        assert!(!envelope.reliable);
        assert!(envelope.source.is_none());
        assert_eq!(envelope.kind(), MessageKind::Ping);
    }
}
