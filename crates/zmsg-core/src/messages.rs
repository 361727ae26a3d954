//! zmsg protocol message types.
//!
//! Every frame on the wire is an [`Envelope`]. Its `payload` is encoded on
//! its own so a receiver can decode the envelope, look at `msg_type`, and
//! only then decode the payload against the matching struct below.

use crate::codec::{decode_payload, encode_payload};
use crate::error::ZmsgResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric message type tags. Must match the client's `MSG` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum MsgType {
    // client → server
    Auth = 1,
    Chat = 2,
    Ack = 3,
    SyncRequest = 4,
    Presence = 5,
    Ping = 6,

    // server → client
    AuthResponse = 101,
    ChatPush = 102,
    SyncResponse = 103,
    PresencePush = 104,
    Pong = 105,
    Error = 106,
}

impl From<MsgType> for u16 {
    fn from(m: MsgType) -> u16 {
        m as u16
    }
}

impl TryFrom<u16> for MsgType {
    type Error = String;
    fn try_from(v: u16) -> Result<Self, String> {
        match v {
            1 => Ok(Self::Auth),
            2 => Ok(Self::Chat),
            3 => Ok(Self::Ack),
            4 => Ok(Self::SyncRequest),
            5 => Ok(Self::Presence),
            6 => Ok(Self::Ping),
            101 => Ok(Self::AuthResponse),
            102 => Ok(Self::ChatPush),
            103 => Ok(Self::SyncResponse),
            104 => Ok(Self::PresencePush),
            105 => Ok(Self::Pong),
            106 => Ok(Self::Error),
            _ => Err(format!("unknown message type: {v}")),
        }
    }
}

/// Delivery status of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported presence of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Away => "away",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error codes carried in [`ErrorPayload::code`] and
/// [`AuthResponsePayload::error`].
pub mod error_codes {
    pub const NOT_AUTHENTICATED: &str = "not_authenticated";
    pub const SEND_FAILED: &str = "send_failed";
    pub const SYNC_FAILED: &str = "sync_failed";
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const TOO_MANY_CONNECTIONS: &str = "too_many_connections";
    pub const ALREADY_AUTHENTICATED: &str = "already_authenticated";
    pub const MALFORMED_FRAME: &str = "malformed_frame";
}

// ── Envelope ──────────────────────────────────────────────────────────

/// Outer frame: type code, caller-assigned sequence, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,

    #[serde(default)]
    pub seq: i64,

    #[serde(default, with = "bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(msg_type: MsgType, seq: i64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            seq,
            payload,
        }
    }

    /// An envelope with no payload (Ping, Pong).
    pub fn empty(msg_type: MsgType, seq: i64) -> Self {
        Self::new(msg_type, seq, Vec::new())
    }

    /// Encode `payload` and wrap it.
    pub fn with_payload<T: Serialize>(msg_type: MsgType, seq: i64, payload: &T) -> ZmsgResult<Self> {
        Ok(Self::new(msg_type, seq, encode_payload(payload)?))
    }

    /// Build an `Error` envelope carrying one of [`error_codes`].
    pub fn error(seq: i64, code: &str, message: impl Into<String>) -> ZmsgResult<Self> {
        Self::with_payload(
            MsgType::Error,
            seq,
            &ErrorPayload {
                code: code.to_string(),
                message: message.into(),
            },
        )
    }

    /// Decode the payload against the schema the caller expects for `msg_type`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> ZmsgResult<T> {
        decode_payload(&self.payload)
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub to: i64,
    /// text, voice or image
    #[serde(rename = "type")]
    pub kind: String,
    /// Text body, or a media id for voice/image.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPushPayload {
    pub message_id: i64,
    pub from: i64,
    pub to: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: i64,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    #[serde(default)]
    pub last_message_id: i64,
    #[serde(default)]
    pub last_sync_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    #[serde(default)]
    pub messages: Vec<ChatPushPayload>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePushPayload {
    pub user_id: i64,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

// ── Byte string serde ────────────────────────────────────────────────

/// Serialize `Vec<u8>` as a CBOR byte string instead of an array of ints.
mod bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                // Some encoders emit byte arrays as sequences of small ints.
                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_match_wire_table() {
        assert_eq!(u16::from(MsgType::Auth), 1);
        assert_eq!(u16::from(MsgType::Ping), 6);
        assert_eq!(u16::from(MsgType::AuthResponse), 101);
        assert_eq!(u16::from(MsgType::Error), 106);
        assert_eq!(MsgType::try_from(104), Ok(MsgType::PresencePush));
        assert!(MsgType::try_from(7).is_err());
        assert!(MsgType::try_from(0).is_err());
    }

    #[test]
    fn error_envelope_carries_code() {
        let env = Envelope::error(9, error_codes::SEND_FAILED, "").unwrap();
        assert_eq!(env.msg_type, MsgType::Error);
        assert_eq!(env.seq, 9);
        let p: ErrorPayload = env.payload_as().unwrap();
        assert_eq!(p.code, "send_failed");
        assert!(p.message.is_empty());
    }

    #[test]
    fn auth_response_omits_empty_fields() {
        let ok = AuthResponsePayload {
            success: false,
            user_id: 0,
            error: None,
        };
        let env = Envelope::with_payload(MsgType::AuthResponse, 1, &ok).unwrap();
        let back: AuthResponsePayload = env.payload_as().unwrap();
        assert_eq!(back, ok);
    }
}
