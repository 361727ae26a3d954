//! zmsg-core: wire protocol for the zmsg real-time chat transport.
//!
//! Provides the message type codes, envelope and payload structs, the CBOR
//! codec, the error taxonomy shared by server and clients, and HMAC bearer
//! tokens.

pub mod codec;
pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode_envelope, decode_payload, encode_envelope, encode_payload};
pub use error::{ZmsgError, ZmsgResult};
pub use messages::{Envelope, MessageStatus, MsgType, PresenceStatus};
pub use token::{create_token, generate_secret, verify_token};
