//! CBOR codec for envelopes and payloads.
//!
//! Wire format of one frame: a CBOR map `{type, seq, payload}` where
//! `payload` is a byte string holding the independently encoded payload map.
//! Framing is left to the transport (one WebSocket binary message = one frame).

use crate::error::{ZmsgError, ZmsgResult};
use crate::messages::Envelope;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

/// Encode an envelope into one frame.
pub fn encode_envelope(envelope: &Envelope) -> ZmsgResult<Vec<u8>> {
    encode_payload(envelope)
}

/// Decode one frame into an envelope. The payload is left undecoded.
pub fn decode_envelope(data: &[u8]) -> ZmsgResult<Envelope> {
    decode_payload(data)
}

/// Encode a serializable payload value.
pub fn encode_payload<T: Serialize>(value: &T) -> ZmsgResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)?;
    Ok(out)
}

/// Decode a payload into a typed value.
///
/// The whole input must be consumed by exactly one CBOR item.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> ZmsgResult<T> {
    if data.is_empty() {
        return Err(ZmsgError::MalformedFrame("empty input".into()));
    }
    let mut cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(&mut cursor)?;
    let consumed = cursor.position() as usize;
    if consumed != data.len() {
        return Err(ZmsgError::MalformedFrame(format!(
            "{} trailing bytes after item",
            data.len() - consumed
        )));
    }
    Ok(value)
}
