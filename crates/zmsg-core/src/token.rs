//! HMAC bearer tokens.
//!
//! A token binds a user id to an expiry time and is signed with a server
//! secret. Clients present it in the `Auth` payload.
//! Format (hex-encoded): `[8-byte user id][8-byte expiry][32-byte HMAC-SHA256]`

use crate::error::{ZmsgError, ZmsgResult};
use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

const TOKEN_LEN: usize = 8 + 8 + 32;

fn unix_now() -> ZmsgResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| ZmsgError::Token(format!("system clock before epoch: {e}")))
}

/// Create a bearer token for `user_id`, valid for `ttl_secs`.
pub fn create_token(secret: &[u8], user_id: i64, ttl_secs: u64) -> ZmsgResult<String> {
    let expiry = unix_now()?.saturating_add(ttl_secs);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::with_capacity(TOKEN_LEN);
    data.extend_from_slice(&user_id.to_be_bytes());
    data.extend_from_slice(&expiry.to_be_bytes());

    let tag = hmac::sign(&key, &data);
    data.extend_from_slice(tag.as_ref());
    Ok(hex::encode(data))
}

/// Verify a bearer token and return the user id it was issued for.
///
/// Checks the encoding, the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], token: &str) -> ZmsgResult<i64> {
    let raw = hex::decode(token.trim())
        .map_err(|e| ZmsgError::Token(format!("invalid token encoding: {e}")))?;
    if raw.len() != TOKEN_LEN {
        return Err(ZmsgError::Token(format!(
            "invalid token length: expected {TOKEN_LEN}, got {}",
            raw.len()
        )));
    }

    let (data, tag) = raw.split_at(16);
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, data, tag)
        .map_err(|_| ZmsgError::Token("invalid token signature".into()))?;

    let mut user_bytes = [0u8; 8];
    user_bytes.copy_from_slice(&data[..8]);
    let mut expiry_bytes = [0u8; 8];
    expiry_bytes.copy_from_slice(&data[8..16]);
    let user_id = i64::from_be_bytes(user_bytes);
    let expiry = u64::from_be_bytes(expiry_bytes);

    if unix_now()? > expiry {
        return Err(ZmsgError::Token("token expired".into()));
    }
    if user_id <= 0 {
        return Err(ZmsgError::Token(format!("invalid user id {user_id}")));
    }

    Ok(user_id)
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> ZmsgResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| ZmsgError::Token("system RNG failure".into()))?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, 10, 3600).unwrap();
        assert_eq!(token.len(), TOKEN_LEN * 2);
        assert_eq!(verify_token(&secret, &token).unwrap(), 10);
    }

    #[test]
    fn wrong_secret() {
        let secret1 = generate_secret().unwrap();
        let secret2 = generate_secret().unwrap();
        let token = create_token(&secret1, 10, 3600).unwrap();
        assert!(verify_token(&secret2, &token).is_err());
    }

    #[test]
    fn tampered_user_id() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, 10, 3600).unwrap();
        let mut raw = hex::decode(&token).unwrap();
        raw[7] = 20;
        assert!(verify_token(&secret, &hex::encode(raw)).is_err());
    }

    #[test]
    fn expired_token() {
        let secret = generate_secret().unwrap();
        // Hand-build a token whose expiry is in the past.
        let key = hmac::Key::new(hmac::HMAC_SHA256, &secret);
        let mut data = Vec::new();
        data.extend_from_slice(&10i64.to_be_bytes());
        data.extend_from_slice(&1u64.to_be_bytes());
        let tag = hmac::sign(&key, &data);
        data.extend_from_slice(tag.as_ref());

        let err = verify_token(&secret, &hex::encode(data)).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn invalid_length_and_encoding() {
        let secret = generate_secret().unwrap();
        assert!(verify_token(&secret, "abcd").is_err());
        assert!(verify_token(&secret, "not-hex").is_err());
        assert!(verify_token(&secret, "").is_err());
    }
}
