//! Session tokens for the REST API.
//!
//! `GET /api/auth?access_token=…&user=…` trades the shared access token
//! for a signed session token (`<user>.<hmac>`); mutating endpoints verify
//! it from the `Authorization: Bearer` header. The HMAC keys off the
//! configured access token, so rotating it invalidates every session.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Issues a session token for `user`.
pub fn issue_token(secret: &[u8], user: &str) -> String {
    format!("{}.{}", user, signature(secret, user))
}

/// Verifies a session token, returning the user it names.
pub fn verify_token(secret: &[u8], token: &str) -> Option<String> {
    let (user, mac) = token.rsplit_once('.')?;
    if user.is_empty() {
        return None;
    }
    let mut expected = HmacSha256::new_from_slice(secret).ok()?;
    expected.update(user.as_bytes());
    let decoded = decode_hex(mac)?;
    expected.verify_slice(&decoded).ok()?;
    Some(user.to_string())
}

fn signature(secret: &[u8], user: &str) -> String {
    // a zero-length key is still a valid HMAC key
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(user.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify() {
        let token = issue_token(b"secret", "alice");
        assert_eq!(verify_token(b"secret", &token), Some("alice".to_string()));
    }

    #[test]
    fn tampered_tokens_fail() {
        let token = issue_token(b"secret", "alice");
        let forged = token.replace("alice", "admin");
        assert_eq!(verify_token(b"secret", &forged), None);
        assert_eq!(verify_token(b"other-secret", &token), None);
        assert_eq!(verify_token(b"secret", "garbage"), None);
        assert_eq!(verify_token(b"secret", ""), None);
    }

    #[test]
    fn user_names_with_dots_verify() {
        let token = issue_token(b"secret", "alice.smith");
        assert_eq!(
            verify_token(b"secret", &token),
            Some("alice.smith".to_string())
        );
    }
}
