//! Reconnect credentials.
//!
//! A token is `token_bytes` of OS randomness, base64url encoded. Only its
//! SHA-256 digest is persisted, so a copy of the store cannot be replayed
//! into a valid token.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use loom_core::time::truncate_micros;

use crate::types::ResumeBlocker;

/// A freshly minted token. The plaintext leaves this crate exactly once.
#[derive(Debug)]
pub struct IssuedToken {
    pub token: SecretString,
    pub digest: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct TokenService {
    ttl: Duration,
    token_bytes: usize,
}

impl TokenService {
    pub fn new(ttl: Duration, token_bytes: usize) -> Self {
        Self { ttl, token_bytes }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a token valid until `now + ttl`, truncated to the microsecond
    /// precision the store keeps.
    pub fn issue(&self, now: DateTime<Utc>) -> IssuedToken {
        let mut bytes = vec![0u8; self.token_bytes];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(&bytes);
        let digest = digest(&token);
        IssuedToken {
            token: SecretString::from(token),
            digest,
            expires_at: truncate_micros(now + self.ttl),
        }
    }

    /// Check a presented token against a session's stored digest and expiry.
    /// Fails closed: a token is valid up to and including `expires_at`.
    pub fn validate(
        &self,
        presented: &SecretString,
        stored_digest: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ResumeBlocker> {
        if !digests_match(&digest(presented.expose_secret()), stored_digest) {
            return Err(ResumeBlocker::TokenMismatch);
        }
        if now > expires_at {
            return Err(ResumeBlocker::TokenExpired);
        }
        Ok(())
    }
}

/// Hex SHA-256 of a token.
pub fn digest(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}
