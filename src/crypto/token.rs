//! Handshake tokens
//!
//! A [`RetryToken`] is handed out by the server in reply to an INIT from an
//! unknown peer and must be echoed back from the same IP within two seconds
//! before the server commits any session state.
//!
//! An [`AuthToken`] travels in the AUTH packet, encrypted under the client's
//! ephemeral key, and carries the negotiated session key.

use super::{random_bytes, unix_now, CryptoError, KEY_LEN, MAC_LEN};
use ring::hmac;
use std::net::IpAddr;

/// Maximum age of a token in seconds
pub const TOKEN_FRESHNESS_SECS: u64 = 2;

/// Encoded AuthToken length: created (8) + challenge (32) + answer (32) + key (32)
pub const AUTH_TOKEN_LEN: usize = 8 + 32 + MAC_LEN + KEY_LEN;

/// Compute HMAC-SHA256 of `data` under `key`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, data);

    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Constant-time check of an HMAC-SHA256 tag
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, data, tag).is_ok()
}

fn is_fresh(created: u64, now: u64) -> bool {
    now.saturating_sub(created) <= TOKEN_FRESHNESS_SECS
        && created.saturating_sub(now) <= TOKEN_FRESHNESS_SECS
}

fn ip_octets(ip: IpAddr) -> Vec<u8> {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Anti-spoofing token bound to a source IP
///
/// Layout: `created (4, u32 Unix secs) | ip (4 or 16) | HMAC-SHA256(secret, created | ip)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryToken {
    bytes: Vec<u8>,
}

impl RetryToken {
    /// Issue a token for `ip` at the current time
    pub fn new(ip: IpAddr, secret: &[u8]) -> Self {
        Self::issued_at(ip, secret, unix_now())
    }

    /// Issue a token for `ip` with an explicit creation time
    pub fn issued_at(ip: IpAddr, secret: &[u8], created: u64) -> Self {
        let mut bytes = Vec::with_capacity(4 + 16 + MAC_LEN);
        bytes.extend_from_slice(&(created as u32).to_be_bytes());
        bytes.extend_from_slice(&ip_octets(ip));

        let mac = hmac_sha256(secret, &bytes);
        bytes.extend_from_slice(&mac);

        Self { bytes }
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Check a token echoed back by `ip`
    pub fn validate(token: &[u8], ip: IpAddr, secret: &[u8]) -> bool {
        Self::validate_at(token, ip, secret, unix_now())
    }

    /// Check a token against an explicit current time
    pub fn validate_at(token: &[u8], ip: IpAddr, secret: &[u8], now: u64) -> bool {
        let octets = ip_octets(ip);
        let signed_len = 4 + octets.len();
        if token.len() != signed_len + MAC_LEN {
            return false;
        }

        let created = u32::from_be_bytes([token[0], token[1], token[2], token[3]]) as u64;
        if !is_fresh(created, now) {
            return false;
        }

        if token[4..signed_len] != octets[..] {
            return false;
        }

        verify_hmac_sha256(secret, &token[..signed_len], &token[signed_len..])
    }
}

/// Session key delivery token carried by the AUTH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// Creation time (Unix secs)
    pub created: u64,
    /// Random challenge the client must answer under the session key
    pub challenge: [u8; 32],
    /// Proof that the sender holds the shared secret
    pub answer: [u8; MAC_LEN],
    /// Negotiated session key
    pub key: [u8; KEY_LEN],
}

impl AuthToken {
    /// Create a token with a fresh random challenge
    pub fn new(answer: [u8; MAC_LEN], key: [u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let mut challenge = [0u8; 32];
        random_bytes(&mut challenge)?;

        Ok(Self {
            created: unix_now(),
            challenge,
            answer,
            key,
        })
    }

    /// Encode to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(AUTH_TOKEN_LEN);
        buf.extend_from_slice(&self.created.to_be_bytes());
        buf.extend_from_slice(&self.challenge);
        buf.extend_from_slice(&self.answer);
        buf.extend_from_slice(&self.key);
        buf
    }

    /// Decode from exactly [`AUTH_TOKEN_LEN`] bytes
    pub fn decode(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() != AUTH_TOKEN_LEN {
            return Err(CryptoError::InvalidToken(format!(
                "auth token length {} != {}",
                data.len(),
                AUTH_TOKEN_LEN
            )));
        }

        let mut created = [0u8; 8];
        created.copy_from_slice(&data[0..8]);

        let mut token = Self {
            created: u64::from_be_bytes(created),
            challenge: [0u8; 32],
            answer: [0u8; MAC_LEN],
            key: [0u8; KEY_LEN],
        };
        token.challenge.copy_from_slice(&data[8..40]);
        token.answer.copy_from_slice(&data[40..72]);
        token.key.copy_from_slice(&data[72..104]);

        Ok(token)
    }

    /// Check freshness and that `answer` is HMAC-SHA256(`secret`, `proof_of`)
    pub fn validate(&self, secret: &[u8], proof_of: &[u8]) -> bool {
        is_fresh(self.created, unix_now()) && verify_hmac_sha256(secret, proof_of, &self.answer)
    }
}
