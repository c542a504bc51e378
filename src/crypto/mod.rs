//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD encryption with random per-message nonces
//! - HMAC-SHA256 retry tokens (anti-spoofing gate before the server commits state)
//! - Authentication tokens carrying the negotiated session key
//! - Secure random number generation

mod aead;
mod token;

pub use aead::Cipher;
pub use token::{hmac_sha256, verify_hmac_sha256, AuthToken, RetryToken, AUTH_TOKEN_LEN};

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Length of an HMAC-SHA256 output
pub const MAC_LEN: usize = 32;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key size: expected {KEY_LEN}, got {0}")]
    InvalidKeySize(usize),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Random number generation failed")]
    Random,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a fresh random 32-byte key
pub fn random_key() -> Result<[u8; KEY_LEN], CryptoError> {
    let mut key = [0u8; KEY_LEN];
    random_bytes(&mut key)?;
    Ok(key)
}

/// Seconds since the Unix epoch
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
