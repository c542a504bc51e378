//! `basic` obfuscator
//!
//! Format:
//! ```text
//! +--------+--------+--------+--------+
//! |   Plaintext length (4B, BE)       |
//! +--------+--------+--------+--------+
//! |          Nonce (12B)              |
//! +--------+--------+--------+--------+
//! |          Ciphertext               |
//! +--------+--------+--------+--------+
//! |          Tag (16B)                |
//! +--------+--------+--------+--------+
//! ```

use super::ObfuscationError;
use crate::crypto::{Cipher, NONCE_LEN, TAG_LEN};

/// Length of the plaintext length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Length-prefixing AEAD obfuscator
#[derive(Debug)]
pub struct BasicObfuscator {
    cipher: Cipher,
}

impl BasicObfuscator {
    pub fn new(key: &[u8]) -> Result<Self, ObfuscationError> {
        Ok(Self {
            cipher: Cipher::new(key)?,
        })
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        let ciphertext = self.cipher.encrypt(data)?;

        let mut encoded = Vec::with_capacity(LENGTH_PREFIX_LEN + ciphertext.len());
        encoded.extend_from_slice(&(data.len() as u32).to_be_bytes());
        encoded.extend_from_slice(&ciphertext);

        Ok(encoded)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if data.len() < LENGTH_PREFIX_LEN {
            return Err(ObfuscationError::Malformed(format!(
                "{} bytes, length prefix needs {}",
                data.len(),
                LENGTH_PREFIX_LEN
            )));
        }

        let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let body = &data[LENGTH_PREFIX_LEN..];
        if body.len() < size + NONCE_LEN + TAG_LEN {
            return Err(ObfuscationError::Malformed(format!(
                "expected {} payload bytes, got {}",
                size,
                body.len().saturating_sub(NONCE_LEN + TAG_LEN)
            )));
        }

        let plaintext = self.cipher.decrypt(body)?;
        if plaintext.len() != size {
            return Err(ObfuscationError::Malformed(format!(
                "length prefix {} does not match payload {}",
                size,
                plaintext.len()
            )));
        }

        Ok(plaintext)
    }
}
