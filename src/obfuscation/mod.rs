//! Traffic obfuscation layer
//!
//! Every datagram leaving the tunnel is passed through an [`Obfuscator`]
//! selected by name from the configuration. The only algorithm today is
//! `basic`: a 4-byte length prefix followed by an AEAD-sealed body.
//! New algorithms are added as new [`ObfuscatorKind`] variants.

mod basic;

pub use basic::BasicObfuscator;

use crate::crypto::CryptoError;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Obfuscation errors
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("Unknown obfuscator: {0}")]
    UnknownObfuscator(String),

    #[error("Malformed datagram: {0}")]
    Malformed(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Obfuscation algorithm, selected by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObfuscatorKind {
    /// Length prefix + ChaCha20-Poly1305
    #[default]
    Basic,
}

impl ObfuscatorKind {
    /// Configuration name of this algorithm
    pub fn name(&self) -> &'static str {
        match self {
            ObfuscatorKind::Basic => "basic",
        }
    }
}

impl FromStr for ObfuscatorKind {
    type Err = ObfuscationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "basic" => Ok(ObfuscatorKind::Basic),
            other => Err(ObfuscationError::UnknownObfuscator(other.to_string())),
        }
    }
}

impl fmt::Display for ObfuscatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A keyed obfuscator instance
#[derive(Debug)]
pub enum Obfuscator {
    Basic(BasicObfuscator),
}

impl Obfuscator {
    /// Build an obfuscator of `kind` keyed with `key`
    pub fn new(kind: ObfuscatorKind, key: &[u8]) -> Result<Self, ObfuscationError> {
        match kind {
            ObfuscatorKind::Basic => Ok(Obfuscator::Basic(BasicObfuscator::new(key)?)),
        }
    }

    /// Which algorithm this instance runs
    pub fn kind(&self) -> ObfuscatorKind {
        match self {
            Obfuscator::Basic(_) => ObfuscatorKind::Basic,
        }
    }

    /// Obfuscate an outgoing buffer
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        match self {
            Obfuscator::Basic(inner) => inner.encode(data),
        }
    }

    /// Recover the buffer from an incoming datagram
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        match self {
            Obfuscator::Basic(inner) => inner.decode(data),
        }
    }
}
