//! # Drill
//!
//! An obfuscated, encrypted UDP tunnel with an HTTP CONNECT front end.
//!
//! A client and a server share a 32-byte secret. After a handshake that
//! makes the server prove the client's address before allocating state,
//! every datagram is encrypted under a per-session key. TCP streams are
//! multiplexed over the session with sequence numbers, ACKs, and selective
//! retransmission.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Proxy Layer                       │
//! │               (HTTP CONNECT front end)               │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │     (Frames, stream registry, send/receive pacers)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │        (Handshake, sessions, keepalive, expiry)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 Obfuscation Layer                    │
//! │         (Length prefix, ChaCha20-Poly1305)           │
//! ├─────────────────────────────────────────────────────┤
//! │                        UDP                           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod obfuscation;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use transport::{Client, Server, TransportConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
