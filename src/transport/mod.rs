//! Transport layer: UDP sessions between client and server
//!
//! Provides:
//! - The INIT → RETRY → AUTH → OK handshake
//! - Session ingress/egress over a shared datagram socket
//! - The UDP server (one session per peer)
//! - The client session used by the front end to open streams

mod client;
mod handshake;
mod server;
mod session;

pub use client::Client;
pub use handshake::{client_handshake, server_handshake, Established, HandshakeState};
pub use server::Server;

use crate::crypto::{CryptoError, KEY_LEN};
use crate::obfuscation::{ObfuscationError, ObfuscatorKind};
use crate::protocol::{
    ProtocolError, DISPATCH_TIMEOUT, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT, KEEPALIVE_INTERVAL,
    QUEUE_CAPACITY,
};
use crate::tunnel::{StreamConfig, TunnelError};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Handshake timed out in state {0}")]
    HandshakeTimeout(HandshakeState),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Session expired after {0:?} without traffic")]
    SessionExpired(Duration),

    #[error("Session closed")]
    Closed,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] ObfuscationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// A datagram socket the session layer can run over
#[async_trait]
pub trait Datagram: Send + Sync {
    /// Send one datagram to `target`
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Bound address
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Datagram for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Shared socket handle
pub type SharedDatagram = Arc<dyn Datagram>;

/// Session parameters shared by client and server
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Pre-shared 32-byte secret
    pub secret: [u8; KEY_LEN],
    /// Obfuscation algorithm
    pub protocol: ObfuscatorKind,
    /// Per-step handshake timeout
    pub handshake_timeout: Duration,
    /// Remote dial timeout, and how long the client waits for OK/ERR
    pub connect_timeout: Duration,
    /// Client PING period
    pub keepalive_interval: Duration,
    /// Session teardown after this long without valid traffic
    pub idle_timeout: Duration,
    /// How long ingress waits on a full stream queue
    pub dispatch_timeout: Duration,
    /// Capacity of session and stream queues
    pub queue_capacity: usize,
    /// Per-stream reliability parameters
    pub stream: StreamConfig,
}

impl TransportConfig {
    /// Defaults around a shared secret
    pub fn new(secret: [u8; KEY_LEN]) -> Self {
        Self {
            secret,
            protocol: ObfuscatorKind::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT),
            dispatch_timeout: DISPATCH_TIMEOUT,
            queue_capacity: QUEUE_CAPACITY,
            stream: StreamConfig::default(),
        }
    }
}
