//! UDP server
//!
//! One socket serves every peer. Datagrams from known peers go to that
//! peer's session queue; an unknown peer must open with a datagram of at
//! least [`INIT_PAYLOAD_SIZE`] bytes before any state is allocated for it.

use super::handshake::server_handshake;
use super::session::ServerSession;
use super::{SharedDatagram, TransportConfig, TransportError};
use crate::protocol::{INIT_PAYLOAD_SIZE, MAX_DATAGRAM_SIZE};
use crate::tunnel::{Frame, Registry};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
struct Peer {
    conn_id: u64,
    streams: Arc<Registry<Frame>>,
}

struct ServerInner {
    socket: SharedDatagram,
    config: Arc<TransportConfig>,
    /// Connection id → session ingress queue
    sessions: Registry<Bytes>,
    peers: RwLock<HashMap<SocketAddr, Peer>>,
}

/// Tunnel server
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Bind a UDP socket on `addr`
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::with_socket(Arc::new(socket), config))
    }

    /// Serve on an existing socket
    pub fn with_socket(socket: SharedDatagram, config: TransportConfig) -> Self {
        let sessions = Registry::new(config.queue_capacity);
        Self {
            inner: Arc::new(ServerInner {
                socket,
                config: Arc::new(config),
                sessions,
                peers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Peers with a session or a handshake in progress
    pub async fn session_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    /// Open streams across all sessions
    pub async fn stream_count(&self) -> usize {
        let peers: Vec<Peer> = self.inner.peers.read().await.values().cloned().collect();
        let mut total = 0;
        for peer in peers {
            total += peer.streams.len().await;
        }
        total
    }

    /// Receive loop. Runs until the task is dropped.
    pub async fn run(&self) -> Result<(), TransportError> {
        info!("Tunnel server listening on {}", self.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, addr) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("UDP receive error: {}", e);
                    continue;
                }
            };

            let known = self.inner.peers.read().await.get(&addr).map(|p| p.conn_id);
            match known {
                Some(conn_id) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if let Err(e) = self
                        .inner
                        .sessions
                        .dispatch(conn_id, data, self.inner.config.dispatch_timeout)
                        .await
                    {
                        debug!("Dropping datagram for session {}: {}", conn_id, e);
                    }
                }
                None if n < INIT_PAYLOAD_SIZE => {
                    trace!("Ignoring {} byte datagram from unknown peer {}", n, addr);
                }
                None => self.accept(addr, Bytes::copy_from_slice(&buf[..n])).await,
            }
        }
    }

    async fn accept(&self, addr: SocketAddr, init: Bytes) {
        let (conn_id, inbox) = self.inner.sessions.create().await;
        let streams = Arc::new(Registry::new(self.inner.config.queue_capacity));

        self.inner.peers.write().await.insert(
            addr,
            Peer {
                conn_id,
                streams: streams.clone(),
            },
        );
        debug!("INIT from {}, handshake as session {}", addr, conn_id);

        tokio::spawn(handle_peer(
            self.inner.clone(),
            addr,
            conn_id,
            init,
            inbox,
            streams,
        ));
    }
}

async fn handle_peer(
    inner: Arc<ServerInner>,
    addr: SocketAddr,
    conn_id: u64,
    init: Bytes,
    mut inbox: mpsc::Receiver<Bytes>,
    streams: Arc<Registry<Frame>>,
) {
    let result = server_handshake(
        &*inner.socket,
        addr,
        conn_id,
        &init,
        &mut inbox,
        &inner.config,
    )
    .await;

    match result {
        Ok(established) => {
            info!("Session {} established with {}", conn_id, addr);
            match ServerSession::new(
                inner.socket.clone(),
                addr,
                &established,
                streams,
                inner.config.clone(),
            ) {
                Ok(session) => session.run(&mut inbox).await,
                Err(e) => warn!("Session {} setup failed: {}", conn_id, e),
            }
            info!("Session {} with {} closed", conn_id, addr);
        }
        Err(e) => warn!("Handshake with {} failed: {}", addr, e),
    }

    inner.peers.write().await.remove(&addr);
    inner.sessions.delete(conn_id).await;
}
